//! Service wiring, router assembly, and process startup.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::api::{self, AppState, SharedState};
use crate::branches::BranchService;
use crate::config::Config;
use crate::db::{Db, DbHandle};
use crate::deploys::DeploymentService;
use crate::exec::{CommandRunner, SystemRunner};
use crate::hook::{HookService, HttpHook};
use crate::repos::RepositoryService;
use crate::store::SqliteStore;
use crate::vars::VariableEngine;
use crate::vcs::{GitVcs, Vcs};
use crate::watcher::{Job, Watcher};

pub struct Services {
    pub repositories: Arc<RepositoryService>,
    pub branches: Arc<BranchService>,
    pub deployments: Arc<DeploymentService>,
}

/// Assemble the service graph over the given ports. Split out so tests can
/// substitute scripted VCS/runner/hook implementations.
pub fn wire_services(
    config: &Config,
    store: Arc<SqliteStore>,
    vcs: Arc<dyn Vcs>,
    runner: Arc<dyn CommandRunner>,
    hook: Option<Arc<dyn HookService>>,
) -> Services {
    let engine = Arc::new(VariableEngine::new(
        config.custom_files_dir().to_string_lossy().into_owned(),
    ));

    let deployments = Arc::new(DeploymentService::new(
        store.clone(),
        store.clone(),
        store.clone(),
        runner.clone(),
        engine.clone(),
        hook.clone(),
        config.work_dir.clone(),
        config.branches_dir(),
        config.config_dir(),
    ));
    let branches = Arc::new(BranchService::new(
        store.clone(),
        store.clone(),
        vcs.clone(),
        runner,
        engine,
        deployments.clone(),
        hook,
        config.repos_dir(),
        config.branches_dir(),
        config.config_dir(),
    ));
    let repositories = Arc::new(RepositoryService::new(store, vcs, branches.clone()));

    Services {
        repositories,
        branches,
        deployments,
    }
}

/// The four jobs in their significant order: downloads feed syncs, syncs
/// feed the build queue, builds mark deployments dirty for the deploy pass.
pub fn watcher_jobs(services: &Services) -> Vec<Job> {
    let download = services.repositories.clone();
    let sync = services.repositories.clone();
    let build = services.branches.clone();
    let deploy = services.deployments.clone();
    vec![
        Job::new("downloadRepo", move |cancel| {
            let svc = download.clone();
            async move { svc.download_job(&cancel).await }
        }),
        Job::new("syncRepo", move |cancel| {
            let svc = sync.clone();
            async move { svc.sync_job(&cancel).await }
        }),
        Job::new("buildBranch", move |cancel| {
            let svc = build.clone();
            async move { svc.build_job(&cancel).await }
        }),
        Job::new("watchDeploy", move |cancel| {
            let svc = deploy.clone();
            async move { svc.run(&cancel).await }
        }),
    ]
}

pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Start the orchestrator: storage, watcher loop, and HTTP listener.
pub async fn start_server(config: Config) -> Result<()> {
    for dir in [
        config.work_dir.clone(),
        config.repos_dir(),
        config.branches_dir(),
        config.custom_files_dir(),
        config.config_dir(),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = Db::new(&config.db_path).context("Failed to initialize database")?;
    let store = Arc::new(SqliteStore::new(DbHandle::new(db)));
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let vcs: Arc<dyn Vcs> = Arc::new(GitVcs::new(config.repos_dir(), runner.clone()));
    let hook: Option<Arc<dyn HookService>> = match &config.hook_url {
        Some(url) => {
            eprintln!("[server] delegating builds and deploys to hook at {}", url);
            Some(Arc::new(HttpHook::new(url.clone())?))
        }
        None => None,
    };

    let services = wire_services(&config, store, vcs, runner, hook);
    let cancel = CancellationToken::new();
    let watcher = Watcher::new(watcher_jobs(&services));
    let watcher_cancel = cancel.clone();
    let watcher_handle = tokio::spawn(async move { watcher.watch(watcher_cancel).await });

    let state = Arc::new(AppState {
        repositories: services.repositories,
        branches: services.branches,
        deployments: services.deployments,
        access_key: config.access_key.clone(),
    });
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    println!("Stagehand listening on http://{}", listener.local_addr()?);

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(cancel.clone()));
    tokio::select! {
        result = server => result.context("Server error")?,
        // Bounded drain: give open connections five seconds after the
        // shutdown signal, then stop waiting on them.
        _ = drain_deadline(cancel.clone()) => {
            eprintln!("[server] shutdown drain timed out");
        }
    }

    cancel.cancel();
    let _ = watcher_handle.await;
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    println!("\nShutting down...");
    cancel.cancel();
}

async fn drain_deadline(cancel: CancellationToken) {
    cancel.cancelled().await;
    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Branch, Repository, VcsRef};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    /// VCS stub: every operation succeeds and the remote is empty.
    struct NullVcs;

    #[async_trait]
    impl Vcs for NullVcs {
        async fn download(&self, _: &Repository, _: &CancellationToken) -> Result<()> {
            Ok(())
        }
        async fn list_remote(&self, _: &Repository, _: &CancellationToken) -> Result<Vec<VcsRef>> {
            Ok(Vec::new())
        }
        async fn switch_branch(
            &self,
            _: &Repository,
            _: &Branch,
            _: &CancellationToken,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn test_router(access_key: Option<&str>) -> Router {
        let config = Config::default();
        let store = Arc::new(SqliteStore::new(DbHandle::new(Db::new_in_memory().unwrap())));
        let services = wire_services(
            &config,
            store,
            Arc::new(NullVcs),
            Arc::new(SystemRunner),
            None,
        );
        let state = Arc::new(AppState {
            repositories: services.repositories,
            branches: services.branches,
            deployments: services.deployments,
            access_key: access_key.map(String::from),
        });
        build_router(state)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router(None);
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_and_list_repositories() {
        let app = test_router(None);
        let req = Request::builder()
            .method("POST")
            .uri("/repositories")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"type": "git", "alias": "svc", "name": "https://x/svc.git"})
                    .to_string(),
            ))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let repo: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(repo["alias"], "svc");
        assert_eq!(repo["status"], "pending");

        let req = Request::builder()
            .uri("/repositories")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let list: Vec<serde_json::Value> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(list.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_repository_type_is_bad_request() {
        let app = test_router(None);
        let req = Request::builder()
            .method("POST")
            .uri("/repositories")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"type": "svn", "alias": "svc", "name": "x"}).to_string(),
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_access_key_is_enforced() {
        let app = test_router(Some("k3y"));
        let req = Request::builder()
            .uri("/repositories")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .uri("/repositories?accessKey=wrong")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .uri("/repositories?accessKey=k3y")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_deployment_with_no_branches_is_bad_request() {
        let app = test_router(None);
        let req = Request::builder()
            .method("POST")
            .uri("/deployments")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"autoRebuild": false, "branches": []}).to_string(),
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_branch_rebuild_is_not_found() {
        let app = test_router(None);
        let req = Request::builder()
            .method("POST")
            .uri("/branch/999")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cors_header_is_permissive() {
        let app = test_router(None);
        let req = Request::builder()
            .uri("/health")
            .header("origin", "http://dashboard.local")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(
            resp.headers()
                .get("access-control-allow-origin")
                .map(|v| v.to_str().unwrap()),
            Some("*")
        );
    }
}
