//! Branch lifecycle: reconciliation against the remote listing and the
//! per-branch build pipeline.
//!
//! The build queue is driven entirely by row status; the only in-memory
//! state is the re-enqueue map, which lets a sync that observed a newer
//! commit cancel an in-flight build of the same branch without a kill
//! signal. The map's writer lock also serializes branch status writes so a
//! cancellation can never interleave with a status transition.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_CFG_FILE;
use crate::errors::{is_kind, ErrorContext, Kind, ResultExt};
use crate::exec::CommandRunner;
use crate::hook::{HookBranch, HookRepo, HookService};
use crate::manifest;
use crate::models::*;
use crate::store::{BranchStore, RepositoryStore};
use crate::vars::{VarSources, VariableEngine};
use crate::vcs::Vcs;
use crate::{deploys::DeploymentService, fs};

/// Actions derived from comparing the local branch set with the remote
/// listing. Identity is (type, name); any hash change moves the branch back
/// to enqueued. A build already running for the old hash is superseded
/// through the re-enqueue flag rather than a kill signal.
#[derive(Debug, Default)]
pub struct SyncPlan {
    pub insert: Vec<VcsRef>,
    pub update: Vec<Branch>,
    pub delete: Vec<i64>,
}

pub fn plan_sync(local: &[Branch], remote: &[VcsRef]) -> SyncPlan {
    let mut by_key: HashMap<(BranchType, &str), &Branch> = HashMap::new();
    for b in local {
        by_key.insert((b.branch_type, b.name.as_str()), b);
    }

    let mut plan = SyncPlan::default();
    let mut keep: HashMap<i64, bool> = HashMap::new();
    for r in remote {
        match by_key.get(&(r.branch_type, r.name.as_str())) {
            None => plan.insert.push(r.clone()),
            Some(existing) => {
                keep.insert(existing.id, true);
                if r.hash == existing.hash {
                    continue;
                }
                let mut updated = (*existing).clone();
                updated.hash = r.hash.clone();
                updated.status = BranchStatus::Enqueued;
                updated.error_msg = None;
                plan.update.push(updated);
            }
        }
    }
    for b in local {
        if !keep.contains_key(&b.id) {
            plan.delete.push(b.id);
        }
    }
    plan
}

pub struct BranchService {
    store: Arc<dyn BranchStore>,
    repositories: Arc<dyn RepositoryStore>,
    vcs: Arc<dyn Vcs>,
    runner: Arc<dyn CommandRunner>,
    engine: Arc<VariableEngine>,
    deployments: Arc<DeploymentService>,
    hook: Option<Arc<dyn HookService>>,
    repos_dir: PathBuf,
    branches_dir: PathBuf,
    config_dir: PathBuf,
    /// Re-enqueue flags, branch id → "a newer commit arrived". The writer
    /// side also serializes status writes.
    queue: RwLock<HashMap<i64, bool>>,
}

impl BranchService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn BranchStore>,
        repositories: Arc<dyn RepositoryStore>,
        vcs: Arc<dyn Vcs>,
        runner: Arc<dyn CommandRunner>,
        engine: Arc<VariableEngine>,
        deployments: Arc<DeploymentService>,
        hook: Option<Arc<dyn HookService>>,
        repos_dir: PathBuf,
        branches_dir: PathBuf,
        config_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            repositories,
            vcs,
            runner,
            engine,
            deployments,
            hook,
            repos_dir,
            branches_dir,
            config_dir,
            queue: RwLock::new(HashMap::new()),
        }
    }

    pub async fn list(&self) -> Result<Vec<Branch>> {
        self.store.find_all().await.ctx("branches.list")
    }

    /// Re-enqueue one branch (API trigger). Raises the re-enqueue flag so an
    /// in-flight build of the same branch gives way.
    pub async fn rebuild(&self, id: i64) -> Result<Branch> {
        let branch = self
            .store
            .find_by_id(id)
            .await
            .ctx_with(ErrorContext::new("branches.rebuild").with("branch", id))?;
        self.enqueue(branch.id).await?;
        self.store
            .find_by_id(id)
            .await
            .ctx_with(ErrorContext::new("branches.rebuild.reload").with("branch", id))
    }

    /// Reconcile the repository's branch rows against the remote listing.
    pub async fn sync(&self, repo: &Repository, remote: Vec<VcsRef>) -> Result<()> {
        let local = self
            .store
            .find_by_repository(repo.id)
            .await
            .ctx_with(ErrorContext::new("branches.sync.find_local").with("repository", repo.id))?;
        let plan = plan_sync(&local, &remote);

        for r in &plan.insert {
            let added = self
                .store
                .add(Branch {
                    id: 0,
                    repository_id: repo.id,
                    branch_type: r.branch_type,
                    name: r.name.clone(),
                    hash: r.hash.clone(),
                    status: BranchStatus::Enqueued,
                    error_msg: None,
                })
                .await
                .ctx_with(
                    ErrorContext::new("branches.sync.add")
                        .with("repository", repo.id)
                        .with("branchName", &r.name),
                )?;
            self.queue.write().await.insert(added.id, true);
        }

        for b in &plan.update {
            let guard = self.queue.write().await;
            self.store
                .update(b.clone())
                .await
                .ctx_with(ErrorContext::new("branches.sync.update").with("branch", b.id))?;
            drop(guard);
            self.queue.write().await.insert(b.id, true);
        }

        if !plan.delete.is_empty() {
            if let Err(e) = self.store.delete_by_ids(plan.delete.clone()).await {
                eprintln!("[branches] failed to delete stale branches: {:#}", e);
            }
            let mut queue = self.queue.write().await;
            for id in &plan.delete {
                queue.remove(id);
            }
            drop(queue);
            if let Some(hook) = &self.hook {
                if let Err(e) = hook.clean_branches(plan.delete.clone()).await {
                    eprintln!("[branches] hook clean-branches failed: {:#}", e);
                }
            }
        }
        Ok(())
    }

    /// Build the next enqueued (or interrupted) branch, if any.
    pub async fn build_job(&self, cancel: &CancellationToken) -> Result<()> {
        let branch = match self.store.find_enqueued().await {
            Ok(b) => b,
            Err(e) if is_kind(&e, Kind::NotFound) => return Ok(()),
            Err(e) => return Err(e).ctx("branches.build_job.find_enqueued"),
        };

        let repo = match self.repositories.find_by_id(branch.repository_id).await {
            Ok(r) => r,
            Err(e) => {
                let msg = format!(
                    "Can't find repository id={}; err={:#}",
                    branch.repository_id, e
                );
                self.set_status(branch.id, BranchStatus::Failed, Some(msg))
                    .await?;
                return Ok(());
            }
        };

        self.begin_build(branch.id).await?;

        let (status, error_msg) = match &self.hook {
            Some(hook) => match self.build_remote(hook.as_ref(), &repo, &branch, cancel).await {
                Ok(outcome) => outcome,
                Err(e) => (BranchStatus::Failed, Some(format!("{:#}", e))),
            },
            None => match self.build_local(&repo, &branch, cancel).await {
                Ok(()) => (BranchStatus::Ready, None),
                Err(e) if is_kind(&e, Kind::BuildCanceled) => {
                    eprintln!(
                        "[builder] build of branch #{} superseded by a newer commit",
                        branch.id
                    );
                    return Ok(());
                }
                Err(e) if is_kind(&e, Kind::ConfigurationNotFound) => {
                    (BranchStatus::Skipped, None)
                }
                Err(e) => (BranchStatus::Failed, Some(format!("{:#}", e))),
            },
        };

        self.set_status(branch.id, status, error_msg.clone()).await?;
        match status {
            BranchStatus::Ready => {
                eprintln!("[builder] branch #{} is built", branch.id);
                self.deployments
                    .auto_rebuild(&branch)
                    .await
                    .ctx_with(ErrorContext::new("branches.build_job.auto_rebuild").with("branch", branch.id))?;
            }
            BranchStatus::Skipped => {
                eprintln!("[builder] branch #{} has no configuration, skipped", branch.id);
            }
            BranchStatus::Failed => {
                eprintln!(
                    "[builder] branch #{} failed: {}",
                    branch.id,
                    error_msg.as_deref().unwrap_or("unknown error")
                );
            }
            _ => {}
        }
        Ok(())
    }

    async fn build_local(
        &self,
        repo: &Repository,
        branch: &Branch,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.guard(branch.id).await?;
        fs::recreate_dir(&self.branches_dir.join(branch.id.to_string()))
            .await
            .ctx_with(ErrorContext::new("branches.build.scratch_dir").with("branch", branch.id))?;

        self.guard(branch.id).await?;
        self.vcs
            .switch_branch(repo, branch, cancel)
            .await
            .ctx_with(ErrorContext::new("branches.build.switch_branch").with("branch", branch.id))?;

        self.guard(branch.id).await?;
        let cfg = self.read_configuration(repo, branch).await?;

        let checkout = self.repos_dir.join(&repo.alias);
        for mut cmd in cfg.build_commands() {
            self.guard(branch.id).await?;
            cmd.dir = resolve_build_dir(&checkout, &cmd.dir);
            cmd.log = true;
            self.runner.run(&cmd, cancel).await.ctx_with(
                ErrorContext::new("branches.build.command")
                    .with("branch", branch.id)
                    .with("cmd", &cmd.name),
            )?;
        }

        self.guard(branch.id).await?;
        let data = manifest::encode(&BranchComposeData {
            pre_deploy: cfg.pre_deploy_commands(),
            post_deploy: cfg.post_deploy_commands(),
            compose: cfg.compose.services.clone(),
        })?;
        self.store
            .save_compose_data(branch.id, data)
            .await
            .ctx_with(ErrorContext::new("branches.build.save_compose_data").with("branch", branch.id))?;
        Ok(())
    }

    async fn build_remote(
        &self,
        hook: &dyn HookService,
        repo: &Repository,
        branch: &Branch,
        cancel: &CancellationToken,
    ) -> Result<(BranchStatus, Option<String>)> {
        self.vcs
            .switch_branch(repo, branch, cancel)
            .await
            .ctx_with(ErrorContext::new("branches.build.switch_branch").with("branch", branch.id))?;

        let resp = hook
            .build_branch(crate::hook::BuildBranchRequest {
                repo: HookRepo {
                    id: repo.id,
                    repo_type: repo.repo_type.to_string(),
                    alias: repo.alias.clone(),
                },
                branch: HookBranch {
                    id: branch.id,
                    repo_id: branch.repository_id,
                    branch_type: branch.branch_type.to_string(),
                    name: branch.name.clone(),
                    hash: branch.hash.clone(),
                },
            })
            .await
            .ctx_with(ErrorContext::new("branches.build.hook").with("branch", branch.id))?;

        match resp.status.parse::<BranchStatus>() {
            Ok(status @ (BranchStatus::Ready | BranchStatus::Skipped)) => Ok((status, None)),
            _ => {
                eprintln!(
                    "[builder] branch #{} was not built, see hook handler; status={}",
                    branch.id, resp.status
                );
                Ok((BranchStatus::Failed, resp.error_msg))
            }
        }
    }

    /// Resolve the configuration file, substitute variables, and decode it.
    async fn read_configuration(
        &self,
        repo: &Repository,
        branch: &Branch,
    ) -> Result<BranchConfig> {
        let cfg_name = repo.cfg_file.as_deref().unwrap_or(DEFAULT_CFG_FILE);
        let primary = self.repos_dir.join(&repo.alias).join(cfg_name);
        let fallback = self
            .config_dir
            .join("repositories")
            .join(&repo.alias)
            .join(DEFAULT_CFG_FILE);

        let data = match read_optional(&primary).await? {
            Some(data) => data,
            None => match read_optional(&fallback).await? {
                Some(data) => data,
                None => return Err(anyhow::Error::new(Kind::ConfigurationNotFound)),
            },
        };

        let secrets = self
            .repositories
            .load_secrets(repo.id)
            .await
            .ctx_with(ErrorContext::new("branches.read_configuration.secrets").with("repository", repo.id))?;
        let data = self
            .engine
            .replace(
                &data,
                &VarSources {
                    repository: Some(repo.clone()),
                    secrets,
                    branch: Some(branch.clone()),
                    ..VarSources::default()
                },
            )
            .ctx_with(ErrorContext::new("branches.read_configuration.replace").with("branch", branch.id))?;
        manifest::decode(&data).ctx_with(
            ErrorContext::new("branches.read_configuration.decode").with("branch", branch.id),
        )
    }

    /// Mark the branch enqueued and raise its re-enqueue flag.
    async fn enqueue(&self, id: i64) -> Result<()> {
        let guard = self.queue.write().await;
        self.store
            .update_status(id, BranchStatus::Enqueued, None)
            .await?;
        drop(guard);
        self.queue.write().await.insert(id, true);
        Ok(())
    }

    /// Mark the branch building and clear its re-enqueue flag in one
    /// critical section.
    async fn begin_build(&self, id: i64) -> Result<()> {
        let mut guard = self.queue.write().await;
        guard.insert(id, false);
        self.store
            .update_status(id, BranchStatus::Building, None)
            .await
    }

    /// Between-step cancellation point.
    async fn guard(&self, id: i64) -> Result<()> {
        if self.queue.read().await.get(&id).copied().unwrap_or(false) {
            return Err(anyhow::Error::new(Kind::BuildCanceled));
        }
        Ok(())
    }

    async fn set_status(
        &self,
        id: i64,
        status: BranchStatus,
        error_msg: Option<String>,
    ) -> Result<()> {
        let guard = self.queue.write().await;
        let res = self.store.update_status(id, status, error_msg).await;
        drop(guard);
        res
    }
}

/// A leading-dot command dir is joined onto the checkout; an empty one runs
/// at the checkout root. Absolute dirs pass through.
fn resolve_build_dir(checkout: &std::path::Path, dir: &str) -> String {
    if dir.is_empty() {
        return checkout.to_string_lossy().into_owned();
    }
    if dir.starts_with('.') {
        return format!("{}/{}", checkout.to_string_lossy(), dir);
    }
    dir.to_string()
}

async fn read_optional(path: &std::path::Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).ctx_with(
            ErrorContext::new("branches.read_configuration.read").with("path", path.display()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(id: i64, branch_type: BranchType, name: &str, hash: &str, status: BranchStatus) -> Branch {
        Branch {
            id,
            repository_id: 1,
            branch_type,
            name: name.into(),
            hash: hash.into(),
            status,
            error_msg: None,
        }
    }

    fn vcs_ref(branch_type: BranchType, name: &str, hash: &str) -> VcsRef {
        VcsRef {
            branch_type,
            name: name.into(),
            hash: hash.into(),
        }
    }

    #[test]
    fn plan_inserts_unknown_remote_refs() {
        let plan = plan_sync(
            &[],
            &[
                vcs_ref(BranchType::Head, "main", "aaa"),
                vcs_ref(BranchType::Tag, "v1", "bbb"),
            ],
        );
        assert_eq!(plan.insert.len(), 2);
        assert!(plan.update.is_empty());
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn plan_updates_changed_hash_and_resets_status() {
        let local = [branch(7, BranchType::Head, "main", "aaa", BranchStatus::Ready)];
        let plan = plan_sync(&local, &[vcs_ref(BranchType::Head, "main", "bbb")]);
        assert_eq!(plan.update.len(), 1);
        assert_eq!(plan.update[0].hash, "bbb");
        assert_eq!(plan.update[0].status, BranchStatus::Enqueued);
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn plan_supersedes_building_branch_on_new_hash() {
        let local = [branch(7, BranchType::Head, "main", "aaa", BranchStatus::Building)];
        let plan = plan_sync(&local, &[vcs_ref(BranchType::Head, "main", "bbb")]);
        assert_eq!(plan.update.len(), 1);
        assert_eq!(plan.update[0].hash, "bbb");
        assert_eq!(plan.update[0].status, BranchStatus::Enqueued);
    }

    #[test]
    fn plan_same_hash_keeps_building_branch_untouched() {
        let local = [branch(7, BranchType::Head, "main", "aaa", BranchStatus::Building)];
        let plan = plan_sync(&local, &[vcs_ref(BranchType::Head, "main", "aaa")]);
        assert!(plan.update.is_empty());
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn plan_deletes_refs_gone_from_remote() {
        let local = [
            branch(7, BranchType::Head, "main", "aaa", BranchStatus::Ready),
            branch(8, BranchType::Head, "old-feature", "ccc", BranchStatus::Failed),
        ];
        let plan = plan_sync(&local, &[vcs_ref(BranchType::Head, "main", "aaa")]);
        assert!(plan.insert.is_empty());
        assert!(plan.update.is_empty());
        assert_eq!(plan.delete, vec![8]);
    }

    #[test]
    fn plan_distinguishes_head_and_tag_with_same_name() {
        let local = [branch(7, BranchType::Head, "v1", "aaa", BranchStatus::Ready)];
        let plan = plan_sync(&local, &[vcs_ref(BranchType::Tag, "v1", "aaa")]);
        // The tag is new, the head disappeared.
        assert_eq!(plan.insert.len(), 1);
        assert_eq!(plan.delete, vec![7]);
    }

    #[test]
    fn plan_same_hash_is_a_no_op() {
        let local = [branch(7, BranchType::Head, "main", "aaa", BranchStatus::Ready)];
        let plan = plan_sync(&local, &[vcs_ref(BranchType::Head, "main", "aaa")]);
        assert!(plan.insert.is_empty());
        assert!(plan.update.is_empty());
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn build_dir_resolution() {
        let checkout = std::path::Path::new("/work/repositories/svc");
        assert_eq!(resolve_build_dir(checkout, ""), "/work/repositories/svc");
        assert_eq!(
            resolve_build_dir(checkout, "./app"),
            "/work/repositories/svc/./app"
        );
        assert_eq!(resolve_build_dir(checkout, "/abs/path"), "/abs/path");
    }
}
