//! Narrow storage ports, one per entity.
//!
//! Services depend on these traits rather than on the SQLite adapter, so a
//! different backend can be slotted in. A missing row is always signaled by
//! the `NotFound` sentinel, never by a transport error, so callers can treat
//! an empty "find next" as a normal tick. Implementers should not assume
//! transactions across entities: every update is row-local.

use anyhow::Result;
use async_trait::async_trait;

use crate::db::DbHandle;
use crate::errors::{ErrorContext, Kind, ResultExt};
use crate::models::*;

#[async_trait]
pub trait RepositoryStore: Send + Sync {
    async fn find_all(&self) -> Result<Vec<Repository>>;
    async fn find_by_id(&self, id: i64) -> Result<Repository>;
    async fn find_pending(&self) -> Result<Repository>;
    async fn find_outdated(&self) -> Result<Repository>;
    async fn add(&self, r: Repository) -> Result<Repository>;
    async fn update(&self, r: Repository) -> Result<Repository>;
    async fn load_secrets(&self, id: i64) -> Result<Vec<Variable>>;
    async fn save_secrets(&self, id: i64, secrets: Vec<Variable>) -> Result<()>;
}

#[async_trait]
pub trait BranchStore: Send + Sync {
    async fn find_all(&self) -> Result<Vec<Branch>>;
    async fn find_by_id(&self, id: i64) -> Result<Branch>;
    async fn find_by_ids(&self, ids: Vec<i64>) -> Result<Vec<Branch>>;
    async fn find_by_repository(&self, repository_id: i64) -> Result<Vec<Branch>>;
    /// Enqueued or building (interrupted) branch, if any.
    async fn find_enqueued(&self) -> Result<Branch>;
    async fn add(&self, b: Branch) -> Result<Branch>;
    async fn update(&self, b: Branch) -> Result<Branch>;
    async fn update_status(
        &self,
        id: i64,
        status: BranchStatus,
        error_msg: Option<String>,
    ) -> Result<()>;
    async fn delete_by_ids(&self, ids: Vec<i64>) -> Result<()>;
    async fn load_compose_data(&self, id: i64) -> Result<Vec<u8>>;
    async fn save_compose_data(&self, id: i64, data: Vec<u8>) -> Result<()>;
}

#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// All non-closed deployments.
    async fn find_open(&self) -> Result<Vec<Deployment>>;
    async fn find_by_id(&self, id: i64) -> Result<Deployment>;
    async fn find_for_auto_rebuild(&self, branch_id: i64) -> Result<Vec<Deployment>>;
    async fn add(&self, d: Deployment) -> Result<Deployment>;
    async fn update(&self, d: Deployment) -> Result<Deployment>;
}

/// SQLite-backed implementation of all three storage ports.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbHandle,
}

impl SqliteStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

fn found<T>(row: Option<T>) -> Result<T> {
    row.ok_or_else(|| anyhow::Error::new(Kind::NotFound))
}

#[async_trait]
impl RepositoryStore for SqliteStore {
    async fn find_all(&self) -> Result<Vec<Repository>> {
        self.db
            .call(|db| db.list_repositories())
            .await
            .ctx("store.repository.find_all")
    }

    async fn find_by_id(&self, id: i64) -> Result<Repository> {
        self.db
            .call(move |db| found(db.get_repository(id)?))
            .await
            .ctx_with(ErrorContext::new("store.repository.find_by_id").with("repository", id))
    }

    async fn find_pending(&self) -> Result<Repository> {
        self.db
            .call(|db| found(db.find_pending_repository()?))
            .await
            .ctx("store.repository.find_pending")
    }

    async fn find_outdated(&self) -> Result<Repository> {
        self.db
            .call(|db| found(db.find_outdated_repository()?))
            .await
            .ctx("store.repository.find_outdated")
    }

    async fn add(&self, r: Repository) -> Result<Repository> {
        self.db
            .call(move |db| db.add_repository(&r))
            .await
            .ctx("store.repository.add")
    }

    async fn update(&self, r: Repository) -> Result<Repository> {
        let id = r.id;
        self.db
            .call(move |db| db.update_repository(&r))
            .await
            .ctx_with(ErrorContext::new("store.repository.update").with("repository", id))
    }

    async fn load_secrets(&self, id: i64) -> Result<Vec<Variable>> {
        self.db
            .call(move |db| db.load_repository_secrets(id))
            .await
            .ctx_with(ErrorContext::new("store.repository.load_secrets").with("repository", id))
    }

    async fn save_secrets(&self, id: i64, secrets: Vec<Variable>) -> Result<()> {
        self.db
            .call(move |db| db.save_repository_secrets(id, &secrets))
            .await
            .ctx_with(ErrorContext::new("store.repository.save_secrets").with("repository", id))
    }
}

#[async_trait]
impl BranchStore for SqliteStore {
    async fn find_all(&self) -> Result<Vec<Branch>> {
        self.db
            .call(|db| db.list_branches())
            .await
            .ctx("store.branch.find_all")
    }

    async fn find_by_id(&self, id: i64) -> Result<Branch> {
        self.db
            .call(move |db| found(db.get_branch(id)?))
            .await
            .ctx_with(ErrorContext::new("store.branch.find_by_id").with("branch", id))
    }

    async fn find_by_ids(&self, ids: Vec<i64>) -> Result<Vec<Branch>> {
        self.db
            .call(move |db| db.find_branches_by_ids(&ids))
            .await
            .ctx("store.branch.find_by_ids")
    }

    async fn find_by_repository(&self, repository_id: i64) -> Result<Vec<Branch>> {
        self.db
            .call(move |db| db.find_branches_by_repository(repository_id))
            .await
            .ctx_with(
                ErrorContext::new("store.branch.find_by_repository")
                    .with("repository", repository_id),
            )
    }

    async fn find_enqueued(&self) -> Result<Branch> {
        self.db
            .call(|db| found(db.find_buildable_branch()?))
            .await
            .ctx("store.branch.find_enqueued")
    }

    async fn add(&self, b: Branch) -> Result<Branch> {
        self.db
            .call(move |db| db.add_branch(&b))
            .await
            .ctx("store.branch.add")
    }

    async fn update(&self, b: Branch) -> Result<Branch> {
        let id = b.id;
        self.db
            .call(move |db| db.update_branch(&b))
            .await
            .ctx_with(ErrorContext::new("store.branch.update").with("branch", id))
    }

    async fn update_status(
        &self,
        id: i64,
        status: BranchStatus,
        error_msg: Option<String>,
    ) -> Result<()> {
        self.db
            .call(move |db| db.update_branch_status(id, status, error_msg.as_deref()))
            .await
            .ctx_with(
                ErrorContext::new("store.branch.update_status")
                    .with("branch", id)
                    .with("status", status),
            )
    }

    async fn delete_by_ids(&self, ids: Vec<i64>) -> Result<()> {
        self.db
            .call(move |db| db.delete_branches(&ids))
            .await
            .ctx("store.branch.delete_by_ids")
    }

    async fn load_compose_data(&self, id: i64) -> Result<Vec<u8>> {
        self.db
            .call(move |db| found(db.load_compose_data(id)?))
            .await
            .ctx_with(ErrorContext::new("store.branch.load_compose_data").with("branch", id))
    }

    async fn save_compose_data(&self, id: i64, data: Vec<u8>) -> Result<()> {
        self.db
            .call(move |db| db.save_compose_data(id, &data))
            .await
            .ctx_with(ErrorContext::new("store.branch.save_compose_data").with("branch", id))
    }
}

#[async_trait]
impl DeploymentStore for SqliteStore {
    async fn find_open(&self) -> Result<Vec<Deployment>> {
        self.db
            .call(|db| db.list_open_deployments())
            .await
            .ctx("store.deployment.find_open")
    }

    async fn find_by_id(&self, id: i64) -> Result<Deployment> {
        self.db
            .call(move |db| found(db.get_deployment(id)?))
            .await
            .ctx_with(ErrorContext::new("store.deployment.find_by_id").with("deployment", id))
    }

    async fn find_for_auto_rebuild(&self, branch_id: i64) -> Result<Vec<Deployment>> {
        self.db
            .call(move |db| db.find_deployments_for_auto_rebuild(branch_id))
            .await
            .ctx_with(
                ErrorContext::new("store.deployment.find_for_auto_rebuild")
                    .with("branch", branch_id),
            )
    }

    async fn add(&self, d: Deployment) -> Result<Deployment> {
        self.db
            .call(move |db| db.add_deployment(&d))
            .await
            .ctx("store.deployment.add")
    }

    async fn update(&self, d: Deployment) -> Result<Deployment> {
        let id = d.id;
        self.db
            .call(move |db| db.update_deployment(&d))
            .await
            .ctx_with(ErrorContext::new("store.deployment.update").with("deployment", id))
    }
}
