use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::models::*;

/// Async-safe handle to the orchestrator database.
///
/// Wraps `Db` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, preventing synchronous SQLite I/O from
/// tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Db>>,
}

impl DbHandle {
    pub fn new(db: Db) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Db) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS repositories (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    type TEXT NOT NULL DEFAULT 'git',
                    alias TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    cfg_file TEXT,
                    secrets TEXT NOT NULL DEFAULT '[]',
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS branches (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repository_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
                    type TEXT NOT NULL,
                    name TEXT NOT NULL,
                    hash TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'enqueued',
                    error_msg TEXT,
                    compose_data BLOB,
                    UNIQUE(repository_id, type, name)
                );

                CREATE TABLE IF NOT EXISTS deployments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    status TEXT NOT NULL DEFAULT 'enqueued',
                    created_at TEXT NOT NULL,
                    auto_rebuild INTEGER NOT NULL DEFAULT 0,
                    branches TEXT NOT NULL DEFAULT '[]',
                    error_msg TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_branches_repository ON branches(repository_id);
                CREATE INDEX IF NOT EXISTS idx_branches_status ON branches(status);
                CREATE INDEX IF NOT EXISTS idx_deployments_status ON deployments(status);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Repositories ──────────────────────────────────────────────────

    pub fn add_repository(&self, r: &Repository) -> Result<Repository> {
        self.conn
            .execute(
                "INSERT INTO repositories (type, alias, name, status, cfg_file, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    r.repo_type.as_str(),
                    r.alias,
                    r.name,
                    r.status.as_str(),
                    r.cfg_file,
                    r.updated_at
                ],
            )
            .context("Failed to insert repository")?;
        let id = self.conn.last_insert_rowid();
        self.get_repository(id)?
            .context("Repository not found after insert")
    }

    pub fn list_repositories(&self) -> Result<Vec<Repository>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, type, alias, name, status, cfg_file, updated_at
                 FROM repositories ORDER BY alias",
            )
            .context("Failed to prepare list_repositories")?;
        let rows = stmt
            .query_map([], RepositoryRow::from_row)
            .context("Failed to query repositories")?;
        let mut repositories = Vec::new();
        for row in rows {
            repositories.push(row.context("Failed to read repository row")?.into_repository()?);
        }
        Ok(repositories)
    }

    pub fn get_repository(&self, id: i64) -> Result<Option<Repository>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, type, alias, name, status, cfg_file, updated_at
                 FROM repositories WHERE id = ?1",
            )
            .context("Failed to prepare get_repository")?;
        let row = stmt
            .query_row(params![id], RepositoryRow::from_row)
            .optional()
            .context("Failed to query repository")?;
        row.map(RepositoryRow::into_repository).transpose()
    }

    pub fn find_pending_repository(&self) -> Result<Option<Repository>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, type, alias, name, status, cfg_file, updated_at
                 FROM repositories WHERE status = ?1 LIMIT 1",
            )
            .context("Failed to prepare find_pending_repository")?;
        let row = stmt
            .query_row(params![RepositoryStatus::Pending.as_str()], RepositoryRow::from_row)
            .optional()
            .context("Failed to query pending repository")?;
        row.map(RepositoryRow::into_repository).transpose()
    }

    /// The ready repository that has waited the longest for a sync.
    pub fn find_outdated_repository(&self) -> Result<Option<Repository>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, type, alias, name, status, cfg_file, updated_at
                 FROM repositories WHERE status = ?1 ORDER BY updated_at ASC LIMIT 1",
            )
            .context("Failed to prepare find_outdated_repository")?;
        let row = stmt
            .query_row(params![RepositoryStatus::Ready.as_str()], RepositoryRow::from_row)
            .optional()
            .context("Failed to query outdated repository")?;
        row.map(RepositoryRow::into_repository).transpose()
    }

    pub fn update_repository(&self, r: &Repository) -> Result<Repository> {
        self.conn
            .execute(
                "UPDATE repositories SET status = ?2, cfg_file = ?3, updated_at = ?4 WHERE id = ?1",
                params![r.id, r.status.as_str(), r.cfg_file, r.updated_at],
            )
            .context("Failed to update repository")?;
        self.get_repository(r.id)?
            .context("Repository not found after update")
    }

    pub fn load_repository_secrets(&self, id: i64) -> Result<Vec<Variable>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT secrets FROM repositories WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query repository secrets")?;
        match raw {
            Some(raw) => {
                serde_json::from_str(&raw).context("Failed to parse repository secrets JSON")
            }
            None => Ok(Vec::new()),
        }
    }

    pub fn save_repository_secrets(&self, id: i64, secrets: &[Variable]) -> Result<()> {
        let raw = serde_json::to_string(secrets).context("Failed to encode repository secrets")?;
        self.conn
            .execute(
                "UPDATE repositories SET secrets = ?2 WHERE id = ?1",
                params![id, raw],
            )
            .context("Failed to save repository secrets")?;
        Ok(())
    }

    // ── Branches ──────────────────────────────────────────────────────

    pub fn add_branch(&self, b: &Branch) -> Result<Branch> {
        self.conn
            .execute(
                "INSERT INTO branches (repository_id, type, name, hash, status, error_msg)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    b.repository_id,
                    b.branch_type.as_str(),
                    b.name,
                    b.hash,
                    b.status.as_str(),
                    b.error_msg
                ],
            )
            .context("Failed to insert branch")?;
        let id = self.conn.last_insert_rowid();
        self.get_branch(id)?.context("Branch not found after insert")
    }

    pub fn list_branches(&self) -> Result<Vec<Branch>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, repository_id, type, name, hash, status, error_msg
                 FROM branches ORDER BY name",
            )
            .context("Failed to prepare list_branches")?;
        let rows = stmt
            .query_map([], BranchRow::from_row)
            .context("Failed to query branches")?;
        let mut branches = Vec::new();
        for row in rows {
            branches.push(row.context("Failed to read branch row")?.into_branch()?);
        }
        Ok(branches)
    }

    pub fn get_branch(&self, id: i64) -> Result<Option<Branch>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, repository_id, type, name, hash, status, error_msg
                 FROM branches WHERE id = ?1",
            )
            .context("Failed to prepare get_branch")?;
        let row = stmt
            .query_row(params![id], BranchRow::from_row)
            .optional()
            .context("Failed to query branch")?;
        row.map(BranchRow::into_branch).transpose()
    }

    pub fn find_branches_by_ids(&self, ids: &[i64]) -> Result<Vec<Branch>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT id, repository_id, type, name, hash, status, error_msg
             FROM branches WHERE id IN ({})",
            placeholders
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare find_branches_by_ids")?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(ids.iter()), BranchRow::from_row)
            .context("Failed to query branches by ids")?;
        let mut branches = Vec::new();
        for row in rows {
            branches.push(row.context("Failed to read branch row")?.into_branch()?);
        }
        Ok(branches)
    }

    pub fn find_branches_by_repository(&self, repository_id: i64) -> Result<Vec<Branch>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, repository_id, type, name, hash, status, error_msg
                 FROM branches WHERE repository_id = ?1",
            )
            .context("Failed to prepare find_branches_by_repository")?;
        let rows = stmt
            .query_map(params![repository_id], BranchRow::from_row)
            .context("Failed to query branches by repository")?;
        let mut branches = Vec::new();
        for row in rows {
            branches.push(row.context("Failed to read branch row")?.into_branch()?);
        }
        Ok(branches)
    }

    /// The next branch to build: enqueued, or building. A build left in
    /// that state was interrupted by a crash and is resumed from scratch.
    pub fn find_buildable_branch(&self) -> Result<Option<Branch>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, repository_id, type, name, hash, status, error_msg
                 FROM branches WHERE status IN (?1, ?2) LIMIT 1",
            )
            .context("Failed to prepare find_buildable_branch")?;
        let row = stmt
            .query_row(
                params![
                    BranchStatus::Enqueued.as_str(),
                    BranchStatus::Building.as_str()
                ],
                BranchRow::from_row,
            )
            .optional()
            .context("Failed to query buildable branch")?;
        row.map(BranchRow::into_branch).transpose()
    }

    pub fn update_branch(&self, b: &Branch) -> Result<Branch> {
        self.conn
            .execute(
                "UPDATE branches SET hash = ?2, status = ?3, error_msg = ?4 WHERE id = ?1",
                params![b.id, b.hash, b.status.as_str(), b.error_msg],
            )
            .context("Failed to update branch")?;
        self.get_branch(b.id)?.context("Branch not found after update")
    }

    pub fn update_branch_status(
        &self,
        id: i64,
        status: BranchStatus,
        error_msg: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE branches SET status = ?2, error_msg = ?3 WHERE id = ?1",
                params![id, status.as_str(), error_msg],
            )
            .context("Failed to update branch status")?;
        Ok(())
    }

    pub fn delete_branches(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!("DELETE FROM branches WHERE id IN ({})", placeholders);
        self.conn
            .execute(&sql, rusqlite::params_from_iter(ids.iter()))
            .context("Failed to delete branches")?;
        Ok(())
    }

    pub fn load_compose_data(&self, id: i64) -> Result<Option<Vec<u8>>> {
        let data: Option<Option<Vec<u8>>> = self
            .conn
            .query_row(
                "SELECT compose_data FROM branches WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query compose data")?;
        Ok(data.flatten())
    }

    pub fn save_compose_data(&self, id: i64, data: &[u8]) -> Result<()> {
        self.conn
            .execute(
                "UPDATE branches SET compose_data = ?2 WHERE id = ?1",
                params![id, data],
            )
            .context("Failed to save compose data")?;
        Ok(())
    }

    // ── Deployments ───────────────────────────────────────────────────

    pub fn add_deployment(&self, d: &Deployment) -> Result<Deployment> {
        let branches =
            serde_json::to_string(&d.branches).context("Failed to encode deployment branches")?;
        self.conn
            .execute(
                "INSERT INTO deployments (status, created_at, auto_rebuild, branches, error_msg)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    d.status.as_str(),
                    d.created_at,
                    d.auto_rebuild,
                    branches,
                    d.error_msg
                ],
            )
            .context("Failed to insert deployment")?;
        let id = self.conn.last_insert_rowid();
        self.get_deployment(id)?
            .context("Deployment not found after insert")
    }

    /// All non-closed deployments, newest first.
    pub fn list_open_deployments(&self) -> Result<Vec<Deployment>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, status, created_at, auto_rebuild, branches, error_msg
                 FROM deployments WHERE status != ?1 ORDER BY created_at DESC, id DESC",
            )
            .context("Failed to prepare list_open_deployments")?;
        let rows = stmt
            .query_map(params![DeploymentStatus::Closed.as_str()], DeploymentRow::from_row)
            .context("Failed to query deployments")?;
        let mut deployments = Vec::new();
        for row in rows {
            deployments.push(row.context("Failed to read deployment row")?.into_deployment()?);
        }
        Ok(deployments)
    }

    pub fn get_deployment(&self, id: i64) -> Result<Option<Deployment>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, status, created_at, auto_rebuild, branches, error_msg
                 FROM deployments WHERE id = ?1",
            )
            .context("Failed to prepare get_deployment")?;
        let row = stmt
            .query_row(params![id], DeploymentRow::from_row)
            .optional()
            .context("Failed to query deployment")?;
        row.map(DeploymentRow::into_deployment).transpose()
    }

    /// Ready auto-rebuild deployments referencing the given branch. The
    /// match joins on the embedded JSON branch list.
    pub fn find_deployments_for_auto_rebuild(&self, branch_id: i64) -> Result<Vec<Deployment>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT DISTINCT d.id, d.status, d.created_at, d.auto_rebuild, d.branches, d.error_msg
                 FROM deployments d, json_each(d.branches) b
                 WHERE json_extract(b.value, '$.id') = ?1
                   AND d.auto_rebuild = 1
                   AND d.status = ?2
                 ORDER BY d.created_at DESC",
            )
            .context("Failed to prepare find_deployments_for_auto_rebuild")?;
        let rows = stmt
            .query_map(
                params![branch_id, DeploymentStatus::Ready.as_str()],
                DeploymentRow::from_row,
            )
            .context("Failed to query auto-rebuild deployments")?;
        let mut deployments = Vec::new();
        for row in rows {
            deployments.push(row.context("Failed to read deployment row")?.into_deployment()?);
        }
        Ok(deployments)
    }

    pub fn update_deployment(&self, d: &Deployment) -> Result<Deployment> {
        let branches =
            serde_json::to_string(&d.branches).context("Failed to encode deployment branches")?;
        self.conn
            .execute(
                "UPDATE deployments SET status = ?2, branches = ?3, error_msg = ?4 WHERE id = ?1",
                params![d.id, d.status.as_str(), branches, d.error_msg],
            )
            .context("Failed to update deployment")?;
        self.get_deployment(d.id)?
            .context("Deployment not found after update")
    }
}

// ── Row mapping ───────────────────────────────────────────────────────

struct RepositoryRow {
    id: i64,
    repo_type: String,
    alias: String,
    name: String,
    status: String,
    cfg_file: Option<String>,
    updated_at: String,
}

impl RepositoryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repo_type: row.get(1)?,
            alias: row.get(2)?,
            name: row.get(3)?,
            status: row.get(4)?,
            cfg_file: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_repository(self) -> Result<Repository> {
        Ok(Repository {
            id: self.id,
            repo_type: RepositoryType::from_str(&self.repo_type).map_err(anyhow::Error::msg)?,
            alias: self.alias,
            name: self.name,
            status: RepositoryStatus::from_str(&self.status).map_err(anyhow::Error::msg)?,
            cfg_file: self.cfg_file,
            updated_at: self.updated_at,
        })
    }
}

struct BranchRow {
    id: i64,
    repository_id: i64,
    branch_type: String,
    name: String,
    hash: String,
    status: String,
    error_msg: Option<String>,
}

impl BranchRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repository_id: row.get(1)?,
            branch_type: row.get(2)?,
            name: row.get(3)?,
            hash: row.get(4)?,
            status: row.get(5)?,
            error_msg: row.get(6)?,
        })
    }

    fn into_branch(self) -> Result<Branch> {
        Ok(Branch {
            id: self.id,
            repository_id: self.repository_id,
            branch_type: BranchType::from_str(&self.branch_type).map_err(anyhow::Error::msg)?,
            name: self.name,
            hash: self.hash,
            status: BranchStatus::from_str(&self.status).map_err(anyhow::Error::msg)?,
            error_msg: self.error_msg,
        })
    }
}

struct DeploymentRow {
    id: i64,
    status: String,
    created_at: String,
    auto_rebuild: bool,
    branches: String,
    error_msg: Option<String>,
}

impl DeploymentRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            created_at: row.get(2)?,
            auto_rebuild: row.get(3)?,
            branches: row.get(4)?,
            error_msg: row.get(5)?,
        })
    }

    fn into_deployment(self) -> Result<Deployment> {
        Ok(Deployment {
            id: self.id,
            status: DeploymentStatus::from_str(&self.status).map_err(anyhow::Error::msg)?,
            created_at: self.created_at,
            auto_rebuild: self.auto_rebuild,
            branches: serde_json::from_str(&self.branches)
                .context("Failed to parse deployment branches JSON")?,
            error_msg: self.error_msg,
        })
    }
}
