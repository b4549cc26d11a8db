//! Repository lifecycle: admission, the download job, and the sync job that
//! keeps branch rows aligned with the remote.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::branches::BranchService;
use crate::clock::{hour_ago_ts, now_ts};
use crate::errors::{bad_input, is_kind, ErrorContext, Kind, ResultExt};
use crate::models::*;
use crate::store::RepositoryStore;
use crate::vcs::Vcs;

pub struct RepositoryService {
    store: Arc<dyn RepositoryStore>,
    vcs: Arc<dyn Vcs>,
    branches: Arc<BranchService>,
}

impl RepositoryService {
    pub fn new(
        store: Arc<dyn RepositoryStore>,
        vcs: Arc<dyn Vcs>,
        branches: Arc<BranchService>,
    ) -> Self {
        Self { store, vcs, branches }
    }

    pub async fn list(&self) -> Result<Vec<Repository>> {
        self.store.find_all().await.ctx("repos.list")
    }

    /// Admit a new repository. It is stamped an hour into the past so it
    /// wins the oldest-ready selection right after its download finishes.
    pub async fn add(&self, form: AddRepositoryForm) -> Result<Repository> {
        let (repo_type, alias, name) = validate_add_form(&form)?;
        let repository = self
            .store
            .add(Repository {
                id: 0,
                repo_type,
                alias,
                name,
                status: RepositoryStatus::Pending,
                cfg_file: form.cfg_file.clone().filter(|f| !f.trim().is_empty()),
                updated_at: hour_ago_ts(),
            })
            .await
            .ctx("repos.add")?;
        eprintln!("[repos] repository #{} is added", repository.id);
        Ok(repository)
    }

    /// Download one pending repository, if any.
    pub async fn download_job(&self, cancel: &CancellationToken) -> Result<()> {
        let mut repository = match self.store.find_pending().await {
            Ok(r) => r,
            Err(e) if is_kind(&e, Kind::NotFound) => return Ok(()),
            Err(e) => return Err(e).ctx("repos.download_job.find_pending"),
        };

        let id = repository.id;
        repository.status = RepositoryStatus::Downloading;
        repository = self.store.update(repository).await.ctx_with(
            ErrorContext::new("repos.download_job.mark_downloading").with("repository", id),
        )?;

        let result = self.vcs.download(&repository, cancel).await;
        repository.status = match &result {
            Ok(()) => RepositoryStatus::Ready,
            Err(_) => RepositoryStatus::Failed,
        };
        self.store.update(repository).await.ctx_with(
            ErrorContext::new("repos.download_job.finish").with("repository", id),
        )?;
        match result {
            Ok(()) => {
                eprintln!("[repos] repository #{} is downloaded", id);
                Ok(())
            }
            Err(e) => {
                Err(e).ctx_with(ErrorContext::new("repos.download_job.download").with("repository", id))
            }
        }
    }

    /// Sync the ready repository that has waited the longest. The
    /// updated-at stamp is written even when the sync fails, so one broken
    /// repository cannot starve the rest.
    pub async fn sync_job(&self, cancel: &CancellationToken) -> Result<()> {
        let mut repository = match self.store.find_outdated().await {
            Ok(r) => r,
            Err(e) if is_kind(&e, Kind::NotFound) => return Ok(()),
            Err(e) => return Err(e).ctx("repos.sync_job.find_outdated"),
        };
        let id = repository.id;

        let result = async {
            let refs = self
                .vcs
                .list_remote(&repository, cancel)
                .await
                .ctx_with(ErrorContext::new("repos.sync_job.list_remote").with("repository", id))?;
            self.branches
                .sync(&repository, refs)
                .await
                .ctx_with(ErrorContext::new("repos.sync_job.sync").with("repository", id))
        }
        .await;

        repository.updated_at = now_ts();
        if let Err(e) = self.store.update(repository).await {
            eprintln!("[repos] failed to stamp repository #{}: {:#}", id, e);
        }
        result
    }
}

fn validate_add_form(form: &AddRepositoryForm) -> Result<(RepositoryType, String, String)> {
    let repo_type = RepositoryType::from_str(form.repo_type.trim()).map_err(|_| {
        bad_input(format!(
            "repository type is invalid; allowed values: {}",
            RepositoryType::Git
        ))
    })?;
    let alias = form.alias.trim().to_string();
    if alias.is_empty() {
        return Err(bad_input("repository alias must not be empty"));
    }
    let name = form.name.trim().to_string();
    if name.is_empty() {
        return Err(bad_input("repository name must not be empty"));
    }
    Ok((repo_type, alias, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(repo_type: &str, alias: &str, name: &str) -> AddRepositoryForm {
        AddRepositoryForm {
            repo_type: repo_type.into(),
            alias: alias.into(),
            name: name.into(),
            cfg_file: None,
        }
    }

    #[test]
    fn validation_accepts_trimmed_git_form() {
        let (repo_type, alias, name) =
            validate_add_form(&form("git", "  svc  ", " https://x/svc.git ")).unwrap();
        assert_eq!(repo_type, RepositoryType::Git);
        assert_eq!(alias, "svc");
        assert_eq!(name, "https://x/svc.git");
    }

    #[test]
    fn validation_rejects_unknown_type() {
        let err = validate_add_form(&form("svn", "svc", "https://x/svc")).unwrap_err();
        assert!(is_kind(&err, Kind::BadInput));
    }

    #[test]
    fn validation_rejects_blank_alias_and_name() {
        let err = validate_add_form(&form("git", "   ", "https://x/svc.git")).unwrap_err();
        assert!(is_kind(&err, Kind::BadInput));
        let err = validate_add_form(&form("git", "svc", "   ")).unwrap_err();
        assert!(is_kind(&err, Kind::BadInput));
    }
}
