//! Version-control port and its git adapter.
//!
//! All git access goes through the subprocess port; the adapter owns the
//! checkout layout `<reposDir>/<alias>` and the ls-remote ref parser.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::errors::{ErrorContext, ResultExt};
use crate::exec::CommandRunner;
use crate::models::{Branch, BranchType, Cmd, Repository, VcsRef};

#[async_trait]
pub trait Vcs: Send + Sync {
    /// Clone the repository into the repositories directory.
    async fn download(&self, repo: &Repository, cancel: &CancellationToken) -> Result<()>;

    /// List the remote heads and tags with their commit hashes.
    async fn list_remote(
        &self,
        repo: &Repository,
        cancel: &CancellationToken,
    ) -> Result<Vec<VcsRef>>;

    /// Bring the working tree to the given branch, discarding local changes.
    async fn switch_branch(
        &self,
        repo: &Repository,
        branch: &Branch,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Parse `git ls-remote` output into refs. Lines that are neither heads nor
/// tags (HEAD, pull refs, peeled tags) are skipped.
pub fn parse_ls_remote(rx: &Regex, out: &str) -> Vec<VcsRef> {
    let mut refs = Vec::new();
    for line in out.lines() {
        let line = line.trim();
        let caps = match rx.captures(line) {
            Some(c) => c,
            None => continue,
        };
        let branch_type = match &caps[2] {
            "heads" => BranchType::Head,
            "tags" => BranchType::Tag,
            _ => continue,
        };
        refs.push(VcsRef {
            branch_type,
            name: caps[3].to_string(),
            hash: caps[1].to_string(),
        });
    }
    refs
}

pub struct GitVcs {
    repos_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
    remote_ref_rx: Regex,
}

impl GitVcs {
    pub fn new(repos_dir: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            repos_dir,
            runner,
            remote_ref_rx: Regex::new(r"^([a-f0-9]+)\s+refs/(heads|tags)/(.*)$")
                .expect("remote ref regex is valid"),
        }
    }

    fn checkout_dir(&self, repo: &Repository) -> String {
        self.repos_dir.join(&repo.alias).to_string_lossy().into_owned()
    }

    fn git(&self, args: &[&str], dir: String, log: bool) -> Cmd {
        Cmd {
            name: "git".into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: Vec::new(),
            dir,
            log,
        }
    }
}

#[async_trait]
impl Vcs for GitVcs {
    async fn download(&self, repo: &Repository, cancel: &CancellationToken) -> Result<()> {
        let dir = self.repos_dir.to_string_lossy().into_owned();
        self.runner
            .run(&self.git(&["clone", &repo.name, &repo.alias], dir, true), cancel)
            .await
            .ctx_with(ErrorContext::new("vcs.git.download").with("repository", repo.id))?;
        Ok(())
    }

    async fn list_remote(
        &self,
        repo: &Repository,
        cancel: &CancellationToken,
    ) -> Result<Vec<VcsRef>> {
        let out = self
            .runner
            .run(&self.git(&["ls-remote"], self.checkout_dir(repo), false), cancel)
            .await
            .ctx_with(ErrorContext::new("vcs.git.list_remote").with("repository", repo.id))?;
        Ok(parse_ls_remote(&self.remote_ref_rx, &out))
    }

    async fn switch_branch(
        &self,
        repo: &Repository,
        branch: &Branch,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let dir = self.checkout_dir(repo);
        self.runner
            .run(&self.git(&["fetch"], dir.clone(), true), cancel)
            .await
            .ctx_with(
                ErrorContext::new("vcs.git.switch_branch.fetch").with("repository", repo.id),
            )?;

        // A dirty tree would make the checkout fail; a failed reset is only
        // logged because a fresh clone has nothing to reset.
        if let Err(e) = self
            .runner
            .run(&self.git(&["reset", "--hard"], dir.clone(), true), cancel)
            .await
        {
            eprintln!("[vcs] reset before checkout failed for {}: {:#}", repo.alias, e);
        }

        let target = match branch.branch_type {
            BranchType::Tag => format!("tags/{}", branch.name),
            BranchType::Head => branch.name.clone(),
        };
        self.runner
            .run(&self.git(&["checkout", &target], dir.clone(), true), cancel)
            .await
            .ctx_with(
                ErrorContext::new("vcs.git.switch_branch.checkout")
                    .with("repository", repo.id)
                    .with("branch", branch.id),
            )?;

        if branch.branch_type == BranchType::Tag {
            return Ok(());
        }

        let origin = format!("origin/{}", branch.name);
        if let Err(e) = self
            .runner
            .run(&self.git(&["reset", "--hard", &origin], dir.clone(), true), cancel)
            .await
        {
            eprintln!("[vcs] reset to {} failed for {}: {:#}", origin, repo.alias, e);
        }

        self.runner
            .run(&self.git(&["pull"], dir, true), cancel)
            .await
            .ctx_with(
                ErrorContext::new("vcs.git.switch_branch.pull")
                    .with("repository", repo.id)
                    .with("branch", branch.id),
            )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RepositoryStatus, RepositoryType};
    use std::sync::Mutex;

    fn rx() -> Regex {
        Regex::new(r"^([a-f0-9]+)\s+refs/(heads|tags)/(.*)$").unwrap()
    }

    #[test]
    fn parses_heads_and_tags() {
        let out = "\
9f4b2c6de0f3a1b2c3d4e5f60718293a4b5c6d7e\trefs/heads/main
1111111111111111111111111111111111111111\trefs/heads/feature/login
2222222222222222222222222222222222222222\trefs/tags/v1.0.0
";
        let refs = parse_ls_remote(&rx(), out);
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].branch_type, BranchType::Head);
        assert_eq!(refs[0].name, "main");
        assert_eq!(refs[0].hash, "9f4b2c6de0f3a1b2c3d4e5f60718293a4b5c6d7e");
        assert_eq!(refs[1].name, "feature/login");
        assert_eq!(refs[2].branch_type, BranchType::Tag);
        assert_eq!(refs[2].name, "v1.0.0");
    }

    #[test]
    fn skips_head_pointer_and_peeled_tags() {
        let out = "\
3333333333333333333333333333333333333333\tHEAD
4444444444444444444444444444444444444444\trefs/pull/12/head
5555555555555555555555555555555555555555\trefs/tags/v2.0.0^{}
";
        let refs = parse_ls_remote(&rx(), out);
        // The peeled tag still matches refs/tags/ with the suffix in the name;
        // HEAD and pull refs are dropped.
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "v2.0.0^{}");
    }

    #[test]
    fn empty_output_yields_no_refs() {
        assert!(parse_ls_remote(&rx(), "").is_empty());
    }

    /// Records every command it is asked to run and returns scripted output.
    struct RecordingRunner {
        calls: Mutex<Vec<Cmd>>,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, cmd: &Cmd, _cancel: &CancellationToken) -> Result<String> {
            self.calls.lock().unwrap().push(cmd.clone());
            Ok(String::new())
        }
    }

    fn test_repo() -> Repository {
        Repository {
            id: 1,
            repo_type: RepositoryType::Git,
            alias: "svc".into(),
            name: "https://example.com/svc.git".into(),
            status: RepositoryStatus::Ready,
            cfg_file: None,
            updated_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    fn test_branch(branch_type: BranchType, name: &str) -> Branch {
        Branch {
            id: 2,
            repository_id: 1,
            branch_type,
            name: name.into(),
            hash: "aaa".into(),
            status: crate::models::BranchStatus::Building,
            error_msg: None,
        }
    }

    #[tokio::test]
    async fn switch_branch_head_runs_full_sequence() {
        let runner = Arc::new(RecordingRunner {
            calls: Mutex::new(Vec::new()),
        });
        let vcs = GitVcs::new(PathBuf::from("/work/repositories"), runner.clone());
        vcs.switch_branch(
            &test_repo(),
            &test_branch(BranchType::Head, "main"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let calls = runner.calls.lock().unwrap();
        let argv: Vec<Vec<String>> = calls.iter().map(|c| c.args.clone()).collect();
        assert_eq!(argv[0], vec!["fetch"]);
        assert_eq!(argv[1], vec!["reset", "--hard"]);
        assert_eq!(argv[2], vec!["checkout", "main"]);
        assert_eq!(argv[3], vec!["reset", "--hard", "origin/main"]);
        assert_eq!(argv[4], vec!["pull"]);
        assert!(calls.iter().all(|c| c.dir == "/work/repositories/svc"));
    }

    #[tokio::test]
    async fn switch_branch_tag_checks_out_tag_ref_and_stops() {
        let runner = Arc::new(RecordingRunner {
            calls: Mutex::new(Vec::new()),
        });
        let vcs = GitVcs::new(PathBuf::from("/work/repositories"), runner.clone());
        vcs.switch_branch(
            &test_repo(),
            &test_branch(BranchType::Tag, "v1.0.0"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let calls = runner.calls.lock().unwrap();
        let argv: Vec<Vec<String>> = calls.iter().map(|c| c.args.clone()).collect();
        assert_eq!(argv.last().unwrap(), &vec!["checkout", "tags/v1.0.0"]);
        // No origin reset or pull for tags.
        assert_eq!(argv.len(), 3);
    }

    #[tokio::test]
    async fn download_clones_into_repos_dir() {
        let runner = Arc::new(RecordingRunner {
            calls: Mutex::new(Vec::new()),
        });
        let vcs = GitVcs::new(PathBuf::from("/work/repositories"), runner.clone());
        vcs.download(&test_repo(), &CancellationToken::new())
            .await
            .unwrap();

        let calls = runner.calls.lock().unwrap();
        assert_eq!(
            calls[0].args,
            vec!["clone", "https://example.com/svc.git", "svc"]
        );
        assert_eq!(calls[0].dir, "/work/repositories");
    }
}
