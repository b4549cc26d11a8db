//! Deployment lifecycle: admission, auto-rebuild fan-out, and the reconcile
//! job that merges per-branch compose data into the global manifest and
//! applies it.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::clock::now_ts;
use crate::errors::{bad_input, ErrorContext, ResultExt};
use crate::exec::CommandRunner;
use crate::hook::{DeployRequest, DeployStatus, HookBranch, HookDeployment, HookRepo, HookService};
use crate::manifest;
use crate::models::*;
use crate::store::{BranchStore, DeploymentStore, RepositoryStore};
use crate::vars::{VarSources, VariableEngine};

pub struct DeploymentService {
    store: Arc<dyn DeploymentStore>,
    branches: Arc<dyn BranchStore>,
    repositories: Arc<dyn RepositoryStore>,
    runner: Arc<dyn CommandRunner>,
    engine: Arc<VariableEngine>,
    hook: Option<Arc<dyn HookService>>,
    work_dir: PathBuf,
    branches_dir: PathBuf,
    config_dir: PathBuf,
}

impl DeploymentService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        branches: Arc<dyn BranchStore>,
        repositories: Arc<dyn RepositoryStore>,
        runner: Arc<dyn CommandRunner>,
        engine: Arc<VariableEngine>,
        hook: Option<Arc<dyn HookService>>,
        work_dir: PathBuf,
        branches_dir: PathBuf,
        config_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            branches,
            repositories,
            runner,
            engine,
            hook,
            work_dir,
            branches_dir,
            config_dir,
        }
    }

    /// Non-closed deployments, newest first.
    pub async fn list(&self) -> Result<Vec<Deployment>> {
        self.store.find_open().await.ctx("deploys.list")
    }

    /// Admit a new deployment with the referenced branches' hashes pinned.
    pub async fn add(&self, form: AddDeploymentForm) -> Result<Deployment> {
        let pinned = self.resolve_branches(&form.branches).await?;
        let deployment = self
            .store
            .add(Deployment {
                id: 0,
                status: DeploymentStatus::Enqueued,
                created_at: now_ts(),
                auto_rebuild: form.auto_rebuild,
                branches: pinned,
                error_msg: None,
            })
            .await
            .ctx("deploys.add")?;
        eprintln!("[deployer] deployment #{} is requested", deployment.id);
        Ok(deployment)
    }

    /// Re-enqueue an existing deployment with a new branch set.
    pub async fn rebuild(&self, id: i64, form: RedeployForm) -> Result<Deployment> {
        let mut deployment = self
            .store
            .find_by_id(id)
            .await
            .ctx_with(ErrorContext::new("deploys.rebuild.find").with("deployment", id))?;
        deployment.branches = self.resolve_branches(&form.branches).await?;
        deployment.status = DeploymentStatus::Enqueued;
        deployment.error_msg = None;
        let deployment = self
            .store
            .update(deployment)
            .await
            .ctx_with(ErrorContext::new("deploys.rebuild.update").with("deployment", id))?;
        eprintln!("[deployer] deployment #{} is enqueued for rebuilding", id);
        Ok(deployment)
    }

    /// Close the deployment. Closed is terminal.
    pub async fn close(&self, id: i64) -> Result<()> {
        let mut deployment = self
            .store
            .find_by_id(id)
            .await
            .ctx_with(ErrorContext::new("deploys.close.find").with("deployment", id))?;
        deployment.status = DeploymentStatus::Closed;
        self.store
            .update(deployment)
            .await
            .ctx_with(ErrorContext::new("deploys.close.update").with("deployment", id))?;
        eprintln!("[deployer] deployment #{} is closed", id);
        Ok(())
    }

    /// Re-enqueue every ready auto-rebuild deployment referencing the branch.
    pub async fn auto_rebuild(&self, branch: &Branch) -> Result<()> {
        let deployments = self
            .store
            .find_for_auto_rebuild(branch.id)
            .await
            .ctx_with(ErrorContext::new("deploys.auto_rebuild.find").with("branch", branch.id))?;
        for mut d in deployments {
            d.status = DeploymentStatus::Enqueued;
            let id = d.id;
            if let Err(e) = self.store.update(d).await {
                eprintln!("[deployer] failed to enqueue deployment #{}: {:#}", id, e);
                continue;
            }
            eprintln!("[deployer] deployment #{} is enqueued for auto-rebuilding", id);
        }
        Ok(())
    }

    async fn resolve_branches(&self, ids: &[i64]) -> Result<Vec<DeploymentBranch>> {
        if ids.is_empty() {
            return Err(bad_input("deployment must reference at least one branch"));
        }
        let found = self
            .branches
            .find_by_ids(ids.to_vec())
            .await
            .ctx("deploys.resolve_branches")?;
        let by_id: HashMap<i64, &Branch> = found.iter().map(|b| (b.id, b)).collect();
        let mut pinned = Vec::with_capacity(ids.len());
        for id in ids {
            match by_id.get(id) {
                Some(b) => pinned.push(DeploymentBranch {
                    id: b.id,
                    hash: b.hash.clone(),
                }),
                None => return Err(bad_input(format!("unknown branch id {}", id))),
            }
        }
        Ok(pinned)
    }

    /// The reconcile pass: merge every open ready/enqueued deployment into
    /// one manifest and apply it when anything moved to building.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let deployments = self.store.find_open().await.ctx("deploys.run.find_open")?;
        let repositories = self
            .repositories
            .find_all()
            .await
            .ctx("deploys.run.find_repositories")?;
        let repo_map: HashMap<i64, Repository> =
            repositories.iter().map(|r| (r.id, r.clone())).collect();
        let branch_rows = self.branches.find_all().await.ctx("deploys.run.find_branches")?;
        let branch_map: HashMap<i64, Branch> =
            branch_rows.iter().map(|b| (b.id, b.clone())).collect();

        let mut compose =
            manifest::base_manifest(&self.config_dir).ctx("deploys.run.base_manifest")?;
        let mut pre_deploy: HashMap<(i64, i64), Vec<Cmd>> = HashMap::new();
        let mut post_deploy: HashMap<(i64, i64), Vec<Cmd>> = HashMap::new();
        let mut building: Vec<Deployment> = Vec::new();
        let mut apply = false;

        for mut d in deployments {
            // A building row at pass start is a crash leftover; it is
            // prepared again and settled by the deferred finalization.
            if !matches!(
                d.status,
                DeploymentStatus::Ready | DeploymentStatus::Enqueued | DeploymentStatus::Building
            ) {
                continue;
            }
            let old_status = d.status;
            if let Err(e) = self
                .prepare(&mut d, &repo_map, &branch_map, &mut compose, &mut pre_deploy, &mut post_deploy)
                .await
            {
                eprintln!("[deployer] failed to prepare deployment #{}: {:#}", d.id, e);
            }
            if d.status != old_status {
                d = match self.store.update(d).await {
                    Ok(d) => d,
                    Err(e) => {
                        eprintln!("[deployer] failed to update deployment: {:#}", e);
                        continue;
                    }
                };
            }
            if d.status == DeploymentStatus::Building {
                apply = true;
                building.push(d);
            }
        }

        if !apply {
            return Ok(());
        }

        eprintln!("[deployer] updating docker-compose configuration");
        let result = match &self.hook {
            Some(hook) => {
                self.apply_remote(hook.as_ref(), &building, &repo_map, &branch_map)
                    .await
            }
            None => self
                .apply_local(&building, &pre_deploy, &post_deploy, &compose, cancel)
                .await
                .map(|_| {
                    building
                        .iter()
                        .map(|d| {
                            (
                                d.id,
                                DeployStatus {
                                    status: DeploymentStatus::Ready.to_string(),
                                    error_msg: None,
                                },
                            )
                        })
                        .collect()
                }),
        };

        // Deferred finalization: every building deployment gets a terminal
        // status for this pass, even when the apply sequence failed.
        let statuses = match result {
            Ok(statuses) => statuses,
            Err(e) => {
                let msg = format!("{:#}", e);
                let mut statuses = HashMap::new();
                for d in &building {
                    statuses.insert(
                        d.id,
                        DeployStatus {
                            status: DeploymentStatus::Failed.to_string(),
                            error_msg: Some(msg.clone()),
                        },
                    );
                }
                self.finalize(building, &statuses).await;
                return Err(e).ctx("deploys.run.apply");
            }
        };
        self.finalize(building, &statuses).await;
        eprintln!("[deployer] docker-compose configuration is updated");
        Ok(())
    }

    async fn finalize(&self, building: Vec<Deployment>, statuses: &HashMap<i64, DeployStatus>) {
        for mut d in building {
            match statuses.get(&d.id) {
                Some(s) if s.status == DeploymentStatus::Ready.as_str() => {
                    d.status = DeploymentStatus::Ready;
                    d.error_msg = None;
                }
                Some(s) => {
                    d.status = DeploymentStatus::Failed;
                    d.error_msg = s.error_msg.clone();
                }
                None => {
                    d.status = DeploymentStatus::Failed;
                    d.error_msg = Some("no status reported for deployment".to_string());
                }
            }
            let id = d.id;
            let status = d.status;
            if let Err(e) = self.store.update(d).await {
                eprintln!("[deployer] failed to finalize deployment #{}: {:#}", id, e);
                continue;
            }
            eprintln!("[deployer] deployment #{} is {}", id, status);
        }
    }

    /// Fold one deployment into the pass: load and substitute every branch
    /// blob, merge its services, collect its commands, refresh pinned
    /// hashes, and move enqueued → building.
    async fn prepare(
        &self,
        d: &mut Deployment,
        repo_map: &HashMap<i64, Repository>,
        branch_map: &HashMap<i64, Branch>,
        compose: &mut ComposeFile,
        pre_deploy: &mut HashMap<(i64, i64), Vec<Cmd>>,
        post_deploy: &mut HashMap<(i64, i64), Vec<Cmd>>,
    ) -> Result<()> {
        for i in 0..d.branches.len() {
            let branch_id = d.branches[i].id;
            let branch = match branch_map.get(&branch_id) {
                Some(b) => b.clone(),
                None => {
                    // The branch disappeared from the remote. A running
                    // environment is closed for good; one still being
                    // prepared fails with a diagnostic.
                    if d.status == DeploymentStatus::Ready {
                        d.status = DeploymentStatus::Closed;
                    } else {
                        d.status = DeploymentStatus::Failed;
                        d.error_msg =
                            Some(format!("deployment references deleted branch {}", branch_id));
                    }
                    return Err(anyhow::anyhow!(
                        "deployment #{} references deleted branch {}",
                        d.id,
                        branch_id
                    ));
                }
            };

            let data = match self.branches.load_compose_data(branch.id).await {
                Ok(data) => data,
                Err(e) => {
                    d.status = DeploymentStatus::Failed;
                    d.error_msg = Some(format!(
                        "no compose data for branch {}: {:#}",
                        branch.id, e
                    ));
                    return Err(e).ctx_with(
                        ErrorContext::new("deploys.prepare.load_compose_data")
                            .with("deployment", d.id)
                            .with("branch", branch.id),
                    );
                }
            };

            let sources = VarSources {
                deployment_id: Some(d.id),
                extra: branch_variables(d, branch_map, repo_map, &self.branches_dir),
                ..VarSources::default()
            };
            let data = match self.engine.replace(&data, &sources) {
                Ok(data) => data,
                Err(e) => {
                    d.status = DeploymentStatus::Failed;
                    d.error_msg = Some(format!("{:#}", e));
                    return Err(e).ctx_with(
                        ErrorContext::new("deploys.prepare.replace")
                            .with("deployment", d.id)
                            .with("branch", branch.id),
                    );
                }
            };
            let branch_data: BranchComposeData = match manifest::decode(&data) {
                Ok(parsed) => parsed,
                Err(e) => {
                    d.status = DeploymentStatus::Failed;
                    d.error_msg = Some(format!("{:#}", e));
                    return Err(e).ctx_with(
                        ErrorContext::new("deploys.prepare.decode")
                            .with("deployment", d.id)
                            .with("branch", branch.id),
                    );
                }
            };

            pre_deploy.insert((d.id, branch.id), branch_data.pre_deploy);
            post_deploy.insert((d.id, branch.id), branch_data.post_deploy);
            d.branches[i].hash = branch.hash.clone();
            manifest::merge_services(compose, &branch_data.compose);
        }

        if d.status == DeploymentStatus::Enqueued {
            d.status = DeploymentStatus::Building;
        }
        Ok(())
    }

    async fn apply_local(
        &self,
        building: &[Deployment],
        pre_deploy: &HashMap<(i64, i64), Vec<Cmd>>,
        post_deploy: &HashMap<(i64, i64), Vec<Cmd>>,
        compose: &ComposeFile,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let data = manifest::encode(compose)?;
        write_manifest(&self.work_dir.join("docker-compose.yml"), &data)
            .ctx("deploys.apply.write_manifest")?;

        self.run_deployment_commands(building, pre_deploy, cancel)
            .await?;

        self.runner
            .run(
                &Cmd {
                    name: "docker-compose".into(),
                    args: vec!["up".into(), "-d".into(), "--remove-orphans".into()],
                    env: Vec::new(),
                    dir: self.work_dir.to_string_lossy().into_owned(),
                    log: true,
                },
                cancel,
            )
            .await
            .ctx("deploys.apply.up")?;

        self.run_deployment_commands(building, post_deploy, cancel)
            .await?;
        Ok(())
    }

    async fn apply_remote(
        &self,
        hook: &dyn HookService,
        building: &[Deployment],
        repo_map: &HashMap<i64, Repository>,
        branch_map: &HashMap<i64, Branch>,
    ) -> Result<HashMap<i64, DeployStatus>> {
        let mut req = DeployRequest {
            repos: repo_map
                .values()
                .map(|r| HookRepo {
                    id: r.id,
                    repo_type: r.repo_type.to_string(),
                    alias: r.alias.clone(),
                })
                .collect(),
            deployments: Vec::with_capacity(building.len()),
        };
        for d in building {
            let mut branches = HashMap::new();
            for db in &d.branches {
                let branch = match branch_map.get(&db.id) {
                    Some(b) => b,
                    None => continue,
                };
                let alias = repo_map
                    .get(&branch.repository_id)
                    .map(|r| r.alias.clone())
                    .unwrap_or_default();
                branches.insert(
                    alias,
                    HookBranch {
                        id: branch.id,
                        repo_id: branch.repository_id,
                        branch_type: branch.branch_type.to_string(),
                        name: branch.name.clone(),
                        hash: branch.hash.clone(),
                    },
                );
            }
            req.deployments.push(HookDeployment {
                id: d.id,
                updated: true,
                branches,
            });
        }
        let resp = hook.deploy(req).await.ctx("deploys.apply.hook")?;
        Ok(resp.statuses)
    }

    async fn run_deployment_commands(
        &self,
        building: &[Deployment],
        commands: &HashMap<(i64, i64), Vec<Cmd>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for d in building {
            for db in &d.branches {
                let list = match commands.get(&(d.id, db.id)) {
                    Some(list) => list,
                    None => continue,
                };
                for cmd in list {
                    let mut cmd = cmd.clone();
                    cmd.dir = resolve_deploy_dir(&self.branches_dir, db.id, &cmd.dir);
                    cmd.log = true;
                    self.runner.run(&cmd, cancel).await.ctx_with(
                        ErrorContext::new("deploys.commands")
                            .with("deployment", d.id)
                            .with("branch", db.id)
                            .with("cmd", &cmd.name),
                    )?;
                }
            }
        }
        Ok(())
    }
}

/// Per-deployment-branch variables: `<ALIAS>_BRANCH_ID` and
/// `<ALIAS>_BRANCH_TMP_DIR` for every branch in the deployment.
fn branch_variables(
    d: &Deployment,
    branch_map: &HashMap<i64, Branch>,
    repo_map: &HashMap<i64, Repository>,
    branches_dir: &Path,
) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    for db in &d.branches {
        let branch = match branch_map.get(&db.id) {
            Some(b) => b,
            None => continue,
        };
        let repo = match repo_map.get(&branch.repository_id) {
            Some(r) => r,
            None => continue,
        };
        let alias = repo.alias.to_uppercase();
        vars.push((format!("{}_BRANCH_ID", alias), branch.id.to_string()));
        vars.push((
            format!("{}_BRANCH_TMP_DIR", alias),
            format!("{}/{}", branches_dir.display(), branch.id),
        ));
    }
    vars
}

/// Empty command dirs run in the branch scratch dir; leading-dot dirs are
/// joined onto it.
fn resolve_deploy_dir(branches_dir: &Path, branch_id: i64, dir: &str) -> String {
    if dir.is_empty() {
        return format!("{}/{}", branches_dir.display(), branch_id);
    }
    if dir.starts_with('.') {
        return format!("{}/{}/{}", branches_dir.display(), branch_id, dir);
    }
    dir.to_string()
}

fn write_manifest(path: &Path, data: &[u8]) -> Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o755);
    }
    let mut file = options.open(path)?;
    file.write_all(data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BranchStatus, BranchType, RepositoryStatus, RepositoryType};

    fn repo(id: i64, alias: &str) -> Repository {
        Repository {
            id,
            repo_type: RepositoryType::Git,
            alias: alias.into(),
            name: format!("https://example.com/{}.git", alias),
            status: RepositoryStatus::Ready,
            cfg_file: None,
            updated_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    fn branch(id: i64, repository_id: i64) -> Branch {
        Branch {
            id,
            repository_id,
            branch_type: BranchType::Head,
            name: "main".into(),
            hash: "abc".into(),
            status: BranchStatus::Ready,
            error_msg: None,
        }
    }

    #[test]
    fn branch_variables_cover_every_deployment_branch() {
        let d = Deployment {
            id: 5,
            status: DeploymentStatus::Enqueued,
            created_at: "2026-01-01T00:00:00Z".into(),
            auto_rebuild: false,
            branches: vec![
                DeploymentBranch { id: 1, hash: "a".into() },
                DeploymentBranch { id: 2, hash: "b".into() },
            ],
            error_msg: None,
        };
        let branch_map = HashMap::from([(1, branch(1, 10)), (2, branch(2, 20))]);
        let repo_map = HashMap::from([(10, repo(10, "api")), (20, repo(20, "web"))]);

        let vars = branch_variables(&d, &branch_map, &repo_map, Path::new("/work/branches"));
        let vars: HashMap<String, String> = vars.into_iter().collect();
        assert_eq!(vars["API_BRANCH_ID"], "1");
        assert_eq!(vars["API_BRANCH_TMP_DIR"], "/work/branches/1");
        assert_eq!(vars["WEB_BRANCH_ID"], "2");
        assert_eq!(vars["WEB_BRANCH_TMP_DIR"], "/work/branches/2");
    }

    #[test]
    fn deploy_dir_resolution() {
        let base = Path::new("/work/branches");
        assert_eq!(resolve_deploy_dir(base, 7, ""), "/work/branches/7");
        assert_eq!(resolve_deploy_dir(base, 7, "./app"), "/work/branches/7/./app");
        assert_eq!(resolve_deploy_dir(base, 7, "/abs"), "/abs");
    }

    #[test]
    fn manifest_write_truncates_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docker-compose.yml");
        write_manifest(&path, b"version: '3'\nservices: {}\n# long tail to truncate\n").unwrap();
        write_manifest(&path, b"version: '3'\n").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"version: '3'\n".to_vec());
    }
}
