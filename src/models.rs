use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Repositories ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryType {
    Git,
}

impl RepositoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Git => "git",
        }
    }
}

impl std::fmt::Display for RepositoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepositoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git" => Ok(Self::Git),
            _ => Err(format!("Invalid repository type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryStatus {
    Pending,
    Downloading,
    Ready,
    Failed,
}

impl RepositoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RepositoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepositoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid repository status: {}", s)),
        }
    }
}

/// A remotely tracked source tree. `alias` doubles as the checkout folder
/// name under the repositories directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: i64,
    #[serde(rename = "type")]
    pub repo_type: RepositoryType,
    pub alias: String,
    pub name: String,
    pub status: RepositoryStatus,
    pub cfg_file: Option<String>,
    pub updated_at: String,
}

/// A secret variable persisted on a repository row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: String,
}

/// New repository form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddRepositoryForm {
    #[serde(rename = "type")]
    pub repo_type: String,
    pub alias: String,
    pub name: String,
    #[serde(default)]
    pub cfg_file: Option<String>,
}

// ── Branches ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchType {
    Head,
    Tag,
}

impl BranchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Head => "head",
            Self::Tag => "tag",
        }
    }
}

impl std::fmt::Display for BranchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BranchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "head" => Ok(Self::Head),
            "tag" => Ok(Self::Tag),
            _ => Err(format!("Invalid branch type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Enqueued,
    Building,
    Ready,
    Failed,
    Skipped,
}

impl BranchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Building => "building",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for BranchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BranchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enqueued" => Ok(Self::Enqueued),
            "building" => Ok(Self::Building),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid branch status: {}", s)),
        }
    }
}

/// A head or tag inside a repository, tracked by its remote commit hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub id: i64,
    pub repository_id: i64,
    #[serde(rename = "type")]
    pub branch_type: BranchType,
    pub name: String,
    pub hash: String,
    pub status: BranchStatus,
    pub error_msg: Option<String>,
}

/// A reference as reported by the remote listing, before it has a row.
#[derive(Debug, Clone, PartialEq)]
pub struct VcsRef {
    pub branch_type: BranchType,
    pub name: String,
    pub hash: String,
}

// ── Deployments ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Enqueued,
    Building,
    Ready,
    Failed,
    Closed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Building => "building",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enqueued" => Ok(Self::Enqueued),
            "building" => Ok(Self::Building),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Invalid deployment status: {}", s)),
        }
    }
}

/// Snapshot of a branch as pinned by a deployment at admission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentBranch {
    pub id: i64,
    pub hash: String,
}

/// A durable grouping of branch snapshots that jointly define a running
/// environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: i64,
    pub status: DeploymentStatus,
    pub created_at: String,
    pub auto_rebuild: bool,
    pub branches: Vec<DeploymentBranch>,
    pub error_msg: Option<String>,
}

/// New deployment form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddDeploymentForm {
    #[serde(default)]
    pub auto_rebuild: bool,
    pub branches: Vec<i64>,
}

/// Re-deployment form: the new branch set for an existing deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeployForm {
    pub branches: Vec<i64>,
}

// ── Subprocess commands ───────────────────────────────────────────────

/// An OS command as declared in a branch configuration or synthesized by
/// the core. `log` is never read from configuration files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cmd {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub dir: String,
    #[serde(skip)]
    pub log: bool,
}

// ── Branch build configuration ────────────────────────────────────────

/// One named step of a branch configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigStep {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub commands: Vec<Cmd>,
}

/// Parsed per-branch configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BranchConfig {
    #[serde(default)]
    pub steps: HashMap<String, ConfigStep>,
    #[serde(default)]
    pub build: Vec<String>,
    #[serde(default)]
    pub pre_deploy: Vec<String>,
    #[serde(default)]
    pub post_deploy: Vec<String>,
    #[serde(default)]
    pub compose: ComposeFile,
    #[serde(default)]
    pub variables: Vec<String>,
}

impl BranchConfig {
    /// Flatten the named steps selected by `names`, in order. A command
    /// with an empty dir inherits the step dir; a leading-dot relative dir
    /// is joined onto it. Declared variables become extra environment for
    /// every command.
    pub fn commands(&self, names: &[String]) -> Vec<Cmd> {
        let mut commands = Vec::new();
        for step_name in names {
            let step = match self.steps.get(step_name) {
                Some(s) => s,
                None => continue,
            };
            for cmd in &step.commands {
                let mut cmd = cmd.clone();
                if cmd.dir.is_empty() {
                    cmd.dir = step.dir.clone();
                } else if !step.dir.is_empty() && cmd.dir.starts_with('.') {
                    cmd.dir = format!("{}/{}", step.dir.trim_end_matches('/'), cmd.dir);
                }
                cmd.env.extend(self.variables.iter().cloned());
                commands.push(cmd);
            }
        }
        commands
    }

    pub fn build_commands(&self) -> Vec<Cmd> {
        self.commands(&self.build)
    }

    pub fn pre_deploy_commands(&self) -> Vec<Cmd> {
        self.commands(&self.pre_deploy)
    }

    pub fn post_deploy_commands(&self) -> Vec<Cmd> {
        self.commands(&self.post_deploy)
    }
}

// ── Compose manifests ─────────────────────────────────────────────────

/// The container-orchestration manifest applied by the deploy job.
/// Services are kept in a sorted map so encoding is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeFile {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub services: BTreeMap<String, ComposeService>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeService {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub restart: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

/// The per-branch build artifact: everything the deploy job needs from a
/// built branch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BranchComposeData {
    #[serde(default)]
    pub pre_deploy: Vec<Cmd>,
    #[serde(default)]
    pub post_deploy: Vec<Cmd>,
    #[serde(default)]
    pub compose: BTreeMap<String, ComposeService>,
}
