//! Optional remote hook handler client.
//!
//! When a hook URL is configured, branch builds and deployment applies are
//! delegated to an external handler over JSON HTTP, and branch deletions are
//! mirrored there. Without one, everything runs locally and only the port
//! stays in the picture.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Repository data passed to the hook handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRepo {
    pub id: i64,
    #[serde(rename = "type")]
    pub repo_type: String,
    pub alias: String,
}

/// Branch data passed to the hook handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookBranch {
    pub id: i64,
    pub repo_id: i64,
    #[serde(rename = "type")]
    pub branch_type: String,
    pub name: String,
    pub hash: String,
}

/// Deployment data passed to the hook handler. `branches` is keyed by
/// repository alias; `updated` marks deployments whose branch set should be
/// rolled forward to current hashes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookDeployment {
    pub id: i64,
    pub updated: bool,
    pub branches: HashMap<String, HookBranch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildBranchRequest {
    pub repo: HookRepo,
    pub branch: HookBranch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildBranchResponse {
    pub status: String,
    #[serde(default)]
    pub error_msg: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub repos: Vec<HookRepo>,
    pub deployments: Vec<HookDeployment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployStatus {
    pub status: String,
    #[serde(default)]
    pub error_msg: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployResponse {
    #[serde(default)]
    pub statuses: HashMap<i64, DeployStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanBranchesRequest {
    pub ids: Vec<i64>,
}

/// The hook handler as the core consumes it.
#[async_trait]
pub trait HookService: Send + Sync {
    async fn build_branch(&self, req: BuildBranchRequest) -> Result<BuildBranchResponse>;
    async fn deploy(&self, req: DeployRequest) -> Result<DeployResponse>;
    async fn clean_branches(&self, ids: Vec<i64>) -> Result<()>;
}

/// JSON-over-HTTP hook client.
pub struct HttpHook {
    base_url: String,
    client: reqwest::Client,
}

impl HttpHook {
    pub fn new(base_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build hook HTTP client")?;
        Ok(Self { base_url, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl HookService for HttpHook {
    async fn build_branch(&self, req: BuildBranchRequest) -> Result<BuildBranchResponse> {
        let resp = self
            .client
            .post(self.url("build-branch"))
            .json(&req)
            .send()
            .await
            .context("Hook build-branch request failed")?
            .error_for_status()
            .context("Hook build-branch returned an error status")?
            .json::<BuildBranchResponse>()
            .await
            .context("Hook build-branch returned invalid JSON")?;
        Ok(resp)
    }

    async fn deploy(&self, req: DeployRequest) -> Result<DeployResponse> {
        let resp = self
            .client
            .post(self.url("deploy"))
            .json(&req)
            .send()
            .await
            .context("Hook deploy request failed")?
            .error_for_status()
            .context("Hook deploy returned an error status")?
            .json::<DeployResponse>()
            .await
            .context("Hook deploy returned invalid JSON")?;
        Ok(resp)
    }

    async fn clean_branches(&self, ids: Vec<i64>) -> Result<()> {
        self.client
            .post(self.url("clean-branches"))
            .json(&CleanBranchesRequest { ids })
            .send()
            .await
            .context("Hook clean-branches request failed")?
            .error_for_status()
            .context("Hook clean-branches returned an error status")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_response_accepts_integer_keyed_statuses() {
        let raw = r#"{"statuses":{"7":{"status":"ready"},"8":{"status":"failed","errorMsg":"no space"}}}"#;
        let resp: DeployResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.statuses[&7].status, "ready");
        assert_eq!(resp.statuses[&8].error_msg.as_deref(), Some("no space"));
    }

    #[test]
    fn build_branch_request_uses_camel_case() {
        let req = BuildBranchRequest {
            repo: HookRepo {
                id: 1,
                repo_type: "git".into(),
                alias: "svc".into(),
            },
            branch: HookBranch {
                id: 2,
                repo_id: 1,
                branch_type: "head".into(),
                name: "main".into(),
                hash: "abc".into(),
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["branch"]["repoId"], 1);
        assert_eq!(json["branch"]["type"], "head");
        assert_eq!(json["repo"]["type"], "git");
    }

    #[test]
    fn url_joins_without_double_slash() {
        let hook = HttpHook::new("http://hooks.local:9000/".into()).unwrap();
        assert_eq!(hook.url("deploy"), "http://hooks.local:9000/deploy");
    }
}
