//! Runtime configuration, read from the environment.

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Default per-branch configuration file name, relative to the checkout
/// root. A repository row may override it.
pub const DEFAULT_CFG_FILE: &str = "stagehand.yml";

/// Working-directory layout.
pub const REPOSITORIES_DIR: &str = "repositories";
pub const BRANCHES_DIR: &str = "branches";
pub const CUSTOM_FILES_DIR: &str = "custom_files";
pub const CONFIG_DIR: &str = "config";

#[derive(Debug, Clone)]
pub struct Config {
    /// Root of all state owned by this process.
    pub work_dir: PathBuf,
    pub db_path: PathBuf,
    pub port: u16,
    /// Shared API access key; `None` disables the check.
    pub access_key: Option<String>,
    /// Remote hook handler base URL; `None` keeps builds and deploys local.
    pub hook_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let work_dir = PathBuf::from(".stagehand");
        Self {
            db_path: work_dir.join("stagehand.db"),
            work_dir,
            port: 8080,
            access_key: None,
            hook_url: None,
        }
    }
}

impl Config {
    /// Build the configuration from `STAGEHAND_*` environment variables,
    /// falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("STAGEHAND_WORKING_DIR") {
            let dir = dir.trim_end_matches('/').to_string();
            config.work_dir = PathBuf::from(dir);
            config.db_path = config.work_dir.join("stagehand.db");
        }
        if let Ok(path) = std::env::var("STAGEHAND_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Ok(port) = std::env::var("STAGEHAND_HTTP_PORT") {
            config.port = port
                .parse()
                .context("STAGEHAND_HTTP_PORT must be a port number")?;
        }
        if let Ok(key) = std::env::var("STAGEHAND_ACCESS_KEY") {
            if !key.is_empty() {
                config.access_key = Some(key);
            }
        }
        if let Ok(url) = std::env::var("STAGEHAND_HOOK_URL") {
            if !url.is_empty() {
                config.hook_url = Some(url.trim_end_matches('/').to_string());
            }
        }
        Ok(config)
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.work_dir.join(REPOSITORIES_DIR)
    }

    pub fn branches_dir(&self) -> PathBuf {
        self.work_dir.join(BRANCHES_DIR)
    }

    pub fn custom_files_dir(&self) -> PathBuf {
        self.work_dir.join(CUSTOM_FILES_DIR)
    }

    pub fn config_dir(&self) -> PathBuf {
        self.work_dir.join(CONFIG_DIR)
    }

    /// Where the merged manifest is written on every apply.
    pub fn compose_file(&self) -> PathBuf {
        self.work_dir.join("docker-compose.yml")
    }
}
