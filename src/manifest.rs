//! Manifest encoding and the compose-service merge.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::models::{ComposeFile, ComposeService};

/// Encode a structured manifest to bytes.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let text = serde_yaml::to_string(value).context("Failed to encode manifest")?;
    Ok(text.into_bytes())
}

/// Decode a structured manifest from bytes.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    serde_yaml::from_slice(data).context("Failed to decode manifest")
}

/// The manifest every deploy pass starts from: the operator's override at
/// `<configDir>/docker-compose.yml` when present, otherwise a built-in
/// reverse proxy wired to the docker socket.
pub fn base_manifest(config_dir: &Path) -> Result<ComposeFile> {
    let override_path = config_dir.join("docker-compose.yml");
    match std::fs::read(&override_path) {
        Ok(data) => decode(&data).with_context(|| {
            format!("Failed to parse base manifest at {}", override_path.display())
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(default_manifest()),
        Err(e) => Err(e).with_context(|| {
            format!("Failed to read base manifest at {}", override_path.display())
        }),
    }
}

fn default_manifest() -> ComposeFile {
    let mut services = BTreeMap::new();
    services.insert(
        "proxy".to_string(),
        ComposeService {
            image: "nginxproxy/nginx-proxy:alpine".to_string(),
            restart: "always".to_string(),
            ports: vec!["80:80".to_string(), "443:443".to_string()],
            volumes: vec!["/var/run/docker.sock:/tmp/docker.sock:ro".to_string()],
            ..ComposeService::default()
        },
    );
    ComposeFile {
        version: "3".to_string(),
        services,
    }
}

/// Merge branch services into the global manifest, last writer wins per
/// service name. Colliding names are not detected; branches are expected to
/// namespace their services.
pub fn merge_services(target: &mut ComposeFile, services: &BTreeMap<String, ComposeService>) {
    for (name, service) in services {
        target.services.insert(name.clone(), service.clone());
    }
}
