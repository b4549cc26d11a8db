//! Variable enumeration and `{NAME}` substitution.
//!
//! Variables come from fixed sources in a fixed precedence: static,
//! repository (plus its persisted secrets), branch, deployment, extra
//! per-call pairs, and finally the `variables:` list embedded in the
//! configuration bytes themselves. Later sources override earlier ones.
//! Substitution is a single pass over the buffer, so replacement values are
//! never themselves substituted.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::models::{Branch, Repository, Variable};

/// The inputs a variable listing is computed from.
#[derive(Default)]
pub struct VarSources {
    pub repository: Option<Repository>,
    pub secrets: Vec<Variable>,
    pub branch: Option<Branch>,
    pub deployment_id: Option<i64>,
    /// Additional pairs appended by the caller (e.g. per-deployment branch
    /// directories). Highest precedence short of the embedded custom list.
    pub extra: Vec<(String, String)>,
}

pub struct VariableEngine {
    custom_files_dir: String,
}

impl VariableEngine {
    pub fn new(custom_files_dir: String) -> Self {
        Self { custom_files_dir }
    }

    /// Enumerate the well-known variables for the given sources.
    pub fn list(&self, src: &VarSources) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("CUSTOM_FILES_DIR".to_string(), self.custom_files_dir.clone());
        if let Some(r) = &src.repository {
            vars.insert("REPOSITORY_ID".to_string(), r.id.to_string());
            vars.insert("REPOSITORY_TYPE".to_string(), r.repo_type.to_string());
            vars.insert("REPOSITORY_NAME".to_string(), r.name.clone());
            vars.insert("REPOSITORY_ALIAS".to_string(), r.alias.clone());
            for secret in &src.secrets {
                vars.insert(secret.name.clone(), secret.value.clone());
            }
        }
        if let Some(b) = &src.branch {
            vars.insert("BRANCH_ID".to_string(), b.id.to_string());
            vars.insert("BRANCH_TYPE".to_string(), b.branch_type.to_string());
            vars.insert("BRANCH_NAME".to_string(), b.name.clone());
            vars.insert("BRANCH_HASH".to_string(), b.hash.clone());
        }
        if let Some(id) = src.deployment_id {
            vars.insert("DEPLOYMENT_ID".to_string(), id.to_string());
        }
        for (key, value) in &src.extra {
            vars.insert(key.clone(), value.clone());
        }
        vars
    }

    /// Substitute `{NAME}` tokens in `data` using the sources plus the
    /// custom `variables:` list found in the data itself.
    pub fn replace(&self, data: &[u8], src: &VarSources) -> Result<Vec<u8>> {
        let mut vars = self.list(src);
        for (key, value) in custom_variables(data)? {
            vars.insert(key, value);
        }
        Ok(substitute(data, &vars))
    }
}

/// Parse the `variables:` list of `KEY=VALUE` items out of configuration
/// bytes. Items without a `=` are ignored.
pub fn custom_variables(data: &[u8]) -> Result<Vec<(String, String)>> {
    #[derive(Deserialize)]
    struct VariablesOnly {
        #[serde(default)]
        variables: Vec<String>,
    }

    let parsed: VariablesOnly =
        serde_yaml::from_slice(data).context("Failed to parse variables list")?;
    Ok(parsed
        .variables
        .iter()
        .filter_map(|item| {
            item.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect())
}

/// Replace every literal `{NAME}` occurrence in one pass. Tokens with no
/// matching variable are left untouched.
pub fn substitute(data: &[u8], vars: &HashMap<String, String>) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'{' {
            if let Some(end) = token_end(&data[i + 1..]) {
                let key = &data[i + 1..i + 1 + end];
                let key = std::str::from_utf8(key).unwrap_or("");
                if let Some(value) = vars.get(key) {
                    out.extend_from_slice(value.as_bytes());
                    i += end + 2;
                    continue;
                }
            }
        }
        out.push(data[i]);
        i += 1;
    }
    out
}

/// Position of the closing brace of a `{NAME}` token, where NAME is a
/// nonempty run of `[A-Za-z0-9_]`.
fn token_end(data: &[u8]) -> Option<usize> {
    let mut len = 0;
    for &b in data {
        if b == b'}' {
            return if len > 0 { Some(len) } else { None };
        }
        if !(b.is_ascii_alphanumeric() || b == b'_') {
            return None;
        }
        len += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BranchStatus, BranchType, RepositoryStatus, RepositoryType};

    fn engine() -> VariableEngine {
        VariableEngine::new("/work/custom_files".into())
    }

    fn sources() -> VarSources {
        VarSources {
            repository: Some(Repository {
                id: 3,
                repo_type: RepositoryType::Git,
                alias: "svc".into(),
                name: "https://example.com/svc.git".into(),
                status: RepositoryStatus::Ready,
                cfg_file: None,
                updated_at: "2026-01-01T00:00:00Z".into(),
            }),
            secrets: vec![Variable {
                name: "API_TOKEN".into(),
                value: "s3cret".into(),
            }],
            branch: Some(Branch {
                id: 11,
                repository_id: 3,
                branch_type: BranchType::Head,
                name: "main".into(),
                hash: "abc123".into(),
                status: BranchStatus::Building,
                error_msg: None,
            }),
            deployment_id: Some(42),
            extra: Vec::new(),
        }
    }

    #[test]
    fn lists_all_well_known_variables() {
        let vars = engine().list(&sources());
        assert_eq!(vars["CUSTOM_FILES_DIR"], "/work/custom_files");
        assert_eq!(vars["REPOSITORY_ID"], "3");
        assert_eq!(vars["REPOSITORY_TYPE"], "git");
        assert_eq!(vars["REPOSITORY_ALIAS"], "svc");
        assert_eq!(vars["API_TOKEN"], "s3cret");
        assert_eq!(vars["BRANCH_ID"], "11");
        assert_eq!(vars["BRANCH_NAME"], "main");
        assert_eq!(vars["BRANCH_HASH"], "abc123");
        assert_eq!(vars["DEPLOYMENT_ID"], "42");
    }

    #[test]
    fn replace_substitutes_known_tokens_and_keeps_unknown() {
        let data = b"image: registry/{REPOSITORY_ALIAS}:{BRANCH_HASH}-{NOPE}";
        let out = engine().replace(data, &sources()).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "image: registry/svc:abc123-{NOPE}"
        );
    }

    #[test]
    fn replace_is_identity_on_token_free_text() {
        let data = b"services: {}\n";
        let once = engine().replace(data, &sources()).unwrap();
        assert_eq!(once, data.to_vec());
        let twice = engine().replace(&once, &sources()).unwrap();
        assert_eq!(twice, once);
    }

    #[test]
    fn substitution_is_single_pass() {
        let mut vars = HashMap::new();
        vars.insert("A".to_string(), "{B}".to_string());
        vars.insert("B".to_string(), "deep".to_string());
        // The replacement value {B} is not substituted again.
        assert_eq!(substitute(b"x={A}", &vars), b"x={B}".to_vec());
    }

    #[test]
    fn custom_variables_parse_and_skip_malformed() {
        let data = b"variables:\n  - FOO=bar\n  - BAZ=a=b\n  - NOEQUALS\n";
        let vars = custom_variables(data).unwrap();
        assert_eq!(
            vars,
            vec![
                ("FOO".to_string(), "bar".to_string()),
                ("BAZ".to_string(), "a=b".to_string()),
            ]
        );
    }

    #[test]
    fn custom_variables_override_well_known_ones() {
        let data = b"variables:\n  - BRANCH_NAME=overridden\nname: '{BRANCH_NAME}'";
        let out = engine().replace(data, &sources()).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("overridden"));
    }

    #[test]
    fn extra_pairs_take_precedence_over_entity_fields() {
        let mut src = sources();
        src.extra
            .push(("SVC_BRANCH_TMP_DIR".into(), "/work/branches/11".into()));
        let vars = engine().list(&src);
        assert_eq!(vars["SVC_BRANCH_TMP_DIR"], "/work/branches/11");
    }

    #[test]
    fn braces_without_valid_token_pass_through() {
        let vars = HashMap::new();
        assert_eq!(substitute(b"a {not a var} {} {", &vars), b"a {not a var} {} {".to_vec());
    }
}
