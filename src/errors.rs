//! Typed error kinds for the orchestrator core.
//!
//! `Kind` holds the sentinel errors that control flow is allowed to match
//! on; everything else travels as `anyhow::Error`. Lower layers annotate
//! errors with a path label and a parameter map via [`ResultExt`], and the
//! annotation keeps the sentinel downcastable so upstream `kind_of` checks
//! keep working no matter how many layers wrapped it.

use std::fmt;

use thiserror::Error;

/// Sentinel error kinds shared by every subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Kind {
    #[error("not found")]
    NotFound,

    #[error("bad input")]
    BadInput,

    #[error("unauthorized")]
    Unauthorized,

    #[error("build canceled")]
    BuildCanceled,

    #[error("configuration is not found")]
    ConfigurationNotFound,
}

/// Structured annotation attached to an error: a path label identifying the
/// failing call site plus free-form key/value parameters.
pub struct ErrorContext {
    pub path: &'static str,
    pub params: Vec<(&'static str, String)>,
}

impl ErrorContext {
    pub fn new(path: &'static str) -> Self {
        Self {
            path,
            params: Vec::new(),
        }
    }

    pub fn with(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.params.push((key, value.to_string()));
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)?;
        for (k, v) in &self.params {
            write!(f, "; {}={}", k, v)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Extension trait that annotates a `Result` with an [`ErrorContext`].
pub trait ResultExt<T> {
    fn ctx(self, path: &'static str) -> anyhow::Result<T>;
    fn ctx_with(self, context: ErrorContext) -> anyhow::Result<T>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn ctx(self, path: &'static str) -> anyhow::Result<T> {
        self.ctx_with(ErrorContext::new(path))
    }

    fn ctx_with(self, context: ErrorContext) -> anyhow::Result<T> {
        self.map_err(|e| e.into().context(context))
    }
}

/// Return the sentinel kind carried anywhere in the error chain, if any.
pub fn kind_of(err: &anyhow::Error) -> Option<Kind> {
    err.downcast_ref::<Kind>().copied()
}

/// Whether the error chain carries the given sentinel.
pub fn is_kind(err: &anyhow::Error, kind: Kind) -> bool {
    kind_of(err) == Some(kind)
}

/// Construct a `BadInput` error with a human-readable reason.
pub fn bad_input(reason: impl fmt::Display) -> anyhow::Error {
    anyhow::Error::new(Kind::BadInput).context(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_survives_context_wrapping() {
        let err: anyhow::Result<()> = Err(anyhow::Error::new(Kind::NotFound));
        let err = err
            .ctx_with(ErrorContext::new("store.branch.find_by_id").with("branch", 7))
            .ctx("branches.build_job")
            .unwrap_err();
        assert!(is_kind(&err, Kind::NotFound));
        assert!(!is_kind(&err, Kind::BadInput));
    }

    #[test]
    fn context_renders_path_and_params() {
        let ctx = ErrorContext::new("vcs.git.switch_branch")
            .with("repository", 3)
            .with("branch", "main");
        assert_eq!(
            ctx.to_string(),
            "vcs.git.switch_branch; repository=3; branch=main"
        );
    }

    #[test]
    fn bad_input_carries_reason_and_kind() {
        let err = bad_input("repository alias must not be empty");
        assert!(is_kind(&err, Kind::BadInput));
        assert!(err.to_string().contains("alias must not be empty"));
    }

    #[test]
    fn plain_errors_have_no_kind() {
        let err = anyhow::anyhow!("disk on fire");
        assert_eq!(kind_of(&err), None);
    }
}
