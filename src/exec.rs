//! Subprocess port: runs external commands with captured output.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::models::Cmd;

/// Abstraction over subprocess execution for testability.
/// Real implementation: [`SystemRunner`]. Tests use scripted doubles.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion and return its stdout. The child is
    /// killed when the cancellation token fires.
    async fn run(&self, cmd: &Cmd, cancel: &CancellationToken) -> Result<String>;
}

/// Runs commands on the host with the process environment inherited and the
/// command's extra `KEY=VALUE` pairs appended.
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, cmd: &Cmd, cancel: &CancellationToken) -> Result<String> {
        if cmd.log {
            eprintln!(
                "[exec] Exec cmd: [{}] {} {}",
                cmd.dir,
                cmd.name,
                cmd.args.join(" ")
            );
        }

        let mut command = Command::new(&cmd.name);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !cmd.dir.is_empty() {
            command.current_dir(&cmd.dir);
        }
        for pair in &cmd.env {
            if let Some((key, value)) = pair.split_once('=') {
                command.env(key, value);
            }
        }

        let child = command
            .spawn()
            .with_context(|| format!("Failed to spawn command: {}", cmd.name))?;

        let output = tokio::select! {
            result = child.wait_with_output() => {
                result.with_context(|| format!("Failed to wait for command: {}", cmd.name))?
            }
            _ = cancel.cancelled() => {
                anyhow::bail!("Command canceled: {}", cmd.name);
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Command failed: {} ({}); output: {}",
                cmd.name,
                output.status,
                stderr.trim()
            );
        }

        String::from_utf8(output.stdout)
            .with_context(|| format!("Invalid UTF-8 in output of {}", cmd.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn captures_stdout() {
        let out = SystemRunner
            .run(
                &Cmd {
                    name: "echo".into(),
                    args: vec!["hello".into()],
                    ..Cmd::default()
                },
                &token(),
            )
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn failure_carries_trimmed_stderr() {
        let err = SystemRunner
            .run(
                &Cmd {
                    name: "sh".into(),
                    args: vec!["-c".into(), "echo boom >&2; exit 3".into()],
                    ..Cmd::default()
                },
                &token(),
            )
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("boom"), "missing stderr in: {}", msg);
        assert!(!msg.contains('\n'));
    }

    #[tokio::test]
    async fn extra_env_is_appended_to_inherited_environment() {
        let out = SystemRunner
            .run(
                &Cmd {
                    name: "sh".into(),
                    args: vec!["-c".into(), "printf '%s' \"$STAGE_TEST_VAR\"".into()],
                    env: vec!["STAGE_TEST_VAR=42".into()],
                    ..Cmd::default()
                },
                &token(),
            )
            .await
            .unwrap();
        assert_eq!(out, "42");
    }

    #[tokio::test]
    async fn runs_in_the_given_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = SystemRunner
            .run(
                &Cmd {
                    name: "pwd".into(),
                    dir: dir.path().to_string_lossy().into_owned(),
                    ..Cmd::default()
                },
                &token(),
            )
            .await
            .unwrap();
        let got = std::fs::canonicalize(out.trim()).unwrap();
        let want = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn cancellation_stops_the_command() {
        let cancel = token();
        cancel.cancel();
        let err = SystemRunner
            .run(
                &Cmd {
                    name: "sleep".into(),
                    args: vec!["30".into()],
                    ..Cmd::default()
                },
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("canceled"));
    }

    #[tokio::test]
    async fn unknown_binary_is_a_spawn_error() {
        let err = SystemRunner
            .run(
                &Cmd {
                    name: "definitely-not-a-real-binary".into(),
                    ..Cmd::default()
                },
                &token(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to spawn"));
    }
}
