//! Test runner backed by the project's own test command.

use std::path::Path;

use sy_agents::{RunReport, TestRunner};
use sy_core::{CoreError, Result};

/// Runs the workspace's test suite: `npm test` when a package.json is
/// present, `cargo test` for a Cargo project, otherwise a pass with a note
/// (nothing to run is not a failure).
pub struct CommandRunner;

impl CommandRunner {
    fn command_for(workspace: &Path) -> Option<(&'static str, &'static [&'static str])> {
        if workspace.join("package.json").exists() {
            Some(("npm", &["test", "--silent"]))
        } else if workspace.join("Cargo.toml").exists() {
            Some(("cargo", &["test", "--quiet"]))
        } else {
            None
        }
    }
}

#[async_trait::async_trait]
impl TestRunner for CommandRunner {
    async fn run(&self, workspace: &Path) -> Result<RunReport> {
        let Some((program, args)) = Self::command_for(workspace) else {
            tracing::debug!(workspace = %workspace.display(), "no test command detected");
            return Ok(RunReport {
                passed: true,
                stdout: "no test suite configured".into(),
                stderr: String::new(),
            });
        };

        let output = tokio::process::Command::new(program)
            .args(args)
            .current_dir(workspace)
            .output()
            .await
            .map_err(|e| CoreError::Transient(format!("spawn {program}: {e}")))?;

        Ok(RunReport {
            passed: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_workspace_passes_with_note() {
        let dir = tempfile::tempdir().unwrap();
        let report = CommandRunner.run(dir.path()).await.unwrap();
        assert!(report.passed);
        assert!(report.stdout.contains("no test suite"));
    }

    #[test]
    fn command_detection() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CommandRunner::command_for(dir.path()).is_none());
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        assert_eq!(CommandRunner::command_for(dir.path()).unwrap().0, "npm");
    }
}
