//! External command execution.

use std::fmt::Debug;
use std::process::Stdio;

use async_trait::async_trait;
use kennel_common::{KennelError, KennelResult};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Captured result of an external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal.
    pub code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with `stdout`.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with `code` and `stderr`.
    #[must_use]
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command exited 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a failed run into [`KennelError::Command`].
    ///
    /// # Errors
    ///
    /// Returns the error when the command did not exit 0.
    pub fn check(self, program: &str) -> KennelResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(KennelError::Command {
                program: program.to_string(),
                message: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs external programs.
///
/// Failing to spawn is an `Err`; a non-zero exit is a successful call
/// returning a non-successful [`CommandOutput`].
#[async_trait]
pub trait CommandRunner: Debug + Send + Sync {
    /// Run `program` with `args`, feeding `stdin` if given.
    async fn run(&self, program: &str, args: &[String], stdin: Option<&str>) -> KennelResult<CommandOutput>;
}

/// Runs real processes with tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String], stdin: Option<&str>) -> KennelResult<CommandOutput> {
        tracing::trace!(program, ?args, "Running command");

        let spawn_error = |e: std::io::Error| KennelError::Command {
            program: program.to_string(),
            message: e.to_string(),
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await.map_err(spawn_error)?;
            drop(pipe);
        }

        let output = child.wait_with_output().await.map_err(spawn_error)?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Convert string slices to owned arguments.
#[must_use]
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn system_runner_captures_output() {
        let out = SystemRunner
            .run("sh", &args(["-c", "echo out; echo err >&2; exit 3"]), None)
            .await
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn system_runner_feeds_stdin() {
        let out = SystemRunner.run("cat", &[], Some("payload")).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "payload");
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let err = SystemRunner
            .run("/nonexistent/kennel-binary", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, KennelError::Command { .. }));
    }

    #[test]
    fn check_maps_failure() {
        let err = CommandOutput::failed(1, "boom\n").check("ip").unwrap_err();
        assert_eq!(err.to_string(), "Command `ip` failed: boom");
    }
}
