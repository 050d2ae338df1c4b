//! External process execution
//!
//! Every call to git, the build script, `tt-smi` and friends goes through the
//! [`CommandRunner`] trait so the reconciliation logic can be exercised with a
//! fake runner instead of real subprocesses.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

// ============================================================================
// Trait Definitions
// ============================================================================

/// A single external command to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
    /// Inherit the terminal's stdout/stderr instead of capturing them.
    /// Captured fields of the resulting [`CommandOutput`] stay empty.
    pub stream: bool,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
            stream: false,
        }
    }

    /// Shorthand for `git <args>` run inside `cwd`
    pub fn git<I, S>(cwd: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new("git").args(args).cwd(cwd)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn streamed(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Human-readable command line, used in logs and error messages
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// None when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, the way diagnostic tools are usually read
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }

    /// Last `max_chars` characters of stderr (or stdout when stderr is empty)
    pub fn diagnostic_tail(&self, max_chars: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let trimmed = source.trim();
        let count = trimmed.chars().count();
        if count <= max_chars {
            trimmed.to_string()
        } else {
            trimmed.chars().skip(count - max_chars).collect()
        }
    }
}

/// Failure to run a command at all. A non-zero exit is not an error at this
/// level; callers inspect [`CommandOutput::exit_code`].
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },
}

impl CommandError {
    /// True when the program itself could not be found
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Capability for running external commands with a timeout
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Production runner using tokio::process
#[derive(Debug, Default)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args).stdin(Stdio::null()).kill_on_drop(true);

        if let Some(cwd) = &invocation.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &invocation.envs {
            cmd.env(key, value);
        }

        if invocation.stream {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        tracing::debug!(
            command = %invocation.display(),
            cwd = ?invocation.cwd,
            timeout_secs = timeout.as_secs(),
            "Running external command"
        );

        let child = cmd.spawn().map_err(|source| CommandError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

        // Dropping the future on timeout drops the child, which kills it
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| CommandError::Spawn {
                program: invocation.program.clone(),
                source,
            })?,
            Err(_) => {
                tracing::warn!(
                    command = %invocation.display(),
                    timeout_secs = timeout.as_secs(),
                    "External command timed out"
                );
                return Err(CommandError::Timeout {
                    command: invocation.display(),
                    timeout,
                });
            }
        };

        let result = CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        tracing::debug!(
            command = %invocation.display(),
            exit_code = ?result.exit_code,
            "External command finished"
        );

        Ok(result)
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_builder() {
        let inv = Invocation::git("/tmp/repo", ["checkout", "abc123"]).env("GIT_TERMINAL_PROMPT", "0");

        assert_eq!(inv.program, "git");
        assert_eq!(inv.args, vec!["checkout", "abc123"]);
        assert_eq!(inv.cwd, Some(PathBuf::from("/tmp/repo")));
        assert_eq!(inv.display(), "git checkout abc123");
        assert!(!inv.stream);
        assert!(inv.streamed().stream);
    }

    #[test]
    fn test_diagnostic_tail_prefers_stderr() {
        let out = CommandOutput {
            exit_code: Some(1),
            stdout: "progress".to_string(),
            stderr: "fatal: reference is not a tree".to_string(),
        };
        assert_eq!(out.diagnostic_tail(5), " tree");
        assert_eq!(out.diagnostic_tail(500), "fatal: reference is not a tree");

        let out = CommandOutput {
            exit_code: Some(1),
            stdout: "only stdout\n".to_string(),
            stderr: "  ".to_string(),
        };
        assert_eq!(out.diagnostic_tail(100), "only stdout");
    }

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemCommandRunner::new();
        let out = runner
            .run(
                &Invocation::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]),
                Duration::from_secs(10),
            )
            .await
            .unwrap();

        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_system_runner_missing_binary() {
        let runner = SystemCommandRunner::new();
        let err = runner
            .run(
                &Invocation::new("definitely-not-a-real-binary-4711"),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();

        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_system_runner_timeout() {
        let runner = SystemCommandRunner::new();
        let err = runner
            .run(
                &Invocation::new("sleep").arg("5"),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_system_runner_cwd_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let runner = SystemCommandRunner::new();
        let out = runner
            .run(
                &Invocation::new("sh")
                    .args(["-c", "pwd; echo $JUKEBOX_TEST_VAR"])
                    .cwd(dir.path())
                    .env("JUKEBOX_TEST_VAR", "hello"),
                Duration::from_secs(10),
            )
            .await
            .unwrap();

        let lines: Vec<&str> = out.stdout.lines().collect();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(
            std::path::Path::new(lines[0]).canonicalize().unwrap(),
            expected
        );
        assert_eq!(lines[1], "hello");
    }
}
