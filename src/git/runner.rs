//! Process-runner capability for the git executable.
//!
//! Everything that shells out to git goes through [`ProcessRunner`] so that
//! request handlers and store operations can be exercised against a scripted
//! fake.  The production implementation, [`TokioRunner`], wraps
//! [`tokio::process::Command`].

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, trace};

/// Write end of a subprocess's standard input.
pub type ProcessStdin = Box<dyn AsyncWrite + Send + Unpin>;
/// Read end of a subprocess's standard output.
pub type ProcessStdout = Box<dyn AsyncRead + Send + Unpin>;

// ---------------------------------------------------------------------------
// Command description
// ---------------------------------------------------------------------------

/// Arguments, working directory and extra environment for one git invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Lossy rendering of the argument vector, for logs and assertions.
    pub fn display_args(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Exit status of a finished subprocess.  `code` is `None` when the process
/// was terminated by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("terminated by signal"),
        }
    }
}

/// Captured output of a run-to-completion invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitOutcome,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error and standard output combined, trimmed.  Some git
    /// porcelain (e.g. `commit`) reports on stdout rather than stderr.
    pub fn diagnostics(&self) -> String {
        let stderr = String::from_utf8_lossy(&self.stderr);
        let stdout = String::from_utf8_lossy(&self.stdout);
        match (stderr.trim(), stdout.trim()) {
            ("", out) => out.to_string(),
            (err, "") => err.to_string(),
            (err, out) => format!("{err}\n{out}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A running subprocess with piped stdin/stdout.
///
/// Implementations must terminate the process when dropped.
#[async_trait]
pub trait Subprocess: Send {
    fn take_stdin(&mut self) -> Option<ProcessStdin>;
    fn take_stdout(&mut self) -> Option<ProcessStdout>;
    async fn wait(&mut self) -> io::Result<ExitOutcome>;
    /// Ask the process to terminate without waiting for it.
    fn start_kill(&mut self);
}

/// Launches git subprocesses.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Spawn a long-lived subprocess with piped stdin and stdout.
    fn start(&self, spec: CommandSpec) -> io::Result<Box<dyn Subprocess>>;

    /// Run to completion with stdin closed, capturing stdout and stderr.
    async fn output(&self, spec: CommandSpec) -> io::Result<CommandOutput>;
}

// ---------------------------------------------------------------------------
// Tokio implementation
// ---------------------------------------------------------------------------

/// Runs the configured git binary via [`tokio::process::Command`].
#[derive(Debug, Clone)]
pub struct TokioRunner {
    program: PathBuf,
}

impl TokioRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ProcessRunner for TokioRunner {
    fn start(&self, spec: CommandSpec) -> io::Result<Box<dyn Subprocess>> {
        let mut cmd = self.command(&spec);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        debug!(args = ?spec.display_args(), pid = child.id(), "spawned git subprocess");

        // Drain stderr so a chatty subprocess never blocks on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "githost::git::stderr", "{line}");
                }
            });
        }

        Ok(Box::new(TokioSubprocess { child }))
    }

    async fn output(&self, spec: CommandSpec) -> io::Result<CommandOutput> {
        let mut cmd = self.command(&spec);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        trace!(args = ?spec.display_args(), "running git");
        let output = cmd.output().await?;
        Ok(CommandOutput {
            status: output.status.into(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

struct TokioSubprocess {
    child: Child,
}

#[async_trait]
impl Subprocess for TokioSubprocess {
    fn take_stdin(&mut self) -> Option<ProcessStdin> {
        self.child.stdin.take().map(|s| Box::new(s) as ProcessStdin)
    }

    fn take_stdout(&mut self) -> Option<ProcessStdout> {
        self.child.stdout.take().map(|s| Box::new(s) as ProcessStdout)
    }

    async fn wait(&mut self) -> io::Result<ExitOutcome> {
        self.child.wait().await.map(Into::into)
    }

    fn start_kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            // Already reaped.
            trace!(error = %e, "start_kill on finished subprocess");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_builder_accumulates() {
        let spec = CommandSpec::new(["clone", "--mirror"])
            .arg("https://example.test/repo.git")
            .current_dir("/tmp")
            .env("GIT_SSH_COMMAND", "ssh -i key");
        assert_eq!(
            spec.display_args(),
            vec!["clone", "--mirror", "https://example.test/repo.git"]
        );
        assert_eq!(spec.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(spec.env, vec![("GIT_SSH_COMMAND".into(), "ssh -i key".into())]);
    }

    #[test]
    fn exit_outcome_display() {
        assert!(ExitOutcome { code: Some(0) }.success());
        assert!(!ExitOutcome { code: Some(128) }.success());
        assert!(!ExitOutcome { code: None }.success());
        assert_eq!(ExitOutcome { code: Some(1) }.to_string(), "exit code 1");
        assert_eq!(ExitOutcome { code: None }.to_string(), "terminated by signal");
    }

    #[test]
    fn diagnostics_prefers_whatever_is_present() {
        let out = CommandOutput {
            status: ExitOutcome { code: Some(1) },
            stdout: b"nothing to commit, working tree clean\n".to_vec(),
            stderr: Vec::new(),
        };
        assert_eq!(out.diagnostics(), "nothing to commit, working tree clean");

        let out = CommandOutput {
            status: ExitOutcome { code: Some(128) },
            stdout: Vec::new(),
            stderr: b"fatal: repository not found\n".to_vec(),
        };
        assert_eq!(out.diagnostics(), "fatal: repository not found");
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let runner = TokioRunner::new("/nonexistent/githost-test-git");
        let err = runner
            .output(CommandSpec::new(["--version"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(runner.start(CommandSpec::new(["--version"])).is_err());
    }
}
