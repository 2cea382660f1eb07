//! Scripted [`ProcessRunner`] used by unit tests across the crate.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::runner::{
    CommandOutput, CommandSpec, ExitOutcome, ProcessRunner, ProcessStdin, ProcessStdout,
    Subprocess, TokioRunner,
};

type OutputHandler = Box<dyn Fn(&CommandSpec) -> CommandOutput + Send + Sync>;

/// Whether a real `git` is on `PATH`.  Tests that drive real git return early
/// without it.
pub async fn git_available() -> bool {
    TokioRunner::new("git")
        .output(CommandSpec::new(["--version"]))
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Behaviour of every subprocess launched through [`FakeRunner::start`].
#[derive(Debug, Clone)]
pub struct StreamScript {
    /// Bytes written to stdout before anything else.
    pub stdout_prefix: Vec<u8>,
    /// Read stdin to EOF and echo it after the prefix.
    pub echo_stdin: bool,
    pub exit_code: i32,
}

impl Default for StreamScript {
    fn default() -> Self {
        Self {
            stdout_prefix: Vec::new(),
            echo_stdin: false,
            exit_code: 0,
        }
    }
}

pub struct FakeRunner {
    calls: Mutex<Vec<CommandSpec>>,
    handler: OutputHandler,
    script: StreamScript,
    stdin_seen: Arc<Mutex<Vec<u8>>>,
    killed: Arc<AtomicBool>,
}

impl FakeRunner {
    /// Every `output` call succeeds with empty output.
    pub fn new() -> Self {
        Self::with_handler(|_| ok_output(""))
    }

    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&CommandSpec) -> CommandOutput + Send + Sync + 'static,
    {
        Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
            script: StreamScript::default(),
            stdin_seen: Arc::new(Mutex::new(Vec::new())),
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_script(mut self, script: StreamScript) -> Self {
        self.script = script;
        self
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(CommandSpec::display_args)
            .collect()
    }

    pub fn specs(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn stdin_seen(&self) -> Vec<u8> {
        self.stdin_seen.lock().unwrap().clone()
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

pub fn ok_output(stdout: &str) -> CommandOutput {
    CommandOutput {
        status: ExitOutcome { code: Some(0) },
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
    }
}

pub fn failed_output(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        status: ExitOutcome { code: Some(code) },
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    fn start(&self, spec: CommandSpec) -> io::Result<Box<dyn Subprocess>> {
        self.calls.lock().unwrap().push(spec);

        let (stdin_ours, mut stdin_theirs) = tokio::io::duplex(64 * 1024);
        let (mut stdout_theirs, stdout_ours) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exit_rx) = oneshot::channel();

        let script = self.script.clone();
        let seen = Arc::clone(&self.stdin_seen);
        let task = tokio::spawn(async move {
            let mut input = Vec::new();
            if script.echo_stdin {
                let _ = stdin_theirs.read_to_end(&mut input).await;
                seen.lock().unwrap().extend_from_slice(&input);
            }
            let _ = stdout_theirs.write_all(&script.stdout_prefix).await;
            let _ = stdout_theirs.write_all(&input).await;
            let _ = stdout_theirs.shutdown().await;
            drop(stdout_theirs);
            let _ = exit_tx.send(script.exit_code);
        });

        Ok(Box::new(FakeSubprocess {
            stdin: Some(Box::new(stdin_ours)),
            stdout: Some(Box::new(stdout_ours)),
            exit: Some(exit_rx),
            task,
            killed: Arc::clone(&self.killed),
        }))
    }

    async fn output(&self, spec: CommandSpec) -> io::Result<CommandOutput> {
        let out = (self.handler)(&spec);
        self.calls.lock().unwrap().push(spec);
        Ok(out)
    }
}

struct FakeSubprocess {
    stdin: Option<ProcessStdin>,
    stdout: Option<ProcessStdout>,
    exit: Option<oneshot::Receiver<i32>>,
    task: JoinHandle<()>,
    killed: Arc<AtomicBool>,
}

#[async_trait]
impl Subprocess for FakeSubprocess {
    fn take_stdin(&mut self) -> Option<ProcessStdin> {
        self.stdin.take()
    }

    fn take_stdout(&mut self) -> Option<ProcessStdout> {
        self.stdout.take()
    }

    async fn wait(&mut self) -> io::Result<ExitOutcome> {
        let Some(rx) = self.exit.take() else {
            return Ok(ExitOutcome { code: None });
        };
        Ok(ExitOutcome {
            code: rx.await.ok(),
        })
    }

    fn start_kill(&mut self) {
        self.killed.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

impl Drop for FakeSubprocess {
    fn drop(&mut self) {
        self.task.abort();
    }
}
