//! Streaming bridge between an HTTP exchange and a git subprocess.
//!
//! A feeder task copies the request body into the subprocess's stdin while the
//! response body pulls from its stdout.  The response body owns the
//! subprocess: when the client goes away the body is dropped and the process
//! is killed with it.  The body ends only after stdout is exhausted, the feeder
//! has finished and the process has exited.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::git::runner::{ProcessStdin, ProcessStdout};
use crate::git::{Service, Subprocess};
use crate::metrics::{Metrics, RpcLabels, RpcOutcome, ServiceLabel, ServiceLabels};

/// Request body as a stream of byte chunks.
pub type InputStream = BoxStream<'static, io::Result<Bytes>>;

/// Hook run on every request chunk before it is written to stdin.
pub type InputInspector = Box<dyn FnMut(&[u8]) + Send>;

/// Everything needed to turn a started subprocess into a response body.
pub struct ProcessBody {
    pub service: Service,
    /// Bytes emitted before the subprocess output.
    pub prefix: Option<Bytes>,
    /// Request body to feed to stdin.  `None` closes stdin immediately.
    pub input: Option<InputStream>,
    pub inspect: Option<InputInspector>,
    /// Upper bound on the subprocess lifetime.
    pub timeout: Duration,
    pub metrics: Arc<Metrics>,
}

impl ProcessBody {
    /// Wire `child` up and return the streaming body.
    pub fn into_body(self, mut child: Box<dyn Subprocess>) -> io::Result<Body> {
        let stdout = child
            .take_stdout()
            .ok_or_else(|| io::Error::other("subprocess stdout is not piped"))?;
        let stdin = child.take_stdin();

        let cancel = CancellationToken::new();
        let feeder = match (self.input, stdin) {
            (Some(input), Some(stdin)) => Some(tokio::spawn(feed_stdin(
                input,
                stdin,
                self.inspect,
                cancel.clone(),
            ))),
            // Dropping stdin here signals end-of-input.
            _ => None,
        };

        let pump = Pump {
            prefix: self.prefix,
            stdout: ReaderStream::new(stdout),
            child,
            feeder,
            cancel,
            deadline: Box::pin(tokio::time::sleep(self.timeout)),
            timeout: self.timeout,
            guard: RpcGuard::new(self.metrics, self.service),
            done: false,
        };

        let stream = futures::stream::unfold(pump, |mut pump| async move {
            pump.next_chunk().await.map(|chunk| (chunk, pump))
        });
        Ok(Body::from_stream(stream))
    }
}

// ---------------------------------------------------------------------------
// Request body -> stdin
// ---------------------------------------------------------------------------

async fn feed_stdin(
    mut input: InputStream,
    mut stdin: ProcessStdin,
    mut inspect: Option<InputInspector>,
    cancel: CancellationToken,
) {
    let mut written = 0u64;
    while let Some(chunk) = input.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                // Client disconnected or sent a broken body.
                warn!(error = %e, "request body aborted; terminating subprocess");
                cancel.cancel();
                return;
            }
        };
        if let Some(inspect) = inspect.as_mut() {
            inspect(&chunk);
        }
        if let Err(e) = stdin.write_all(&chunk).await {
            // The subprocess stopped reading; its stdout still decides the outcome.
            debug!(error = %e, written, "subprocess closed stdin early");
            return;
        }
        written += chunk.len() as u64;
    }
    if let Err(e) = stdin.shutdown().await {
        debug!(error = %e, "failed to close subprocess stdin");
    }
    debug!(written, "request body forwarded");
}

// ---------------------------------------------------------------------------
// stdout -> response body
// ---------------------------------------------------------------------------

enum Event {
    Chunk(Option<io::Result<Bytes>>),
    Cancelled,
    TimedOut,
}

struct Pump {
    prefix: Option<Bytes>,
    stdout: ReaderStream<ProcessStdout>,
    child: Box<dyn Subprocess>,
    feeder: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    deadline: Pin<Box<Sleep>>,
    timeout: Duration,
    guard: RpcGuard,
    done: bool,
}

impl Pump {
    async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        if self.done {
            return None;
        }
        if let Some(prefix) = self.prefix.take() {
            return Some(Ok(prefix));
        }

        let event = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Event::Cancelled,
            () = &mut self.deadline => Event::TimedOut,
            chunk = self.stdout.next() => Event::Chunk(chunk),
        };

        match event {
            Event::Chunk(Some(Ok(bytes))) => Some(Ok(bytes)),
            Event::Chunk(Some(Err(e))) => {
                error!(error = %e, "failed reading subprocess output; truncating response");
                self.abort(RpcOutcome::Failed);
                Some(Err(e))
            }
            Event::Chunk(None) => {
                self.finish().await;
                None
            }
            Event::Cancelled => {
                self.abort(RpcOutcome::Aborted);
                Some(Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "request body aborted",
                )))
            }
            Event::TimedOut => {
                warn!(timeout_secs = self.timeout.as_secs(), "subprocess exceeded its deadline; killed");
                self.abort(RpcOutcome::TimedOut);
                Some(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "git subprocess timed out",
                )))
            }
        }
    }

    /// stdout is exhausted: join the feeder, reap the process.
    async fn finish(&mut self) {
        self.done = true;
        if let Some(mut feeder) = self.feeder.take() {
            let joined = tokio::select! {
                joined = &mut feeder => Some(joined),
                () = &mut self.deadline => None,
            };
            match joined {
                Some(Ok(())) => {}
                Some(Err(e)) => warn!(error = %e, "stdin feeder task failed"),
                None => {
                    warn!("request body still streaming at the deadline; killed");
                    feeder.abort();
                    self.child.start_kill();
                    self.guard.outcome = Some(RpcOutcome::TimedOut);
                    return;
                }
            }
        }

        let exit = tokio::select! {
            exit = self.child.wait() => Some(exit),
            () = &mut self.deadline => None,
        };
        let Some(exit) = exit else {
            warn!("subprocess closed stdout but did not exit before its deadline; killed");
            self.child.start_kill();
            self.guard.outcome = Some(RpcOutcome::TimedOut);
            return;
        };

        match exit {
            Ok(status) if status.success() => {
                self.guard.outcome = Some(RpcOutcome::Ok);
            }
            Ok(status) => {
                // Bytes are already on the wire; the log is all that is left.
                warn!(%status, "git subprocess exited unsuccessfully");
                self.guard.outcome = Some(RpcOutcome::Failed);
            }
            Err(e) => {
                error!(error = %e, "failed to wait on git subprocess");
                self.guard.outcome = Some(RpcOutcome::Failed);
            }
        }
    }

    fn abort(&mut self, outcome: RpcOutcome) {
        self.done = true;
        self.child.start_kill();
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        self.guard.outcome = Some(outcome);
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        if !self.done {
            debug!("response dropped before completion; killing subprocess");
            self.child.start_kill();
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics guard
// ---------------------------------------------------------------------------

/// Tracks one in-flight protocol request.  A request that is dropped without
/// recording an outcome counts as aborted.
struct RpcGuard {
    metrics: Arc<Metrics>,
    service: ServiceLabel,
    started: Instant,
    outcome: Option<RpcOutcome>,
}

impl RpcGuard {
    fn new(metrics: Arc<Metrics>, service: Service) -> Self {
        let service = ServiceLabel::from(service);
        metrics
            .rpc_active
            .get_or_create(&ServiceLabels {
                service: service.clone(),
            })
            .inc();
        Self {
            metrics,
            service,
            started: Instant::now(),
            outcome: None,
        }
    }
}

impl Drop for RpcGuard {
    fn drop(&mut self) {
        let labels = ServiceLabels {
            service: self.service.clone(),
        };
        self.metrics.rpc_active.get_or_create(&labels).dec();
        self.metrics
            .rpc_duration_seconds
            .get_or_create(&labels)
            .observe(self.started.elapsed().as_secs_f64());
        self.metrics
            .rpc_requests_total
            .get_or_create(&RpcLabels {
                service: self.service.clone(),
                outcome: self.outcome.take().unwrap_or(RpcOutcome::Aborted),
            })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
