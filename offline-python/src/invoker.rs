//! Invocation driver
//!
//! The child protocol carries no request ids, so a child may only ever have
//! one request in flight. Every child gets a single worker task that owns
//! its stdin and its classified stdout; invocations are queued to that
//! worker and answered through a oneshot channel in FIFO order.

use crate::codec::{Frame, LineCodec};
use crate::invocation::{InvocationError, InvocationRequest};
use crate::lifecycle::{ExitState, SpawnedChild};
use crate::registry::ProcessRegistry;
use crate::runtime::RuntimeDescriptor;
use crate::sink::OutputSink;
use offline_core::{HandlerIdentity, InvocationId};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Classified stdout lines buffered ahead of the worker
const FRAME_BUFFER: usize = 64;

/// How long stdout and the exit status may lag behind each other
const EXIT_GRACE: Duration = Duration::from_millis(200);

type Reply = oneshot::Sender<Result<Value, InvocationError>>;

/// Queued invocation
struct Job {
    id: InvocationId,
    line: String,
    timeout: Option<Duration>,
    reply: Reply,
}

/// Shared handle to one running handler process
#[derive(Debug)]
pub struct ProcessHandle {
    identity: HandlerIdentity,
    pid: Option<u32>,
    jobs: mpsc::UnboundedSender<Job>,
    exit: watch::Receiver<ExitState>,
    stopped: watch::Receiver<()>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("id", &self.id).finish_non_exhaustive()
    }
}

impl ProcessHandle {
    /// Attach readers and a worker to a freshly spawned child
    pub(crate) fn start(
        identity: HandlerIdentity,
        child: SpawnedChild,
        codec: LineCodec,
        sink: Arc<dyn OutputSink>,
    ) -> Arc<Self> {
        let SpawnedChild {
            pid,
            stdin,
            stdout,
            stderr,
            exit,
        } = child;

        let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (stopped_tx, stopped_rx) = watch::channel(());

        tokio::spawn(read_stdout(identity.clone(), stdout, codec, frames_tx));
        tokio::spawn(read_stderr(identity.clone(), stderr, sink.clone()));

        let worker = Worker {
            identity: identity.clone(),
            stdin,
            frames: frames_rx,
            jobs: jobs_rx,
            sink,
            exit: exit.clone(),
            owed_payloads: 0,
            _stopped: stopped_tx,
        };
        tokio::spawn(worker.run());

        Arc::new(Self {
            identity,
            pid,
            jobs: jobs_tx,
            exit,
            stopped: stopped_rx,
        })
    }

    pub fn identity(&self) -> &HandlerIdentity {
        &self.identity
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// False once the child has exited or its worker has stopped
    pub fn is_alive(&self) -> bool {
        !self.jobs.is_closed() && self.exit.borrow().is_none()
    }

    /// Resolves once the worker has stopped serving this child
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut stopped = self.stopped.clone();
        async move { while stopped.changed().await.is_ok() {} }
    }

    fn submit(&self, job: Job) -> Result<(), Job> {
        self.jobs.send(job).map_err(|e| e.0)
    }
}

/// Invokes one handler
pub struct Invoker {
    registry: Arc<ProcessRegistry>,
    identity: HandlerIdentity,
    descriptor: RuntimeDescriptor,
    environment: HashMap<String, String>,
    timeout: Option<Duration>,
}

impl Invoker {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        identity: HandlerIdentity,
        descriptor: RuntimeDescriptor,
        environment: HashMap<String, String>,
    ) -> Self {
        Self {
            registry,
            identity,
            descriptor,
            environment,
            timeout: None,
        }
    }

    /// Fail invocations whose payload takes longer than `timeout`.
    ///
    /// The clock starts when the request is written, not while it waits in
    /// the queue.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn identity(&self) -> &HandlerIdentity {
        &self.identity
    }

    /// Run the handler with `event` and `context` and wait for its payload
    pub async fn invoke(&self, event: Value, context: Value) -> Result<Value, InvocationError> {
        let id = InvocationId::new();
        let line = InvocationRequest::new(event, context).to_line()?;

        let handle = self
            .registry
            .acquire(&self.identity, &self.descriptor, &self.environment)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            id: id.clone(),
            line,
            timeout: self.timeout,
            reply: reply_tx,
        };

        debug!(handler = %self.identity, invocation_id = %id, pid = ?handle.pid(), "Queueing invocation");

        if handle.submit(job).is_err() {
            return Err(InvocationError::ChildExited {
                handler: self.identity.clone(),
                status: exit_description(&handle.exit),
            });
        }

        match reply_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(InvocationError::ChildExited {
                handler: self.identity.clone(),
                status: exit_description(&handle.exit),
            }),
        }
    }
}

async fn child_exited(exit: &mut watch::Receiver<ExitState>) {
    // A dropped reaper counts as exited too
    let _ = exit.wait_for(Option::is_some).await;
}

fn exit_description(exit: &watch::Receiver<ExitState>) -> String {
    exit.borrow()
        .clone()
        .unwrap_or_else(|| "output stream closed".to_string())
}

enum Flow {
    Continue,
    Exited,
}

enum Wait {
    Frame(Option<Frame>),
    TimedOut,
    CallerGone,
    ChildGone,
}

/// Serves the invocations of one child, one at a time.
///
/// A request that timed out or was abandoned still owes a payload, and the
/// next payload the child prints is discarded on its behalf. This assumes
/// the child answers every request it read. A child that swallows a request
/// without printing a payload shifts every later answer by one, so each
/// later call sees its own payload discarded and times out in turn; the
/// chain ends only when the child exits and is replaced.
struct Worker {
    identity: HandlerIdentity,
    stdin: ChildStdin,
    frames: mpsc::Receiver<Frame>,
    jobs: mpsc::UnboundedReceiver<Job>,
    sink: Arc<dyn OutputSink>,
    exit: watch::Receiver<ExitState>,
    /// Payloads still due for invocations that were abandoned mid-flight
    owed_payloads: usize,
    /// Dropped with the worker, which is how the handle learns it stopped
    _stopped: watch::Sender<()>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                frame = self.frames.recv() => match frame {
                    Some(frame) => self.handle_idle_frame(frame),
                    None => break,
                },
                () = child_exited(&mut self.exit) => {
                    self.drain_output().await;
                    break;
                }
                job = self.jobs.recv() => match job {
                    Some(job) => {
                        if let Flow::Exited = self.run_job(job).await {
                            break;
                        }
                    }
                    None => {
                        debug!(handler = %self.identity, "Handle released, closing stdin");
                        return;
                    }
                },
            }
        }

        self.fail_queued().await;
    }

    fn handle_idle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::PassThrough(line) => self.sink.stdout_line(&self.identity, &line),
            Frame::Payload(_) if self.owed_payloads > 0 => {
                self.owed_payloads -= 1;
                debug!(handler = %self.identity, "Discarding payload of an abandoned invocation");
            }
            Frame::Payload(_) => {
                warn!(handler = %self.identity, "Discarding payload received with no invocation in flight");
            }
        }
    }

    async fn run_job(&mut self, job: Job) -> Flow {
        let Job {
            id,
            line,
            timeout,
            mut reply,
        } = job;

        if reply.is_closed() {
            debug!(handler = %self.identity, invocation_id = %id, "Skipping cancelled invocation");
            return Flow::Continue;
        }

        if let Err(e) = self.write_request(&line).await {
            warn!(handler = %self.identity, invocation_id = %id, error = %e, "Failed to write request");
            let status = self.exit_status().await;
            self.jobs.close();
            let _ = reply.send(Err(InvocationError::ChildExited {
                handler: self.identity.clone(),
                status,
            }));
            return Flow::Exited;
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let timer = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timer);

        // Armed once the child has exited, so a payload still in the pipe
        // is read before the call is failed
        let drain = tokio::time::sleep(EXIT_GRACE);
        tokio::pin!(drain);
        let mut child_gone = false;

        let mut saw_output = false;
        loop {
            let wait = tokio::select! {
                frame = self.frames.recv() => Wait::Frame(frame),
                () = &mut timer => Wait::TimedOut,
                () = reply.closed() => Wait::CallerGone,
                () = child_exited(&mut self.exit), if !child_gone => Wait::ChildGone,
                () = &mut drain, if child_gone => Wait::Frame(None),
            };

            match wait {
                Wait::Frame(Some(Frame::PassThrough(text))) => {
                    saw_output = true;
                    self.sink.stdout_line(&self.identity, &text);
                }
                Wait::Frame(Some(Frame::Payload(_))) if self.owed_payloads > 0 => {
                    self.owed_payloads -= 1;
                    debug!(handler = %self.identity, invocation_id = %id, "Discarding payload of an abandoned invocation");
                }
                Wait::Frame(Some(Frame::Payload(value))) => {
                    debug!(handler = %self.identity, invocation_id = %id, "Invocation resolved");
                    let _ = reply.send(Ok(value));
                    return Flow::Continue;
                }
                Wait::Frame(None) => {
                    let status = self.exit_status().await;
                    let error = if saw_output {
                        InvocationError::Protocol {
                            handler: self.identity.clone(),
                            reason: format!("output ended without a payload frame ({status})"),
                        }
                    } else {
                        InvocationError::ChildExited {
                            handler: self.identity.clone(),
                            status,
                        }
                    };
                    warn!(handler = %self.identity, invocation_id = %id, error = %error, "Invocation failed");
                    self.jobs.close();
                    let _ = reply.send(Err(error));
                    return Flow::Exited;
                }
                Wait::TimedOut => {
                    let timeout = timeout.unwrap_or_default();
                    warn!(
                        handler = %self.identity,
                        invocation_id = %id,
                        timeout = ?timeout,
                        "Invocation timed out, child left running"
                    );
                    self.owed_payloads += 1;
                    let _ = reply.send(Err(InvocationError::Timeout(timeout)));
                    return Flow::Continue;
                }
                Wait::CallerGone => {
                    info!(handler = %self.identity, invocation_id = %id, "Caller abandoned invocation");
                    self.owed_payloads += 1;
                    return Flow::Continue;
                }
                Wait::ChildGone => {
                    debug!(handler = %self.identity, invocation_id = %id, "Child exited mid-invocation");
                    child_gone = true;
                    drain.as_mut().reset(Instant::now() + EXIT_GRACE);
                }
            }
        }
    }

    async fn write_request(&mut self, line: &str) -> std::io::Result<()> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await
    }

    async fn exit_status(&mut self) -> String {
        let waited = tokio::time::timeout(EXIT_GRACE, self.exit.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(state)) => state.clone().unwrap_or_default(),
            _ => "output stream closed".to_string(),
        }
    }

    /// Relay what the child printed before exiting.
    ///
    /// Its stdout may stay open in a process it left behind, so this gives
    /// up after [`EXIT_GRACE`].
    async fn drain_output(&mut self) {
        let deadline = Instant::now() + EXIT_GRACE;
        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, self.frames.recv()).await {
            self.handle_idle_frame(frame);
        }
    }

    /// Reject everything still queued once the child is gone
    async fn fail_queued(&mut self) {
        self.jobs.close();
        let status = self.exit_status().await;

        let mut rejected = 0;
        while let Ok(job) = self.jobs.try_recv() {
            rejected += 1;
            let _ = job.reply.send(Err(InvocationError::ChildExited {
                handler: self.identity.clone(),
                status: status.clone(),
            }));
        }

        if rejected > 0 {
            warn!(handler = %self.identity, rejected, "Rejected queued invocations after child exit");
        }
    }
}

async fn read_stdout(
    identity: HandlerIdentity,
    mut stdout: ChildStdout,
    mut codec: LineCodec,
    frames: mpsc::Sender<Frame>,
) {
    let mut buf = vec![0u8; 8192];
    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(handler = %identity, error = %e, "Failed to read handler stdout");
                break;
            }
        };

        for frame in codec.decode(&buf[..n]) {
            if frames.send(frame).await.is_err() {
                return;
            }
        }
    }

    if let Some(frame) = codec.finish() {
        let _ = frames.send(frame).await;
    }
    debug!(handler = %identity, "Handler stdout closed");
}

async fn read_stderr(identity: HandlerIdentity, stderr: ChildStderr, sink: Arc<dyn OutputSink>) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                sink.stderr_text(&identity, text.trim_end_matches(['\r', '\n']));
            }
            Err(e) => {
                warn!(handler = %identity, error = %e, "Failed to read handler stderr");
                break;
            }
        }
    }
}
