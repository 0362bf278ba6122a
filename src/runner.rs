use crate::harness::launch_failure::{describe_launch_failure, LAUNCH_FAILURE_EXIT_CODE};
use crate::harness::line_buffer::LineBuffer;
use crate::models::{InvocationRequest, OutputOrigin, RunPhase};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

const READ_CHUNK_BYTES: usize = 4096;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Receives the events of a single run, always from one task, in order.
pub trait RunSink: Send + 'static {
    fn on_phase(&mut self, _phase: RunPhase) {}
    fn on_chunk(&mut self, origin: OutputOrigin, text: &str);
    fn on_terminated(&mut self, exit_code: i32);
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// How long to keep reading after the child exited while a pipe is
    /// still held open (typically by a backgrounded grandchild).
    pub drain_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
enum StreamEvent {
    Chunk { origin: OutputOrigin, text: String },
    Closed(OutputOrigin),
    Exited(i32),
}

/// Reconciles stream closure and process exit into one terminal decision.
#[derive(Debug)]
pub(crate) struct TerminationTracker {
    exit_code: Option<i32>,
    stdout_open: bool,
    stderr_open: bool,
    terminated: bool,
}

impl TerminationTracker {
    pub(crate) fn new(stdout_open: bool, stderr_open: bool) -> Self {
        Self {
            exit_code: None,
            stdout_open,
            stderr_open,
            terminated: false,
        }
    }

    pub(crate) fn stream_closed(&mut self, origin: OutputOrigin) -> Option<i32> {
        match origin {
            OutputOrigin::Stdout => self.stdout_open = false,
            OutputOrigin::Stderr => self.stderr_open = false,
        }
        self.try_terminate()
    }

    /// The first reported exit code wins; later reports are ignored.
    pub(crate) fn process_exited(&mut self, exit_code: i32) -> Option<i32> {
        if self.exit_code.is_none() {
            self.exit_code = Some(exit_code);
        }
        self.try_terminate()
    }

    /// Terminates without waiting for open streams.
    pub(crate) fn force(&mut self) -> Option<i32> {
        if self.terminated {
            return None;
        }
        self.terminated = true;
        Some(self.exit_code.unwrap_or(LAUNCH_FAILURE_EXIT_CODE))
    }

    pub(crate) fn is_draining(&self) -> bool {
        !self.terminated && self.exit_code.is_some()
    }

    fn try_terminate(&mut self) -> Option<i32> {
        if self.terminated || self.stdout_open || self.stderr_open {
            return None;
        }
        let exit_code = self.exit_code?;
        self.terminated = true;
        Some(exit_code)
    }
}

enum Completion {
    Ready(i32),
    Pending(JoinHandle<i32>),
}

/// Handle to a started run. Dropping it does not affect the run.
pub struct RunHandle {
    run_id: String,
    phase: watch::Receiver<RunPhase>,
    completion: Completion,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.phase() == RunPhase::Terminated
    }

    /// Waits for the terminal write and returns the recorded exit code.
    pub async fn wait(self) -> i32 {
        match self.completion {
            Completion::Ready(exit_code) => exit_code,
            Completion::Pending(task) => task.await.unwrap_or(LAUNCH_FAILURE_EXIT_CODE),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    config: RunnerConfig,
}

impl ProcessRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Launches the child and streams its output into `sink`. Must be called
    /// from within a tokio runtime. A launch failure is reported through the
    /// sink as one stderr line plus [`LAUNCH_FAILURE_EXIT_CODE`].
    pub fn start<S: RunSink>(&self, request: &InvocationRequest, sink: S) -> RunHandle {
        self.start_with_id(Uuid::new_v4().to_string(), request, sink)
    }

    pub fn start_with_id<S: RunSink>(
        &self,
        run_id: String,
        request: &InvocationRequest,
        mut sink: S,
    ) -> RunHandle {
        let (phase_tx, phase_rx) = watch::channel(RunPhase::Idle);

        set_phase(&mut sink, &phase_tx, RunPhase::Launching);

        let mut command = Command::new(&request.executable_path);
        command
            .args(&request.arguments)
            .env_clear()
            .envs(&request.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = request.working_directory.as_ref() {
            command.current_dir(cwd);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                let message = describe_launch_failure(&error, request);
                tracing::warn!(
                    run_id = %run_id,
                    executable = %request.executable_path.display(),
                    error = %error,
                    "failed to launch tool"
                );
                sink.on_chunk(OutputOrigin::Stderr, &message);
                sink.on_terminated(LAUNCH_FAILURE_EXIT_CODE);
                set_phase(&mut sink, &phase_tx, RunPhase::Terminated);
                return RunHandle {
                    run_id,
                    phase: phase_rx,
                    completion: Completion::Ready(LAUNCH_FAILURE_EXIT_CODE),
                };
            }
        };

        tracing::info!(
            run_id = %run_id,
            executable = %request.executable_path.display(),
            args = request.arguments.len(),
            pid = child.id(),
            "tool launched"
        );

        let (events_tx, events_rx) = mpsc::channel::<StreamEvent>(EVENT_CHANNEL_CAPACITY);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let tracker = TerminationTracker::new(stdout.is_some(), stderr.is_some());

        let mut readers = Vec::with_capacity(2);
        if let Some(stream) = stdout {
            readers.push(spawn_reader(stream, OutputOrigin::Stdout, events_tx.clone()));
        }
        if let Some(stream) = stderr {
            readers.push(spawn_reader(stream, OutputOrigin::Stderr, events_tx.clone()));
        }

        let exit_tx = events_tx;
        let wait_run_id = run_id.clone();
        tokio::spawn(async move {
            let exit_code = match child.wait().await {
                Ok(status) => exit_code_of(status),
                Err(error) => {
                    tracing::warn!(run_id = %wait_run_id, error = %error, "failed to wait for tool");
                    LAUNCH_FAILURE_EXIT_CODE
                }
            };
            let _ = exit_tx.send(StreamEvent::Exited(exit_code)).await;
        });

        set_phase(&mut sink, &phase_tx, RunPhase::Streaming);

        let task = tokio::spawn(consume_events(
            run_id.clone(),
            events_rx,
            sink,
            phase_tx,
            tracker,
            readers,
            self.config.drain_timeout,
        ));

        RunHandle {
            run_id,
            phase: phase_rx,
            completion: Completion::Pending(task),
        }
    }
}

fn set_phase<S: RunSink>(sink: &mut S, phase_tx: &watch::Sender<RunPhase>, phase: RunPhase) {
    phase_tx.send_replace(phase);
    sink.on_phase(phase);
}

fn spawn_reader<R>(mut stream: R, origin: OutputOrigin, events: mpsc::Sender<StreamEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
        let mut line_buffer = LineBuffer::new();
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(size) => {
                    for line in line_buffer.push(&chunk[..size]) {
                        if line.is_empty() {
                            continue;
                        }
                        if events.send(StreamEvent::Chunk { origin, text: line }).await.is_err() {
                            return;
                        }
                    }
                }
                Err(error) => {
                    tracing::debug!(stream = origin.as_str(), error = %error, "stream read failed");
                    break;
                }
            }
        }

        if let Some(rest) = line_buffer.flush() {
            if !rest.is_empty() {
                let _ = events.send(StreamEvent::Chunk { origin, text: rest }).await;
            }
        }
        let dropped = line_buffer.consume_decode_failures();
        if dropped > 0 {
            tracing::debug!(stream = origin.as_str(), dropped, "dropped undecodable output lines");
        }
        let _ = events.send(StreamEvent::Closed(origin)).await;
    })
}

async fn consume_events<S: RunSink>(
    run_id: String,
    mut events: mpsc::Receiver<StreamEvent>,
    mut sink: S,
    phase_tx: watch::Sender<RunPhase>,
    mut tracker: TerminationTracker,
    readers: Vec<JoinHandle<()>>,
    drain_timeout: Duration,
) -> i32 {
    let mut drain_deadline: Option<Instant> = None;

    let exit_code = loop {
        let next = match drain_deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::warn!(run_id = %run_id, "output still open after exit, giving up on drain");
                    for reader in &readers {
                        reader.abort();
                    }
                    if let Some(exit_code) = tracker.force() {
                        break exit_code;
                    }
                    continue;
                }
            },
            None => events.recv().await,
        };

        let Some(event) = next else {
            // Every producer is gone without a complete set of signals.
            if let Some(exit_code) = tracker.force() {
                break exit_code;
            }
            continue;
        };

        let ready = match event {
            StreamEvent::Chunk { origin, text } => {
                sink.on_chunk(origin, &text);
                None
            }
            StreamEvent::Closed(origin) => tracker.stream_closed(origin),
            StreamEvent::Exited(exit_code) => {
                let ready = tracker.process_exited(exit_code);
                if ready.is_none() && tracker.is_draining() && drain_deadline.is_none() {
                    set_phase(&mut sink, &phase_tx, RunPhase::Draining);
                    drain_deadline = Some(Instant::now() + drain_timeout);
                }
                ready
            }
        };

        if let Some(exit_code) = ready {
            break exit_code;
        }
    };

    // Nothing is delivered to the sink past this point.
    events.close();
    sink.on_terminated(exit_code);
    set_phase(&mut sink, &phase_tx, RunPhase::Terminated);
    tracing::info!(run_id = %run_id, exit_code, "tool finished");
    exit_code
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    LAUNCH_FAILURE_EXIT_CODE
}
