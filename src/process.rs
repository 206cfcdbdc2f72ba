use crate::config::CgiConfig;
use crate::error::CgiError;
use crate::parser::{CgiEvent, ResponseParser};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Size of the stdout/stderr read buffers
const READ_BUF_SIZE: usize = 16 * 1024;

/// Events buffered between the process and its consumer
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Phase of a single interpreter run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// Process spawned, output not yet being read
    Spawned,
    /// Output is being read and decoded
    Streaming,
    /// Process exited and all output was delivered
    Ended,
    /// Process or its output failed
    Errored,
    /// Process was killed by `terminate()`
    Killed,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Ended | RunPhase::Errored | RunPhase::Killed)
    }

    fn can_advance_to(&self, next: RunPhase) -> bool {
        match (self, next) {
            (RunPhase::Spawned, RunPhase::Streaming) => true,
            (RunPhase::Streaming, next) => next.is_terminal(),
            _ => false,
        }
    }
}

/// The interpreter binary and its fixed arguments
#[derive(Debug, Clone)]
pub struct CgiCommand {
    /// Program to execute
    pub bin: String,
    /// Arguments passed on every run
    pub args: Vec<String>,
    /// Parent environment variables copied into the child
    pub pass_env: Vec<String>,
}

impl CgiCommand {
    pub fn new(bin: &str) -> Self {
        Self {
            bin: bin.to_string(),
            args: Vec::new(),
            pass_env: vec!["PATH".to_string()],
        }
    }

    pub fn from_config(cgi: &CgiConfig) -> Self {
        Self {
            bin: cgi.bin.clone(),
            args: cgi.command_args(),
            pass_env: cgi.pass_env.clone(),
        }
    }

    /// Set arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    fn inherited_env(&self) -> Vec<(String, String)> {
        self.pass_env
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.clone(), value)))
            .collect()
    }
}

/// State shared between a run's handle and its supervisor task
struct RunShared {
    phase: Mutex<RunPhase>,
    kill_requested: AtomicBool,
    kill: Notify,
}

impl RunShared {
    fn advance(&self, next: RunPhase) -> bool {
        let mut phase = self.phase.lock();
        if phase.can_advance_to(next) {
            *phase = next;
            true
        } else {
            false
        }
    }
}

/// Handle to one running interpreter process.
///
/// The process is owned by a supervisor task that reads its output, feeds the
/// parser and forwards events. Dropping the handle does not kill the process;
/// only [`terminate`](CgiProcess::terminate) does.
pub struct CgiProcess {
    id: Uuid,
    pid: Option<u32>,
    shared: Arc<RunShared>,
    events: mpsc::Receiver<CgiEvent>,
}

impl CgiProcess {
    /// Spawn the interpreter with `env` and stream `body` into its stdin.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<B>(
        command: &CgiCommand,
        env: HashMap<String, String>,
        body: B,
    ) -> Result<Self, CgiError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display + Send,
    {
        let id = Uuid::new_v4();

        let mut cmd = Command::new(&command.bin);
        cmd.args(&command.args);
        cmd.env_clear();
        cmd.envs(command.inherited_env());
        cmd.envs(&env);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| CgiError::Spawn {
            bin: command.bin.clone(),
            source,
        })?;
        let pid = child.id();

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(CgiError::Io(std::io::Error::other(
                "interpreter pipes were not captured",
            )));
        };

        debug!(run_id = %id, pid, bin = %command.bin, "Interpreter spawned");

        let shared = Arc::new(RunShared {
            phase: Mutex::new(RunPhase::Spawned),
            kill_requested: AtomicBool::new(false),
            kill: Notify::new(),
        });
        let (events_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let pump = tokio::spawn(pump_stdin(id, stdin, body));
        tokio::spawn(supervise(
            id,
            child,
            stdout,
            stderr,
            Arc::clone(&shared),
            events_tx,
            pump,
        ));

        Ok(Self {
            id,
            pid,
            shared,
            events,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn phase(&self) -> RunPhase {
        *self.shared.phase.lock()
    }

    /// Next decoded event; `None` once the supervisor is done
    pub async fn next_event(&mut self) -> Option<CgiEvent> {
        self.events.recv().await
    }

    /// Forcefully kill the process.
    ///
    /// Idempotent: returns true only for the call that requested the kill.
    /// Racing a natural exit is harmless.
    pub fn terminate(&self) -> bool {
        if self.shared.kill_requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shared.kill.notify_one();
        true
    }
}

/// Copy the request body into the interpreter's stdin, frame by frame
async fn pump_stdin<B>(id: Uuid, mut stdin: ChildStdin, body: B)
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::fmt::Display + Send,
{
    let mut body = Box::pin(body);
    let mut written = 0usize;

    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                if let Err(e) = stdin.write_all(&data).await {
                    // The script stopped reading; not an error for the run
                    debug!(run_id = %id, error = %e, "Interpreter stdin closed early");
                    return;
                }
                written += data.len();
            }
            Err(e) => {
                debug!(run_id = %id, error = %e, "Request body failed");
                break;
            }
        }
    }

    let _ = stdin.shutdown().await;
    debug!(run_id = %id, bytes = written, "Request body delivered");
}

/// What woke the supervisor up
enum Step {
    Stdout(std::io::Result<usize>),
    Stderr(std::io::Result<usize>),
    Kill,
    Exit(std::io::Result<std::process::ExitStatus>),
}

/// Owns the child, its parser and the event sender for one run
struct Supervisor {
    id: Uuid,
    child: Child,
    parser: ResponseParser,
    shared: Arc<RunShared>,
    events: mpsc::Sender<CgiEvent>,
    kill_handled: bool,
}

impl Supervisor {
    /// Act on a kill request.
    ///
    /// A child that already exited but was not reaped yet is not killed; its
    /// run ends normally instead of being recorded as `Killed`.
    fn kill(&mut self) -> Vec<CgiEvent> {
        self.kill_handled = true;

        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(run_id = %self.id, ?status, "Kill requested after interpreter exited");
                return self.parser.fail(CgiError::AlreadyExited).into_iter().collect();
            }
            Ok(None) => {}
            Err(e) => {
                debug!(run_id = %self.id, error = %e, "Failed to poll interpreter status");
            }
        }

        match self.child.start_kill() {
            Ok(()) => {
                if self.shared.advance(RunPhase::Killed) {
                    info!(run_id = %self.id, pid = self.child.id(), "Interpreter killed");
                }
                Vec::new()
            }
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {
                self.parser.fail(CgiError::AlreadyExited).into_iter().collect()
            }
            Err(e) => {
                warn!(run_id = %self.id, error = %e, "Failed to kill interpreter");
                Vec::new()
            }
        }
    }

    /// Record terminal events on the run phase and hand them to the consumer.
    ///
    /// A kill request interrupts a send the consumer is not picking up; the
    /// pending event is dropped.
    async fn forward(&mut self, batch: Vec<CgiEvent>) {
        let mut queue: std::collections::VecDeque<CgiEvent> = batch.into();

        while let Some(event) = queue.pop_front() {
            match event {
                CgiEvent::End => {
                    self.shared.advance(RunPhase::Ended);
                }
                CgiEvent::Error(_) => {
                    self.shared.advance(RunPhase::Errored);
                }
                _ => {}
            }

            if self.kill_handled {
                // A gone consumer still lets the process run to completion
                let _ = self.events.send(event).await;
                continue;
            }

            let shared = Arc::clone(&self.shared);
            let killed = tokio::select! {
                _ = self.events.send(event) => false,
                _ = shared.kill.notified() => true,
            };
            if killed {
                queue.extend(self.kill());
            }
        }
    }
}

/// Read both output pipes until EOF, then reap the process
async fn supervise(
    id: Uuid,
    child: Child,
    mut stdout: ChildStdout,
    mut stderr: ChildStderr,
    shared: Arc<RunShared>,
    events: mpsc::Sender<CgiEvent>,
    pump: tokio::task::JoinHandle<()>,
) {
    let mut sup = Supervisor {
        id,
        child,
        parser: ResponseParser::new(),
        shared,
        events,
        kill_handled: false,
    };
    let mut out_buf = vec![0u8; READ_BUF_SIZE];
    let mut err_buf = vec![0u8; READ_BUF_SIZE];
    let mut stdout_open = true;
    let mut stderr_open = true;

    sup.shared.advance(RunPhase::Streaming);

    loop {
        let kill_handled = sup.kill_handled;
        let shared = Arc::clone(&sup.shared);
        let step = tokio::select! {
            read = stdout.read(&mut out_buf), if stdout_open => Step::Stdout(read),
            read = stderr.read(&mut err_buf), if stderr_open => Step::Stderr(read),
            _ = shared.kill.notified(), if !kill_handled => Step::Kill,
            // A killed process is reaped even if a grandchild still holds its pipes
            status = sup.child.wait(), if kill_handled || (!stdout_open && !stderr_open) => {
                Step::Exit(status)
            }
        };

        let batch = match step {
            Step::Stdout(Ok(0)) => {
                stdout_open = false;
                Vec::new()
            }
            Step::Stdout(Ok(n)) => sup.parser.push_stdout(&out_buf[..n]),
            Step::Stdout(Err(e)) => {
                debug!(run_id = %id, error = %e, "Failed reading interpreter stdout");
                stdout_open = false;
                Vec::new()
            }
            Step::Stderr(Ok(0)) => {
                stderr_open = false;
                Vec::new()
            }
            Step::Stderr(Ok(n)) => sup.parser.push_stderr(&err_buf[..n]),
            Step::Stderr(Err(e)) => {
                debug!(run_id = %id, error = %e, "Failed reading interpreter stderr");
                stderr_open = false;
                Vec::new()
            }
            Step::Kill => sup.kill(),
            Step::Exit(status) => {
                let last = match status {
                    Ok(status) => exit_event(id, &mut sup.parser, &sup.shared, status),
                    Err(e) => sup.parser.fail(CgiError::Io(e)),
                };
                sup.forward(last.into_iter().collect()).await;
                break;
            }
        };

        sup.forward(batch).await;
    }

    pump.abort();
    let phase = *sup.shared.phase.lock();
    debug!(run_id = %id, ?phase, "Interpreter supervisor finished");
}

fn exit_event(
    id: Uuid,
    parser: &mut ResponseParser,
    shared: &RunShared,
    status: std::process::ExitStatus,
) -> Option<CgiEvent> {
    if *shared.phase.lock() == RunPhase::Killed {
        return parser.finish();
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return parser.fail(CgiError::AbnormalExit(format!(
                "terminated by signal {}",
                signal
            )));
        }
    }

    if !status.success() {
        debug!(run_id = %id, ?status, "Interpreter exited with non-zero status");
    }
    parser.finish()
}
