//! Executes scripted requests through the admission queue
//!
//! [`CgiGateway::submit`] waits for a run slot, spawns the interpreter and
//! hands the run to a supervising task. The task turns parser events into a
//! response head and a body stream, enforces the run timeout and frees the
//! slot when the run is over. The handler only waits for the head.

use crate::config::Config;
use crate::env::{request_env, ScriptTarget, ServerEnv};
use crate::error::{
    error_response, full_body, script_failure_response, CgiError, GatewayBody, GatewayErrorCode,
};
use crate::parser::CgiEvent;
use crate::process::{CgiCommand, CgiProcess};
use crate::queue::{AdmissionQueue, QueueConfig, RunPermit};
use crate::router;
use futures::stream::{self, StreamExt};
use http_body_util::{BodyExt, BodyStream, StreamBody};
use hyper::body::{Body, Bytes, Frame};
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Body frames buffered between the run and the client
const BODY_CHANNEL_CAPACITY: usize = 16;

/// Request body bytes read ahead while waiting for a slot
const PREFETCH_LIMIT: usize = 64 * 1024;

/// Script headers that hyper manages itself
const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "transfer-encoding"];

type BodyFrame = Result<Frame<Bytes>, CgiError>;

/// What the handler needs before it can answer
#[derive(Debug)]
enum RunHead {
    /// Status and headers are known; body follows on the channel
    Response {
        status: u16,
        headers: Vec<(String, String)>,
    },
    /// The process exited without a header block
    Headerless,
    /// Run timeout fired before any header was produced
    TimedOut,
    /// Spawn, exit or protocol failure before any header was produced
    Failed(CgiError),
}

/// How a supervised run ended
enum RunOutcome {
    Finished,
    Failed(CgiError),
    TimedOut,
    ClientGone,
}

enum Delivery {
    Sent,
    ClientGone,
    TimedOut,
}

#[derive(Debug, Clone, Copy, Default)]
struct RunOptions {
    forward_stderr: bool,
    kill_on_disconnect: bool,
}

/// Runs scripts for one document root behind one admission queue
pub struct CgiGateway {
    command: CgiCommand,
    server_env: Arc<ServerEnv>,
    queue: AdmissionQueue,
    document_root: PathBuf,
    extension: String,
    options: RunOptions,
}

impl CgiGateway {
    pub fn new(
        command: CgiCommand,
        server_env: Arc<ServerEnv>,
        queue: AdmissionQueue,
        document_root: PathBuf,
    ) -> Self {
        Self {
            command,
            server_env,
            queue,
            document_root,
            extension: ".php".to_string(),
            options: RunOptions::default(),
        }
    }

    pub fn from_config(config: &Config, server_env: Arc<ServerEnv>) -> Self {
        Self::new(
            CgiCommand::from_config(&config.cgi),
            server_env,
            AdmissionQueue::new(QueueConfig::from_config(config)),
            config.cgi.root.clone(),
        )
        .with_extension(&config.cgi.extension)
        .with_forward_stderr(config.cgi.forward_stderr)
        .with_kill_on_disconnect(config.cgi.kill_on_disconnect)
    }

    /// Set the scripted-page suffix (builder pattern)
    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.to_string();
        self
    }

    /// Append interpreter stderr to the body once it started (builder pattern)
    pub fn with_forward_stderr(mut self, forward: bool) -> Self {
        self.options.forward_stderr = forward;
        self
    }

    /// Kill a running interpreter when its client leaves (builder pattern)
    pub fn with_kill_on_disconnect(mut self, kill: bool) -> Self {
        self.options.kill_on_disconnect = kill;
        self
    }

    pub fn queue(&self) -> &AdmissionQueue {
        &self.queue
    }

    /// Map a URL path to a script under the document root, if it names one
    pub async fn resolve_script(&self, url_path: &str) -> Option<ScriptTarget> {
        router::resolve_script(&self.document_root, url_path, &self.extension).await
    }

    /// Run `req` through the interpreter and produce its response.
    ///
    /// Dropping the returned future while the request is still waiting for a
    /// slot removes it from the line. An upload that breaks off while waiting
    /// does the same, since the first `PREFETCH_LIMIT` bytes of the request
    /// body are read ahead during the wait. Once running, the process keeps
    /// going until it exits or times out unless `kill_on_disconnect` is set.
    pub async fn submit<B>(
        &self,
        req: Request<B>,
        target: ScriptTarget,
        remote_addr: SocketAddr,
    ) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display + Send,
    {
        let (parts, body) = req.into_parts();
        let mut body = Box::pin(body);
        let mut prefetched = Vec::new();
        let mut prefetched_len = 0;
        let mut body_done = body.is_end_stream();

        let acquire = self.queue.acquire();
        tokio::pin!(acquire);
        let admitted = loop {
            tokio::select! {
                result = &mut acquire => break result,
                frame = body.frame(), if !body_done && prefetched_len < PREFETCH_LIMIT => match frame {
                    Some(Ok(frame)) => {
                        prefetched_len += frame.data_ref().map_or(0, |d| d.len());
                        prefetched.push(frame);
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, uri = %parts.uri, "Request body broke off while waiting");
                        return error_response(GatewayErrorCode::ServerBusy);
                    }
                    None => body_done = true,
                },
            }
        };

        let permit = match admitted {
            Ok(permit) => permit,
            Err(rejection) => {
                warn!(reason = %rejection, uri = %parts.uri, "Request not admitted");
                return error_response(GatewayErrorCode::ServerBusy);
            }
        };

        let body = StreamBody::new(
            stream::iter(prefetched.into_iter().map(Ok)).chain(BodyStream::new(body)),
        );
        let env = request_env(&parts, &self.server_env, &target, remote_addr);

        let run = match CgiProcess::start(&self.command, env, body) {
            Ok(run) => run,
            Err(e) => {
                error!(error = %e, script = %target.script_file.display(), "Failed to start interpreter");
                drop(permit);
                return script_failure_response(&e);
            }
        };
        let run_id = run.id();
        debug!(
            run_id = %run_id,
            pid = run.pid(),
            method = %parts.method,
            uri = %parts.uri,
            running = self.queue.running(),
            waiting = self.queue.waiting(),
            "Run started"
        );

        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        tokio::spawn(drive_run(
            run,
            permit,
            self.queue.clone(),
            self.options,
            head_tx,
            body_tx,
        ));

        match head_rx.await {
            Ok(RunHead::Response { status, headers }) => {
                build_response(run_id, status, headers, body_rx)
            }
            Ok(RunHead::Headerless) => {
                debug!(run_id = %run_id, "Interpreter produced no headers");
                Response::builder()
                    .status(StatusCode::OK)
                    .body(full_body(Bytes::new()))
                    .expect("valid response builder")
            }
            Ok(RunHead::TimedOut) => error_response(GatewayErrorCode::RequestTimeout),
            Ok(RunHead::Failed(e)) => script_failure_response(&e),
            Err(_) => script_failure_response(&CgiError::Io(std::io::Error::other(
                "run supervisor exited without a response",
            ))),
        }
    }
}

/// Supervise one run until it ends, times out, or loses its client
async fn drive_run(
    mut run: CgiProcess,
    permit: RunPermit,
    queue: AdmissionQueue,
    options: RunOptions,
    head_tx: oneshot::Sender<RunHead>,
    body_tx: mpsc::Sender<BodyFrame>,
) {
    let run_id = run.id();
    let timeout = queue.config().process_timeout;
    let deadline = Instant::now() + timeout;
    let mut head_tx = Some(head_tx);
    let mut status = None;
    let mut headers = Vec::new();
    let mut client_gone = false;

    let outcome = loop {
        let event = tokio::select! {
            event = run.next_event() => event,
            _ = tokio::time::sleep_until(deadline) => break RunOutcome::TimedOut,
            _ = body_tx.closed(), if options.kill_on_disconnect && !client_gone => {
                break RunOutcome::ClientGone;
            }
        };

        let delivery = match event {
            None | Some(CgiEvent::End) => break RunOutcome::Finished,
            Some(CgiEvent::Error(e)) => break RunOutcome::Failed(e),
            Some(CgiEvent::Status(code)) => {
                status = Some(code);
                Delivery::Sent
            }
            Some(CgiEvent::Header(name, value)) => {
                headers.push((name, value));
                Delivery::Sent
            }
            Some(CgiEvent::BodyStart) => match head_tx.take() {
                Some(tx) => {
                    let head = RunHead::Response {
                        status: status.unwrap_or(200),
                        headers: std::mem::take(&mut headers),
                    };
                    if tx.send(head).is_err() {
                        Delivery::ClientGone
                    } else {
                        Delivery::Sent
                    }
                }
                None => Delivery::Sent,
            },
            Some(CgiEvent::Body(bytes)) => {
                if client_gone || bytes.is_empty() {
                    Delivery::Sent
                } else {
                    deliver(&body_tx, deadline, bytes).await
                }
            }
            Some(CgiEvent::Stderr(bytes)) => {
                warn!(
                    run_id = %run_id,
                    output = %String::from_utf8_lossy(&bytes).trim_end(),
                    "Interpreter wrote to stderr"
                );
                if options.forward_stderr && head_tx.is_none() && !client_gone {
                    deliver(&body_tx, deadline, bytes).await
                } else {
                    Delivery::Sent
                }
            }
        };

        match delivery {
            Delivery::Sent => {}
            Delivery::TimedOut => break RunOutcome::TimedOut,
            Delivery::ClientGone => {
                if options.kill_on_disconnect {
                    break RunOutcome::ClientGone;
                }
                if !client_gone {
                    debug!(run_id = %run_id, "Client left, letting the run finish");
                }
                client_gone = true;
            }
        }
    };

    match outcome {
        RunOutcome::Finished => {
            drop(permit);
            if let Some(tx) = head_tx.take() {
                let _ = tx.send(RunHead::Headerless);
            }
            debug!(run_id = %run_id, phase = ?run.phase(), "Run finished");
        }
        RunOutcome::Failed(e) => {
            run.terminate();
            // Releasing the event receiver unblocks a supervisor stuck on a full channel
            drop(run);
            drop(permit);
            warn!(run_id = %run_id, error = %e, "Run failed");
            match head_tx.take() {
                Some(tx) => {
                    let _ = tx.send(RunHead::Failed(e));
                }
                None => {
                    let _ = body_tx.send(Err(e)).await;
                }
            }
        }
        RunOutcome::TimedOut => {
            run.terminate();
            drop(run);
            drop(permit);
            queue.stats().record_run_timeout();
            warn!(
                run_id = %run_id,
                timeout_ms = timeout.as_millis() as u64,
                "Run timed out, interpreter killed"
            );
            match head_tx.take() {
                Some(tx) => {
                    let _ = tx.send(RunHead::TimedOut);
                }
                None => {
                    let _ = body_tx.send(Err(CgiError::RunTimeout)).await;
                }
            }
        }
        RunOutcome::ClientGone => {
            run.terminate();
            drop(run);
            drop(permit);
            debug!(run_id = %run_id, "Client left, interpreter killed");
        }
    }
}

/// Send one body chunk without outliving the run deadline
async fn deliver(body_tx: &mpsc::Sender<BodyFrame>, deadline: Instant, bytes: Bytes) -> Delivery {
    match tokio::time::timeout_at(deadline, body_tx.send(Ok(Frame::data(bytes)))).await {
        Ok(Ok(())) => Delivery::Sent,
        Ok(Err(_)) => Delivery::ClientGone,
        Err(_) => Delivery::TimedOut,
    }
}

fn build_response(
    run_id: Uuid,
    status: u16,
    headers: Vec<(String, String)>,
    body_rx: mpsc::Receiver<BodyFrame>,
) -> Response<GatewayBody> {
    let Ok(status) = StatusCode::from_u16(status) else {
        return script_failure_response(&CgiError::ProtocolViolation(format!(
            "invalid status code {}",
            status
        )));
    };

    let stream = stream::unfold(body_rx, |mut rx| async move {
        rx.recv().await.map(|frame| (frame, rx))
    });
    let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
    *response.status_mut() = status;

    let response_headers = response.headers_mut();
    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                response_headers.insert(name, value);
            }
            _ => {
                debug!(run_id = %run_id, header = %name, "Skipping invalid header from interpreter");
            }
        }
    }

    response
}
