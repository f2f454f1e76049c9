//! The restart state machine (§4.6): debounces change events, orchestrates
//! kill/wait/spawn/replay, and broadcasts the tool-change notification.
//!
//! Grounded on three sources: the `other_examples/…gawd-ai-sctl…supervisor.rs`
//! reference file (hot-reload proxy shape: own real stdio, proxy JSON-RPC,
//! reload a worker subprocess on change) for the overall state shape;
//! `elev8tion-zeroclaw`'s `StdioTransport::try_restart` (`src/mcp/transport.rs`)
//! for the kill-then-respawn-under-a-lock pattern; and the teacher's
//! `spawn_with_retry` exponential backoff for the `Spawning` state's retry
//! policy. The kill-escalation grace timer uses `tokio::time::timeout` in the
//! idiom of the teacher's `recv_with_timeout` helper in `mcp/jsonrpc.rs`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::buffer::MessageBuffer;
use crate::change::ChangeEvent;
use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::hooks::HookBus;
use crate::ingress::IngressEvent;
use crate::message::{self, Message};
use crate::process::{ChildHandle, ProcessManager, Signal, SpawnOptions};
use crate::session::Session;
use crate::stream_pump;

/// Sink for client-facing stdout: an unbounded channel into a single writer
/// task that owns the real stdout handle. Both the per-child stdout pump and
/// the controller's own notifications hand it whole lines, so a restart's
/// `tools/list_changed` can never land mid-frame inside a child's output —
/// sharing a `Mutex<dyn AsyncWrite>` across the pump's entire lifetime would
/// either serialize nothing (lock-per-write) or deadlock the controller
/// behind a pump that never releases it (lock-for-the-whole-pump).
pub type ClientStdout = mpsc::UnboundedSender<Vec<u8>>;

/// Adapts [`ClientStdout`] to `AsyncWrite`, coalescing writes into one
/// channel item per `flush()` so a caller's `write_all(line); write_all(b"\n");
/// flush()` sequence reaches the writer task as a single atomic frame.
struct ClientStdoutWriter {
    tx: ClientStdout,
    pending: Vec<u8>,
}

impl ClientStdoutWriter {
    fn new(tx: ClientStdout) -> Self {
        Self {
            tx,
            pending: Vec::new(),
        }
    }
}

impl AsyncWrite for ClientStdoutWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        this.pending.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.pending.is_empty() {
            let frame = std::mem::take(&mut this.pending);
            let _ = this.tx.send(frame);
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.poll_flush(cx)
    }
}

/// Events the controller consumes from its single-consumer queue (§5).
pub enum ControllerEvent {
    Client(IngressEvent),
    Change(ChangeEvent),
    Shutdown(ShutdownReason),
}

/// Why the controller is shutting down, and (eventually) the process exit code.
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// Client stdin hit EOF (§9 Open Question: treated as a clean exit).
    ClientEof,
    Sigint,
    Sigterm,
    /// Spawn retries exhausted, or another unrecoverable configuration error.
    Fatal(String),
}

impl ShutdownReason {
    fn exit_code(&self) -> i32 {
        match self {
            ShutdownReason::ClientEof | ShutdownReason::Sigterm => 0,
            ShutdownReason::Sigint => 130,
            ShutdownReason::Fatal(_) => 1,
        }
    }
}

/// A spawned child plus the pump tasks forwarding its stdout/stderr.
struct RunningChild {
    handle: ChildHandle,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
}

impl RunningChild {
    fn abort_pumps(&self) {
        self.stdout_task.abort();
        self.stderr_task.abort();
    }
}

pub struct RestartController {
    config: SupervisorConfig,
    process_manager: Arc<dyn ProcessManager>,
    session: Arc<Session>,
    hooks: HookBus,
    client_stdout: ClientStdout,
    buffer: MessageBuffer,
    current: Option<RunningChild>,
}

impl RestartController {
    pub fn new(
        config: SupervisorConfig,
        process_manager: Arc<dyn ProcessManager>,
        session: Arc<Session>,
        hooks: HookBus,
        client_stdout: ClientStdout,
    ) -> Self {
        let buffer = MessageBuffer::new(config.buffer_capacity);
        Self {
            config,
            process_manager,
            session,
            hooks,
            client_stdout,
            buffer,
            current: None,
        }
    }

    /// Run until a shutdown is requested (client EOF, signal, or fatal spawn
    /// exhaustion), returning the process exit code.
    pub async fn run(mut self, mut events: mpsc::Receiver<ControllerEvent>) -> i32 {
        match Self::spawn_with_retries(
            &self.process_manager,
            &self.config,
            self.session.clone(),
            self.hooks.clone(),
            self.client_stdout.clone(),
        )
        .await
        {
            Ok(running) => self.current = Some(running),
            Err(err) => {
                error!("initial spawn failed: {err}");
                return ShutdownReason::Fatal(err.to_string()).exit_code();
            }
        }
        self.hooks.after_server_start().await;

        let reason = loop {
            match self.drive_idle(&mut events).await {
                IdleOutcome::ChangeDetected => match self.restart_on_change(&mut events).await {
                    Ok(()) => continue,
                    Err(reason) => break reason,
                },
                IdleOutcome::ChildCrashed => match self.restart_on_crash(&mut events).await {
                    Ok(()) => continue,
                    Err(reason) => break reason,
                },
                IdleOutcome::Shutdown(reason) => break reason,
            }
        };

        self.shutdown(reason).await
    }

    /// `Idle`/`Announcing`-equivalent steady state: forward client messages
    /// directly to the current child, watch for change events and unexpected
    /// child exit.
    async fn drive_idle(&mut self, events: &mut mpsc::Receiver<ControllerEvent>) -> IdleOutcome {
        loop {
            let status_fut = async {
                match self.current.as_mut() {
                    Some(running) => running.handle.status_mut().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                ev = events.recv() => {
                    match ev {
                        Some(ControllerEvent::Client(IngressEvent::Message(msg))) => {
                            if !self.forward_to_child(msg).await {
                                return IdleOutcome::ChildCrashed;
                            }
                        }
                        Some(ControllerEvent::Client(IngressEvent::Eof)) => {
                            return IdleOutcome::Shutdown(ShutdownReason::ClientEof);
                        }
                        Some(ControllerEvent::Change(change)) => {
                            debug!(path = %change.path.display(), "change detected, entering debounce");
                            return IdleOutcome::ChangeDetected;
                        }
                        Some(ControllerEvent::Shutdown(reason)) => return IdleOutcome::Shutdown(reason),
                        None => return IdleOutcome::Shutdown(ShutdownReason::ClientEof),
                    }
                }
                status = status_fut => {
                    warn!(?status, "child exited unexpectedly");
                    return IdleOutcome::ChildCrashed;
                }
            }
        }
    }

    /// Write a message straight to the current child's stdin. Returns `false`
    /// on write failure (broken pipe — the child has likely just exited),
    /// requeuing the message at the buffer's head for replay after restart
    /// (§4.5 step 4, `TransientChildError`).
    async fn forward_to_child(&mut self, msg: Message) -> bool {
        use tokio::io::AsyncWriteExt;

        let Some(running) = self.current.as_mut() else {
            self.buffer.push_front(msg);
            return false;
        };
        let Ok(line) = msg.to_line() else {
            warn!("failed to serialize outgoing message; dropped");
            return true;
        };
        let write = async {
            running.handle.stdin.write_all(line.as_bytes()).await?;
            running.handle.stdin.write_all(b"\n").await?;
            running.handle.stdin.flush().await
        };
        if write.await.is_err() {
            warn!("write to child stdin failed; requeuing and restarting");
            self.buffer.push_front(msg);
            return false;
        }
        true
    }

    /// Debounce additional change events (§4.6 `Debouncing`), then run the
    /// full restart sequence.
    async fn restart_on_change(
        &mut self,
        events: &mut mpsc::Receiver<ControllerEvent>,
    ) -> Result<(), ShutdownReason> {
        let mut deadline = tokio::time::Instant::now() + self.config.debounce;

        loop {
            tokio::select! {
                biased;
                ev = events.recv() => {
                    match ev {
                        Some(ControllerEvent::Client(IngressEvent::Message(msg))) => self.buffer.push(msg),
                        Some(ControllerEvent::Client(IngressEvent::Eof)) | None => {
                            return Err(ShutdownReason::ClientEof);
                        }
                        Some(ControllerEvent::Change(_)) => {
                            deadline = tokio::time::Instant::now() + self.config.debounce;
                        }
                        Some(ControllerEvent::Shutdown(reason)) => return Err(reason),
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        self.hooks.before_restart().await;
        self.perform_restart(events, true).await
    }

    /// The child exited on its own (crash); skip straight to `Spawning`.
    async fn restart_on_crash(
        &mut self,
        events: &mut mpsc::Receiver<ControllerEvent>,
    ) -> Result<(), ShutdownReason> {
        if let Some(running) = self.current.take() {
            running.abort_pumps();
        }
        self.perform_restart(events, false).await
    }

    /// `Killing` (only when `needs_kill`) → `Spawning` → `Replaying` → `Announcing`.
    ///
    /// `self.buffer` keeps accepting newly-arrived client messages for as
    /// long as `race()` is the one driving `events` (i.e. through `Killing`,
    /// `Spawning`, and the `replay()` round-trip) — it is drained once right
    /// after the new child exists (the pre-restart backlog) and once more
    /// right after `replay()` returns (anything that trickled in *during*
    /// that round-trip), so nothing buffered mid-restart is ever silently
    /// orphaned at shutdown. Once `Announcing` begins the child is already
    /// live, so `announce_live` stops buffering altogether and forwards
    /// arriving messages straight to its stdin, matching the Idle-like
    /// routing rule of §4.5 step 3 ("not Idle/Announcing" buffers; Announcing
    /// does not).
    async fn perform_restart(
        &mut self,
        events: &mut mpsc::Receiver<ControllerEvent>,
        needs_kill: bool,
    ) -> Result<(), ShutdownReason> {
        if needs_kill {
            if let Some(mut running) = self.current.take() {
                let grace = self.config.kill_grace;
                let _status =
                    race(&mut self.buffer, events, kill_gracefully(&mut running.handle, grace)).await?;
                running.abort_pumps();
            }
        }

        let spawned = race(
            &mut self.buffer,
            events,
            Self::spawn_with_retries(
                &self.process_manager,
                &self.config,
                self.session.clone(),
                self.hooks.clone(),
                self.client_stdout.clone(),
            ),
        )
        .await?;
        let running = match spawned {
            Ok(running) => running,
            Err(err) => return Err(ShutdownReason::Fatal(err.to_string())),
        };
        self.current = Some(running);
        self.hooks.after_server_start().await;

        // Everything buffered since `Draining` began (through `Killing` and
        // `Spawning`) is replayed first, in arrival order, after the stored
        // `initialize`.
        let drained = self.buffer.drain();
        race(
            &mut self.buffer,
            events,
            replay(
                self.current.as_mut().expect("just spawned"),
                &self.session,
                self.config.proxy_request_timeout,
                drained,
            ),
        )
        .await?;

        // Anything that arrived *during* that replay round-trip was buffered
        // by `race` above and would otherwise never be drained again; flush
        // it to the child now, still in arrival order, before announcing.
        let stragglers = self.buffer.drain();
        if !stragglers.is_empty() {
            replay_remainder(self.current.as_mut().expect("just spawned"), stragglers).await;
        }

        self.announce_live(events).await?;

        Ok(())
    }

    /// `Announcing`: request a fresh `tools/list` and emit
    /// `notifications/tools/list_changed` to the client exactly once — with
    /// an empty `tools` array if the request failed or timed out, so the
    /// client always learns a reload occurred (§8 property 4). Unlike the
    /// other mid-restart phases, the child is already live here, so a client
    /// message that arrives while waiting on the `tools/list` round-trip is
    /// forwarded straight to it via `forward_to_child` instead of being
    /// queued into `self.buffer`, which nothing would drain again until the
    /// *next* restart (§4.5 step 3).
    async fn announce_live(&mut self, events: &mut mpsc::Receiver<ControllerEvent>) -> Result<(), ShutdownReason> {
        let id = self.session.allocate_id();
        let (tx, mut response) = oneshot::channel();
        self.session.register_pending(id.clone(), tx).await;

        let request = message::build_tools_list_request(&id);
        let mut tools = serde_json::Value::Array(Vec::new());

        if let Ok(line) = request.to_line() {
            if self.write_to_child(&line).await {
                let deadline = tokio::time::Instant::now() + self.config.proxy_request_timeout;
                loop {
                    tokio::select! {
                        biased;
                        resp = &mut response => {
                            match resp {
                                Ok(Ok(value)) => {
                                    if let Some(list) = value.get("tools") {
                                        tools = list.clone();
                                    }
                                }
                                Ok(Err(err)) => warn!("tools/list failed after restart: {err:?}"),
                                Err(_) => warn!("tools/list response channel dropped"),
                            }
                            break;
                        }
                        _ = tokio::time::sleep_until(deadline) => {
                            warn!("timed out waiting for tools/list after restart");
                            break;
                        }
                        ev = events.recv() => {
                            match ev {
                                Some(ControllerEvent::Client(IngressEvent::Message(msg))) => {
                                    self.forward_to_child(msg).await;
                                }
                                Some(ControllerEvent::Client(IngressEvent::Eof)) | None => {
                                    return Err(ShutdownReason::ClientEof);
                                }
                                Some(ControllerEvent::Change(_)) => {
                                    debug!("ignoring change event observed mid-restart");
                                }
                                Some(ControllerEvent::Shutdown(reason)) => return Err(reason),
                            }
                        }
                    }
                }
            } else {
                warn!("failed to write tools/list request to new child");
                self.session.take_pending(&id).await;
            }
        } else {
            self.session.take_pending(&id).await;
        }

        if let serde_json::Value::Array(list) = &mut tools {
            list.extend(self.hooks.extend_tools_list().await);
        }

        let notification = message::build_tools_list_changed(tools);
        if let Ok(line) = notification.to_line() {
            let mut writer = ClientStdoutWriter::new(self.client_stdout.clone());
            if writer.write_all(line.as_bytes()).await.is_ok() {
                let _ = writer.write_all(b"\n").await;
                let _ = writer.flush().await;
            }
        }

        Ok(())
    }

    /// Write one already-serialized line to the current child's stdin.
    /// Returns `false` (without touching `self.buffer`) if there is no
    /// current child or the write fails — callers that need requeue-on-
    /// failure semantics go through [`RestartController::forward_to_child`]
    /// instead.
    async fn write_to_child(&mut self, line: &str) -> bool {
        use tokio::io::AsyncWriteExt;

        let Some(running) = self.current.as_mut() else {
            return false;
        };
        running.handle.stdin.write_all(line.as_bytes()).await.is_ok()
            && running.handle.stdin.write_all(b"\n").await.is_ok()
            && running.handle.stdin.flush().await.is_ok()
    }

    async fn spawn_with_retries(
        process_manager: &Arc<dyn ProcessManager>,
        config: &SupervisorConfig,
        session: Arc<Session>,
        hooks: HookBus,
        client_stdout: ClientStdout,
    ) -> Result<RunningChild, SupervisorError> {
        let mut backoff = config.spawn_backoff_base;

        for attempt in 0..=config.spawn_retries {
            let options = SpawnOptions {
                env: config.env.clone(),
                cwd: config.cwd.clone(),
            };
            match process_manager.spawn(&config.command, &config.args, options).await {
                Ok(mut handle) => {
                    let stdout = handle.take_stdout();
                    let stderr = handle.take_stderr();
                    let stdout_task = tokio::spawn({
                        let hooks = hooks.clone();
                        let session = session.clone();
                        let writer = ClientStdoutWriter::new(client_stdout.clone());
                        async move {
                            if let Err(err) = stream_pump::pump_stdout(stdout, writer, &hooks, &session).await
                            {
                                debug!("child stdout pump ended: {err}");
                            }
                        }
                    });
                    let stderr_task = tokio::spawn(async move {
                        let mut stderr_out = tokio::io::stderr();
                        if let Err(err) = stream_pump::pump_stderr(stderr, &mut stderr_out).await {
                            debug!("child stderr pump ended: {err}");
                        }
                    });
                    return Ok(RunningChild {
                        handle,
                        stdout_task,
                        stderr_task,
                    });
                }
                Err(err) => {
                    warn!("spawn attempt {attempt} failed: {err}");
                    if attempt < config.spawn_retries {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        Err(SupervisorError::SpawnRetriesExhausted {
            binary: config.command.clone().into(),
            attempts: config.spawn_retries + 1,
        })
    }

    /// `ShuttingDown` (§4.6): run `onShutdown`, kill the current child, drain
    /// the buffer to stderr as a warning, and compute the final exit code.
    async fn shutdown(mut self, reason: ShutdownReason) -> i32 {
        info!("shutting down: {reason:?}");
        self.hooks.on_shutdown().await;

        let mut child_exit_code = None;
        if let Some(mut running) = self.current.take() {
            running.abort_pumps();
            let status = kill_gracefully(&mut running.handle, self.config.kill_grace).await;
            child_exit_code = status.code;
        }

        if !self.buffer.is_empty() {
            let dropped = self.buffer.drain();
            warn!(
                "discarding {} buffered client message(s) on shutdown",
                dropped.len()
            );
        }

        match reason {
            ShutdownReason::Sigterm => child_exit_code.unwrap_or(0),
            other => other.exit_code(),
        }
    }
}

enum IdleOutcome {
    ChangeDetected,
    ChildCrashed,
    Shutdown(ShutdownReason),
}

/// Race `fut` against the controller's event stream, buffering any client
/// messages that arrive in the meantime and surfacing shutdown requests.
/// Kept as a free function (rather than a `&mut self` method) so it borrows
/// only `buffer`, leaving the rest of `self` free for `fut` to borrow.
async fn race<T>(
    buffer: &mut MessageBuffer,
    events: &mut mpsc::Receiver<ControllerEvent>,
    fut: impl Future<Output = T>,
) -> Result<T, ShutdownReason> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            out = &mut fut => return Ok(out),
            ev = events.recv() => {
                match ev {
                    Some(ControllerEvent::Client(IngressEvent::Message(msg))) => buffer.push(msg),
                    Some(ControllerEvent::Client(IngressEvent::Eof)) | None => {
                        return Err(ShutdownReason::ClientEof);
                    }
                    Some(ControllerEvent::Change(_)) => {
                        debug!("ignoring change event observed mid-restart");
                    }
                    Some(ControllerEvent::Shutdown(reason)) => return Err(reason),
                }
            }
        }
    }
}

/// `Killing`: SIGTERM, grace window, SIGKILL escalation, then a final
/// out-of-band wait. Proceeds regardless of the outcome (§7 `ProcessKillFailed`
/// is logged, never propagated).
async fn kill_gracefully(
    handle: &mut ChildHandle,
    grace: Duration,
) -> crate::process::ExitStatus {
    handle.kill(Signal::Term);
    if let Ok(status) = tokio::time::timeout(grace, handle.status_mut()).await {
        return status.unwrap_or_default();
    }

    warn!(pid = handle.pid, "SIGTERM grace window elapsed, escalating to SIGKILL");
    handle.kill(Signal::Kill);
    match tokio::time::timeout(Duration::from_secs(1), handle.status_mut()).await {
        Ok(status) => status.unwrap_or_default(),
        Err(_) => {
            error!(pid = handle.pid, "process did not terminate after SIGKILL; proceeding regardless");
            crate::process::ExitStatus::default()
        }
    }
}

/// `Replaying`: resend the stored `initialize`, wait up to
/// `proxy_request_timeout` (logging but never aborting on failure), then
/// drain the pre-captured buffer to the new child in FIFO order. Any
/// buffered `initialize` is dropped — the stored-session replay always wins.
async fn replay(
    running: &mut RunningChild,
    session: &Session,
    timeout: Duration,
    mut drained: Vec<Message>,
) {
    use tokio::io::AsyncWriteExt;

    if let Some(params) = session.initialize_params().await {
        let id = session.allocate_id();
        let (tx, rx) = oneshot::channel();
        session.register_pending(id.clone(), tx).await;

        let request = message::build_initialize_request(&id, params);
        if let Ok(line) = request.to_line() {
            let write_ok = running.handle.stdin.write_all(line.as_bytes()).await.is_ok()
                && running.handle.stdin.write_all(b"\n").await.is_ok()
                && running.handle.stdin.flush().await.is_ok();
            if write_ok {
                match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(Ok(_))) => debug!("child re-initialized"),
                    Ok(Ok(Err(err))) => warn!("child rejected replayed initialize: {err:?}"),
                    Ok(Err(_)) => warn!("child dropped the replayed initialize response channel"),
                    Err(_) => warn!("timed out waiting for replayed initialize response"),
                }
            } else {
                warn!("failed to write replayed initialize to new child");
                session.take_pending(&id).await;
            }
        } else {
            session.take_pending(&id).await;
        }
    }

    // A client-sent `initialize` captured during the restart window must not
    // duplicate the stored-session replay above (§4.6 Replaying).
    drained.retain(|m| !m.is_initialize());
    write_messages_in_order(running, drained).await;
}

/// Write a straggler batch — messages that arrived in `self.buffer` during
/// the `replay()` round-trip itself — straight to the child, still filtering
/// out any `initialize` so the stored-session replay stays the only one the
/// child sees for this restart.
async fn replay_remainder(running: &mut RunningChild, mut messages: Vec<Message>) {
    messages.retain(|m| !m.is_initialize());
    write_messages_in_order(running, messages).await;
}

/// Write an already-ordered batch of messages to the child's stdin, stopping
/// early (and logging) on the first write failure.
async fn write_messages_in_order(running: &mut RunningChild, messages: Vec<Message>) {
    use tokio::io::AsyncWriteExt;

    for msg in messages {
        if let Ok(line) = msg.to_line() {
            if running.handle.stdin.write_all(line.as_bytes()).await.is_err()
                || running.handle.stdin.write_all(b"\n").await.is_err()
                || running.handle.stdin.flush().await.is_err()
            {
                warn!("failed to replay buffered message to new child; dropping remainder");
                break;
            }
        }
    }
}
