//! Top-level wiring: spawns the client-ingress, change-watch, and
//! client-stdout-writer tasks, then hands the assembled channels to
//! [`RestartController::run`].
//!
//! The signal-handling half is grounded on `atm-daemon`'s `main.rs`, which
//! races `ctrl_c()` against a `SIGTERM` listener on unix and cancels a shared
//! token; here the two signals are instead distinguished so SIGINT and
//! SIGTERM can map to different exit codes (§6).

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::change::ChangeSource;
use crate::config::SupervisorConfig;
use crate::controller::{ControllerEvent, RestartController, ShutdownReason};
use crate::error::SupervisorError;
use crate::hooks::HookBus;
use crate::ingress::{self, IngressEvent};
use crate::process::ProcessManager;
use crate::session::Session;

/// The assembled proxy: configuration plus the pluggable process/change
/// backends and hook registry. Construct with [`Supervisor::new`] for the
/// default `tokio::process`/`notify` backends, or [`Supervisor::with_backends`]
/// to inject fakes (used by the scenario tests).
pub struct Supervisor {
    config: SupervisorConfig,
    process_manager: Arc<dyn ProcessManager>,
    change_source: Arc<dyn ChangeSource>,
    hooks: HookBus,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        let ignore = config
            .ignore_matcher()
            .map_err(|err| SupervisorError::ConfigError(err.to_string()))?;
        Ok(Self {
            config,
            process_manager: Arc::new(crate::process::StdioProcessManager),
            change_source: Arc::new(crate::change::NotifyChangeSource::new(ignore)),
            hooks: HookBus::default(),
        })
    }

    pub fn with_backends(
        config: SupervisorConfig,
        process_manager: Arc<dyn ProcessManager>,
        change_source: Arc<dyn ChangeSource>,
        hooks: HookBus,
    ) -> Self {
        Self {
            config,
            process_manager,
            change_source,
            hooks,
        }
    }

    /// Run the proxy to completion against the real process's stdin/stdout,
    /// returning the exit code the CLI should propagate.
    pub async fn run(self) -> i32 {
        let stdin = tokio::io::stdin();
        let (stdout_tx, mut stdout_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let writer_task = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(frame) = stdout_rx.recv().await {
                if stdout.write_all(&frame).await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;
            }
        });

        let exit_code = self.run_with_io(stdin, stdout_tx).await;

        writer_task.abort();
        exit_code
    }

    /// Run against an arbitrary client stdin and stdout-sink, rather than the
    /// process's own stdio. Used by the scenario tests (a `tokio::io::duplex`
    /// stands in for the client) and available to embedders that want to run
    /// the proxy over something other than the process's real stdio.
    pub async fn run_with_io<R>(self, client_stdin: R, client_stdout: mpsc::UnboundedSender<Vec<u8>>) -> i32
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let session = Arc::new(Session::new(self.config.id_prefix.clone()));
        let (events_tx, events_rx) = mpsc::channel::<ControllerEvent>(self.config.buffer_capacity);
        let cancel = CancellationToken::new();

        let ingress_task = {
            let hooks = self.hooks.clone();
            let session = session.clone();
            let events_tx = events_tx.clone();
            tokio::spawn(async move {
                let (tx, mut rx) = mpsc::channel::<IngressEvent>(64);
                let producer = ingress::run_client_ingress(client_stdin, &hooks, &session, tx);
                let consumer = async {
                    while let Some(event) = rx.recv().await {
                        if events_tx.send(ControllerEvent::Client(event)).await.is_err() {
                            break;
                        }
                    }
                };
                tokio::join!(producer, consumer);
            })
        };

        let change_task = if self.config.watch_paths.is_empty() {
            None
        } else {
            let change_source = self.change_source.clone();
            let paths = self.config.watch_paths.clone();
            let events_tx = events_tx.clone();
            let cancel = cancel.clone();
            Some(tokio::spawn(async move {
                let (change_tx, mut change_rx) = mpsc::channel(64);
                let producer = change_source.watch(paths, change_tx, cancel);
                let consumer = async {
                    while let Some(change) = change_rx.recv().await {
                        if events_tx.send(ControllerEvent::Change(change)).await.is_err() {
                            break;
                        }
                    }
                };
                let (watch_result, ()) = tokio::join!(producer, consumer);
                if let Err(err) = watch_result {
                    warn!("change source watch ended with an error: {err}");
                }
            }))
        };

        let signal_task = {
            let events_tx = events_tx.clone();
            tokio::spawn(async move {
                let reason = wait_for_signal().await;
                let _ = events_tx.send(ControllerEvent::Shutdown(reason)).await;
            })
        };

        let controller = RestartController::new(
            self.config,
            self.process_manager,
            session,
            self.hooks,
            client_stdout,
        );
        let exit_code = controller.run(events_rx).await;

        info!("proxy exiting with code {exit_code}");
        cancel.cancel();
        ingress_task.abort();
        signal_task.abort();
        if let Some(task) = change_task {
            task.abort();
        }

        exit_code
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> ShutdownReason {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => ShutdownReason::Sigint,
        _ = sigterm.recv() => ShutdownReason::Sigterm,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> ShutdownReason {
    let _ = tokio::signal::ctrl_c().await;
    ShutdownReason::Sigint
}
