//! `ProcessManager` contract (§4.1) and its default `tokio::process`-backed
//! implementation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;

use crate::error::SupervisorError;

/// The signal a caller may request when killing a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

/// The terminal status of a child process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

/// Options accompanying a spawn request.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

/// A live child process: pid, piped stdio, and a one-shot exit status.
///
/// Invariant (§3 ChildHandle / §8.8 zombies): every handle's `status` future
/// must be awaited to completion exactly once before the proxy exits, so the
/// OS process table entry is reaped.
pub struct ChildHandle {
    pub pid: u32,
    pub stdin: ChildStdin,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    status_rx: oneshot::Receiver<ExitStatus>,
    killer: PlatformKiller,
}

impl ChildHandle {
    /// Request termination. Returns whether the signal was delivered — not
    /// whether the process has exited. Idempotent: killing an already-dead
    /// (already-reaped) process returns `false` without error.
    pub fn kill(&self, signal: Signal) -> bool {
        self.killer.kill(signal)
    }

    /// Take ownership of the child's stdout, for a pump task. Panics if
    /// called more than once per handle.
    pub fn take_stdout(&mut self) -> ChildStdout {
        self.stdout.take().expect("child stdout already taken")
    }

    /// Take ownership of the child's stderr, for a pump task. Panics if
    /// called more than once per handle.
    pub fn take_stderr(&mut self) -> ChildStderr {
        self.stderr.take().expect("child stderr already taken")
    }

    /// Await the terminal exit status. Resolves exactly once.
    pub async fn status(self) -> ExitStatus {
        self.status_rx.await.unwrap_or_default()
    }

    /// Borrow the exit-status future so it can be raced against a timer
    /// across multiple `select!` iterations (e.g. the kill-escalation grace
    /// window) without consuming the handle.
    pub fn status_mut(&mut self) -> &mut oneshot::Receiver<ExitStatus> {
        &mut self.status_rx
    }
}

/// Spawn/observe contract for child processes. Abstracted so the restart
/// engine never calls `tokio::process` directly (§1, out of scope: platform
/// specific spawning).
#[async_trait]
pub trait ProcessManager: Send + Sync {
    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<ChildHandle, SupervisorError>;
}

/// Default `tokio::process`-backed implementation.
///
/// Grounded on `JsonRpcTransport::spawn_with_subcommand` (piped stdio,
/// `kill_on_drop`, env merging, `current_dir`) and `process::spawn_with_retry`
/// (busy-executable backoff) in the teacher's `codex` crate.
pub struct StdioProcessManager;

#[async_trait]
impl ProcessManager for StdioProcessManager {
    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<ChildHandle, SupervisorError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let mut child = spawn_with_busy_retry(&mut cmd, command).await?;
        let pid = child.id().unwrap_or(0);

        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let (status_tx, status_rx) = oneshot::channel();
        let killer = PlatformKiller::spawn(child, pid, status_tx);

        Ok(ChildHandle {
            pid,
            stdin,
            stdout: Some(stdout),
            stderr: Some(stderr),
            status_rx,
            killer,
        })
    }
}

async fn spawn_with_busy_retry(cmd: &mut Command, command: &str) -> Result<Child, SupervisorError> {
    let mut backoff = Duration::from_millis(2);
    for attempt in 0..5 {
        match cmd.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                let is_busy = matches!(source.kind(), std::io::ErrorKind::ExecutableFileBusy)
                    || source.raw_os_error() == Some(26);
                if is_busy && attempt < 4 {
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    continue;
                }
                return Err(SupervisorError::Spawn {
                    binary: PathBuf::from(command),
                    source,
                });
            }
        }
    }
    unreachable!("spawn_with_busy_retry should return before exhausting retries")
}

#[cfg(unix)]
fn to_exit_status(status: std::process::ExitStatus) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    ExitStatus {
        code: status.code(),
        signal: status.signal().map(|s| s.to_string()),
    }
}

#[cfg(not(unix))]
fn to_exit_status(status: std::process::ExitStatus) -> ExitStatus {
    ExitStatus {
        code: status.code(),
        signal: None,
    }
}

/// Unix: the pid is stable for the process's entire lifetime (including while
/// a zombie awaiting reap), so signaling by raw pid needs no coordination with
/// the task that owns `Child` and calls `wait()`.
#[cfg(unix)]
struct PlatformKiller {
    pid: u32,
}

#[cfg(unix)]
impl PlatformKiller {
    fn spawn(mut child: Child, _pid: u32, status_tx: oneshot::Sender<ExitStatus>) -> Self {
        let pid = child.id().unwrap_or(0);
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => to_exit_status(status),
                Err(_) => ExitStatus::default(),
            };
            let _ = status_tx.send(exit);
        });
        Self { pid }
    }

    fn kill(&self, signal: Signal) -> bool {
        use nix::sys::signal::{self, Signal as NixSignal};
        use nix::unistd::Pid;

        if self.pid == 0 {
            return false;
        }
        let nix_signal = match signal {
            Signal::Term => NixSignal::SIGTERM,
            Signal::Kill => NixSignal::SIGKILL,
        };
        signal::kill(Pid::from_raw(self.pid as i32), nix_signal).is_ok()
    }
}

/// Non-unix: no portable raw-pid signaling, so the child stays behind a
/// shared lock and the wait loop polls `try_wait` instead of blocking on
/// `wait()`, so `kill` can always acquire the lock between polls.
#[cfg(not(unix))]
struct PlatformKiller {
    child: std::sync::Arc<std::sync::Mutex<Option<Child>>>,
}

#[cfg(not(unix))]
impl PlatformKiller {
    fn spawn(child: Child, _pid: u32, status_tx: oneshot::Sender<ExitStatus>) -> Self {
        let shared = std::sync::Arc::new(std::sync::Mutex::new(Some(child)));
        let watched = shared.clone();
        tokio::spawn(async move {
            loop {
                let polled = {
                    let mut guard = watched.lock().unwrap();
                    guard.as_mut().and_then(|c| c.try_wait().ok().flatten())
                };
                if let Some(status) = polled {
                    let _ = status_tx.send(to_exit_status(status));
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });
        Self { child: shared }
    }

    fn kill(&self, _signal: Signal) -> bool {
        let mut guard = self.child.lock().unwrap();
        match guard.as_mut() {
            Some(child) => child.start_kill().is_ok(),
            None => false,
        }
    }
}
