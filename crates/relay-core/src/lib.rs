#![forbid(unsafe_code)]
//! Engine for a transparent hot-reload proxy sitting between an MCP client
//! and a child tool-server process speaking newline-delimited JSON-RPC 2.0
//! over stdio.
//!
//! The proxy forwards traffic bidirectionally and, on a watched file change
//! or child crash, restarts the child, replays the last `initialize`, and
//! announces the reload via `notifications/tools/list_changed` — all without
//! the client ever seeing a dropped connection. See
//! [`controller::RestartController`] for the restart state machine and
//! [`supervisor::Supervisor`] for how the pieces are wired together.

mod buffer;
mod change;
mod config;
mod controller;
mod error;
mod framer;
mod hooks;
mod ingress;
mod message;
mod process;
mod session;
mod stream_pump;
mod supervisor;

pub use buffer::MessageBuffer;
pub use change::{ChangeEvent, ChangeKind, ChangeSource, NotifyChangeSource};
pub use config::SupervisorConfig;
pub use controller::{ClientStdout, ControllerEvent, RestartController, ShutdownReason};
pub use error::{Result, SupervisorError};
pub use hooks::{Hook, HookBus};
pub use ingress::IngressEvent;
pub use message::{Message, RequestId};
pub use process::{ChildHandle, ExitStatus, ProcessManager, Signal, SpawnOptions, StdioProcessManager};
pub use session::Session;
pub use supervisor::Supervisor;
