//! Hook-point contract (§4.7) and the bus that dispatches registered hooks.
//!
//! The extension subsystem itself is out of scope (§1); the core only owns
//! this contract plus an empty-by-default registry the CLI can populate.
//! Modeled as message passing rather than back-references into the pump, per
//! the design note in §9: hooks return values, the bus collects them.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::Value;
use tracing::{error, warn};

use crate::message::Message;

/// A message interceptor hung off one of the five hook points. Default
/// methods are identity/no-ops so implementors only override what they need.
#[async_trait::async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str {
        "unnamed-hook"
    }

    /// Before a client message is forwarded to the child. Return `Ok(None)`
    /// to suppress, `Ok(Some(msg))` to forward (possibly mutated).
    async fn before_stdin_forward(&self, msg: Message) -> Result<Option<Message>, String> {
        Ok(Some(msg))
    }

    /// After a child message is parsed, before it is forwarded to the client.
    async fn after_stdout_receive(&self, msg: Message) -> Result<Option<Message>, String> {
        Ok(Some(msg))
    }

    async fn before_restart(&self) {}
    async fn after_server_start(&self) {}
    async fn on_shutdown(&self) {}

    /// Contribute synthetic tool definitions merged into the next
    /// `tools/list` response the proxy intercepts. Default: none.
    async fn extend_tools_list(&self) -> Vec<Value> {
        Vec::new()
    }
}

/// Dispatches hook points to registered hooks in registration order.
///
/// A hook that returns `Ok(None)` suppresses the message for downstream hooks
/// and for the subsequent forward. A hook whose future panics or returns
/// `Err` is logged and treated as identity for that message (§4.7).
#[derive(Clone, Default)]
pub struct HookBus {
    hooks: Vec<Arc<dyn Hook>>,
}

impl HookBus {
    pub fn new(hooks: Vec<Arc<dyn Hook>>) -> Self {
        Self { hooks }
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub async fn before_stdin_forward(&self, mut msg: Message) -> Option<Message> {
        for hook in &self.hooks {
            let name = hook.name().to_string();
            match run_guarded(hook.before_stdin_forward(msg.clone()), &name).await {
                Some(Some(next)) => msg = next,
                Some(None) => return None,
                None => {}
            }
        }
        Some(msg)
    }

    pub async fn after_stdout_receive(&self, mut msg: Message) -> Option<Message> {
        for hook in &self.hooks {
            let name = hook.name().to_string();
            match run_guarded(hook.after_stdout_receive(msg.clone()), &name).await {
                Some(Some(next)) => msg = next,
                Some(None) => return None,
                None => {}
            }
        }
        Some(msg)
    }

    pub async fn before_restart(&self) {
        for hook in &self.hooks {
            let _ = AssertUnwindSafe(hook.before_restart()).catch_unwind().await;
        }
    }

    pub async fn after_server_start(&self) {
        for hook in &self.hooks {
            let _ = AssertUnwindSafe(hook.after_server_start()).catch_unwind().await;
        }
    }

    pub async fn on_shutdown(&self) {
        for hook in &self.hooks {
            let _ = AssertUnwindSafe(hook.on_shutdown()).catch_unwind().await;
        }
    }

    /// Collect synthetic tool definitions from every hook that opts in,
    /// merged into the next intercepted `tools/list` response.
    pub async fn extend_tools_list(&self) -> Vec<Value> {
        let mut extra = Vec::new();
        for hook in &self.hooks {
            let name = hook.name().to_string();
            match AssertUnwindSafe(hook.extend_tools_list()).catch_unwind().await {
                Ok(tools) => extra.extend(tools),
                Err(_) => error!("hook `{name}` panicked in extend_tools_list"),
            }
        }
        extra
    }
}

/// Run a hook's future, catching panics and logging `Err` results as
/// `HookError`, per §7's "offending hook is treated as identity".
async fn run_guarded<F>(fut: F, name: &str) -> Option<Option<Message>>
where
    F: std::future::Future<Output = Result<Option<Message>, String>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(result)) => Some(result),
        Ok(Err(reason)) => {
            warn!("hook `{name}` returned an error: {reason}; passing message through unmodified");
            None
        }
        Err(_) => {
            error!("hook `{name}` panicked; passing message through unmodified");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Suppressor;
    #[async_trait::async_trait]
    impl Hook for Suppressor {
        fn name(&self) -> &str {
            "suppressor"
        }
        async fn before_stdin_forward(&self, _msg: Message) -> Result<Option<Message>, String> {
            Ok(None)
        }
    }

    struct Failing;
    #[async_trait::async_trait]
    impl Hook for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        async fn after_stdout_receive(&self, _msg: Message) -> Result<Option<Message>, String> {
            Err("boom".to_string())
        }
    }

    #[tokio::test]
    async fn suppressing_hook_drops_message() {
        let bus = HookBus::new(vec![Arc::new(Suppressor)]);
        let msg = Message::from_value(serde_json::json!({"jsonrpc":"2.0","method":"ping"}));
        assert!(bus.before_stdin_forward(msg).await.is_none());
    }

    #[tokio::test]
    async fn failing_hook_passes_through_unmodified() {
        let bus = HookBus::new(vec![Arc::new(Failing)]);
        let msg = Message::from_value(serde_json::json!({"jsonrpc":"2.0","result":{}}));
        let out = bus.after_stdout_receive(msg.clone()).await;
        assert!(out.is_some());
        assert_eq!(out.unwrap().into_value(), msg.into_value());
    }

    #[tokio::test]
    async fn empty_bus_is_identity() {
        let bus = HookBus::default();
        assert!(bus.is_empty());
        let msg = Message::from_value(serde_json::json!({"jsonrpc":"2.0","method":"ping"}));
        let out = bus.before_stdin_forward(msg.clone()).await.unwrap();
        assert_eq!(out.into_value(), msg.into_value());
    }
}
