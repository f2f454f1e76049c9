//! Session state: the last observed `initialize` params and the id allocator
//! for proxy-synthesized requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use crate::message::RequestId;

/// One-shot resolver for a proxy-synthesized request, paired with the
/// request's own timeout so the stdout pump doesn't need to track deadlines.
pub struct PendingProxyRequest {
    pub resolver: oneshot::Sender<Result<Value, Value>>,
}

/// Shared map of in-flight proxy-synthesized requests. Touched by the
/// controller (insert, timeout removal) and by the stdout pump (resolve on
/// response); guarded by a mutex per §5 rather than routed through the
/// controller's event channel, since resolution must happen the instant a
/// matching frame is parsed.
pub type PendingProxyRequests = Arc<Mutex<HashMap<RequestId, PendingProxyRequest>>>;

/// Per-proxy-lifetime session state: the last client `initialize` and the
/// allocator for proxy-synthesized request ids.
pub struct Session {
    initialize_params: Mutex<Option<Value>>,
    next_id: AtomicU64,
    id_prefix: String,
    pub pending: PendingProxyRequests,
}

impl Session {
    pub fn new(id_prefix: impl Into<String>) -> Self {
        Self {
            initialize_params: Mutex::new(None),
            next_id: AtomicU64::new(1),
            id_prefix: id_prefix.into(),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Snapshot the params of a client-originated `initialize`, overwriting
    /// any prior value.
    pub async fn record_initialize(&self, params: Value) {
        *self.initialize_params.lock().await = Some(params);
    }

    pub async fn initialize_params(&self) -> Option<Value> {
        self.initialize_params.lock().await.clone()
    }

    /// Allocate a proxy-synthesized request id, tagged so it can never
    /// collide with a client-originated numeric id (§3).
    pub fn allocate_id(&self) -> RequestId {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        RequestId::Str(format!("{}:{}", self.id_prefix, n))
    }

    /// Register a waiter for a proxy-synthesized request's response.
    pub async fn register_pending(&self, id: RequestId, resolver: oneshot::Sender<Result<Value, Value>>) {
        self.pending
            .lock()
            .await
            .insert(id, PendingProxyRequest { resolver });
    }

    /// Remove a waiter without resolving it (used on timeout).
    pub async fn take_pending(&self, id: &RequestId) -> Option<PendingProxyRequest> {
        self.pending.lock().await.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocated_ids_are_disjoint_from_numeric_client_ids() {
        let session = Session::new("relay");
        let id1 = session.allocate_id();
        let id2 = session.allocate_id();
        assert_ne!(id1, id2);
        assert!(matches!(id1, RequestId::Str(ref s) if s.starts_with("relay:")));
        // A numeric client id can never equal a tagged string id under serde_json's
        // Value equality / our RequestId enum, by construction.
        assert_ne!(id1, RequestId::Number(1));
    }

    #[tokio::test]
    async fn record_initialize_overwrites_prior_value() {
        let session = Session::new("relay");
        session.record_initialize(serde_json::json!({"v": 1})).await;
        session.record_initialize(serde_json::json!({"v": 2})).await;
        assert_eq!(
            session.initialize_params().await,
            Some(serde_json::json!({"v": 2}))
        );
    }

    #[tokio::test]
    async fn pending_request_round_trips() {
        let session = Session::new("relay");
        let id = session.allocate_id();
        let (tx, rx) = oneshot::channel();
        session.register_pending(id.clone(), tx).await;
        let pending = session.take_pending(&id).await.unwrap();
        pending.resolver.send(Ok(serde_json::json!({"ok": true}))).unwrap();
        assert_eq!(rx.await.unwrap(), Ok(serde_json::json!({"ok": true})));
    }
}
