//! Reads client stdin, frames/parses messages, and forwards them to the
//! restart controller for routing (§4.5). Writing to the (possibly swapped)
//! child stdin and buffering during a restart both require exclusive access
//! to controller-owned state, so this stage only decides what the message
//! *is* (recording `initialize`, running `beforeStdinForward`) and lets the
//! controller decide where it goes.

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::warn;

use crate::framer::{truncate_for_log, FramedLine, LineFramer};
use crate::hooks::HookBus;
use crate::message::Message;
use crate::session::Session;

/// An event the client-ingress loop hands to the controller.
pub enum IngressEvent {
    Message(Message),
    Eof,
}

/// Read client stdin to EOF, parsing and hook-dispatching each line, and
/// forward the result to `tx`. Malformed lines are logged and dropped
/// (never forwarded, per §4.3/§7 ParseError).
pub async fn run_client_ingress<R>(
    mut client_stdin: R,
    hooks: &HookBus,
    session: &Session,
    tx: tokio::sync::mpsc::Sender<IngressEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut framer = LineFramer::new();
    let mut chunk = [0u8; 8192];

    loop {
        let n = match client_stdin.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!("client stdin read error: {err}");
                break;
            }
        };

        for line in framer.feed(&chunk[..n]) {
            if let Some(event) = decode_and_hook(line, hooks, session).await {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }

    if let Some(line) = framer.finish() {
        if let Some(event) = decode_and_hook(line, hooks, session).await {
            let _ = tx.send(event).await;
        }
    }

    let _ = tx.send(IngressEvent::Eof).await;
}

async fn decode_and_hook(
    line: FramedLine,
    hooks: &HookBus,
    session: &Session,
) -> Option<IngressEvent> {
    let text = match line {
        FramedLine::Text(text) => text,
        FramedLine::Invalid(_) => {
            warn!("client stdin produced non-UTF-8 line; dropped");
            return None;
        }
    };

    let value: serde_json::Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(err) => {
            warn!(
                "malformed JSON from client stdin, dropped: {err} (line: {})",
                truncate_for_log(&text, 256)
            );
            return None;
        }
    };

    let msg = Message::from_value(value);

    // Step 1: snapshot `initialize` params before hook dispatch, so the
    // latest init survives a restart even if a hook mutates/suppresses it.
    if msg.is_initialize() {
        if let Some(params) = msg.params() {
            session.record_initialize(params.clone()).await;
        }
    }

    // Step 2: before-forward hook; mutation/suppression semantics mirror §4.4.
    let forwarded = hooks.before_stdin_forward(msg).await?;
    Some(IngressEvent::Message(forwarded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initialize_recorded_before_buffering_decision() {
        let session = Session::new("relay");
        let hooks = HookBus::default();
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let input = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\",\"params\":{\"v\":1}}\n".to_vec();
        run_client_ingress(input.as_slice(), &hooks, &session, tx).await;

        assert_eq!(
            session.initialize_params().await,
            Some(serde_json::json!({"v": 1}))
        );
        match rx.recv().await {
            Some(IngressEvent::Message(msg)) => assert!(msg.is_initialize()),
            other => panic!("expected a message event, got {}", matches!(other, Some(IngressEvent::Eof))),
        }
    }

    #[tokio::test]
    async fn malformed_line_dropped_not_forwarded() {
        let session = Session::new("relay");
        let hooks = HookBus::default();
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        run_client_ingress(b"not-json\n".as_slice(), &hooks, &session, tx).await;
        match rx.recv().await {
            Some(IngressEvent::Eof) => {}
            other => panic!("expected only EOF, got a message event: {}", matches!(other, Some(_))),
        }
    }

    #[tokio::test]
    async fn eof_sent_after_stream_closes() {
        let session = Session::new("relay");
        let hooks = HookBus::default();
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        run_client_ingress(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n".as_slice(), &hooks, &session, tx).await;
        assert!(matches!(rx.recv().await, Some(IngressEvent::Message(_))));
        assert!(matches!(rx.recv().await, Some(IngressEvent::Eof)));
    }
}
