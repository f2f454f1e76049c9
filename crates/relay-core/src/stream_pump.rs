//! Forwards child stdout to client stdout, parsing frames for interception.
//!
//! Key design rule (§4.4): **passthrough is authoritative, parsing is
//! advisory.** A frame that fails to parse is still forwarded verbatim;
//! interception is skipped for it. Grounded on `reader_task` in the teacher's
//! `mcp/jsonrpc.rs` (demux loop reading lines, deciding response vs.
//! notification), generalized to re-emit raw bytes for non-JSON lines and to
//! consult a [`crate::hooks::HookBus`] instead of a fixed dispatch.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::framer::{truncate_for_log, FramedLine, LineFramer};
use crate::hooks::HookBus;
use crate::message::Message;
use crate::session::Session;

/// Pump child stdout to client stdout until EOF, applying hooks and
/// resolving proxy-synthesized requests along the way.
pub async fn pump_stdout<R, W>(
    mut child_stdout: R,
    mut client_stdout: W,
    hooks: &HookBus,
    session: &Session,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut framer = LineFramer::new();
    let mut chunk = [0u8; 8192];

    loop {
        let n = child_stdout.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        for line in framer.feed(&chunk[..n]) {
            handle_line(line, &mut client_stdout, hooks, session).await?;
        }
    }

    if let Some(line) = framer.finish() {
        handle_line(line, &mut client_stdout, hooks, session).await?;
    }

    Ok(())
}

async fn handle_line<W: AsyncWrite + Unpin>(
    line: FramedLine,
    client_stdout: &mut W,
    hooks: &HookBus,
    session: &Session,
) -> std::io::Result<()> {
    let text = match line {
        FramedLine::Text(text) => text,
        FramedLine::Invalid(raw) => {
            warn!("child stdout produced non-UTF-8 output; forwarding verbatim");
            client_stdout.write_all(&raw).await?;
            client_stdout.write_all(b"\n").await?;
            client_stdout.flush().await?;
            return Ok(());
        }
    };

    let parsed: Option<serde_json::Value> = match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(
                "malformed JSON from child stdout, forwarding verbatim: {err} (line: {})",
                truncate_for_log(&text, 256)
            );
            None
        }
    };

    let Some(value) = parsed else {
        client_stdout.write_all(text.as_bytes()).await?;
        client_stdout.write_all(b"\n").await?;
        client_stdout.flush().await?;
        return Ok(());
    };

    let msg = Message::from_value(value);

    // Intercept proxy-synthesized request responses before they reach hooks:
    // the client must never see a response to a request it didn't make.
    if msg.is_response() {
        if let Some(id) = msg.id() {
            if let Some(pending) = session.take_pending(&id).await {
                let result = msg
                    .0
                    .get("error")
                    .cloned()
                    .map(Err)
                    .unwrap_or_else(|| Ok(msg.0.get("result").cloned().unwrap_or(serde_json::Value::Null)));
                let _ = pending.resolver.send(result);
                return Ok(());
            }
        }
    }

    let original = msg.0.clone();
    match hooks.after_stdout_receive(msg).await {
        None => {} // suppressed: no bytes forwarded
        Some(forwarded) if forwarded.0 == original => {
            // unmutated: forward the exact bytes the child chose.
            client_stdout.write_all(text.as_bytes()).await?;
            client_stdout.write_all(b"\n").await?;
            client_stdout.flush().await?;
        }
        Some(forwarded) => {
            let serialized = forwarded.to_line().unwrap_or(text);
            client_stdout.write_all(serialized.as_bytes()).await?;
            client_stdout.write_all(b"\n").await?;
            client_stdout.flush().await?;
        }
    }

    Ok(())
}

/// Forward child stderr to proxy stderr verbatim, with no parsing (§4.4).
pub async fn pump_stderr<R, W>(mut child_stderr: R, mut proxy_stderr: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        let n = child_stderr.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        proxy_stderr.write_all(&buf[..n]).await?;
        proxy_stderr.flush().await?;
    }
    Ok(())
}
