//! Scenario-test fixtures: fake child-server scripts written to a tempdir
//! (the fixture style from the teacher's `mcp/test_support.rs`) plus a
//! `ChangeSource` the test drives directly, so restarts are triggered
//! deterministically instead of depending on real filesystem-watch timing.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use relay_core::{ChangeEvent, ChangeKind, ChangeSource, SupervisorError};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, body).expect("write fixture script");
    let mut perms = fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod");
    path
}

/// Generic fake MCP server: replies to `initialize`/`tools/list`/`ping` with a
/// canned result carrying the client's own id, and (if `SPAWN_COUNTER_FILE` is
/// set) appends a line to that file on every startup so a test can count how
/// many times it was spawned.
pub const GENERIC_SERVER: &str = r#"#!/usr/bin/env python3
import json
import os
import sys

counter_path = os.environ.get("SPAWN_COUNTER_FILE")
if counter_path:
    with open(counter_path, "a") as fh:
        fh.write("spawn\n")

for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    msg = json.loads(line)
    method = msg.get("method")
    mid = msg.get("id")
    if method == "initialize":
        print(json.dumps({"jsonrpc": "2.0", "id": mid, "result": {"ok": True}}))
    elif method == "tools/list":
        print(json.dumps({"jsonrpc": "2.0", "id": mid, "result": {"tools": [{"name": "t"}]}}))
    elif method == "ping":
        print(json.dumps({"jsonrpc": "2.0", "id": mid, "result": {"pong": True}}))
    sys.stdout.flush()
"#;

/// Ignores SIGTERM so the kill-escalation grace window elapses and the
/// controller must fall back to SIGKILL.
pub const UNRESPONSIVE_SERVER: &str = r#"#!/usr/bin/env python3
import json
import signal
import sys

signal.signal(signal.SIGTERM, signal.SIG_IGN)

for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    msg = json.loads(line)
    method = msg.get("method")
    mid = msg.get("id")
    if method == "initialize":
        print(json.dumps({"jsonrpc": "2.0", "id": mid, "result": {"ok": True}}))
        sys.stdout.flush()
    elif method == "tools/list":
        print(json.dumps({"jsonrpc": "2.0", "id": mid, "result": {"tools": []}}))
        sys.stdout.flush()
"#;

/// Writes one malformed (non-JSON) line on startup, then idles.
pub const MALFORMED_SERVER: &str = r#"#!/usr/bin/env python3
import sys

print("not-json")
sys.stdout.flush()
for _line in sys.stdin:
    pass
"#;

/// A `ChangeSource` the test controls directly via [`ManualChangeTrigger`],
/// so S2/S3 don't depend on real filesystem-watch latency.
pub struct ManualChangeSource {
    rx: Mutex<mpsc::UnboundedReceiver<ChangeEvent>>,
}

#[derive(Clone)]
pub struct ManualChangeTrigger(mpsc::UnboundedSender<ChangeEvent>);

impl ManualChangeTrigger {
    pub fn fire(&self, path: &str) {
        let _ = self.0.send(ChangeEvent {
            path: PathBuf::from(path),
            kind: ChangeKind::Modify,
        });
    }
}

pub fn manual_change_source() -> (ManualChangeSource, ManualChangeTrigger) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ManualChangeSource { rx: Mutex::new(rx) },
        ManualChangeTrigger(tx),
    )
}

#[async_trait]
impl ChangeSource for ManualChangeSource {
    async fn watch(
        &self,
        _paths: Vec<PathBuf>,
        tx: mpsc::Sender<ChangeEvent>,
        cancel: CancellationToken,
    ) -> Result<(), SupervisorError> {
        let mut rx = self.rx.lock().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                maybe = rx.recv() => {
                    match maybe {
                        Some(event) => {
                            if tx.send(event).await.is_err() {
                                return Ok(());
                            }
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}
