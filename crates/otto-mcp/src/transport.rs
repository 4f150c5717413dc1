// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! JSON-RPC 2.0 over a child process's stdio.
//!
//! Each configured MCP server is one spawned subprocess speaking
//! newline-delimited JSON-RPC on stdin/stdout.  Requests carry
//! monotonically increasing integer ids; a background reader task routes
//! responses to their waiting callers through a pending-request table.
//!
//! Lifecycle: Spawning → Initializing → Ready → Closing → Closed.  Any
//! protocol failure moves the client to Closing; Closed clients are removed
//! from the tool registry on the next refresh.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, warn};

use otto_config::McpServerConfig;

/// Per-request reply deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Spawning,
    Initializing,
    Ready,
    Closing,
    Closed,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerState::Spawning => "spawning",
            ServerState::Initializing => "initializing",
            ServerState::Ready => "ready",
            ServerState::Closing => "closing",
            ServerState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("server '{name}' is {state}, not ready")]
    NotReady { name: String, state: ServerState },
    #[error("transport closed before a reply arrived")]
    ChannelClosed,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A tool advertised by an MCP server via `tools/list`.
#[derive(Debug, Clone)]
pub struct McpToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

type PendingMap = Arc<Mutex<HashMap<u64, tokio::sync::oneshot::Sender<Value>>>>;

/// One connected MCP server.
pub struct McpClient {
    name: String,
    child: Mutex<Option<Child>>,
    stdin: tokio::sync::Mutex<tokio::process::ChildStdin>,
    pending: PendingMap,
    next_id: AtomicU64,
    state: Mutex<ServerState>,
}

impl McpClient {
    /// Spawn the server process and start the response reader.  The client
    /// is in `Spawning` state until [`McpClient::initialize`] completes.
    pub fn spawn(name: &str, cfg: &McpServerConfig) -> Result<Arc<Self>, McpError> {
        let mut cmd = Command::new(&cfg.command);
        cmd.args(&cfg.args)
            .envs(&cfg.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().expect("stdin piped");
        let stdout = child.stdout.take().expect("stdout piped");

        let client = Arc::new(Self {
            name: name.to_string(),
            child: Mutex::new(Some(child)),
            stdin: tokio::sync::Mutex::new(stdin),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            state: Mutex::new(ServerState::Spawning),
        });

        // Reader task: route each stdout line to the waiting request by id.
        let pending = Arc::clone(&client.pending);
        let reader_client = Arc::clone(&client);
        tokio::spawn(async move {
            let mut lines = FramedRead::new(stdout, LinesCodec::new());
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        warn!(server = %reader_client.name, error = %e, "mcp read error");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let v: Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(server = %reader_client.name, error = %e, "mcp sent invalid JSON");
                        continue;
                    }
                };
                match v.get("id").and_then(Value::as_u64) {
                    Some(id) => {
                        let tx = pending.lock().unwrap().remove(&id);
                        match tx {
                            Some(tx) => {
                                let _ = tx.send(v);
                            }
                            None => {
                                debug!(server = %reader_client.name, id, "reply for unknown request id");
                            }
                        }
                    }
                    // Notifications (no id) are accepted and ignored.
                    None => debug!(server = %reader_client.name, "mcp notification"),
                }
            }
            // Reader gone: the process died or closed stdout.  Dropping the
            // pending senders wakes every waiting caller with ChannelClosed.
            reader_client.set_state(ServerState::Closed);
            pending.lock().unwrap().clear();
        });

        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, s: ServerState) {
        *self.state.lock().unwrap() = s;
    }

    /// Send one request and await its reply.
    async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        if self.state() == ServerState::Closed {
            return Err(McpError::ChannelClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let msg = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let mut line = msg.to_string();
        line.push('\n');
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                self.pending.lock().unwrap().remove(&id);
                self.set_state(ServerState::Closing);
                return Err(McpError::Spawn(e));
            }
        }

        let reply = match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                return Err(McpError::Timeout(REQUEST_TIMEOUT));
            }
            Ok(Err(_)) => return Err(McpError::ChannelClosed),
            Ok(Ok(v)) => v,
        };

        if let Some(err) = reply.get("error").filter(|e| !e.is_null()) {
            self.set_state(ServerState::Closing);
            return Err(McpError::Protocol(err.to_string()));
        }
        Ok(reply.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Perform the MCP `initialize` handshake.
    pub async fn initialize(&self) -> Result<(), McpError> {
        self.set_state(ServerState::Initializing);
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": { "name": "otto", "version": env!("CARGO_PKG_VERSION") },
                }),
            )
            .await;
        match result {
            Ok(_) => {
                self.set_state(ServerState::Ready);
                Ok(())
            }
            Err(e) => {
                self.set_state(ServerState::Closing);
                Err(e)
            }
        }
    }

    /// Enumerate the server's tools.
    pub async fn list_tools(&self) -> Result<Vec<McpToolInfo>, McpError> {
        self.ensure_ready()?;
        let result = self.request("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(tools
            .iter()
            .filter_map(|t| {
                Some(McpToolInfo {
                    name: t.get("name")?.as_str()?.to_string(),
                    description: t
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    input_schema: t
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| json!({ "type": "object" })),
                })
            })
            .collect())
    }

    /// Invoke a tool on the server.  Returns `(text, is_error)`.
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<(String, bool), McpError> {
        self.ensure_ready()?;
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": args }))
            .await?;
        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let text = result
            .get("content")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        Ok((text, is_error))
    }

    fn ensure_ready(&self) -> Result<(), McpError> {
        let state = self.state();
        if state != ServerState::Ready {
            return Err(McpError::NotReady { name: self.name.clone(), state });
        }
        Ok(())
    }

    /// Terminate the server process.
    pub async fn shutdown(&self) {
        self.set_state(ServerState::Closing);
        let child = self.child.lock().unwrap().take();
        if let Some(mut child) = child {
            let _ = child.kill().await;
        }
        self.set_state(ServerState::Closed);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Write a bash stub that answers every request by echoing the id back
    /// with a canned result per method.
    fn stub_server(dir: &tempfile::TempDir) -> McpServerConfig {
        let script = dir.path().join("mcp_stub.sh");
        std::fs::write(
            &script,
            r##"#!/bin/bash
while IFS= read -r line; do
  id=$(echo "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"stub"}}}\n' "$id";;
    *'tools/list'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"echoes text","inputSchema":{"type":"object","properties":{"text":{"type":"string"}}}}]}}\n' "$id";;
    *'tools/call'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"echoed"}],"isError":false}}\n' "$id";;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"method not found"}}\n' "$id";;
  esac
done
"##,
        )
        .unwrap();
        McpServerConfig {
            command: "bash".into(),
            args: vec![script.to_string_lossy().into_owned()],
            env: Default::default(),
        }
    }

    #[tokio::test]
    async fn initialize_transitions_to_ready() {
        let dir = tempfile::tempdir().unwrap();
        let client = McpClient::spawn("stub", &stub_server(&dir)).unwrap();
        assert_eq!(client.state(), ServerState::Spawning);
        client.initialize().await.unwrap();
        assert_eq!(client.state(), ServerState::Ready);
        client.shutdown().await;
        assert_eq!(client.state(), ServerState::Closed);
    }

    #[tokio::test]
    async fn list_tools_parses_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let client = McpClient::spawn("stub", &stub_server(&dir)).unwrap();
        client.initialize().await.unwrap();
        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
        assert_eq!(tools[0].description, "echoes text");
        assert!(tools[0].input_schema["properties"]["text"].is_object());
        client.shutdown().await;
    }

    #[tokio::test]
    async fn call_tool_returns_text() {
        let dir = tempfile::tempdir().unwrap();
        let client = McpClient::spawn("stub", &stub_server(&dir)).unwrap();
        client.initialize().await.unwrap();
        let (text, is_error) = client
            .call_tool("echo", json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(text, "echoed");
        assert!(!is_error);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn requests_before_initialize_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let client = McpClient::spawn("stub", &stub_server(&dir)).unwrap();
        let err = client.list_tools().await.unwrap_err();
        assert!(matches!(err, McpError::NotReady { .. }));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn protocol_error_moves_to_closing() {
        let dir = tempfile::tempdir().unwrap();
        let client = McpClient::spawn("stub", &stub_server(&dir)).unwrap();
        client.initialize().await.unwrap();
        // The stub answers unknown methods with a JSON-RPC error object.
        let err = client.request("bogus/method", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::Protocol(_)));
        assert_eq!(client.state(), ServerState::Closing);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn ids_increase_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let client = McpClient::spawn("stub", &stub_server(&dir)).unwrap();
        client.initialize().await.unwrap();
        let a = client.next_id.load(Ordering::SeqCst);
        let _ = client.list_tools().await.unwrap();
        let b = client.next_id.load(Ordering::SeqCst);
        assert!(b > a);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn dead_server_fails_requests() {
        let cfg = McpServerConfig {
            command: "bash".into(),
            args: vec!["-c".into(), "exit 0".into()],
            env: Default::default(),
        };
        let client = McpClient::spawn("dead", &cfg).unwrap();
        // Give the reader a moment to observe EOF.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = client.initialize().await.unwrap_err();
        assert!(
            matches!(err, McpError::ChannelClosed | McpError::Spawn(_)),
            "unexpected error: {err:?}"
        );
    }
}
