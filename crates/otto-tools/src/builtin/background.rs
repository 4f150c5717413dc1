// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Background process management.
//!
//! Long-running commands (dev servers, watchers) must not block the agent
//! loop, so `start_background_process` spawns them detached and returns a
//! numeric handle.  Output accumulates in a per-process buffer that
//! `check_background_process` drains; `stop_background_process` kills the
//! child.  The table is session-scoped state owned by the entrypoint — the
//! same `Arc` is shared by the three tools, never a process-wide global.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::tool::{RiskLevel, Tool, ToolCall, ToolOutput};

/// Default idle timeout: a process that produces no output for this long is
/// reaped.  Zero disables the watchdog.
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 15;

struct BgProcess {
    command: String,
    child: tokio::process::Child,
    /// Output accumulated since the last check.
    buffer: Arc<Mutex<String>>,
    /// Set by the idle watchdog when it kills the process.
    idle_killed: Arc<AtomicBool>,
}

/// Session-scoped table of running background processes.
#[derive(Default)]
pub struct BackgroundProcessTable {
    procs: Mutex<HashMap<u32, BgProcess>>,
    next_id: AtomicU32,
}

impl BackgroundProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill everything still running (session teardown).
    pub async fn kill_all(&self) {
        let procs: Vec<BgProcess> = self.procs.lock().unwrap().drain().map(|(_, p)| p).collect();
        for mut p in procs {
            let _ = p.child.kill().await;
        }
    }

    pub fn count(&self) -> usize {
        self.procs.lock().unwrap().len()
    }
}

pub struct StartBackgroundProcessTool {
    pub table: Arc<BackgroundProcessTable>,
    /// Seconds without output before the watchdog kills the process;
    /// 0 disables.
    pub idle_timeout_secs: u64,
}

impl StartBackgroundProcessTool {
    pub fn new(table: Arc<BackgroundProcessTable>) -> Self {
        Self { table, idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS }
    }
}

#[async_trait]
impl Tool for StartBackgroundProcessTool {
    fn name(&self) -> &str {
        "start_background_process"
    }

    fn description(&self) -> &str {
        "Start a long-running shell command in the background and return its\n\
         process id. Use check_background_process to read accumulated output\n\
         and stop_background_process to kill it. A process that stays silent\n\
         past the idle timeout is reaped automatically."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to run in the background"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Dangerous
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let command = match call.args.get("command").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'command'"),
        };

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(&call.id, format!("spawn error: {e}")),
        };

        let buffer = Arc::new(Mutex::new(String::new()));
        let idle_killed = Arc::new(AtomicBool::new(false));
        let pid = child.id();

        // Drain stdout and stderr into the shared buffer, tracking activity
        // for the idle watchdog.
        let activity = Arc::new(Mutex::new(std::time::Instant::now()));
        if let Some(stdout) = child.stdout.take() {
            spawn_drain(
                BufReader::new(stdout).lines(),
                Arc::clone(&buffer),
                Arc::clone(&activity),
            );
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_drain(
                BufReader::new(stderr).lines(),
                Arc::clone(&buffer),
                Arc::clone(&activity),
            );
        }

        let id = self.table.next_id.fetch_add(1, Ordering::SeqCst) + 1;

        // Idle watchdog: reap the process when it goes silent.
        if self.idle_timeout_secs > 0 {
            let idle = Duration::from_secs(self.idle_timeout_secs);
            let activity = Arc::clone(&activity);
            let killed_flag = Arc::clone(&idle_killed);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(idle / 2).await;
                    let last = *activity.lock().unwrap();
                    if last.elapsed() >= idle {
                        killed_flag.store(true, Ordering::SeqCst);
                        #[cfg(unix)]
                        if let Some(pid) = pid {
                            unsafe {
                                libc::kill(pid as i32, libc::SIGKILL);
                            }
                        }
                        break;
                    }
                }
            });
        }

        debug!(id, cmd = %command, "started background process");
        self.table.procs.lock().unwrap().insert(
            id,
            BgProcess { command: command.clone(), child, buffer, idle_killed },
        );
        ToolOutput::ok(
            &call.id,
            format!("started background process {id}: {command}"),
        )
    }
}

fn spawn_drain<R>(
    mut lines: tokio::io::Lines<BufReader<R>>,
    buffer: Arc<Mutex<String>>,
    activity: Arc<Mutex<std::time::Instant>>,
) where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            *activity.lock().unwrap() = std::time::Instant::now();
            let mut buf = buffer.lock().unwrap();
            buf.push_str(&line);
            buf.push('\n');
        }
    });
}

pub struct CheckBackgroundProcessTool {
    pub table: Arc<BackgroundProcessTable>,
}

#[async_trait]
impl Tool for CheckBackgroundProcessTool {
    fn name(&self) -> &str {
        "check_background_process"
    }

    fn description(&self) -> &str {
        "Read the output a background process has produced since the last \
         check, plus its run state."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": {
                    "type": "integer",
                    "description": "Process id returned by start_background_process"
                }
            },
            "required": ["id"],
            "additionalProperties": false
        })
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::ReadOnly
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let id = match call.args.get("id").and_then(|v| v.as_u64()) {
            Some(i) => i as u32,
            None => return ToolOutput::err(&call.id, "missing required parameter 'id'"),
        };

        let mut procs = self.table.procs.lock().unwrap();
        let Some(proc) = procs.get_mut(&id) else {
            return ToolOutput::err(&call.id, format!("no background process with id {id}"));
        };

        let output = std::mem::take(&mut *proc.buffer.lock().unwrap());
        let status = match proc.child.try_wait() {
            Ok(Some(status)) if proc.idle_killed.load(Ordering::SeqCst) => {
                format!("killed after idle timeout (exit {})", status.code().unwrap_or(-1))
            }
            Ok(Some(status)) => format!("exited with code {}", status.code().unwrap_or(-1)),
            Ok(None) => "running".to_string(),
            Err(e) => format!("status unknown: {e}"),
        };

        let body = if output.is_empty() {
            format!("process {id} ({}): {status}\n[no new output]", proc.command)
        } else {
            format!("process {id} ({}): {status}\n{output}", proc.command)
        };
        ToolOutput::ok(&call.id, body)
    }
}

pub struct StopBackgroundProcessTool {
    pub table: Arc<BackgroundProcessTable>,
}

#[async_trait]
impl Tool for StopBackgroundProcessTool {
    fn name(&self) -> &str {
        "stop_background_process"
    }

    fn description(&self) -> &str {
        "Kill a background process and remove it from the table."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": {
                    "type": "integer",
                    "description": "Process id returned by start_background_process"
                }
            },
            "required": ["id"],
            "additionalProperties": false
        })
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Moderate
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let id = match call.args.get("id").and_then(|v| v.as_u64()) {
            Some(i) => i as u32,
            None => return ToolOutput::err(&call.id, "missing required parameter 'id'"),
        };
        let proc = self.table.procs.lock().unwrap().remove(&id);
        match proc {
            Some(mut p) => {
                let _ = p.child.kill().await;
                ToolOutput::ok(&call.id, format!("stopped background process {id}"))
            }
            None => ToolOutput::err(&call.id, format!("no background process with id {id}")),
        }
    }
}

/// Register the three background-process tools over one shared table.
pub fn register_background_tools(
    registry: &mut crate::ToolRegistry,
    table: Arc<BackgroundProcessTable>,
) {
    registry.register(StartBackgroundProcessTool::new(Arc::clone(&table)));
    registry.register(CheckBackgroundProcessTool { table: Arc::clone(&table) });
    registry.register(StopBackgroundProcessTool { table });
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
