// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Pre/post tool hooks.
//!
//! Hook commands run through `sh -c`.  The contract for hook scripts, kept
//! stable so scripts stay portable:
//!
//! - the tool's argument JSON arrives on **stdin**;
//! - `OTTO_TOOL_NAME` and `OTTO_TOOL_ARGS` carry the same information as
//!   environment variables for shells that prefer them;
//! - a pre-hook exiting non-zero blocks the tool call;
//! - post-hooks are fire-and-forget and cannot block anything.

use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use otto_config::HooksConfig;

/// Hard timeout for synchronous pre-hooks.
const PRE_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HookRunner {
    config: HooksConfig,
}

impl HookRunner {
    pub fn new(config: HooksConfig) -> Self {
        Self { config }
    }

    /// Look up the hook command for `tool`: a specific entry takes priority
    /// over the `"*"` wildcard.
    fn lookup<'a>(
        map: &'a std::collections::HashMap<String, String>,
        tool: &str,
    ) -> Option<&'a str> {
        map.get(tool).or_else(|| map.get("*")).map(String::as_str)
    }

    /// Run the pre-hook for `tool`, if configured.
    ///
    /// Returns `true` when the tool may proceed: no hook configured, or the
    /// hook exited zero.  A non-zero exit, spawn failure, or timeout blocks
    /// the call.
    pub async fn run_pre(&self, tool: &str, args: &Value) -> bool {
        let Some(cmd) = Self::lookup(&self.config.pre, tool) else {
            return true;
        };
        debug!(tool, cmd, "running pre-hook");
        match run_hook(cmd, tool, args, Some(PRE_HOOK_TIMEOUT)).await {
            Ok(success) => success,
            Err(e) => {
                warn!(tool, error = %e, "pre-hook failed to run; blocking tool");
                false
            }
        }
    }

    /// Fire the post-hook for `tool`, if configured.  Never blocks the
    /// caller; outcome is logged only.
    pub fn run_post(&self, tool: &str, args: &Value) {
        let Some(cmd) = Self::lookup(&self.config.post, tool) else {
            return;
        };
        let cmd = cmd.to_string();
        let tool = tool.to_string();
        let args = args.clone();
        tokio::spawn(async move {
            if let Err(e) = run_hook(&cmd, &tool, &args, None).await {
                warn!(tool = %tool, error = %e, "post-hook failed");
            }
        });
    }

    /// Whether any pre-hook would apply to `tool`.
    pub fn has_pre(&self, tool: &str) -> bool {
        Self::lookup(&self.config.pre, tool).is_some()
    }
}

/// Spawn a hook command and wait for it.  Returns `Ok(true)` on exit 0.
async fn run_hook(
    cmd: &str,
    tool: &str,
    args: &Value,
    timeout: Option<Duration>,
) -> anyhow::Result<bool> {
    let args_json = args.to_string();

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .env("OTTO_TOOL_NAME", tool)
        .env("OTTO_TOOL_ARGS", &args_json)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        // A hook that never reads stdin may have exited already; ignore
        // the broken pipe in that case.
        let _ = stdin.write_all(args_json.as_bytes()).await;
        drop(stdin);
    }

    let status = match timeout {
        Some(t) => tokio::time::timeout(t, child.wait())
            .await
            .map_err(|_| anyhow::anyhow!("hook timed out after {}s", t.as_secs()))??,
        None => child.wait().await?,
    };
    Ok(status.success())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
