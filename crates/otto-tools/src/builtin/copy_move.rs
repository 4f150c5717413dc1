// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{RiskLevel, Tool, ToolCall, ToolOutput};

fn src_dst(call: &ToolCall) -> Result<(String, String), ToolOutput> {
    let src = call
        .args
        .get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolOutput::err(&call.id, "missing required parameter 'path'"))?;
    let dst = call
        .args
        .get("destination")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolOutput::err(&call.id, "missing required parameter 'destination'"))?;
    Ok((src.to_string(), dst.to_string()))
}

async fn ensure_parent(dst: &str) -> std::io::Result<()> {
    if let Some(parent) = std::path::Path::new(dst).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

pub struct CopyFileTool;

#[async_trait]
impl Tool for CopyFileTool {
    fn name(&self) -> &str {
        "copy_file"
    }

    fn description(&self) -> &str {
        "Copy a file to a new location, creating parent directories as needed. \
         An existing destination is overwritten."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Source file" },
                "destination": { "type": "string", "description": "Target path" }
            },
            "required": ["path", "destination"],
            "additionalProperties": false
        })
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Moderate
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let (src, dst) = match src_dst(call) {
            Ok(v) => v,
            Err(e) => return e,
        };
        debug!(src = %src, dst = %dst, "copy_file tool");
        if let Err(e) = ensure_parent(&dst).await {
            return ToolOutput::err(&call.id, format!("mkdir error: {e}"));
        }
        match tokio::fs::copy(&src, &dst).await {
            Ok(bytes) => ToolOutput::ok(&call.id, format!("copied {src} → {dst} ({bytes} bytes)")),
            Err(e) => ToolOutput::err(&call.id, format!("copy error: {e}")),
        }
    }
}

pub struct MoveFileTool;

#[async_trait]
impl Tool for MoveFileTool {
    fn name(&self) -> &str {
        "move_file"
    }

    fn description(&self) -> &str {
        "Move or rename a file, creating parent directories as needed. \
         An existing destination is overwritten."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Source file" },
                "destination": { "type": "string", "description": "Target path" }
            },
            "required": ["path", "destination"],
            "additionalProperties": false
        })
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Moderate
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let (src, dst) = match src_dst(call) {
            Ok(v) => v,
            Err(e) => return e,
        };
        debug!(src = %src, dst = %dst, "move_file tool");
        if let Err(e) = ensure_parent(&dst).await {
            return ToolOutput::err(&call.id, format!("mkdir error: {e}"));
        }
        match tokio::fs::rename(&src, &dst).await {
            Ok(()) => ToolOutput::ok(&call.id, format!("moved {src} → {dst}")),
            // Rename fails across filesystems; fall back to copy + remove.
            Err(_) => match tokio::fs::copy(&src, &dst).await {
                Ok(_) => match tokio::fs::remove_file(&src).await {
                    Ok(()) => ToolOutput::ok(&call.id, format!("moved {src} → {dst}")),
                    Err(e) => ToolOutput::err(
                        &call.id,
                        format!("copied but could not remove source: {e}"),
                    ),
                },
                Err(e) => ToolOutput::err(&call.id, format!("move error: {e}")),
            },
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
