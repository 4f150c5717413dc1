// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{RiskLevel, Tool, ToolCall, ToolOutput};

pub struct DeleteFileTool;

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a single file. Directories are refused; remove their contents first."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path of the file to delete"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Dangerous
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p,
            None => return ToolOutput::err(&call.id, "missing required parameter 'path'"),
        };
        debug!(path = %path, "delete_file tool");

        let meta = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) => return ToolOutput::err(&call.id, format!("stat error: {e}")),
        };
        if meta.is_dir() {
            return ToolOutput::err(&call.id, format!("'{path}' is a directory, not a file"));
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => ToolOutput::ok(&call.id, format!("deleted {path}")),
            Err(e) => ToolOutput::err(&call.id, format!("delete error: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
