// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{OutputCategory, RiskLevel, Tool, ToolCall, ToolOutput};

/// Default number of lines returned when the caller does not specify a limit.
/// Kept small to avoid flooding the model context on the first read; the agent
/// can paginate with offset + limit to get more.
const DEFAULT_LINE_LIMIT: usize = 200;

/// Hard byte ceiling applied in addition to the line limit.
/// Whichever constraint is hit first determines where the output is cut.
const MAX_BYTES: usize = 20_000;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Reads a text file. Default: 200 lines / 20 KB — whichever comes first.\n\
         Lines formatted as L{n}:content (1-indexed). For edit_file old_string strip the L{n}: prefix.\n\
         When more lines exist, a pagination notice shows the next offset.\n\
         Strategy: use grep to find the relevant region first, then read only those lines\n\
         with offset+limit. Batch multiple reads in parallel when exploring related files."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the file"
                },
                "offset": {
                    "type": "integer",
                    "description": "1-indexed line number to start reading from (default 1)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (default 200)"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::ReadOnly
    }
    fn output_category(&self) -> OutputCategory {
        OutputCategory::FileContent
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'path'"),
        };
        let offset = call.args.get("offset").and_then(|v| v.as_u64()).unwrap_or(1).max(1) as usize;
        let limit = call
            .args
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_LINE_LIMIT as u64) as usize;

        debug!(path = %path, offset, limit, "read_file tool");

        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) => return ToolOutput::err(&call.id, format!("read error: {e}")),
        };
        if bytes.iter().take(8192).any(|&b| b == 0) {
            return ToolOutput::err(
                &call.id,
                format!("'{path}' looks like a binary file; read_file handles text only"),
            );
        }
        let text = String::from_utf8_lossy(&bytes);

        let total_lines = text.lines().count();
        let mut out = String::new();
        let mut shown = 0usize;
        for (idx, line) in text.lines().enumerate().skip(offset - 1).take(limit) {
            let formatted = format!("L{}:{}\n", idx + 1, line);
            if out.len() + formatted.len() > MAX_BYTES {
                break;
            }
            out.push_str(&formatted);
            shown += 1;
        }

        let last = offset - 1 + shown;
        if last < total_lines {
            out.push_str(&format!(
                "...[{} more lines — showing L{}-L{} of {}; use offset={} to continue]",
                total_lines - last,
                offset,
                last,
                total_lines,
                last + 1
            ));
        }
        if out.is_empty() {
            out = format!("[empty range: file has {total_lines} lines, offset was {offset}]");
        }
        ToolOutput::ok(&call.id, out)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
