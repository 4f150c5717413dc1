// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{RiskLevel, Tool, ToolCall, ToolOutput};

pub struct MultiEditTool;

#[async_trait]
impl Tool for MultiEditTool {
    fn name(&self) -> &str {
        "multi_edit"
    }

    fn description(&self) -> &str {
        "Apply several exact string replacements to one file in a single\n\
         atomic operation: either every edit applies or the file is left\n\
         untouched. Edits apply in order; each old_string must match exactly\n\
         once in the file as it stands when that edit runs."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path of the file to edit"
                },
                "edits": {
                    "type": "array",
                    "description": "Ordered list of {old_string, new_string} replacements",
                    "items": {
                        "type": "object",
                        "properties": {
                            "old_string": { "type": "string" },
                            "new_string": { "type": "string" }
                        },
                        "required": ["old_string", "new_string"]
                    }
                }
            },
            "required": ["path", "edits"],
            "additionalProperties": false
        })
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Moderate
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p,
            None => return ToolOutput::err(&call.id, "missing required parameter 'path'"),
        };
        let edits = match call.args.get("edits").and_then(|v| v.as_array()) {
            Some(e) if !e.is_empty() => e,
            Some(_) => return ToolOutput::err(&call.id, "edits must not be empty"),
            None => return ToolOutput::err(&call.id, "missing required parameter 'edits'"),
        };

        debug!(path = %path, count = edits.len(), "multi_edit tool");

        let original = match tokio::fs::read_to_string(path).await {
            Ok(t) => t,
            Err(e) => return ToolOutput::err(&call.id, format!("read error: {e}")),
        };

        // Validate and apply against a working copy; nothing is written
        // until every edit has succeeded.
        let mut working = original.clone();
        for (i, edit) in edits.iter().enumerate() {
            let old = match edit.get("old_string").and_then(|v| v.as_str()) {
                Some(s) if !s.is_empty() => s,
                _ => {
                    return ToolOutput::err(
                        &call.id,
                        format!("edit #{}: old_string missing or empty", i + 1),
                    )
                }
            };
            let new = edit.get("new_string").and_then(|v| v.as_str()).unwrap_or("");
            match working.matches(old).count() {
                0 => {
                    return ToolOutput::err(
                        &call.id,
                        format!("edit #{}: old_string not found; no edits were applied", i + 1),
                    )
                }
                1 => working = working.replacen(old, new, 1),
                n => {
                    return ToolOutput::err(
                        &call.id,
                        format!(
                            "edit #{}: old_string appears {n} times; \
                             add context to make it unique. No edits were applied",
                            i + 1
                        ),
                    )
                }
            }
        }

        if let Err(e) = tokio::fs::write(path, &working).await {
            return ToolOutput::err(&call.id, format!("write error: {e}"));
        }
        ToolOutput::ok(&call.id, format!("applied {} edits to {path}", edits.len()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
