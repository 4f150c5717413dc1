// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use similar::TextDiff;
use tracing::debug;

use crate::tool::{RiskLevel, Tool, ToolCall, ToolOutput};

pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace an exact string in a file. old_string must appear exactly once;\n\
         include enough surrounding context to make it unique. Use replace_all\n\
         to change every occurrence instead. The result includes a unified diff\n\
         of the change."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path of the file to edit"
                },
                "old_string": {
                    "type": "string",
                    "description": "Exact text to replace (must be unique unless replace_all)"
                },
                "new_string": {
                    "type": "string",
                    "description": "Replacement text"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace every occurrence (default false)"
                }
            },
            "required": ["path", "old_string", "new_string"],
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
        let old_string = match call.args.get("old_string").and_then(|v| v.as_str()) {
            Some(s) => s,
            None => return ToolOutput::err(&call.id, "missing required parameter 'old_string'"),
        };
        let new_string = call
            .args
            .get("new_string")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let replace_all = call
            .args
            .get("replace_all")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if old_string.is_empty() {
            return ToolOutput::err(&call.id, "old_string must not be empty");
        }
        if old_string == new_string {
            return ToolOutput::err(&call.id, "old_string and new_string are identical");
        }

        debug!(path = %path, replace_all, "edit_file tool");

        let original = match tokio::fs::read_to_string(path).await {
            Ok(t) => t,
            Err(e) => return ToolOutput::err(&call.id, format!("read error: {e}")),
        };

        let occurrences = original.matches(old_string).count();
        if occurrences == 0 {
            return ToolOutput::err(
                &call.id,
                format!("old_string not found in {path}; re-read the file and retry with exact text"),
            );
        }
        if occurrences > 1 && !replace_all {
            return ToolOutput::err(
                &call.id,
                format!(
                    "old_string appears {occurrences} times in {path}; \
                     add surrounding context to make it unique or set replace_all"
                ),
            );
        }

        let updated = if replace_all {
            original.replace(old_string, new_string)
        } else {
            original.replacen(old_string, new_string, 1)
        };

        if let Err(e) = tokio::fs::write(path, &updated).await {
            return ToolOutput::err(&call.id, format!("write error: {e}"));
        }

        let diff = TextDiff::from_lines(&original, &updated)
            .unified_diff()
            .header(&format!("a/{path}"), &format!("b/{path}"))
            .to_string();
        ToolOutput::ok(
            &call.id,
            format!("replaced {occurrences} occurrence(s) in {path}\n{diff}"),
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
