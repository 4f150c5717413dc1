// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{RiskLevel, Tool, ToolCall, ToolOutput};

/// Maximum entries returned per listing.
const MAX_ENTRIES: usize = 500;

pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List a directory's entries, sorted, directories suffixed with '/'. \
         Files show their size in bytes. Defaults to the current directory."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (default: current directory)"
                }
            },
            "additionalProperties": false
        })
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::ReadOnly
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = call
            .args
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or(".")
            .to_string();

        let mut rd = match tokio::fs::read_dir(&path).await {
            Ok(rd) => rd,
            Err(e) => return ToolOutput::err(&call.id, format!("list error: {e}")),
        };

        let mut entries: Vec<String> = Vec::new();
        while let Ok(Some(entry)) = rd.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.metadata().await {
                Ok(m) if m.is_dir() => entries.push(format!("{name}/")),
                Ok(m) => entries.push(format!("{name} ({} bytes)", m.len())),
                Err(_) => entries.push(name),
            }
        }
        entries.sort();

        let total = entries.len();
        if total > MAX_ENTRIES {
            entries.truncate(MAX_ENTRIES);
            entries.push(format!("...[{} more entries omitted]", total - MAX_ENTRIES));
        }
        if entries.is_empty() {
            return ToolOutput::ok(&call.id, format!("{path} is empty"));
        }
        ToolOutput::ok(&call.id, entries.join("\n"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
