// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::tool::{RiskLevel, Tool, ToolCall, ToolOutput};

const MAX_RESULTS: usize = 200;

pub struct FindFileTool;

#[async_trait]
impl Tool for FindFileTool {
    fn name(&self) -> &str {
        "find_file"
    }

    fn description(&self) -> &str {
        "Find files whose name matches a glob pattern (e.g. '*.rs', 'Cargo.*').\n\
         Searches recursively from 'path' (default: current directory); first\n\
         200 results, hidden directories skipped."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern matched against file names ('*' and '?' supported)"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search from (default: current directory)"
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::ReadOnly
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let pattern = match call.args.get("pattern").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'pattern'"),
        };
        let root = call
            .args
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or(".")
            .to_string();

        let Some(re) = name_glob_to_regex(&pattern) else {
            return ToolOutput::err(&call.id, format!("invalid pattern '{pattern}'"));
        };

        let result = tokio::task::spawn_blocking(move || {
            let mut hits: Vec<String> = Vec::new();
            for entry in WalkDir::new(&root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| !is_hidden_dir(e))
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
            {
                let name = entry.file_name().to_string_lossy();
                if re.is_match(&name) {
                    hits.push(entry.path().display().to_string());
                    if hits.len() >= MAX_RESULTS {
                        break;
                    }
                }
            }
            hits.sort();
            hits
        })
        .await;

        match result {
            Ok(hits) if hits.is_empty() => {
                ToolOutput::ok(&call.id, format!("no files matching '{pattern}'"))
            }
            Ok(hits) => ToolOutput::ok(&call.id, hits.join("\n")),
            Err(e) => ToolOutput::err(&call.id, format!("search task failed: {e}")),
        }
    }
}

/// File-name glob: `*` any run, `?` one char, everything else literal.
fn name_glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

fn is_hidden_dir(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|n| n.starts_with('.') && n.len() > 1)
            .unwrap_or(false)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
