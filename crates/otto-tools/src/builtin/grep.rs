// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::tool::{OutputCategory, RiskLevel, Tool, ToolCall, ToolOutput};

/// Leading matches kept; later matches are less relevant.
const MAX_MATCHES: usize = 200;

/// Files larger than this are skipped rather than scanned.
const MAX_FILE_BYTES: u64 = 1_000_000;

pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression. Returns matching lines\n\
         as path:line:content, first 200 matches. Searches recursively from\n\
         'path' (default: current directory); binary and oversized files are skipped."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "path": {
                    "type": "string",
                    "description": "Directory or file to search (default: current directory)"
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::ReadOnly
    }
    fn output_category(&self) -> OutputCategory {
        OutputCategory::MatchList
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

        let re = match Regex::new(&pattern) {
            Ok(re) => re,
            Err(e) => return ToolOutput::err(&call.id, format!("invalid pattern: {e}")),
        };

        // Walking and scanning is blocking I/O; keep it off the runtime.
        let result = tokio::task::spawn_blocking(move || scan(&re, &root)).await;
        match result {
            Ok(Ok(matches)) if matches.is_empty() => {
                ToolOutput::ok(&call.id, format!("no matches for '{pattern}'"))
            }
            Ok(Ok(matches)) => {
                let truncated = matches.len() == MAX_MATCHES;
                let mut out = matches.join("\n");
                if truncated {
                    out.push_str("\n...[match limit reached; use a more specific pattern]");
                }
                ToolOutput::ok(&call.id, out)
            }
            Ok(Err(e)) => ToolOutput::err(&call.id, e),
            Err(e) => ToolOutput::err(&call.id, format!("search task failed: {e}")),
        }
    }
}

fn scan(re: &Regex, root: &str) -> Result<Vec<String>, String> {
    if !std::path::Path::new(root).exists() {
        return Err(format!("path '{root}' does not exist"));
    }
    let mut matches = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_hidden_dir(e))
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
            continue;
        }
        let Ok(bytes) = std::fs::read(entry.path()) else {
            continue;
        };
        if bytes.iter().take(4096).any(|&b| b == 0) {
            continue;
        }
        let text = String::from_utf8_lossy(&bytes);
        for (idx, line) in text.lines().enumerate() {
            if re.is_match(line) {
                matches.push(format!("{}:{}:{}", entry.path().display(), idx + 1, line));
                if matches.len() >= MAX_MATCHES {
                    return Ok(matches);
                }
            }
        }
    }
    Ok(matches)
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

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn call(args: Value) -> ToolCall {
        ToolCall { id: "1".into(), name: "grep".into(), args }
    }

    #[tokio::test]
    async fn finds_matching_lines_with_location() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello\nneedle here\nbye\n").unwrap();
        let out = GrepTool
            .execute(&call(json!({
                "pattern": "needle",
                "path": dir.path().to_string_lossy()
            })))
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains("a.txt:2:needle here"));
    }

    #[tokio::test]
    async fn recurses_into_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), "deep needle\n").unwrap();
        let out = GrepTool
            .execute(&call(json!({
                "pattern": "needle",
                "path": dir.path().to_string_lossy()
            })))
            .await;
        assert!(out.content.contains("deep needle"));
    }

    #[tokio::test]
    async fn no_matches_reports_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "nothing\n").unwrap();
        let out = GrepTool
            .execute(&call(json!({
                "pattern": "absent_term",
                "path": dir.path().to_string_lossy()
            })))
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains("no matches"));
    }

    #[tokio::test]
    async fn invalid_regex_is_error() {
        let out = GrepTool.execute(&call(json!({"pattern": "[unclosed"}))).await;
        assert!(out.is_error);
        assert!(out.content.contains("invalid pattern"));
    }

    #[tokio::test]
    async fn hidden_directories_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/config"), "needle\n").unwrap();
        let out = GrepTool
            .execute(&call(json!({
                "pattern": "needle",
                "path": dir.path().to_string_lossy()
            })))
            .await;
        assert!(out.content.contains("no matches"));
    }
}
