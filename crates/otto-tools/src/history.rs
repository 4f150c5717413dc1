// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cap on the result text kept per record; full results live in the
/// conversation, the history is for display and debugging.
const RESULT_SNIPPET_BYTES: usize = 512;

/// One executed tool call as recorded in the session history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub timestamp: DateTime<Utc>,
    pub tool: String,
    pub args: serde_json::Value,
    /// Truncated result text.
    pub result: String,
    pub is_error: bool,
    pub duration_ms: u64,
}

/// Per-session record of executed tool calls.
#[derive(Default)]
pub struct SessionHistory {
    records: Mutex<Vec<ToolInvocation>>,
}

impl SessionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        tool: &str,
        args: &serde_json::Value,
        result: &str,
        is_error: bool,
        duration_ms: u64,
    ) {
        let snippet = if result.len() > RESULT_SNIPPET_BYTES {
            let cut = result
                .char_indices()
                .take_while(|(i, _)| *i < RESULT_SNIPPET_BYTES)
                .last()
                .map(|(i, c)| i + c.len_utf8())
                .unwrap_or(0);
            format!("{}…", &result[..cut])
        } else {
            result.to_string()
        };
        self.records.lock().unwrap().push(ToolInvocation {
            timestamp: Utc::now(),
            tool: tool.to_string(),
            args: args.clone(),
            result: snippet,
            is_error,
            duration_ms,
        });
    }

    pub fn snapshot(&self) -> Vec<ToolInvocation> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
