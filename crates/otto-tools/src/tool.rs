// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// If true, the tool execution failed non-fatally (returned error message).
    pub is_error: bool,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), content: content.into(), is_error: false }
    }

    /// Error result containing a plain-text error message.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), content: msg.into(), is_error: true }
    }
}

/// Static danger classification of a tool.
///
/// Drives auto-approval (`auto_approve_read_only` / `auto_approve_moderate`)
/// and the Plan/Sandbox catalog filter, which exposes only ReadOnly tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Inspects state without changing it (reads, searches, listings).
    ReadOnly,
    /// Mutates files inside the workspace.
    #[default]
    Moderate,
    /// Arbitrary side effects (shell, deletion, network writes).
    Dangerous,
}

/// Describes the shape of a tool's text output for context-aware truncation.
///
/// When a tool result exceeds the configured token cap, the conversation
/// layer uses this category to pick the right extraction strategy.  Each
/// tool declares its own category; the core never hard-codes tool names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// Terminal / process output: keep head + tail lines so both the command
    /// preamble and the final result are visible.
    HeadTail,
    /// Ordered match list: keep the leading matches.
    MatchList,
    /// File content: balanced head + tail window with a separator.
    FileContent,
    /// Generic text: hard-truncate at the nearest line boundary.
    #[default]
    Generic,
}

/// Receives incremental output lines from a streaming tool execution.
///
/// The embedder supplies an implementation (a terminal printer, a log
/// forwarder); tools call [`OutputSink::line`] as output becomes available.
pub trait OutputSink: Send + Sync {
    fn line(&self, line: &str);
}

/// Trait that every built-in and proxied tool must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    /// Static danger classification used by the permission engine and the
    /// Plan/Sandbox catalog filter.
    fn risk(&self) -> RiskLevel;
    /// Describes the shape of this tool's output for context-aware truncation.
    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }
    /// Per-tool execution timeout override in seconds.
    fn timeout_secs(&self) -> Option<u64> {
        None
    }
    /// Execute the tool.  Errors should be wrapped in [`ToolOutput::err`].
    async fn execute(&self, call: &ToolCall) -> ToolOutput;
    /// Streaming execution: emit incremental output lines to `sink` while
    /// running.  The default falls back to [`Tool::execute`] and emits
    /// nothing incrementally; tools with long-running output override this.
    async fn execute_streaming(&self, call: &ToolCall, _sink: &dyn OutputSink) -> ToolOutput {
        self.execute(call).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
