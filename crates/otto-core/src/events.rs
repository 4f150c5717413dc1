// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use otto_tools::ToolCall;

/// Events emitted by the agent during a single turn.
/// Consumers (the CLI front-end, tests) subscribe to these to drive output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A user-visible text chunk streamed from the model (markup filtered).
    TextDelta(String),
    /// A thinking/reasoning chunk from the model.
    ThinkingDelta(String),
    /// The model has requested a tool call.
    ToolCallStarted(ToolCall),
    /// A tool call finished.
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// Context was compacted; statistics for the UI.
    ContextCompacted {
        tokens_before: usize,
        tokens_after: usize,
    },
    /// Token usage reported by the provider for the last request.
    TokenUsage { input: u32, output: u32 },
    /// The in-flight stream went quiet past the idle timeout.
    StreamIdle,
    /// The agent has finished processing the current user turn.
    TurnComplete,
    /// The turn was cancelled; carries the partial assistant text.
    Aborted { partial_text: String },
}
