// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use otto_model::{Message, MessageContent, Role};
use uuid::Uuid;

use crate::stream::CHARS_PER_TOKEN;

/// Ordered message history for one interactive session.
///
/// The system prompt is held apart from the ordered list and always emitted
/// first in wire form.  Appends are totally ordered; callers serialize
/// concurrent appends (the agent loop appends tool results from a collected
/// buffer, never from concurrent completions).
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    system_prompt: Option<String>,
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            system_prompt: None,
            messages: Vec::new(),
        }
    }

    pub fn set_system_prompt(&mut self, text: impl Into<String>) {
        self.system_prompt = Some(text.into());
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn append_user(&mut self, text: impl Into<String>) {
        self.messages.push(Message::user(text));
    }

    pub fn append_assistant(&mut self, text: impl Into<String>) {
        self.messages.push(Message::assistant(text));
    }

    pub fn append_tool_call(
        &mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) {
        self.messages.push(Message::tool_call(id, name, arguments));
    }

    /// Tool results are attributed by call id, never by position.
    pub fn append_tool_result(
        &mut self,
        call_id: impl Into<String>,
        text: impl Into<String>,
        is_error: bool,
    ) {
        self.messages.push(Message::tool_result(call_id, text, is_error));
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Replace the ordered list wholesale (compaction, session restore).
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Estimated token footprint of the ordered list plus system prompt.
    /// Used only for compaction triggering, never for billing.
    pub fn estimated_tokens(&self) -> usize {
        let chars: usize = self.messages.iter().map(Message::char_len).sum::<usize>()
            + self.system_prompt.as_deref().map(str::len).unwrap_or(0);
        (chars as f32 / CHARS_PER_TOKEN) as usize
    }

    /// Indices of messages that start a turn: each user message that is not
    /// itself part of the previous turn's tool traffic.  A turn is one user
    /// message plus all following assistant/tool messages up to the next
    /// user message.
    pub fn turn_starts(&self) -> Vec<usize> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::User)
            .map(|(i, _)| i)
            .collect()
    }

    /// Number of complete turns in the conversation.
    pub fn turn_count(&self) -> usize {
        self.turn_starts().len()
    }

    /// Message index where the last `n` turns begin, or `None` when the
    /// conversation has `n` or fewer turns.
    pub fn preserve_boundary(&self, n: usize) -> Option<usize> {
        let starts = self.turn_starts();
        if starts.len() <= n {
            return None;
        }
        Some(starts[starts.len() - n])
    }

    /// Remove the last `n` complete turns (rewind).  Returns the number of
    /// messages removed.
    pub fn remove_last_turns(&mut self, n: usize) -> usize {
        let starts = self.turn_starts();
        if n == 0 || starts.is_empty() {
            return 0;
        }
        let cut = if n >= starts.len() {
            0
        } else {
            starts[starts.len() - n]
        };
        let removed = self.messages.len() - cut;
        self.messages.truncate(cut);
        removed
    }

    /// Ids of assistant tool calls that have no matching tool result yet.
    /// The agent keeps this empty before every model call; an orphaned call
    /// id makes chat endpoints reject the request.
    pub fn unanswered_tool_calls(&self) -> Vec<String> {
        let mut open: Vec<String> = Vec::new();
        for m in &self.messages {
            match &m.content {
                MessageContent::ToolCall { tool_call_id, .. } => {
                    open.push(tool_call_id.clone());
                }
                MessageContent::ToolResult { tool_call_id, .. } => {
                    open.retain(|id| id != tool_call_id);
                }
                _ => {}
            }
        }
        open
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
