// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Chat-completions wire serialization.
//!
//! otto stores each tool call as a separate [`MessageContent::ToolCall`]
//! entry internally (easier to work with), while the OpenAI wire format
//! requires all tool calls from one assistant turn inside a *single*
//! assistant message as a `tool_calls` array.  [`render`] performs that
//! coalescing; [`parse`] inverts it, so `parse(render(msgs)) == msgs` for
//! any well-formed message list.
//!
//! Tool-result error state is not a wire concept: the dispatcher prefixes
//! every failed result with `ERROR: `, and [`parse`] recovers `is_error`
//! from that prefix.

use anyhow::{bail, Context};
use serde_json::{json, Value};

use crate::{FunctionCall, Message, MessageContent, Role};

fn role_str(r: &Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Serialize a conversation into the OpenAI wire-format JSON array.
///
/// The system prompt, when present, is always the first element regardless
/// of the ordered message list.
pub fn render(system: Option<&str>, messages: &[Message]) -> Vec<Value> {
    fn tool_call_to_json(tool_call_id: &str, function: &FunctionCall) -> Value {
        json!({
            "id": tool_call_id,
            "type": "function",
            "function": {
                "name": function.name,
                "arguments": function.arguments,
            }
        })
    }

    let mut result: Vec<Value> = Vec::with_capacity(messages.len() + 1);
    if let Some(sys) = system {
        result.push(json!({ "role": "system", "content": sys }));
    }

    let mut i = 0;
    while i < messages.len() {
        let m = &messages[i];

        // Merge consecutive ToolCall messages into one assistant message so
        // the wire format satisfies OpenAI's parallel-tool-call contract.
        if let MessageContent::ToolCall { tool_call_id, function } = &m.content {
            let mut calls = vec![tool_call_to_json(tool_call_id, function)];
            i += 1;
            while i < messages.len() {
                if let MessageContent::ToolCall { tool_call_id, function } = &messages[i].content {
                    calls.push(tool_call_to_json(tool_call_id, function));
                    i += 1;
                } else {
                    break;
                }
            }
            result.push(json!({ "role": "assistant", "tool_calls": calls }));
            continue;
        }

        let v = match &m.content {
            MessageContent::Text(t) => json!({
                "role": role_str(&m.role),
                "content": t,
            }),
            MessageContent::ToolCall { .. } => unreachable!("handled above"),
            MessageContent::ToolResult { tool_call_id, content, .. } => json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": content,
            }),
        };
        result.push(v);
        i += 1;
    }

    result
}

/// Parse a wire-format message array back into `(system, messages)`.
///
/// Inverse of [`render`]: an assistant message carrying a `tool_calls`
/// array expands into one [`MessageContent::ToolCall`] per element, and a
/// tool message recovers `is_error` from the `ERROR: ` prefix.
pub fn parse(wire: &[Value]) -> anyhow::Result<(Option<String>, Vec<Message>)> {
    let mut system = None;
    let mut messages = Vec::with_capacity(wire.len());

    for v in wire {
        let role = v["role"].as_str().context("message missing role")?;
        match role {
            "system" => {
                let text = v["content"].as_str().context("system content not a string")?;
                system = Some(text.to_string());
            }
            "assistant" if v.get("tool_calls").is_some() => {
                let calls = v["tool_calls"]
                    .as_array()
                    .context("tool_calls not an array")?;
                for tc in calls {
                    let id = tc["id"].as_str().unwrap_or_default().to_string();
                    let name = tc["function"]["name"]
                        .as_str()
                        .context("tool call missing function.name")?
                        .to_string();
                    let arguments = tc["function"]["arguments"]
                        .as_str()
                        .unwrap_or("{}")
                        .to_string();
                    messages.push(Message {
                        role: Role::Assistant,
                        content: MessageContent::ToolCall {
                            tool_call_id: id,
                            function: FunctionCall { name, arguments },
                        },
                    });
                }
            }
            "tool" => {
                let id = v["tool_call_id"]
                    .as_str()
                    .context("tool message missing tool_call_id")?
                    .to_string();
                let content = v["content"].as_str().unwrap_or_default().to_string();
                let is_error = content.starts_with("ERROR: ");
                messages.push(Message {
                    role: Role::Tool,
                    content: MessageContent::ToolResult { tool_call_id: id, content, is_error },
                });
            }
            "user" | "assistant" => {
                let text = v["content"].as_str().unwrap_or_default().to_string();
                let r = if role == "user" { Role::User } else { Role::Assistant };
                messages.push(Message { role: r, content: MessageContent::Text(text) });
            }
            other => bail!("unknown wire role: {other}"),
        }
    }

    Ok((system, messages))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
