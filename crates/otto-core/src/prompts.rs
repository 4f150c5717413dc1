// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use otto_config::AgentMode;

const BASE_PROMPT: &str = "\
You are otto, a coding agent running in a developer's terminal. You help by \
reading and modifying files and running commands through the tools provided. \
Work step by step: inspect before you change, prefer small verifiable edits, \
and report what you did. Never invent file contents — read them.";

const PLAN_PROMPT: &str = "\
You are in PLAN mode: only read-only tools are available. Investigate the \
codebase and produce a concrete plan; do not attempt to modify anything.";

const SANDBOX_PROMPT: &str = "\
You are in SANDBOX mode: only read-only tools are available. Explore freely \
but nothing you do may change the system.";

const TOOL_PROTOCOL_PROMPT: &str = "\
To use a tool, respond with a tool call. If your runtime does not support \
structured function calling, emit exactly:\n\
<tool_call>{\"name\": \"<tool>\", \"arguments\": { ... }}</tool_call>\n\
One call per block; multiple blocks are allowed. Do not describe a tool call \
in prose instead of making it.";

/// Assemble the system prompt for a turn.
///
/// `custom` fully replaces the built-in preamble when set (the tool listing
/// is still appended so the model always knows its catalog).
pub fn system_prompt(mode: AgentMode, custom: Option<&str>, tool_listing: &str) -> String {
    let mut out = String::new();
    match custom {
        Some(c) => out.push_str(c),
        None => {
            out.push_str(BASE_PROMPT);
            match mode {
                AgentMode::Plan => {
                    out.push_str("\n\n");
                    out.push_str(PLAN_PROMPT);
                }
                AgentMode::Sandbox => {
                    out.push_str("\n\n");
                    out.push_str(SANDBOX_PROMPT);
                }
                AgentMode::Agent => {}
            }
        }
    }
    out.push_str("\n\n");
    out.push_str(TOOL_PROTOCOL_PROMPT);
    if !tool_listing.is_empty() {
        out.push_str("\n\nAvailable tools:\n");
        out.push_str(tool_listing);
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
