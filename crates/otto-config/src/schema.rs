// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless explicitly
/// disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    /// Named MCP server configurations.  Each entry spawns one child process
    /// whose tools are proxied into the registry under an `mcp_<name>_`
    /// prefix.
    ///
    /// ```yaml
    /// mcp_servers:
    ///   filesystem:
    ///     command: npx
    ///     args: ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
    /// ```
    #[serde(default)]
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

// ─── Model ────────────────────────────────────────────────────────────────────

fn default_base_url() -> String {
    "http://localhost:8080/v1".into()
}
fn default_model_name() -> String {
    "default".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base URL of the OpenAI-compatible API, ending before `/chat/completions`.
    /// Defaults to a local llama.cpp / vLLM style server.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Model name forwarded to the API.
    #[serde(default = "default_model_name")]
    pub name: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files.
    pub api_key: Option<String>,
    /// Maximum tokens to request in a single completion.  When unset, otto
    /// probes the server and negotiates downward from 32768.
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0).
    pub temperature: Option<f32>,
    /// Context window size in tokens, used for compaction triggering.
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Pass structured function schemas to the model.  When disabled the
    /// model only sees the textual tool listing in the system prompt and
    /// must emit tagged tool calls in its text.
    #[serde(default = "default_true")]
    pub native_tool_calls: bool,
    /// Total per-request timeout in seconds.
    #[serde(default = "default_model_timeout")]
    pub request_timeout_secs: u64,
}

fn default_context_window() -> usize {
    32_768
}
fn default_model_timeout() -> u64 {
    120
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            name: default_model_name(),
            api_key_env: None,
            api_key: None,
            max_tokens: None,
            temperature: Some(0.2),
            context_window: default_context_window(),
            native_tool_calls: true,
            request_timeout_secs: default_model_timeout(),
        }
    }
}

impl ModelConfig {
    /// Resolve the API key: explicit value wins, then the named env var.
    /// Local servers typically need no key at all.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(k) = &self.api_key {
            return Some(k.clone());
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
    }
}

// ─── Agent ────────────────────────────────────────────────────────────────────

/// Interaction mode.  Plan and Sandbox restrict the tool catalog to
/// read-only tools; the dispatcher additionally rejects any out-of-mode call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Plan,
    Sandbox,
    #[default]
    Agent,
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentMode::Plan => write!(f, "plan"),
            AgentMode::Sandbox => write!(f, "sandbox"),
            AgentMode::Agent => write!(f, "agent"),
        }
    }
}

fn default_max_iterations() -> u32 {
    20
}
fn default_max_parallel_tool_calls() -> usize {
    8
}
fn default_compact_threshold() -> f32 {
    0.8
}
fn default_compact_preserve_turns() -> usize {
    4
}
fn default_stream_idle_timeout() -> u64 {
    120
}
fn default_tool_timeout() -> u64 {
    120
}
fn default_tool_result_token_cap() -> usize {
    4096
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Default mode when none is specified on the CLI.
    #[serde(default)]
    pub default_mode: AgentMode,
    /// Maximum number of model↔tool iterations per user turn.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Maximum tool calls executed concurrently within one iteration.
    #[serde(default = "default_max_parallel_tool_calls")]
    pub max_parallel_tool_calls: usize,
    /// Fraction of the context window at which summary compaction triggers.
    #[serde(default = "default_compact_threshold")]
    pub auto_compact_threshold: f32,
    /// Number of most-recent turns (user message + following assistant/tool
    /// messages) preserved verbatim during compaction.
    #[serde(default = "default_compact_preserve_turns")]
    pub compact_preserve_turns: usize,
    /// Seconds without a single streamed byte before the in-flight model
    /// stream is cancelled and the iteration ends with what was accumulated.
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout_secs: u64,
    /// Default tool execution timeout in seconds.  Tools may override.
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
    /// Maximum tokens allowed for a single tool result before it is
    /// deterministically truncated before entering the conversation.
    /// 0 disables per-result truncation.
    #[serde(default = "default_tool_result_token_cap")]
    pub tool_result_token_cap: usize,
    /// Restrict file-affecting tools to paths under this root.  Unset means
    /// no restriction beyond the static dangerous-path blocklist.
    #[serde(default)]
    pub restrict_dir: Option<String>,
    /// System prompt override; leave None to use the built-in prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_mode: AgentMode::Agent,
            max_iterations: default_max_iterations(),
            max_parallel_tool_calls: default_max_parallel_tool_calls(),
            auto_compact_threshold: default_compact_threshold(),
            compact_preserve_turns: default_compact_preserve_turns(),
            stream_idle_timeout_secs: default_stream_idle_timeout(),
            tool_timeout_secs: default_tool_timeout(),
            tool_result_token_cap: default_tool_result_token_cap(),
            restrict_dir: None,
            system_prompt: None,
        }
    }
}

// ─── Permissions ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsConfig {
    /// Tools that are never available, regardless of any allow rule.
    #[serde(default)]
    pub disabled_tools: Vec<String>,
    /// Deny patterns of the form `ToolName(glob)`, e.g. `bash(rm -rf *)`.
    /// A matching deny pattern always wins over every allow rule.
    #[serde(default)]
    pub deny_patterns: Vec<String>,
    /// Allow patterns of the form `ToolName(glob)`, e.g. `read_file(src/**)`.
    #[serde(default)]
    pub allow_patterns: Vec<String>,
    /// Approve every call without asking.  Deny patterns still apply.
    #[serde(default)]
    pub auto_approve_all: bool,
    /// Tools approved unconditionally by name.
    #[serde(default)]
    pub always_approve: Vec<String>,
    /// Auto-approve tools whose risk level is ReadOnly.
    #[serde(default = "default_true")]
    pub auto_approve_read_only: bool,
    /// Auto-approve tools whose risk level is Moderate.
    #[serde(default)]
    pub auto_approve_moderate: bool,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            disabled_tools: Vec::new(),
            deny_patterns: Vec::new(),
            allow_patterns: Vec::new(),
            auto_approve_all: false,
            always_approve: Vec::new(),
            // Read-only tools run without prompting out of the box; every
            // mutating call still goes through the approval flow.
            auto_approve_read_only: true,
            auto_approve_moderate: false,
        }
    }
}

// ─── Hooks ────────────────────────────────────────────────────────────────────

/// Pre/post tool hooks.  Keys are tool names or `"*"` for a wildcard; a
/// specific entry takes priority over the wildcard.  The hook command runs
/// through `sh -c`; the tool's argument JSON arrives on stdin and in the
/// `OTTO_TOOL_NAME` / `OTTO_TOOL_ARGS` environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    /// Run before the tool.  Non-zero exit blocks the call.
    #[serde(default)]
    pub pre: HashMap<String, String>,
    /// Run after the tool, fire-and-forget.
    #[serde(default)]
    pub post: HashMap<String, String>,
}

// ─── MCP ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Executable to spawn.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
