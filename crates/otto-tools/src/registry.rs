// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use otto_config::AgentMode;

use crate::{RiskLevel, Tool};

/// A tool schema – mirrors otto_model::ToolSchema but keeps the tools crate
/// independent from the model crate.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Central registry holding all available tools.
///
/// Names are case-insensitive: `Register("Bash")` and `resolve("bash")`
/// address the same entry, and re-registering a name replaces the previous
/// tool.  The registry is read-mostly after startup — construct it fully,
/// then share it behind an `Arc`.
pub struct ToolRegistry {
    /// Keyed by the lowercased name; the tool itself keeps its display name.
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    /// Register a pre-wrapped tool (used by the MCP proxy layer).
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_lowercase(), tool);
    }

    /// The single lookup.  Case-insensitive.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(&name.to_lowercase()).cloned()
    }

    /// Remove a tool by name.  Returns whether an entry was removed.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(&name.to_lowercase()).is_some()
    }

    /// Nearest registered name within edit distance 2, else `None`.
    /// Used for "Unknown tool: X. Did you mean Y?" suggestions.
    pub fn closest_match(&self, name: &str) -> Option<String> {
        let wanted = name.to_lowercase();
        self.tools
            .values()
            .map(|t| {
                let n = t.name();
                (levenshtein(&wanted, &n.to_lowercase()), n.to_string())
            })
            .filter(|(d, _)| *d <= 2)
            .min_by_key(|(d, n)| (*d, n.clone()))
            .map(|(_, n)| n)
    }

    /// Produce schemas for all tools available in the given mode,
    /// deterministically ordered by name.  Plan and Sandbox expose only
    /// ReadOnly tools.
    pub fn schemas_for_mode(&self, mode: AgentMode) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .filter(|t| mode_allows(mode, t.risk()))
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Textual tool listing for models without native function calling.
    /// Embedded in the system prompt; same deterministic order as
    /// [`ToolRegistry::schemas_for_mode`].
    pub fn textual_catalog(&self, mode: AgentMode) -> String {
        let mut out = String::new();
        for s in self.schemas_for_mode(mode) {
            out.push_str(&format!(
                "- {}: {}\n  parameters: {}\n",
                s.name,
                s.description.lines().next().unwrap_or(""),
                s.parameters
            ));
        }
        out
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.values().map(|t| t.name().to_string()).collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn mode_allows(mode: AgentMode, risk: RiskLevel) -> bool {
    match mode {
        AgentMode::Agent => true,
        AgentMode::Plan | AgentMode::Sandbox => risk == RiskLevel::ReadOnly,
    }
}

/// Standard dynamic-programming Levenshtein edit distance.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
