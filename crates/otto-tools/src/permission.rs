// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use otto_config::PermissionsConfig;

use crate::RiskLevel;

/// Outcome of an interactive approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Run this one call.
    Approved,
    /// Run this call and every future call to the same tool this session.
    ApproveAll,
    Denied,
}

/// Interactive approval capability supplied by the embedder.
///
/// Modelled as a trait rather than a function field so the engine does not
/// couple to the embedder's concurrency model.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn request_approval(&self, tool: &str, risk: RiskLevel, args: &Value)
        -> ApprovalDecision;
}

/// A single allow/deny rule of the form `ToolName(glob)`.
///
/// The glob applies to the call's *relevant argument*: `command` for
/// shell-family tools, `path` for everything else.  `*` matches within a
/// path segment, `**` crosses separators, `?` matches one character.
#[derive(Debug)]
pub struct PermissionPattern {
    tool: String,
    glob: Regex,
}

impl PermissionPattern {
    /// Parse `ToolName(glob)`.  Returns `None` for malformed strings.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let open = s.find('(')?;
        if !s.ends_with(')') || open == 0 {
            return None;
        }
        let tool = s[..open].trim().to_lowercase();
        let glob = &s[open + 1..s.len() - 1];
        Some(Self { tool, glob: glob_to_regex(glob)? })
    }

    /// Whether this pattern matches a call to `tool` with `extracted` as the
    /// relevant argument.  Tool comparison is case-insensitive.
    pub fn matches(&self, tool: &str, extracted: &str) -> bool {
        self.tool == tool.to_lowercase() && self.glob.is_match(extracted)
    }
}

/// Convert a permission glob to an anchored [`Regex`].
///
/// `**` → any characters, `*` → any characters except `/`, `?` → one
/// character; everything else matches literally.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    re.push_str(".*");
                    i += 1;
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    re.push('$');
    Regex::new(&re).ok()
}

/// Tools whose relevant argument is `command` rather than `path`.
const SHELL_FAMILY: &[&str] = &["bash", "start_background_process"];

/// Extract the argument a permission glob applies to.
///
/// Shell-family tools match on `command`; all other tools match on `path`
/// when present.  Absent arguments extract as the empty string, which only
/// the `*`/`**` globs match.
pub fn extract_pattern_arg(tool: &str, args: &Value) -> String {
    let key = if SHELL_FAMILY.contains(&tool.to_lowercase().as_str()) {
        "command"
    } else {
        "path"
    };
    args.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

/// Decides whether a tool call may run.
///
/// The decision is a deterministic function of the config snapshot, the
/// session-approved set, and the call itself — identical inputs always yield
/// the same output, and a matching deny pattern can never be overridden by
/// any allow setting.
pub struct PermissionEngine {
    disabled: HashSet<String>,
    deny: Vec<PermissionPattern>,
    allow: Vec<PermissionPattern>,
    auto_approve_all: bool,
    always_approve: HashSet<String>,
    auto_approve_read_only: bool,
    auto_approve_moderate: bool,
    /// Tools the user approved for the rest of the session (ApproveAll).
    /// Monotonic: entries are only added, never removed except by
    /// [`PermissionEngine::reset_session`].  Never persisted.
    session_approved: Mutex<HashSet<String>>,
    handler: Option<Box<dyn ApprovalHandler>>,
}

impl PermissionEngine {
    pub fn from_config(cfg: &PermissionsConfig, handler: Option<Box<dyn ApprovalHandler>>) -> Self {
        let compile = |patterns: &[String]| -> Vec<PermissionPattern> {
            patterns
                .iter()
                .filter_map(|p| {
                    let parsed = PermissionPattern::parse(p);
                    if parsed.is_none() {
                        warn!(pattern = %p, "ignoring malformed permission pattern");
                    }
                    parsed
                })
                .collect()
        };
        Self {
            disabled: cfg.disabled_tools.iter().map(|t| t.to_lowercase()).collect(),
            deny: compile(&cfg.deny_patterns),
            allow: compile(&cfg.allow_patterns),
            auto_approve_all: cfg.auto_approve_all,
            always_approve: cfg.always_approve.iter().map(|t| t.to_lowercase()).collect(),
            auto_approve_read_only: cfg.auto_approve_read_only,
            auto_approve_moderate: cfg.auto_approve_moderate,
            session_approved: Mutex::new(HashSet::new()),
            handler,
        }
    }

    /// Evaluate the fixed decision order; first match wins.
    pub async fn check(&self, tool: &str, risk: RiskLevel, args: &Value) -> bool {
        let name = tool.to_lowercase();
        let extracted = extract_pattern_arg(tool, args);

        // 1. Disabled tools are never available.
        if self.disabled.contains(&name) {
            return false;
        }
        // 2. Deny always wins over any subsequent allow.
        if self.deny.iter().any(|p| p.matches(tool, &extracted)) {
            return false;
        }
        // 3. Explicit allow pattern.
        if self.allow.iter().any(|p| p.matches(tool, &extracted)) {
            return true;
        }
        // 4.–6. Blanket and per-tool approvals.
        if self.auto_approve_all {
            return true;
        }
        if self.always_approve.contains(&name) {
            return true;
        }
        if self.session_approved.lock().unwrap().contains(&name) {
            return true;
        }
        // 7.–8. Risk-based auto-approval.
        if self.auto_approve_read_only && risk == RiskLevel::ReadOnly {
            return true;
        }
        if self.auto_approve_moderate && risk == RiskLevel::Moderate {
            return true;
        }
        // 9. Interactive approval, when a handler is registered.
        if let Some(handler) = &self.handler {
            return match handler.request_approval(tool, risk, args).await {
                ApprovalDecision::Approved => true,
                ApprovalDecision::ApproveAll => {
                    self.session_approved.lock().unwrap().insert(name);
                    true
                }
                ApprovalDecision::Denied => false,
            };
        }
        // 10. No handler: conservative default.
        false
    }

    /// Clear all session-wide grants.
    pub fn reset_session(&self) {
        self.session_approved.lock().unwrap().clear();
    }

    /// Snapshot of the session-approved tool names (sorted, for display).
    pub fn session_approved(&self) -> Vec<String> {
        let mut v: Vec<String> = self.session_approved.lock().unwrap().iter().cloned().collect();
        v.sort();
        v
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn cfg(deny: &[&str], allow: &[&str]) -> PermissionsConfig {
        PermissionsConfig {
            deny_patterns: deny.iter().map(|s| s.to_string()).collect(),
            allow_patterns: allow.iter().map(|s| s.to_string()).collect(),
            auto_approve_read_only: false,
            ..Default::default()
        }
    }

    fn engine(cfg: &PermissionsConfig) -> PermissionEngine {
        PermissionEngine::from_config(cfg, None)
    }

    // ── Pattern parsing ───────────────────────────────────────────────────────

    #[test]
    fn parse_tool_and_glob() {
        let p = PermissionPattern::parse("bash(rm -rf *)").unwrap();
        assert!(p.matches("bash", "rm -rf /tmp/x"));
        assert!(!p.matches("bash", "ls"));
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(PermissionPattern::parse("no_parens").is_none());
        assert!(PermissionPattern::parse("(only_glob)").is_none());
        assert!(PermissionPattern::parse("tool(unclosed").is_none());
    }

    #[test]
    fn pattern_tool_match_is_case_insensitive() {
        let p = PermissionPattern::parse("Bash(ls*)").unwrap();
        assert!(p.matches("bash", "ls -la"));
        assert!(p.matches("BASH", "ls"));
    }

    // ── Glob semantics ────────────────────────────────────────────────────────

    #[test]
    fn single_star_does_not_cross_separator() {
        let p = PermissionPattern::parse("read_file(src/*.rs)").unwrap();
        assert!(p.matches("read_file", "src/main.rs"));
        assert!(!p.matches("read_file", "src/sub/main.rs"));
    }

    #[test]
    fn double_star_crosses_separators() {
        let p = PermissionPattern::parse("read_file(src/**)").unwrap();
        assert!(p.matches("read_file", "src/main.rs"));
        assert!(p.matches("read_file", "src/deep/nested/mod.rs"));
        assert!(!p.matches("read_file", "tests/main.rs"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        let p = PermissionPattern::parse("bash(ls ?)").unwrap();
        assert!(p.matches("bash", "ls -"));
        assert!(!p.matches("bash", "ls --"));
    }

    #[test]
    fn glob_special_chars_are_literal() {
        let p = PermissionPattern::parse("read_file(a.b+c)").unwrap();
        assert!(p.matches("read_file", "a.b+c"));
        assert!(!p.matches("read_file", "aXb+c"));
    }

    // ── Argument extraction ───────────────────────────────────────────────────

    #[test]
    fn shell_family_extracts_command() {
        let args = json!({"command": "git status", "path": "ignored"});
        assert_eq!(extract_pattern_arg("bash", &args), "git status");
        assert_eq!(extract_pattern_arg("start_background_process", &args), "git status");
    }

    #[test]
    fn other_tools_extract_path() {
        let args = json!({"path": "src/lib.rs"});
        assert_eq!(extract_pattern_arg("read_file", &args), "src/lib.rs");
    }

    #[test]
    fn missing_arg_extracts_empty() {
        assert_eq!(extract_pattern_arg("read_file", &json!({})), "");
    }

    // ── Decision order ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn disabled_tool_is_denied_before_everything() {
        let mut c = cfg(&[], &["bash(**)"]);
        c.disabled_tools = vec!["bash".into()];
        c.auto_approve_all = true;
        let e = engine(&c);
        assert!(!e.check("bash", RiskLevel::ReadOnly, &json!({"command":"ls"})).await);
    }

    #[tokio::test]
    async fn deny_pattern_beats_auto_approve_all() {
        let mut c = cfg(&["bash(rm -rf *)"], &[]);
        c.auto_approve_all = true;
        let e = engine(&c);
        assert!(!e.check("bash", RiskLevel::Dangerous, &json!({"command":"rm -rf /tmp/x"})).await);
        // A different command is still allowed via auto_approve_all.
        assert!(e.check("bash", RiskLevel::Dangerous, &json!({"command":"ls"})).await);
    }

    #[tokio::test]
    async fn deny_pattern_beats_allow_pattern() {
        let c = cfg(&["bash(rm *)"], &["bash(**)"]);
        let e = engine(&c);
        assert!(!e.check("bash", RiskLevel::Dangerous, &json!({"command":"rm x"})).await);
        assert!(e.check("bash", RiskLevel::Dangerous, &json!({"command":"ls"})).await);
    }

    #[tokio::test]
    async fn allow_pattern_grants_without_handler() {
        let c = cfg(&[], &["read_file(src/**)"]);
        let e = engine(&c);
        assert!(e.check("read_file", RiskLevel::ReadOnly, &json!({"path":"src/a.rs"})).await);
    }

    #[tokio::test]
    async fn always_approve_list_grants_by_name() {
        let mut c = cfg(&[], &[]);
        c.always_approve = vec!["Grep".into()];
        let e = engine(&c);
        assert!(e.check("grep", RiskLevel::ReadOnly, &json!({})).await);
    }

    #[tokio::test]
    async fn read_only_auto_approval() {
        let mut c = cfg(&[], &[]);
        c.auto_approve_read_only = true;
        let e = engine(&c);
        assert!(e.check("list_dir", RiskLevel::ReadOnly, &json!({})).await);
        assert!(!e.check("write_file", RiskLevel::Moderate, &json!({})).await);
    }

    #[tokio::test]
    async fn moderate_auto_approval() {
        let mut c = cfg(&[], &[]);
        c.auto_approve_moderate = true;
        let e = engine(&c);
        assert!(e.check("write_file", RiskLevel::Moderate, &json!({})).await);
        assert!(!e.check("bash", RiskLevel::Dangerous, &json!({})).await);
    }

    #[tokio::test]
    async fn no_handler_denies_by_default() {
        let e = engine(&cfg(&[], &[]));
        assert!(!e.check("write_file", RiskLevel::Moderate, &json!({})).await);
    }

    #[tokio::test]
    async fn decision_is_deterministic() {
        let c = cfg(&["bash(rm *)"], &["bash(git *)"]);
        let e = engine(&c);
        let args = json!({"command":"git push"});
        let first = e.check("bash", RiskLevel::Dangerous, &args).await;
        for _ in 0..10 {
            assert_eq!(e.check("bash", RiskLevel::Dangerous, &args).await, first);
        }
    }

    // ── Interactive handler & session set ─────────────────────────────────────

    struct FixedHandler(ApprovalDecision);

    #[async_trait]
    impl ApprovalHandler for FixedHandler {
        async fn request_approval(
            &self,
            _tool: &str,
            _risk: RiskLevel,
            _args: &Value,
        ) -> ApprovalDecision {
            self.0
        }
    }

    #[tokio::test]
    async fn handler_approved_is_one_shot() {
        let e = PermissionEngine::from_config(
            &cfg(&[], &[]),
            Some(Box::new(FixedHandler(ApprovalDecision::Approved))),
        );
        assert!(e.check("write_file", RiskLevel::Moderate, &json!({})).await);
        assert!(e.session_approved().is_empty(), "Approved must not persist");
    }

    #[tokio::test]
    async fn handler_approve_all_populates_session_set() {
        let e = PermissionEngine::from_config(
            &cfg(&[], &[]),
            Some(Box::new(FixedHandler(ApprovalDecision::ApproveAll))),
        );
        assert!(e.check("write_file", RiskLevel::Moderate, &json!({})).await);
        assert_eq!(e.session_approved(), vec!["write_file"]);
    }

    #[tokio::test]
    async fn handler_denied_denies() {
        let e = PermissionEngine::from_config(
            &cfg(&[], &[]),
            Some(Box::new(FixedHandler(ApprovalDecision::Denied))),
        );
        assert!(!e.check("write_file", RiskLevel::Moderate, &json!({})).await);
    }

    #[tokio::test]
    async fn session_grant_is_case_insensitive_and_resettable() {
        let e = PermissionEngine::from_config(
            &cfg(&[], &[]),
            Some(Box::new(FixedHandler(ApprovalDecision::ApproveAll))),
        );
        assert!(e.check("Write_File", RiskLevel::Moderate, &json!({})).await);
        // Second call hits the session set before the handler.
        assert!(e.check("WRITE_FILE", RiskLevel::Moderate, &json!({})).await);
        e.reset_session();
        assert!(e.session_approved().is_empty());
    }

    #[tokio::test]
    async fn deny_pattern_beats_session_grant() {
        let e = PermissionEngine::from_config(
            &cfg(&["bash(rm *)"], &[]),
            Some(Box::new(FixedHandler(ApprovalDecision::ApproveAll))),
        );
        // Grant bash for the session via a safe call…
        assert!(e.check("bash", RiskLevel::Dangerous, &json!({"command":"ls"})).await);
        // …the deny pattern still wins afterwards.
        assert!(!e.check("bash", RiskLevel::Dangerous, &json!({"command":"rm x"})).await);
    }
}
