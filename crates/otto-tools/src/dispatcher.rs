// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Safe execution of tool calls.
//!
//! Every call runs the same ordered pipeline: resolve → mode gate →
//! permission check → pre-hook → argument normalization → checkpoint →
//! required-argument validation → path restriction → timed execution →
//! post-hook → history record → error formatting.  Any stage may fail the
//! call; failures become error text fed back to the model, never `Err`.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use otto_config::AgentMode;

use crate::{
    CheckpointStore, HookRunner, OutputSink, PermissionEngine, RiskLevel, SessionHistory, Tool,
    ToolCall, ToolOutput, ToolRegistry,
};

/// Fixed argument-name aliases.  Models trained on other agents regularly
/// invent near-miss parameter names; renaming them beats a round-trip
/// through a validation error.  An alias applies only when the canonical
/// name exists in the schema and is not already set.
const ARG_ALIASES: &[(&str, &str)] = &[
    ("file_path", "path"),
    ("filepath", "path"),
    ("filename", "path"),
    ("directory", "path"),
    ("dir", "path"),
    ("cmd", "command"),
    ("script", "command"),
    ("find", "old_string"),
    ("replace", "new_string"),
    ("replacement", "new_string"),
    ("instructions", "task"),
];

/// Tools that mutate the filesystem and therefore checkpoint their path
/// arguments before running.
const MUTATING_TOOLS: &[&str] = &[
    "write_file",
    "edit_file",
    "multi_edit",
    "delete_file",
    "copy_file",
    "move_file",
];

/// Paths no file-mutating tool may touch, restricted root or not.
const DANGEROUS_PATH_PREFIXES: &[&str] =
    &["/etc", "/usr", "/bin", "/sbin", "/boot", "/lib", "/dev", "/proc", "/sys"];

/// Argument keys that may carry a filesystem path worth checkpointing.
const PATH_ARG_KEYS: &[&str] = &["path", "destination"];

pub struct DispatcherOptions {
    pub session_id: String,
    pub max_parallel: usize,
    pub default_timeout_secs: u64,
    pub restrict_dir: Option<PathBuf>,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            max_parallel: 8,
            default_timeout_secs: 120,
            restrict_dir: None,
        }
    }
}

pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    permissions: Arc<PermissionEngine>,
    hooks: Arc<HookRunner>,
    checkpoints: Arc<CheckpointStore>,
    history: Arc<SessionHistory>,
    options: DispatcherOptions,
    /// Optional sink for incremental output from streaming-capable tools.
    sink: Option<Arc<dyn OutputSink>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        permissions: Arc<PermissionEngine>,
        hooks: Arc<HookRunner>,
        checkpoints: Arc<CheckpointStore>,
        options: DispatcherOptions,
    ) -> Self {
        Self {
            registry,
            permissions,
            hooks,
            checkpoints,
            history: Arc::new(SessionHistory::new()),
            options,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn history(&self) -> &Arc<SessionHistory> {
        &self.history
    }

    pub fn session_id(&self) -> &str {
        &self.options.session_id
    }

    /// Execute a batch of calls with bounded concurrency.
    ///
    /// Results come back in input order regardless of completion order; a
    /// failure or panic in one slot never affects the others.  `cancel`
    /// aborts outstanding calls cooperatively.
    pub async fn execute_all(
        self: &Arc<Self>,
        calls: &[ToolCall],
        mode: AgentMode,
        cancel: &CancellationToken,
    ) -> Vec<ToolOutput> {
        let semaphore = Arc::new(Semaphore::new(self.options.max_parallel.max(1)));
        let mut tasks = Vec::with_capacity(calls.len());

        for call in calls.iter().cloned() {
            let this = Arc::clone(self);
            let sem = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => ToolOutput::err(&call.id, "Cancelled"),
                    out = this.execute_one(&call, mode) => out,
                }
            }));
        }

        // Await in input order, preserving result indices for correct
        // conversation history serialization.
        let mut outputs = Vec::with_capacity(calls.len());
        for (i, task) in tasks.into_iter().enumerate() {
            let output = match task.await {
                Ok(o) => o,
                Err(e) => ToolOutput::err(
                    &calls[i].id,
                    format!("ERROR: executing {}: {e}", calls[i].name),
                ),
            };
            outputs.push(output);
        }
        outputs
    }

    /// Run the full pipeline for a single call.
    pub async fn execute_one(&self, call: &ToolCall, mode: AgentMode) -> ToolOutput {
        let started = Instant::now();

        // 1. Resolve.
        let Some(tool) = self.registry.resolve(&call.name) else {
            let msg = match self.registry.closest_match(&call.name) {
                Some(suggestion) => {
                    format!("Unknown tool: {}. Did you mean {}?", call.name, suggestion)
                }
                None => format!("Unknown tool: {}.", call.name),
            };
            return ToolOutput::err(&call.id, msg);
        };

        // 2. Mode gate.  The catalog filter already hides out-of-mode tools;
        // this rejects calls the model invents anyway.
        if !mode_allows(mode, tool.risk()) {
            return ToolOutput::err(
                &call.id,
                format!(
                    "Tool '{}' is not available in {mode} mode; only read-only tools may run.",
                    tool.name()
                ),
            );
        }

        // 3. Permission check.
        if !self.permissions.check(tool.name(), tool.risk(), &call.args).await {
            return ToolOutput::err(&call.id, "Permission denied by user.");
        }

        // 4. Pre-hook.
        if !self.hooks.run_pre(tool.name(), &call.args).await {
            return ToolOutput::err(&call.id, "Tool blocked by hook.");
        }

        // 5. Argument normalization.
        let schema = tool.parameters_schema();
        let args = normalize_args(call.args.clone(), &schema);
        let call = ToolCall { id: call.id.clone(), name: call.name.clone(), args };

        // 6. Checkpoint path arguments of mutating tools.
        if MUTATING_TOOLS.contains(&tool.name().to_lowercase().as_str()) {
            for key in PATH_ARG_KEYS {
                if let Some(p) = call.args.get(*key).and_then(|v| v.as_str()) {
                    self.checkpoints
                        .snapshot_best_effort(Path::new(p), &self.options.session_id)
                        .await;
                }
            }
        }

        // 7. Required-argument validation.  The error quotes both the schema
        // and the provided args so the model can self-correct.
        if let Some(missing) = missing_required(&call.args, &schema) {
            return ToolOutput::err(
                &call.id,
                format!(
                    "Missing required arguments: {missing}.\nschema: {schema}\nprovided: {}",
                    call.args
                ),
            );
        }

        // 8. Path restriction.
        if let Some(err) = self.check_path_restriction(&tool, &call.args) {
            return ToolOutput::err(&call.id, err);
        }

        // 9. Execute with timeout.
        debug!(tool = %tool.name(), call_id = %call.id, "executing tool");
        let timeout =
            Duration::from_secs(tool.timeout_secs().unwrap_or(self.options.default_timeout_secs));
        let exec = async {
            match &self.sink {
                Some(sink) => tool.execute_streaming(&call, sink.as_ref()).await,
                None => tool.execute(&call).await,
            }
        };
        let mut output = match tokio::time::timeout(timeout, exec).await {
            Ok(out) => out,
            Err(_) => ToolOutput::err(
                &call.id,
                format!("execution timed out after {}s", timeout.as_secs()),
            ),
        };

        // 10. Post-hook, fire-and-forget.
        self.hooks.run_post(tool.name(), &call.args);

        // 11. Record + format.  Error content gets a stable prefix so the
        // model consistently sees failures.
        if output.is_error && !output.content.starts_with("ERROR: ") {
            output.content = format!("ERROR: {}", output.content);
        }
        self.history.record(
            tool.name(),
            &call.args,
            &output.content,
            output.is_error,
            started.elapsed().as_millis() as u64,
        );
        output
    }

    /// Reject file-affecting calls whose path escapes the restricted root or
    /// touches the static blocklist.  Returns an error message on violation.
    fn check_path_restriction(&self, tool: &Arc<dyn Tool>, args: &Value) -> Option<String> {
        let file_affecting = args.get("path").is_some();
        if !file_affecting {
            return None;
        }
        let path = args.get("path").and_then(|v| v.as_str())?;
        let normalized = normalize_path(Path::new(path));

        if tool.risk() != RiskLevel::ReadOnly {
            for prefix in DANGEROUS_PATH_PREFIXES {
                if normalized.starts_with(prefix) {
                    return Some(format!(
                        "Path '{path}' is on the protected system path blocklist."
                    ));
                }
            }
        }

        if let Some(root) = &self.options.restrict_dir {
            let root = normalize_path(root);
            if !normalized.starts_with(&root) {
                return Some(format!(
                    "Path '{path}' is outside the allowed root '{}'.",
                    root.display()
                ));
            }
        }
        None
    }
}

fn mode_allows(mode: AgentMode, risk: RiskLevel) -> bool {
    match mode {
        AgentMode::Agent => true,
        AgentMode::Plan | AgentMode::Sandbox => risk == RiskLevel::ReadOnly,
    }
}

/// Apply alias renames and single-required promotion against the schema.
fn normalize_args(args: Value, schema: &Value) -> Value {
    let Value::Object(mut map) = args else {
        // Anything that is not an object normalizes to an empty object.
        return Value::Object(serde_json::Map::new());
    };
    let Some(props) = schema.get("properties").and_then(|p| p.as_object()) else {
        return Value::Object(map);
    };

    // Alias resolution: rename near-miss keys to their canonical names.
    for (alias, canonical) in ARG_ALIASES {
        if map.contains_key(*alias)
            && !props.contains_key(*alias)
            && props.contains_key(*canonical)
            && !map.contains_key(*canonical)
        {
            if let Some(v) = map.remove(*alias) {
                map.insert(canonical.to_string(), v);
            }
        }
    }

    // Missing-required inference: a schema with exactly one required string
    // property and exactly one provided string argument under a wrong name
    // is unambiguous — promote it.
    let required: Vec<&str> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();
    if required.len() == 1 && !map.contains_key(required[0]) && map.len() == 1 {
        let is_string_prop = props
            .get(required[0])
            .and_then(|p| p.get("type"))
            .and_then(|t| t.as_str())
            == Some("string");
        let (key, value) = map.iter().next().map(|(k, v)| (k.clone(), v.clone())).unwrap();
        if is_string_prop && value.is_string() && !props.contains_key(&key) {
            map.remove(&key);
            map.insert(required[0].to_string(), value);
        }
    }

    Value::Object(map)
}

/// First missing required argument, comma-joined when several are absent.
fn missing_required(args: &Value, schema: &Value) -> Option<String> {
    let required = schema.get("required")?.as_array()?;
    let missing: Vec<&str> = required
        .iter()
        .filter_map(|v| v.as_str())
        .filter(|name| args.get(*name).is_none())
        .collect();
    if missing.is_empty() {
        None
    } else {
        Some(missing.join(", "))
    }
}

/// Absolute, lexically-normalized form of `path` (no symlink resolution).
fn normalize_path(path: &Path) -> PathBuf {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    };
    let mut out = PathBuf::new();
    for comp in abs.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
