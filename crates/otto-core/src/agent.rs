// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use otto_config::{AgentConfig, AgentMode, ModelConfig};
use otto_model::{CompletionRequest, ModelProvider, ResponseEvent};
use otto_tools::{Dispatcher, ToolCall, ToolRegistry};

use crate::{
    compact::{maybe_compact, smart_truncate, CompactionSettings},
    events::AgentEvent,
    parser::{needs_tool_nudge, parse_tool_calls},
    prompts::system_prompt,
    stream::TagFilter,
    Conversation,
};

/// Consecutive idle-timeout streams tolerated before the loop gives up.
const MAX_CONSECUTIVE_IDLE: u32 = 3;

const NUDGE_MESSAGE: &str = "\
Reminder: to act on files or run commands you must emit an actual tool call \
(structured, or a <tool_call>{...}</tool_call> block). Describing the action \
in prose or a code block does nothing.";

/// What a finished `run_until_quiet` produced.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// Aggregated user-visible assistant text across all iterations.
    pub text: String,
    /// Number of model iterations consumed.
    pub iterations: u32,
    /// The turn ended on cancellation; `text` is partial.
    pub cancelled: bool,
}

/// The core agent: owns a conversation and drives the model ↔ tool loop.
pub struct Agent {
    conversation: Conversation,
    provider: Arc<dyn ModelProvider>,
    registry: Arc<ToolRegistry>,
    dispatcher: Arc<Dispatcher>,
    config: AgentConfig,
    model_config: ModelConfig,
    mode: AgentMode,
}

/// One tool call being accumulated from streamed deltas, keyed by the
/// provider's parallel-tool-call index.
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    /// Resolve to a dispatchable call.  `strict` drops calls whose argument
    /// buffer is not valid JSON (used when the stream ended abnormally and
    /// the buffer may be a half-emitted fragment); otherwise invalid JSON
    /// degrades to `{}` so the model gets a validation error it can react to.
    fn finish(self, ordinal: usize, strict: bool) -> Option<ToolCall> {
        if self.name.is_empty() {
            warn!(call_id = %self.id, "dropping tool call with empty name");
            return None;
        }
        let args = if self.args_buf.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(_) if strict => {
                    warn!(tool = %self.name, "discarding tool call with truncated arguments");
                    return None;
                }
                Err(e) => {
                    warn!(tool = %self.name, error = %e, "invalid tool arguments; substituting {{}}");
                    serde_json::Value::Object(Default::default())
                }
            }
        };
        let id = if self.id.is_empty() {
            format!("tc_synthetic_{ordinal}")
        } else {
            self.id
        };
        Some(ToolCall { id, name: self.name, args })
    }
}

/// Everything one streamed model turn produced.
struct StreamedTurn {
    visible: String,
    raw: String,
    native_calls: Vec<ToolCall>,
    idle_timed_out: bool,
    cancelled: bool,
}

impl Agent {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        registry: Arc<ToolRegistry>,
        dispatcher: Arc<Dispatcher>,
        config: AgentConfig,
        model_config: ModelConfig,
    ) -> Self {
        let mode = config.default_mode;
        Self {
            conversation: Conversation::new(),
            provider,
            registry,
            dispatcher,
            config,
            model_config,
            mode,
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn conversation_mut(&mut self) -> &mut Conversation {
        &mut self.conversation
    }

    pub fn mode(&self) -> AgentMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: AgentMode) {
        self.mode = mode;
    }

    /// Drive the model until it answers without tool calls.
    ///
    /// Appends `user_input`, then iterates: stream a model turn, collect
    /// tool calls from the native channel or — only when that channel stayed
    /// empty — from the text, dispatch them in parallel, reinject results in
    /// call order, repeat.  Terminates on a call-free answer, cancellation,
    /// the iteration cap, or repeated stream idle timeouts.
    pub async fn run_until_quiet(
        &mut self,
        user_input: &str,
        tx: mpsc::Sender<AgentEvent>,
        cancel: CancellationToken,
    ) -> anyhow::Result<AgentOutcome> {
        self.conversation.append_user(user_input);

        let mut aggregated = String::new();
        let mut consecutive_idle = 0u32;
        let mut nudge_sent = false;
        let mut iteration = 0u32;

        loop {
            iteration += 1;
            if iteration > self.config.max_iterations {
                anyhow::bail!(
                    "iteration cap ({}) reached without a final answer",
                    self.config.max_iterations
                );
            }
            if cancel.is_cancelled() {
                let _ = tx.send(AgentEvent::Aborted { partial_text: aggregated.clone() }).await;
                return Ok(AgentOutcome { text: aggregated, iterations: iteration, cancelled: true });
            }

            // Budget gate before every model call.
            let tokens_before = self.conversation.estimated_tokens();
            let settings = CompactionSettings {
                context_window: self.model_config.context_window,
                threshold: self.config.auto_compact_threshold,
                preserve_turns: self.config.compact_preserve_turns,
            };
            if maybe_compact(&mut self.conversation, self.provider.as_ref(), &settings).await? {
                let _ = tx
                    .send(AgentEvent::ContextCompacted {
                        tokens_before,
                        tokens_after: self.conversation.estimated_tokens(),
                    })
                    .await;
            }

            // The catalog reaches the model twice: as structured schemas
            // (native function calling) and as a textual listing inside the
            // system prompt for models that only emit tagged text.
            let listing = self.registry.textual_catalog(self.mode);
            self.conversation.set_system_prompt(system_prompt(
                self.mode,
                self.config.system_prompt.as_deref(),
                &listing,
            ));

            let tools: Vec<otto_model::ToolSchema> = if self.model_config.native_tool_calls {
                self.registry
                    .schemas_for_mode(self.mode)
                    .into_iter()
                    .map(|s| otto_model::ToolSchema {
                        name: s.name,
                        description: s.description,
                        parameters: s.parameters,
                    })
                    .collect()
            } else {
                vec![]
            };

            let request = CompletionRequest {
                system: self.conversation.system_prompt().map(str::to_string),
                messages: self.conversation.messages().to_vec(),
                tools,
                stream: true,
                temperature: None,
                max_tokens: None,
            };

            let turn = self.stream_one_turn(request, &tx, &cancel).await?;

            let visible = turn.visible.trim().to_string();
            if !visible.is_empty() {
                self.conversation.append_assistant(&visible);
                if !aggregated.is_empty() {
                    aggregated.push('\n');
                }
                aggregated.push_str(&visible);
            }

            if turn.cancelled {
                let _ = tx.send(AgentEvent::Aborted { partial_text: aggregated.clone() }).await;
                return Ok(AgentOutcome { text: aggregated, iterations: iteration, cancelled: true });
            }

            if turn.idle_timed_out {
                consecutive_idle += 1;
                let _ = tx.send(AgentEvent::StreamIdle).await;
                if consecutive_idle >= MAX_CONSECUTIVE_IDLE {
                    anyhow::bail!(
                        "stream idle timeout on {MAX_CONSECUTIVE_IDLE} consecutive iterations"
                    );
                }
            } else {
                consecutive_idle = 0;
            }

            // Native wins: a model that used the structured channel is never
            // second-guessed by the text parser.
            let calls: Vec<ToolCall> = if !turn.native_calls.is_empty() {
                turn.native_calls
            } else {
                parse_tool_calls(&turn.raw)
                    .into_iter()
                    .map(|p| ToolCall { id: p.id, name: p.name, args: p.arguments })
                    .collect()
            };

            if calls.is_empty() {
                if !nudge_sent
                    && needs_tool_nudge(&turn.raw)
                    && iteration < self.config.max_iterations
                {
                    debug!("no tool calls but tool-intent detected; nudging once");
                    nudge_sent = true;
                    self.conversation.append_user(NUDGE_MESSAGE);
                    continue;
                }
                let _ = tx.send(AgentEvent::TurnComplete).await;
                return Ok(AgentOutcome { text: aggregated, iterations: iteration, cancelled: false });
            }

            // Phase 1: record all tool-call messages before any result, as
            // the parallel-tool-call wire format requires.
            for call in &calls {
                let _ = tx.send(AgentEvent::ToolCallStarted(call.clone())).await;
                self.conversation
                    .append_tool_call(&call.id, &call.name, call.args.to_string());
            }

            // Phase 2: parallel execution under the concurrency cap.
            let outputs = self.dispatcher.execute_all(&calls, self.mode, &cancel).await;

            // Phase 3: reinject results in call order with per-category
            // truncation.
            let cap = self.config.tool_result_token_cap;
            for (call, output) in calls.iter().zip(outputs.into_iter()) {
                let category = self
                    .registry
                    .resolve(&call.name)
                    .map(|t| t.output_category())
                    .unwrap_or_default();
                let content = smart_truncate(&output.content, category, cap);
                let _ = tx
                    .send(AgentEvent::ToolCallFinished {
                        call_id: output.call_id.clone(),
                        tool_name: call.name.clone(),
                        output: content.clone(),
                        is_error: output.is_error,
                    })
                    .await;
                self.conversation
                    .append_tool_result(&output.call_id, &content, output.is_error);
            }

            if cancel.is_cancelled() {
                let _ = tx.send(AgentEvent::Aborted { partial_text: aggregated.clone() }).await;
                return Ok(AgentOutcome { text: aggregated, iterations: iteration, cancelled: true });
            }
        }
    }

    /// Stream one model turn through the tag filter, accumulating native
    /// tool-call deltas by index and enforcing the idle watchdog.
    async fn stream_one_turn(
        &self,
        request: CompletionRequest,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<StreamedTurn> {
        let mut stream = self
            .provider
            .complete(request)
            .await
            .context("model completion failed")?;

        let idle = Duration::from_secs(self.config.stream_idle_timeout_secs.max(1));
        let mut filter = TagFilter::new();
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
        let mut visible = String::new();
        let mut idle_timed_out = false;
        let mut cancelled = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                next = tokio::time::timeout(idle, stream.next()) => next,
            };
            let event = match next {
                // Watchdog fired: no byte for the whole idle window.
                Err(_) => {
                    idle_timed_out = true;
                    break;
                }
                Ok(None) => break,
                Ok(Some(ev)) => ev?,
            };
            match event {
                ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                    let vis = filter.push(&delta);
                    if !vis.is_empty() {
                        visible.push_str(&vis);
                        let _ = tx.send(AgentEvent::TextDelta(vis)).await;
                    }
                }
                ResponseEvent::TextDelta(_) => {}
                ResponseEvent::ThinkingDelta(delta) => {
                    let _ = tx.send(AgentEvent::ThinkingDelta(delta)).await;
                }
                ResponseEvent::ToolCall { index, id, name, arguments } => {
                    let ptc = pending.entry(index).or_insert_with(|| PendingToolCall {
                        id: String::new(),
                        name: String::new(),
                        args_buf: String::new(),
                    });
                    if !id.is_empty() {
                        ptc.id = id;
                    }
                    if !name.is_empty() {
                        ptc.name = name;
                    }
                    ptc.args_buf.push_str(&arguments);
                }
                ResponseEvent::Usage { input_tokens, output_tokens } => {
                    let _ = tx
                        .send(AgentEvent::TokenUsage { input: input_tokens, output: output_tokens })
                        .await;
                }
                ResponseEvent::Done => break,
                ResponseEvent::Error(e) => {
                    warn!("model stream error: {e}");
                }
            }
        }

        let tail = filter.flush();
        if !tail.is_empty() && !cancelled {
            visible.push_str(&tail);
            let _ = tx.send(AgentEvent::TextDelta(tail)).await;
        }

        // An abnormal end may leave half-emitted argument JSON in the
        // buffers; those fragments are discarded rather than dispatched, so
        // no tool_call ever enters the conversation without a result.
        let strict = idle_timed_out || cancelled;
        let mut pending_sorted: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
        pending_sorted.sort_by_key(|(idx, _)| *idx);
        let native_calls: Vec<ToolCall> = pending_sorted
            .into_iter()
            .enumerate()
            .filter_map(|(i, (_, ptc))| ptc.finish(i, strict))
            .collect();

        Ok(StreamedTurn {
            visible,
            raw: filter.raw().to_string(),
            native_calls: if cancelled { vec![] } else { native_calls },
            idle_timed_out,
            cancelled,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
