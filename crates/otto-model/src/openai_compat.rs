// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Driver for OpenAI-compatible chat completion servers.
//!
//! Targets locally-hosted endpoints (llama.cpp, vLLM, LM Studio, Ollama)
//! that all speak the same `/chat/completions` + `/models` wire format with
//! SSE streaming.
//!
//! Two quirks of local servers are handled here rather than leaking into the
//! agent:
//!
//! - **max_tokens negotiation** — servers reject requests whose `max_tokens`
//!   exceeds the loaded context.  When the user configured no explicit value
//!   we probe with 32768 and either adopt the limit quoted in the 400 body
//!   (`max_tokens must be less than or equal to N`) or step down through a
//!   fixed ladder until a request is accepted.
//! - **SSE line splitting** — a single SSE event may arrive across multiple
//!   TCP packets.  A persistent line buffer reassembles complete lines
//!   before parsing.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use otto_config::ModelConfig;

use crate::{
    provider::{ModelInfo, ResponseStream},
    wire, CompletionRequest, ResponseEvent,
};

/// Fallback ladder tried when the server rejects `max_tokens` without
/// quoting its actual limit.
const MAX_TOKENS_LADDER: &[u32] = &[32_768, 16_384, 8_192, 4_096];

/// How long a `/models` listing stays fresh.
const MODELS_CACHE_TTL: Duration = Duration::from_secs(300);

/// OpenAI-compatible chat completion provider.
pub struct OpenAICompatProvider {
    model: String,
    api_key: Option<String>,
    chat_url: String,
    models_url: String,
    /// Configured max_tokens; `None` triggers negotiation.
    max_tokens: Option<u32>,
    temperature: f32,
    request_timeout: Duration,
    client: reqwest::Client,
    /// Limit learned from the server once negotiation has run.
    negotiated_max_tokens: Mutex<Option<u32>>,
    /// `/models` response cache: (fetched_at, entries).
    models_cache: Mutex<Option<(Instant, Vec<ModelInfo>)>>,
}

impl OpenAICompatProvider {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        request_timeout_secs: u64,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            models_url: format!("{base}/models"),
            max_tokens,
            temperature: temperature.unwrap_or(0.2),
            request_timeout: Duration::from_secs(request_timeout_secs.max(1)),
            client: reqwest::Client::new(),
            negotiated_max_tokens: Mutex::new(None),
            models_cache: Mutex::new(None),
        }
    }

    pub fn from_config(cfg: &ModelConfig) -> Self {
        Self::new(
            cfg.name.clone(),
            cfg.resolve_api_key(),
            &cfg.base_url,
            cfg.max_tokens,
            cfg.temperature,
            cfg.request_timeout_secs,
        )
    }

    fn build_body(&self, req: &CompletionRequest, max_tokens: Option<u32>) -> Value {
        let messages = wire::render(req.system.as_deref(), &req.messages);

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": req.stream,
            "temperature": req.temperature.unwrap_or(self.temperature),
            "stream_options": { "include_usage": true },
        });
        if let Some(mt) = max_tokens {
            body["max_tokens"] = json!(mt);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        body
    }

    async fn send(&self, body: &Value) -> anyhow::Result<reqwest::Response> {
        let mut http_req = self.client.post(&self.chat_url).json(body);
        if let Some(key) = &self.api_key {
            http_req = http_req.bearer_auth(key);
        }
        tokio::time::timeout(self.request_timeout, http_req.send())
            .await
            .context("model request timed out")?
            .context("model request failed")
    }

    /// Effective max_tokens for the next request: per-request override, then
    /// the configured value, then whatever a previous negotiation learned.
    fn effective_max_tokens(&self, req: &CompletionRequest) -> Option<u32> {
        req.max_tokens
            .or(self.max_tokens)
            .or(*self.negotiated_max_tokens.lock().unwrap())
    }
}

#[async_trait]
impl crate::ModelProvider for OpenAICompatProvider {
    fn name(&self) -> &str {
        "openai-compat"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    /// List models via `GET /models`, cached for five minutes.
    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        if let Some((at, entries)) = self.models_cache.lock().unwrap().as_ref() {
            if at.elapsed() < MODELS_CACHE_TTL {
                return Ok(entries.clone());
            }
        }

        let mut req = self.client.get(&self.models_url);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.context("models request failed")?;
        if !resp.status().is_success() {
            bail!("models endpoint error {}", resp.status());
        }
        let body: Value = resp.json().await.context("models response not JSON")?;

        let mut entries: Vec<ModelInfo> = body["data"]
            .as_array()
            .map(|data| {
                data.iter()
                    .filter_map(|item| item["id"].as_str())
                    .map(|id| ModelInfo { id: id.to_string() })
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(|a, b| a.id.cmp(&b.id));

        *self.models_cache.lock().unwrap() = Some((Instant::now(), entries.clone()));
        Ok(entries)
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        debug!(
            model = %self.model,
            tool_count = req.tools.len(),
            message_count = req.messages.len(),
            "sending completion request"
        );

        let explicit = self.effective_max_tokens(&req);
        // Negotiation candidates: the known value alone, or the probe ladder
        // followed by "unset" as the last resort.
        let candidates: Vec<Option<u32>> = match explicit {
            Some(mt) => vec![Some(mt)],
            None => MAX_TOKENS_LADDER
                .iter()
                .map(|&mt| Some(mt))
                .chain(std::iter::once(None))
                .collect(),
        };

        let mut resp = None;
        for (attempt, mt) in candidates.iter().enumerate() {
            let body = self.build_body(&req, *mt);
            let r = self.send(&body).await?;
            if r.status().is_success() {
                if explicit.is_none() {
                    *self.negotiated_max_tokens.lock().unwrap() = *mt;
                }
                resp = Some(r);
                break;
            }

            let status = r.status();
            let text = r.text().await.unwrap_or_default();
            let negotiating = explicit.is_none() && status.as_u16() == 400;
            if !negotiating {
                bail!("model endpoint error {status}: {text}");
            }

            // The server quoted its own limit — adopt it and retry once.
            if let Some(cap) = extract_max_tokens_cap(&text) {
                debug!(cap, "server quoted max_tokens limit; adopting");
                *self.negotiated_max_tokens.lock().unwrap() = Some(cap);
                let body = self.build_body(&req, Some(cap));
                let r2 = self.send(&body).await?;
                if r2.status().is_success() {
                    resp = Some(r2);
                    break;
                }
                let status2 = r2.status();
                let text2 = r2.text().await.unwrap_or_default();
                bail!("model endpoint error {status2} after adopting max_tokens={cap}: {text2}");
            }

            warn!(
                attempt,
                rejected = ?mt,
                "max_tokens rejected without a quoted limit; stepping down"
            );
        }

        let resp = resp.context("model endpoint rejected every max_tokens candidate")?;

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across multiple TCP packets.  Maintain a
        // line buffer across chunks; emit events only for complete lines.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<ResponseEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Extract the server's limit from a 400 body of the form
/// `max_tokens must be less than or equal to N` (with or without backticks
/// around the field name or the number, anywhere in the body).
fn extract_max_tokens_cap(body: &str) -> Option<u32> {
    let re = regex::Regex::new(
        r"`?max_tokens`?\s+must\s+be\s+less\s+than\s+or\s+equal\s+to\s+`?(\d+)`?",
    )
    .expect("static regex");
    re.captures(body)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Parse a single complete SSE `data:` line into a [`ResponseEvent`].
///
/// Returns `None` for empty lines, comment lines, or unparseable data.
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<ResponseEvent>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ResponseEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    Some(Ok(parse_sse_chunk(&v)))
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line is left in `buf` so it can be extended by
/// the next TCP chunk.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<ResponseEvent>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        // Strip the optional Windows-style \r before \n.
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

fn parse_sse_chunk(v: &Value) -> ResponseEvent {
    // Usage-only chunk (emitted when stream_options.include_usage = true)
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return ResponseEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        };
    }

    let delta = &v["choices"][0]["delta"];

    // Tool call delta — parallel tool calls are identified by an "index"
    // field; the index routes accumulation in the agent loop.
    if let Some(tc) = v["choices"][0]["delta"]["tool_calls"].get(0) {
        let index = tc["index"].as_u64().unwrap_or(0) as u32;
        let id = tc["id"].as_str().unwrap_or("").to_string();
        let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
        let args = tc["function"]["arguments"].as_str().unwrap_or("").to_string();
        return ResponseEvent::ToolCall { index, id, name, arguments: args };
    }

    // Thinking delta — `reasoning_content` (llama.cpp, DeepSeek) or
    // `reasoning` (some aggregators).
    let thinking = delta
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
    if let Some(t) = thinking {
        if !t.is_empty() {
            return ResponseEvent::ThinkingDelta(t.to_string());
        }
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        return ResponseEvent::TextDelta(text.to_string());
    }

    ResponseEvent::TextDelta(String::new())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModelProvider;

    fn make_provider() -> OpenAICompatProvider {
        OpenAICompatProvider::new(
            "test-model".into(),
            None,
            "http://localhost:9999/v1",
            Some(1024),
            Some(0.0),
            120,
        )
    }

    #[test]
    fn model_name_returns_model() {
        assert_eq!(make_provider().model_name(), "test-model");
    }

    #[test]
    fn chat_url_appends_path() {
        let p = make_provider();
        assert_eq!(p.chat_url, "http://localhost:9999/v1/chat/completions");
    }

    #[test]
    fn base_url_trailing_slash_stripped() {
        let p = OpenAICompatProvider::new(
            "m".into(), None, "http://localhost:1234/v1/", None, None, 120,
        );
        assert_eq!(p.chat_url, "http://localhost:1234/v1/chat/completions");
        assert_eq!(p.models_url, "http://localhost:1234/v1/models");
    }

    // ── max_tokens negotiation ────────────────────────────────────────────────

    #[test]
    fn extract_cap_plain_message() {
        let body = r#"{"error":{"message":"max_tokens must be less than or equal to 8192"}}"#;
        assert_eq!(extract_max_tokens_cap(body), Some(8192));
    }

    #[test]
    fn extract_cap_with_backticks() {
        let body = "`max_tokens` must be less than or equal to `4096`";
        assert_eq!(extract_max_tokens_cap(body), Some(4096));
    }

    #[test]
    fn extract_cap_absent_returns_none() {
        assert_eq!(extract_max_tokens_cap("invalid request"), None);
        assert_eq!(extract_max_tokens_cap(""), None);
    }

    #[test]
    fn effective_max_tokens_prefers_request_override() {
        let p = make_provider();
        let req = CompletionRequest { max_tokens: Some(512), ..Default::default() };
        assert_eq!(p.effective_max_tokens(&req), Some(512));
    }

    #[test]
    fn effective_max_tokens_falls_back_to_negotiated() {
        let p = OpenAICompatProvider::new("m".into(), None, "http://x/v1", None, None, 120);
        assert_eq!(p.effective_max_tokens(&CompletionRequest::default()), None);
        *p.negotiated_max_tokens.lock().unwrap() = Some(8192);
        assert_eq!(p.effective_max_tokens(&CompletionRequest::default()), Some(8192));
    }

    #[test]
    fn ladder_starts_at_32768_and_ends_unset() {
        assert_eq!(MAX_TOKENS_LADDER[0], 32_768);
        assert_eq!(*MAX_TOKENS_LADDER.last().unwrap(), 4_096);
    }

    // ── Request body ──────────────────────────────────────────────────────────

    #[test]
    fn body_contains_model_and_stream_options() {
        let p = make_provider();
        let req = CompletionRequest {
            messages: vec![crate::Message::user("hi")],
            stream: true,
            ..Default::default()
        };
        let body = p.build_body(&req, Some(1024));
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn body_omits_max_tokens_when_unset() {
        let p = make_provider();
        let body = p.build_body(&CompletionRequest::default(), None);
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn body_request_temperature_overrides_configured() {
        let p = make_provider();
        let req = CompletionRequest { temperature: Some(0.9), ..Default::default() };
        let body = p.build_body(&req, None);
        assert_eq!(body["temperature"], 0.9);
    }

    #[test]
    fn body_omits_tools_when_empty() {
        let p = make_provider();
        let body = p.build_body(&CompletionRequest::default(), None);
        assert!(body.get("tools").is_none());
    }

    // ── parse_sse_chunk ───────────────────────────────────────────────────────

    #[test]
    fn parse_sse_text_delta() {
        let v = serde_json::json!({
            "choices": [{ "delta": { "content": "hello" } }]
        });
        assert!(matches!(parse_sse_chunk(&v), ResponseEvent::TextDelta(t) if t == "hello"));
    }

    #[test]
    fn parse_sse_tool_call_with_index() {
        let v = serde_json::json!({
            "choices": [{
                "delta": {
                    "tool_calls": [{
                        "index": 2,
                        "id": "call_xyz",
                        "function": { "name": "read_file", "arguments": "" }
                    }]
                }
            }]
        });
        match parse_sse_chunk(&v) {
            ResponseEvent::ToolCall { index, id, name, .. } => {
                assert_eq!(index, 2);
                assert_eq!(id, "call_xyz");
                assert_eq!(name, "read_file");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parse_sse_usage_event() {
        let v = serde_json::json!({
            "usage": { "prompt_tokens": 100, "completion_tokens": 50 }
        });
        assert!(matches!(
            parse_sse_chunk(&v),
            ResponseEvent::Usage { input_tokens: 100, output_tokens: 50 }
        ));
    }

    #[test]
    fn parse_sse_null_usage_falls_through_to_delta() {
        let v = serde_json::json!({
            "usage": null,
            "choices": [{ "delta": { "content": "hi" } }]
        });
        assert!(matches!(parse_sse_chunk(&v), ResponseEvent::TextDelta(t) if t == "hi"));
    }

    #[test]
    fn parse_sse_reasoning_content_is_thinking() {
        let v = serde_json::json!({
            "choices": [{ "delta": { "reasoning_content": "hmm" } }]
        });
        assert!(matches!(parse_sse_chunk(&v), ResponseEvent::ThinkingDelta(t) if t == "hmm"));
    }

    #[test]
    fn parse_sse_empty_reasoning_falls_through_to_text() {
        let v = serde_json::json!({
            "choices": [{ "delta": { "content": "answer", "reasoning_content": "" } }]
        });
        assert!(matches!(parse_sse_chunk(&v), ResponseEvent::TextDelta(t) if t == "answer"));
    }

    // ── SSE line buffering ────────────────────────────────────────────────────

    #[test]
    fn drain_complete_lines_handles_single_complete_line() {
        let line = r#"{"choices":[{"delta":{"content":"hi"}}]}"#;
        let mut buf = format!("data: {line}\n");
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Ok(ResponseEvent::TextDelta(t)) if t == "hi"));
        assert!(buf.is_empty(), "buffer should be drained");
    }

    #[test]
    fn drain_complete_lines_retains_incomplete_last_line() {
        let partial = "data: {\"choices\":[{\"delta\":{\"content\":\"hel";
        let mut buf = partial.to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert!(events.is_empty(), "no complete line yet");
        assert_eq!(buf, partial, "partial line must stay in buffer");
    }

    #[test]
    fn sse_event_split_across_two_chunks_is_parsed_correctly() {
        let full_line = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"bash","arguments":""}}]}}]}"#;
        let split = full_line.len() / 2;

        let mut buf = String::new();
        buf.push_str(&full_line[..split]);
        assert!(drain_complete_sse_lines(&mut buf).is_empty());
        assert!(!buf.is_empty(), "buffer must hold partial line");

        buf.push_str(&full_line[split..]);
        buf.push('\n');
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Ok(ResponseEvent::ToolCall { index, id, name, .. }) => {
                assert_eq!(*index, 0);
                assert_eq!(id, "call_1");
                assert_eq!(name, "bash");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn multiple_sse_events_in_one_tcp_chunk_all_parsed() {
        let chunk = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n",
        );
        let mut buf = chunk.to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn done_event_is_parsed_correctly() {
        let mut buf = "data: [DONE]\n".to_string();
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Ok(ResponseEvent::Done)));
    }

    #[test]
    fn windows_crlf_line_endings_are_handled() {
        let line = r#"{"choices":[{"delta":{"content":"hi"}}]}"#;
        let mut buf = format!("data: {line}\r\n");
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Ok(ResponseEvent::TextDelta(t)) if t == "hi"));
    }
}
