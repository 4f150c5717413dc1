// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use futures::StreamExt;
use otto_model::{CompletionRequest, Message, MessageContent, ModelProvider, ResponseEvent, Role};
use otto_tools::OutputCategory;
use tracing::warn;

use crate::Conversation;

// ─── Compaction ───────────────────────────────────────────────────────────────

const SUMMARIZE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     in a single concise, information-dense paragraph. Preserve all technical details, \
     decisions, file names, and tool outputs that may be relevant to future work. \
     The summary will replace the original history to free up context space.";

/// Assistant acknowledgement inserted after the synthetic summary message.
const SUMMARY_ACK: &str = "Understood — continuing from the summary.";

/// Output cap for the summary call; summaries must stay small to be useful.
const SUMMARY_MAX_TOKENS: u32 = 512;

#[derive(Debug, Clone)]
pub struct CompactionSettings {
    /// Context window of the active model, in tokens.
    pub context_window: usize,
    /// Fraction of the window at which compaction fires.
    pub threshold: f32,
    /// Most-recent turns preserved verbatim.
    pub preserve_turns: usize,
}

/// Compact `conv` when its estimated footprint crosses the threshold.
///
/// The messages older than the preserve window are summarised by a
/// tool-free, temperature-0 model call and replaced with a synthetic
/// `[user summary, assistant ack]` pair.  The preserve window is never
/// touched; when it already covers the whole conversation this is a no-op.
/// Returns whether compaction ran.
pub async fn maybe_compact(
    conv: &mut Conversation,
    provider: &dyn ModelProvider,
    settings: &CompactionSettings,
) -> anyhow::Result<bool> {
    if settings.context_window == 0 {
        return Ok(false);
    }
    let fraction = conv.estimated_tokens() as f32 / settings.context_window as f32;
    if fraction < settings.threshold {
        return Ok(false);
    }

    let Some(mut boundary) = conv.preserve_boundary(settings.preserve_turns) else {
        return Ok(false);
    };

    // Never split a tool-interaction group: if the boundary lands on a tool
    // call or result, walk it back so the whole group stays in the preserved
    // tail.  Orphaned tool results referencing summarised-away call ids
    // would violate the call/result pairing the wire format requires.
    let msgs = conv.messages();
    while boundary > 0
        && matches!(
            msgs[boundary].content,
            MessageContent::ToolCall { .. } | MessageContent::ToolResult { .. }
        )
    {
        boundary -= 1;
    }
    if boundary == 0 {
        return Ok(false);
    }

    let prefix: Vec<Message> = msgs[..boundary].to_vec();
    let tail: Vec<Message> = msgs[boundary..].to_vec();

    let history = serialize_history(&prefix);
    let request = CompletionRequest {
        system: None,
        messages: vec![Message::user(format!("{SUMMARIZE_PROMPT}\n\n---\n\n{history}"))],
        tools: vec![],
        stream: true,
        temperature: Some(0.0),
        max_tokens: Some(SUMMARY_MAX_TOKENS),
    };

    let mut stream = provider.complete(request).await?;
    let mut summary = String::new();
    while let Some(event) = stream.next().await {
        match event {
            Ok(ResponseEvent::TextDelta(t)) => summary.push_str(&t),
            Ok(ResponseEvent::Done) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "summary stream error during compaction");
                break;
            }
        }
    }

    if summary.trim().is_empty() {
        // A failed summary must not destroy history; skip this round.
        warn!("compaction summary came back empty; leaving history untouched");
        return Ok(false);
    }

    let mut rebuilt = Vec::with_capacity(tail.len() + 2);
    rebuilt.push(Message::user(format!("[Conversation summary] {}", summary.trim())));
    rebuilt.push(Message::assistant(SUMMARY_ACK));
    rebuilt.extend(tail);
    conv.replace_messages(rebuilt);
    Ok(true)
}

/// Serialise a message list into plain text for the compaction prompt.
fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
                Role::System => "System",
            };
            let text = match &m.content {
                MessageContent::Text(t) => t.clone(),
                MessageContent::ToolCall { function, .. } => {
                    format!("[tool_call: {}({})]", function.name, function.arguments)
                }
                MessageContent::ToolResult { content, .. } => {
                    format!("[tool_result: {content}]")
                }
            };
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Tool-result truncation ───────────────────────────────────────────────────

/// Deterministic, content-aware tool-result truncation.
///
/// Returns `content` unchanged when it fits within `cap_tokens`.  Otherwise
/// applies a category-specific extraction strategy so the most useful part
/// of the output survives.  Dispatching on [`OutputCategory`] keeps this
/// independent of concrete tool names; each tool declares its own category.
pub fn smart_truncate(content: &str, category: OutputCategory, cap_tokens: usize) -> String {
    if cap_tokens == 0 {
        return content.to_string();
    }
    let cap_chars = (cap_tokens as f32 * crate::stream::CHARS_PER_TOKEN) as usize;
    if content.len() <= cap_chars {
        return content.to_string();
    }
    let omitted_bytes = content.len().saturating_sub(cap_chars);
    match category {
        OutputCategory::HeadTail => head_tail_lines(
            content,
            cap_chars,
            &format!("[... {{lines}} lines / {omitted_bytes} bytes omitted ...]"),
        ),
        OutputCategory::MatchList => head_lines(
            content,
            cap_chars,
            &format!(
                "[... {{lines}} more matches omitted ({omitted_bytes} bytes); \
                 use a more specific pattern to see them ...]"
            ),
        ),
        OutputCategory::FileContent => head_tail_lines(
            content,
            cap_chars,
            &format!(
                "[... {{lines}} lines omitted ({omitted_bytes} bytes); \
                 use read_file with offset/limit to see more ...]"
            ),
        ),
        OutputCategory::Generic => {
            let cut = content[..cap_chars]
                .rfind('\n')
                .map(|p| p + 1)
                .unwrap_or(cap_chars);
            format!(
                "{}\n[... {omitted_bytes} bytes omitted; content truncated to fit context budget ...]",
                &content[..cut]
            )
        }
    }
}

/// Keep only the leading lines that fit within `cap_chars`.
fn head_lines(content: &str, cap_chars: usize, notice_template: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let mut kept = String::with_capacity(cap_chars);
    let mut kept_count = 0usize;
    for line in &lines {
        let needed = if kept.is_empty() { line.len() } else { line.len() + 1 };
        if kept.len() + needed > cap_chars {
            break;
        }
        if !kept.is_empty() {
            kept.push('\n');
        }
        kept.push_str(line);
        kept_count += 1;
    }
    let omitted = lines.len().saturating_sub(kept_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{kept}\n{notice}")
}

/// Keep head and tail line windows, inserting a notice between them.
fn head_tail_lines(content: &str, cap_chars: usize, notice_template: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let half_cap = cap_chars / 2;

    let mut head = String::with_capacity(half_cap);
    let mut head_count = 0usize;
    for line in &lines {
        let needed = if head.is_empty() { line.len() } else { line.len() + 1 };
        if head.len() + needed > half_cap {
            break;
        }
        if !head.is_empty() {
            head.push('\n');
        }
        head.push_str(line);
        head_count += 1;
    }

    let mut tail_lines: Vec<&str> = Vec::new();
    let mut tail_chars = 0usize;
    for line in lines.iter().rev() {
        let needed = if tail_lines.is_empty() { line.len() } else { line.len() + 1 };
        if tail_chars + needed > half_cap {
            break;
        }
        tail_chars += needed;
        tail_lines.push(line);
    }
    tail_lines.reverse();
    let tail_count = tail_lines.len();
    let tail = tail_lines.join("\n");

    let omitted = lines.len().saturating_sub(head_count + tail_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{head}\n{notice}\n{tail}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use otto_model::mock::ScriptedMockProvider;

    use super::*;

    fn summary_script(text: &str) -> Vec<Vec<ResponseEvent>> {
        vec![vec![
            ResponseEvent::TextDelta(text.to_string()),
            ResponseEvent::Done,
        ]]
    }

    fn settings(window: usize) -> CompactionSettings {
        CompactionSettings { context_window: window, threshold: 0.8, preserve_turns: 4 }
    }

    /// Build a conversation with `turns` user/assistant pairs of `bulk`
    /// characters each.
    fn bulky_conversation(turns: usize, bulk: usize) -> Conversation {
        let mut c = Conversation::new();
        for i in 0..turns {
            c.append_user(format!("question {i}: {}", "q".repeat(bulk)));
            c.append_assistant(format!("answer {i}: {}", "a".repeat(bulk)));
        }
        c
    }

    // ── Triggering ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn below_threshold_is_noop() {
        let mut c = bulky_conversation(6, 10);
        let before = c.messages().to_vec();
        let p = ScriptedMockProvider::new(summary_script("should not be called"));
        let ran = maybe_compact(&mut c, &p, &settings(1_000_000)).await.unwrap();
        assert!(!ran);
        assert_eq!(c.messages(), before.as_slice());
    }

    #[tokio::test]
    async fn empty_conversation_is_noop() {
        let mut c = Conversation::new();
        let p = ScriptedMockProvider::new(vec![]);
        let ran = maybe_compact(&mut c, &p, &settings(100)).await.unwrap();
        assert!(!ran);
    }

    #[tokio::test]
    async fn preserve_window_covering_everything_is_noop() {
        // 3 turns < preserve_turns=4 → nothing to summarize even over budget.
        let mut c = bulky_conversation(3, 500);
        let p = ScriptedMockProvider::new(summary_script("s"));
        let ran = maybe_compact(&mut c, &p, &settings(100)).await.unwrap();
        assert!(!ran);
    }

    // ── Compaction shape ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn compaction_replaces_prefix_with_summary_pair() {
        let mut c = bulky_conversation(20, 100);
        let p = ScriptedMockProvider::new(summary_script("the early work, condensed"));
        let ran = maybe_compact(&mut c, &p, &settings(1_000)).await.unwrap();
        assert!(ran);

        let msgs = c.messages();
        // Synthetic pair + 4 preserved turns × 2 messages.
        assert_eq!(msgs.len(), 2 + 8);
        assert_eq!(msgs[0].role, Role::User);
        assert!(msgs[0]
            .as_text()
            .unwrap()
            .starts_with("[Conversation summary] the early work, condensed"));
        assert_eq!(msgs[1].role, Role::Assistant);
        assert_eq!(msgs[1].as_text(), Some(SUMMARY_ACK));
    }

    #[tokio::test]
    async fn preserved_tail_is_byte_identical() {
        let mut c = bulky_conversation(20, 100);
        let tail_before: Vec<Message> = c.messages()[c.preserve_boundary(4).unwrap()..].to_vec();
        let p = ScriptedMockProvider::new(summary_script("s"));
        maybe_compact(&mut c, &p, &settings(1_000)).await.unwrap();
        let tail_after: Vec<Message> = c.messages()[2..].to_vec();
        assert_eq!(tail_after, tail_before);
    }

    #[tokio::test]
    async fn summary_request_is_tool_free_and_cold() {
        let mut c = bulky_conversation(20, 100);
        let p = ScriptedMockProvider::new(summary_script("s"));
        maybe_compact(&mut c, &p, &settings(1_000)).await.unwrap();
        let req = p.last_request.lock().unwrap().clone().unwrap();
        assert!(req.tools.is_empty());
        assert_eq!(req.temperature, Some(0.0));
        assert_eq!(req.max_tokens, Some(SUMMARY_MAX_TOKENS));
        assert_eq!(req.messages.len(), 1);
    }

    #[tokio::test]
    async fn empty_summary_leaves_history_untouched() {
        let mut c = bulky_conversation(20, 100);
        let before = c.messages().to_vec();
        let p = ScriptedMockProvider::new(summary_script(""));
        let ran = maybe_compact(&mut c, &p, &settings(1_000)).await.unwrap();
        assert!(!ran);
        assert_eq!(c.messages(), before.as_slice());
    }

    #[tokio::test]
    async fn boundary_never_splits_tool_group() {
        let mut c = Conversation::new();
        // Old bulk so compaction triggers.
        for i in 0..6 {
            c.append_user(format!("old {i} {}", "x".repeat(200)));
            c.append_assistant(format!("ack {i} {}", "y".repeat(200)));
        }
        // A turn whose tool traffic would sit exactly at the preserve
        // boundary.
        c.append_user("do things");
        c.append_tool_call("t1", "read_file", "{}");
        c.append_tool_result("t1", "data", false);
        c.append_assistant("done");
        for i in 0..3 {
            c.append_user(format!("recent {i}"));
            c.append_assistant("ok");
        }

        let p = ScriptedMockProvider::new(summary_script("s"));
        maybe_compact(&mut c, &p, &settings(500)).await.unwrap();
        assert!(
            c.unanswered_tool_calls().is_empty(),
            "compaction orphaned a tool call"
        );
    }

    // ── smart_truncate ────────────────────────────────────────────────────────

    fn make_lines(n: usize) -> String {
        (0..n).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n")
    }

    #[test]
    fn truncate_returns_original_when_under_cap() {
        let short = "hello world";
        assert_eq!(smart_truncate(short, OutputCategory::HeadTail, 100), short);
    }

    #[test]
    fn truncate_zero_cap_returns_original() {
        let content = "a".repeat(10_000);
        assert_eq!(smart_truncate(&content, OutputCategory::HeadTail, 0), content);
    }

    #[test]
    fn truncate_empty_content_returns_empty() {
        assert_eq!(smart_truncate("", OutputCategory::Generic, 10), "");
    }

    #[test]
    fn all_categories_add_omission_notice_when_truncated() {
        let content = make_lines(1000);
        for category in [
            OutputCategory::HeadTail,
            OutputCategory::MatchList,
            OutputCategory::FileContent,
            OutputCategory::Generic,
        ] {
            let result = smart_truncate(&content, category, 10);
            assert!(
                result.contains("omitted"),
                "{category:?} truncation must include an omission notice"
            );
        }
    }

    #[test]
    fn headtail_preserves_first_and_last_lines() {
        let content = make_lines(200);
        let result = smart_truncate(&content, OutputCategory::HeadTail, 50);
        assert!(result.contains("line 0"));
        assert!(result.contains("line 199"));
    }

    #[test]
    fn matchlist_keeps_leading_matches_only() {
        let content = (0..500)
            .map(|i| format!("match {i}: some content"))
            .collect::<Vec<_>>()
            .join("\n");
        let result = smart_truncate(&content, OutputCategory::MatchList, 50);
        assert!(result.contains("match 0:"));
        assert!(
            !result.contains("match 499:"),
            "MatchList must not jump to the tail"
        );
    }

    #[test]
    fn filecontent_notice_suggests_pagination() {
        let content = make_lines(1000);
        let result = smart_truncate(&content, OutputCategory::FileContent, 20);
        assert!(result.contains("offset"));
    }

    #[test]
    fn generic_cuts_at_newline_boundary() {
        let content = format!("{}\n{}", "a".repeat(10), "b".repeat(500));
        let result = smart_truncate(&content, OutputCategory::Generic, 5);
        assert!(!result.contains("bbb"));
    }
}
