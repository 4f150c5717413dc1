// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Streaming tag filter.
//!
//! Some models write tool calls and reasoning directly into the text stream
//! as tagged markup (`<tool_call>{…}</tool_call>`, `<think>…</think>`)
//! instead of using the structured tool-call channel.  The user must not see
//! that markup, but the post-stream parser needs it verbatim.  [`TagFilter`]
//! consumes the stream token by token and maintains both views at once:
//! everything pushed accumulates into a raw transcript, while the visible
//! output hides recognized spans.
//!
//! The filter holds back at most one potential-marker prefix worth of text,
//! so output is identical for any chunking of the same byte sequence — a
//! token split in the middle of `<tool_` behaves exactly like the unsplit
//! text.  Stray `<` characters, HTML-ish tags, and inequalities flush
//! through verbatim as soon as they can no longer begin a marker.

/// Character-per-token ratio used for running context estimates.
pub const CHARS_PER_TOKEN: f32 = 3.5;

/// A swallow span: what opens it, what closes it, and whether the content
/// between the markers is reasoning (which may be surfaced on request)
/// rather than tool markup (which never is).
struct Marker {
    opener: &'static str,
    closer: &'static str,
    reasoning: bool,
}

/// Marker dialects, matched case-insensitively.
const MARKERS: &[Marker] = &[
    Marker { opener: "<tool_call>", closer: "</tool_call>", reasoning: false },
    Marker { opener: "<|tool_call|>", closer: "<|/tool_call|>", reasoning: false },
    Marker { opener: "[tool_call]", closer: "[/tool_call]", reasoning: false },
    Marker { opener: "<function_call>", closer: "</function_call>", reasoning: false },
    Marker { opener: "<|function_call|>", closer: "<|/function_call|>", reasoning: false },
    Marker { opener: "<think>", closer: "</think>", reasoning: true },
];

enum State {
    Normal,
    /// Swallowing until `MARKERS[idx].closer`.
    Swallow { idx: usize },
}

pub struct TagFilter {
    /// Complete transcript, markers included, for the post-stream parser.
    raw: String,
    /// Bytes not yet committed to visible output (bounded by the longest
    /// opener/closer length).
    pending: String,
    state: State,
    /// Surface reasoning spans to the user instead of hiding them.
    show_reasoning: bool,
}

impl TagFilter {
    pub fn new() -> Self {
        Self {
            raw: String::new(),
            pending: String::new(),
            state: State::Normal,
            show_reasoning: false,
        }
    }

    /// Show `<think>` content in the visible output (markers stay hidden).
    pub fn with_reasoning_visible(mut self) -> Self {
        self.show_reasoning = true;
        self
    }

    /// Feed one streamed token; returns the newly visible text, if any.
    pub fn push(&mut self, token: &str) -> String {
        self.raw.push_str(token);
        self.pending.push_str(token);
        self.drain()
    }

    /// End of stream: release whatever the holdback buffer still contains.
    /// An unclosed swallow span stays hidden (its content is in the raw
    /// transcript for the parser); an unmatched prefix in normal state is
    /// ordinary text and flushes through.
    pub fn flush(&mut self) -> String {
        match self.state {
            State::Normal => std::mem::take(&mut self.pending),
            State::Swallow { idx } => {
                let tail = std::mem::take(&mut self.pending);
                if self.show_reasoning && MARKERS[idx].reasoning {
                    tail
                } else {
                    String::new()
                }
            }
        }
    }

    /// The full accumulated text, markers and swallowed spans included.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Running token estimate over everything streamed so far.
    pub fn estimated_tokens(&self) -> usize {
        (self.raw.len() as f32 / CHARS_PER_TOKEN) as usize
    }

    fn drain(&mut self) -> String {
        let mut visible = String::new();
        loop {
            match self.state {
                State::Normal => {
                    let lower = ascii_lower(&self.pending);
                    // Earliest complete opener in the buffer, if any.
                    let hit = MARKERS
                        .iter()
                        .enumerate()
                        .filter_map(|(i, m)| lower.find(m.opener).map(|pos| (pos, i)))
                        .min();
                    if let Some((pos, idx)) = hit {
                        visible.push_str(&self.pending[..pos]);
                        self.pending.drain(..pos + MARKERS[idx].opener.len());
                        self.state = State::Swallow { idx };
                        continue;
                    }
                    // No complete opener: hold back only a suffix that could
                    // still become one; everything before it is committed.
                    let hold = longest_opener_prefix_suffix(&lower);
                    let cut = self.pending.len() - hold;
                    visible.push_str(&self.pending[..cut]);
                    self.pending.drain(..cut);
                    break;
                }
                State::Swallow { idx } => {
                    let marker = &MARKERS[idx];
                    let lower = ascii_lower(&self.pending);
                    if let Some(pos) = lower.find(marker.closer) {
                        if self.show_reasoning && marker.reasoning {
                            visible.push_str(&self.pending[..pos]);
                        }
                        self.pending.drain(..pos + marker.closer.len());
                        self.state = State::Normal;
                        continue;
                    }
                    // Closer not seen yet: drop (or surface, for reasoning)
                    // everything except a suffix that could start the closer.
                    let hold = longest_prefix_suffix(&lower, marker.closer);
                    let cut = self.pending.len() - hold;
                    if self.show_reasoning && marker.reasoning {
                        visible.push_str(&self.pending[..cut]);
                    }
                    self.pending.drain(..cut);
                    break;
                }
            }
        }
        visible
    }
}

impl Default for TagFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// ASCII-lowercased copy; byte-length preserving, so indices into the copy
/// are valid for the original.  Bytes outside 'A'..='Z' are untouched, which
/// keeps multi-byte UTF-8 sequences intact.
fn ascii_lower(s: &str) -> String {
    let bytes: Vec<u8> = s.bytes().map(|b| b.to_ascii_lowercase()).collect();
    String::from_utf8(bytes).expect("ascii lowercasing preserves utf-8")
}

/// Longest suffix of `s` that is a proper prefix of any opener.
fn longest_opener_prefix_suffix(s: &str) -> usize {
    MARKERS
        .iter()
        .map(|m| longest_prefix_suffix(s, m.opener))
        .max()
        .unwrap_or(0)
}

/// Longest suffix of `s` that is a proper prefix of `needle`.
fn longest_prefix_suffix(s: &str, needle: &str) -> usize {
    let max = needle.len().saturating_sub(1).min(s.len());
    for len in (1..=max).rev() {
        if !s.is_char_boundary(s.len() - len) {
            continue;
        }
        if needle.starts_with(&s[s.len() - len..]) {
            return len;
        }
    }
    0
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Run the filter over `chunks` and return (visible, raw).
    fn filter_chunks(chunks: &[&str]) -> (String, String) {
        let mut f = TagFilter::new();
        let mut visible = String::new();
        for c in chunks {
            visible.push_str(&f.push(c));
        }
        visible.push_str(&f.flush());
        let raw = f.raw().to_string();
        (visible, raw)
    }

    fn filter_whole(text: &str) -> (String, String) {
        filter_chunks(&[text])
    }

    /// Every split of `text` into single characters must yield the same
    /// visible output as the unsplit text.
    fn assert_chunking_invariant(text: &str) {
        let (whole, _) = filter_whole(text);
        let chars: Vec<String> = text.chars().map(|c| c.to_string()).collect();
        let refs: Vec<&str> = chars.iter().map(String::as_str).collect();
        let (char_at_a_time, _) = filter_chunks(&refs);
        assert_eq!(
            char_at_a_time, whole,
            "chunking changed output for {text:?}"
        );
    }

    // ── Basic hiding ──────────────────────────────────────────────────────────

    #[test]
    fn plain_text_passes_through() {
        let (vis, raw) = filter_whole("hello world");
        assert_eq!(vis, "hello world");
        assert_eq!(raw, "hello world");
    }

    #[test]
    fn tool_call_markup_is_hidden() {
        let (vis, raw) = filter_whole("Hello <tool_call>{\"name\":\"x\"}</tool_call> World");
        assert_eq!(vis, "Hello  World");
        assert!(raw.contains("<tool_call>"));
        assert!(raw.contains("{\"name\":\"x\"}"));
    }

    #[test]
    fn pipe_dialect_is_hidden() {
        let (vis, _) = filter_whole("a<|tool_call|>{}<|/tool_call|>b");
        assert_eq!(vis, "ab");
    }

    #[test]
    fn bracket_dialect_is_hidden() {
        let (vis, _) = filter_whole("a[TOOL_CALL]{}[/TOOL_CALL]b");
        assert_eq!(vis, "ab");
    }

    #[test]
    fn function_call_dialect_is_hidden() {
        let (vis, _) = filter_whole("x<function_call>{}</function_call>y");
        assert_eq!(vis, "xy");
    }

    #[test]
    fn matching_is_case_insensitive() {
        let (vis, _) = filter_whole("a<TOOL_CALL>{}</TOOL_CALL>b");
        assert_eq!(vis, "ab");
    }

    #[test]
    fn think_block_is_hidden_by_default() {
        let (vis, raw) = filter_whole("before<think>secret reasoning</think>after");
        assert_eq!(vis, "beforeafter");
        assert!(raw.contains("secret reasoning"));
    }

    #[test]
    fn think_content_visible_when_requested() {
        let mut f = TagFilter::new().with_reasoning_visible();
        let mut vis = f.push("a<think>why not</think>b");
        vis.push_str(&f.flush());
        assert_eq!(vis, "awhy notb");
    }

    #[test]
    fn multiple_spans_in_one_stream() {
        let (vis, _) =
            filter_whole("1<tool_call>A</tool_call>2<think>B</think>3<tool_call>C</tool_call>4");
        assert_eq!(vis, "1234");
    }

    // ── Pass-through of lookalikes ────────────────────────────────────────────

    #[test]
    fn html_tags_pass_through() {
        let (vis, _) = filter_whole("<div>content</div>");
        assert_eq!(vis, "<div>content</div>");
    }

    #[test]
    fn inequality_passes_through() {
        let (vis, _) = filter_whole("check a < b and c <= d");
        assert_eq!(vis, "check a < b and c <= d");
    }

    #[test]
    fn stray_lt_at_end_is_flushed() {
        let (vis, _) = filter_whole("dangling <");
        assert_eq!(vis, "dangling <");
    }

    #[test]
    fn near_miss_prefix_is_flushed() {
        // `<tool_cal!` can never complete `<tool_call>`.
        let (vis, _) = filter_whole("x<tool_cal! y");
        assert_eq!(vis, "x<tool_cal! y");
    }

    #[test]
    fn think_lookalike_passes_through() {
        let (vis, _) = filter_whole("<thinker>text</thinker>");
        assert_eq!(vis, "<thinker>text</thinker>");
    }

    // ── Unclosed spans ────────────────────────────────────────────────────────

    #[test]
    fn unclosed_tool_call_stays_hidden() {
        let (vis, raw) = filter_whole("before <tool_call>{\"name\":\"x\"");
        assert_eq!(vis, "before ");
        assert!(raw.contains("{\"name\":\"x\""));
    }

    #[test]
    fn unclosed_think_stays_hidden() {
        let (vis, _) = filter_whole("answer<think>still going");
        assert_eq!(vis, "answer");
    }

    // ── Chunking invariance ───────────────────────────────────────────────────

    #[test]
    fn chunking_invariance_for_markup() {
        assert_chunking_invariant("Hello <tool_call>{\"name\":\"f\",\"arguments\":{}}</tool_call> World");
    }

    #[test]
    fn chunking_invariance_for_lookalikes() {
        assert_chunking_invariant("<div>a < b</div> <thinker>hm</thinker>");
    }

    #[test]
    fn chunking_invariance_for_think() {
        assert_chunking_invariant("x<think>reason</think>y<tool_call>{}</tool_call>z");
    }

    #[test]
    fn chunking_invariance_for_unclosed() {
        assert_chunking_invariant("tail <tool_call>{\"partial\":");
    }

    #[test]
    fn split_mid_marker_behaves_like_whole() {
        let (vis, _) = filter_chunks(&["abc<tool_", "call>{}</tool_", "call>def"]);
        assert_eq!(vis, "abcdef");
    }

    // ── Empty input ───────────────────────────────────────────────────────────

    #[test]
    fn empty_input_emits_empty() {
        let (vis, raw) = filter_whole("");
        assert_eq!(vis, "");
        assert_eq!(raw, "");
    }

    // ── Raw accumulation & token estimate ─────────────────────────────────────

    #[test]
    fn raw_preserves_everything_verbatim() {
        let text = "a<tool_call>{\"n\":1}</tool_call>b<think>t</think>c";
        let (_, raw) = filter_whole(text);
        assert_eq!(raw, text);
    }

    #[test]
    fn token_estimate_uses_chars_per_token() {
        let mut f = TagFilter::new();
        f.push(&"x".repeat(35));
        assert_eq!(f.estimated_tokens(), 10);
    }

    // ── Holdback bound ────────────────────────────────────────────────────────

    #[test]
    fn pending_buffer_stays_bounded() {
        let mut f = TagFilter::new();
        // Long text with no marker characters: buffer must not grow.
        for _ in 0..1000 {
            f.push("abcdefgh ");
        }
        assert!(f.pending.len() <= 16, "pending grew to {}", f.pending.len());
    }
}
