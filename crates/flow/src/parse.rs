//! Reading node output.
//!
//! Models answer in one of three shapes:
//! - tagged sections: `<thinking>`, `<decision>`, `<agent_guidance>`, `<response>`
//! - a JSON object with the same keys, optionally inside a code fence
//! - plain text, taken as the whole response
//!
//! Decisions fail closed: an evaluator that gives no usable decision is read
//! as `CAUTION`, an executor envelope without one as `ERROR`. Either way a
//! note is added to the outgoing guidance.
//!
//! [`VisibleTextFilter`] applies the same rules to a stream so only response
//! text is ever forwarded as partial output.

use serde::Deserialize;
use std::ops::Range;
use tracing::warn;

use superego_core::decision::{AgentDecision, SuperegoDecision};

const SECTIONS: [(&str, &str); 4] = [
    ("<thinking>", "</thinking>"),
    ("<decision>", "</decision>"),
    ("<agent_guidance>", "</agent_guidance>"),
    ("<response>", "</response>"),
];

const THINKING: usize = 0;
const DECISION: usize = 1;
const GUIDANCE: usize = 2;
const RESPONSE: usize = 3;

/// How an output was recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeFormat {
    Tagged,
    Json,
    Plain,
}

/// Raw sections of one model output, before decision validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub thinking: Option<String>,
    pub decision: Option<String>,
    pub agent_guidance: Option<String>,
    pub response: String,
    pub format: EnvelopeFormat,
}

/// A validated node output.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOutput<D> {
    pub decision: D,
    pub thinking: Option<String>,
    pub agent_guidance: Option<String>,
    pub response: String,
}

#[derive(Debug, Deserialize)]
struct JsonEnvelope {
    #[serde(default, alias = "reasoning")]
    thinking: Option<String>,
    #[serde(default)]
    decision: Option<String>,
    #[serde(default, alias = "guidance")]
    agent_guidance: Option<String>,
    #[serde(default)]
    response: Option<String>,
}

/// Extract JSON from a response that may contain markdown code fences.
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find('{')
        && let Some(end) = trimmed.rfind('}')
        && start < end
    {
        return &trimmed[start..=end];
    }
    trimmed
}

/// Split a model output into its sections.
pub fn parse_envelope(text: &str) -> Envelope {
    let found: Vec<Option<(Range<usize>, &str)>> = SECTIONS
        .iter()
        .map(|(open, close)| section(text, open, close))
        .collect();

    if found.iter().any(Option::is_some) {
        let body = |idx: usize| found[idx].as_ref().and_then(|(_, body)| non_empty(body));
        let response = match &found[RESPONSE] {
            Some((_, body)) => body.trim().to_string(),
            None => leftover(text, found.iter().flatten().map(|(range, _)| range.clone())),
        };
        return Envelope {
            thinking: body(THINKING),
            decision: body(DECISION),
            agent_guidance: body(GUIDANCE),
            response,
            format: EnvelopeFormat::Tagged,
        };
    }

    let trimmed = text.trim();
    if (trimmed.starts_with('{') || trimmed.contains("```"))
        && let Ok(json) = serde_json::from_str::<JsonEnvelope>(extract_json(trimmed))
        && (json.decision.is_some() || json.response.is_some())
    {
        return Envelope {
            thinking: json.thinking.as_deref().and_then(non_empty),
            decision: json.decision.as_deref().and_then(non_empty),
            agent_guidance: json.agent_guidance.as_deref().and_then(non_empty),
            response: json.response.unwrap_or_default().trim().to_string(),
            format: EnvelopeFormat::Json,
        };
    }

    Envelope {
        thinking: None,
        decision: None,
        agent_guidance: None,
        response: trimmed.to_string(),
        format: EnvelopeFormat::Plain,
    }
}

/// Read an evaluator's output. Anything but a valid decision becomes `CAUTION`.
pub fn parse_superego_output(text: &str) -> ParsedOutput<SuperegoDecision> {
    let envelope = parse_envelope(text);
    let (decision, note) = match envelope.decision.as_deref() {
        Some(raw) => match raw.parse::<SuperegoDecision>() {
            Ok(decision) => (decision, None),
            Err(_) => {
                warn!(raw = %raw, "Unparseable evaluator decision, failing closed to CAUTION");
                (
                    SuperegoDecision::Caution,
                    Some(format!(
                        "The evaluator's decision '{raw}' could not be parsed. Treat this input with caution."
                    )),
                )
            }
        },
        None => {
            warn!("Evaluator output had no decision, failing closed to CAUTION");
            (
                SuperegoDecision::Caution,
                Some("The evaluator gave no decision. Treat this input with caution.".to_string()),
            )
        }
    };

    ParsedOutput {
        decision,
        thinking: envelope.thinking,
        agent_guidance: with_note(envelope.agent_guidance, note),
        response: envelope.response,
    }
}

/// Read an executor's output.
///
/// Plain text takes `fallback`; an envelope whose decision is missing or
/// malformed becomes `ERROR`.
pub fn parse_agent_output(text: &str, fallback: &AgentDecision) -> ParsedOutput<AgentDecision> {
    let envelope = parse_envelope(text);
    let (decision, note) = match (envelope.format, envelope.decision.as_deref()) {
        (EnvelopeFormat::Plain, _) => (fallback.clone(), None),
        (_, Some(raw)) => match AgentDecision::parse(raw) {
            Ok(decision) => (decision, None),
            Err(e) => {
                warn!(raw = %raw, "Malformed agent decision, failing closed to ERROR");
                (AgentDecision::error(), Some(format!("{e}. The step was marked ERROR.")))
            }
        },
        (_, None) => {
            warn!("Agent envelope had no decision, failing closed to ERROR");
            (
                AgentDecision::error(),
                Some("The agent gave no decision. The step was marked ERROR.".to_string()),
            )
        }
    };

    ParsedOutput {
        decision,
        thinking: envelope.thinking,
        agent_guidance: with_note(envelope.agent_guidance, note),
        response: envelope.response,
    }
}

/// Prefix `note` to the outgoing guidance.
pub fn with_note(guidance: Option<String>, note: Option<String>) -> Option<String> {
    match (note, guidance) {
        (Some(note), Some(guidance)) => Some(format!("{note}\n\n{guidance}")),
        (Some(note), None) => Some(note),
        (None, guidance) => guidance,
    }
}

fn section<'a>(text: &'a str, open: &str, close: &str) -> Option<(Range<usize>, &'a str)> {
    let start = text.find(open)?;
    let body_start = start + open.len();
    // An unterminated section runs to the end of the output.
    match text[body_start..].find(close) {
        Some(rel) => {
            let body_end = body_start + rel;
            Some((start..body_end + close.len(), &text[body_start..body_end]))
        }
        None => Some((start..text.len(), &text[body_start..])),
    }
}

fn leftover(text: &str, ranges: impl Iterator<Item = Range<usize>>) -> String {
    let mut ranges: Vec<Range<usize>> = ranges.collect();
    ranges.sort_by_key(|r| r.start);

    let mut out = String::new();
    let mut cursor = 0;
    for range in ranges {
        if range.start > cursor {
            out.push_str(&text[cursor..range.start]);
        }
        cursor = cursor.max(range.end);
    }
    if cursor < text.len() {
        out.push_str(&text[cursor..]);
    }
    out.trim().to_string()
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Undecided,
    Plain,
    /// JSON or a code fence: nothing is shown until the whole output is known.
    Held,
    Between,
    Inside(usize),
}

const FENCE: &str = "```";

/// Incremental filter that yields only user-visible text from a stream.
///
/// Partial tags at the end of a chunk are held back until the next chunk
/// shows whether they open or close a section. From a leading `{` or the
/// first code fence on, text is held until [`finish`](Self::finish), which
/// releases it only if [`parse_envelope`] reads the whole output as plain.
#[derive(Debug)]
pub struct VisibleTextFilter {
    mode: Mode,
    buf: String,
    seen: String,
}

impl VisibleTextFilter {
    pub fn new() -> Self {
        Self {
            mode: Mode::Undecided,
            buf: String::new(),
            seen: String::new(),
        }
    }

    /// Feed a chunk; returns the text that may be shown now.
    pub fn push(&mut self, chunk: &str) -> String {
        self.seen.push_str(chunk);
        self.buf.push_str(chunk);
        let mut out = String::new();

        loop {
            match self.mode {
                Mode::Undecided => {
                    let t = self.buf.trim_start();
                    if t.is_empty() {
                        return out;
                    }
                    let mode = if t.starts_with('{') || t.starts_with(FENCE) {
                        Mode::Held
                    } else if FENCE.starts_with(t) {
                        return out;
                    } else if t.starts_with('<') {
                        if SECTIONS.iter().any(|(open, _)| t.starts_with(open)) {
                            Mode::Between
                        } else if SECTIONS.iter().any(|(open, _)| open.starts_with(t)) {
                            return out;
                        } else {
                            Mode::Plain
                        }
                    } else {
                        Mode::Plain
                    };
                    self.buf = t.to_string();
                    self.mode = mode;
                }
                Mode::Held => match find_open(&self.buf) {
                    Some((pos, _)) => {
                        out.push_str(&self.buf[..pos]);
                        self.buf.drain(..pos);
                        self.mode = Mode::Between;
                    }
                    None => return out,
                },
                Mode::Plain => {
                    let tag = find_open(&self.buf);
                    let fence = self.buf.find(FENCE);
                    match (tag, fence) {
                        (Some((pos, _)), fence) if fence.is_none_or(|f| pos < f) => {
                            out.push_str(&self.buf[..pos]);
                            self.buf.drain(..pos);
                            self.mode = Mode::Between;
                        }
                        (_, Some(pos)) => {
                            out.push_str(&self.buf[..pos]);
                            self.buf.drain(..pos);
                            self.mode = Mode::Held;
                        }
                        (None, None) => {
                            let opens = SECTIONS.iter().map(|(open, _)| *open);
                            let held = partial_suffix_len(&self.buf, opens)
                                .max(partial_fence_len(&self.buf));
                            let emit = self.buf.len() - held;
                            out.push_str(&self.buf[..emit]);
                            self.buf.drain(..emit);
                            return out;
                        }
                        // Covered by the first arm's guard (`is_none_or` on `None`).
                        (Some(_), None) => unreachable!(),
                    }
                }
                Mode::Between => match find_open(&self.buf) {
                    Some((pos, idx)) => {
                        self.buf.drain(..pos + SECTIONS[idx].0.len());
                        self.mode = Mode::Inside(idx);
                    }
                    None => {
                        let opens = SECTIONS.iter().map(|(open, _)| *open);
                        let held = partial_suffix_len(&self.buf, opens);
                        self.buf.drain(..self.buf.len() - held);
                        return out;
                    }
                },
                Mode::Inside(idx) => {
                    let close = SECTIONS[idx].1;
                    match self.buf.find(close) {
                        Some(pos) => {
                            if idx == RESPONSE {
                                out.push_str(&self.buf[..pos]);
                            }
                            self.buf.drain(..pos + close.len());
                            self.mode = Mode::Between;
                        }
                        None => {
                            let held = partial_suffix_len(&self.buf, [close]);
                            let emit = self.buf.len() - held;
                            if idx == RESPONSE {
                                out.push_str(&self.buf[..emit]);
                            }
                            self.buf.drain(..emit);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush text still held back once the stream has ended.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.buf);
        match self.mode {
            Mode::Plain | Mode::Inside(RESPONSE) => rest,
            Mode::Undecided => rest.trim().to_string(),
            Mode::Held if parse_envelope(&self.seen).format == EnvelopeFormat::Plain => rest,
            _ => String::new(),
        }
    }
}

impl Default for VisibleTextFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Earliest section opening tag in `buf`: (byte offset, section index).
fn find_open(buf: &str) -> Option<(usize, usize)> {
    SECTIONS
        .iter()
        .enumerate()
        .filter_map(|(idx, (open, _))| buf.find(open).map(|pos| (pos, idx)))
        .min()
}

/// Trailing backticks that could still become a code fence.
fn partial_fence_len(buf: &str) -> usize {
    let ticks = buf.len() - buf.trim_end_matches('`').len();
    ticks.min(FENCE.len() - 1)
}

/// Length of a trailing fragment of `buf` that could still become one of `tags`.
fn partial_suffix_len<'a>(buf: &str, tags: impl IntoIterator<Item = &'a str>) -> usize {
    let Some(start) = buf.rfind('<') else {
        return 0;
    };
    let tail = &buf[start..];
    if tags
        .into_iter()
        .any(|tag| tail.len() < tag.len() && tag.starts_with(tail))
    {
        tail.len()
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(filter: &mut VisibleTextFilter, text: &str, chunk: usize) -> String {
        let chars: Vec<char> = text.chars().collect();
        let mut out = String::new();
        for piece in chars.chunks(chunk) {
            out.push_str(&filter.push(&piece.iter().collect::<String>()));
        }
        out.push_str(&filter.finish());
        out
    }

    #[test]
    fn tagged_envelope() {
        let text = "<thinking>harmless arithmetic</thinking>\n<decision>ACCEPT</decision>\n\
                    <agent_guidance>just compute it</agent_guidance>\n<response>Looks fine.</response>";
        let env = parse_envelope(text);
        assert_eq!(env.format, EnvelopeFormat::Tagged);
        assert_eq!(env.thinking.as_deref(), Some("harmless arithmetic"));
        assert_eq!(env.decision.as_deref(), Some("ACCEPT"));
        assert_eq!(env.agent_guidance.as_deref(), Some("just compute it"));
        assert_eq!(env.response, "Looks fine.");
    }

    #[test]
    fn tagged_without_response_uses_leftover_text() {
        let env = parse_envelope("<decision>COMPLETE</decision>\nThe answer is 50.");
        assert_eq!(env.decision.as_deref(), Some("COMPLETE"));
        assert_eq!(env.response, "The answer is 50.");
    }

    #[test]
    fn unterminated_section_runs_to_end() {
        let env = parse_envelope("<decision>ACCEPT</decision><response>partial answ");
        assert_eq!(env.response, "partial answ");
    }

    #[test]
    fn json_envelope_in_fence() {
        let text = "```json\n{\"decision\": \"BLOCK\", \"guidance\": \"refused\", \"response\": \"I can't help.\"}\n```";
        let env = parse_envelope(text);
        assert_eq!(env.format, EnvelopeFormat::Json);
        assert_eq!(env.decision.as_deref(), Some("BLOCK"));
        assert_eq!(env.agent_guidance.as_deref(), Some("refused"));
        assert_eq!(env.response, "I can't help.");
    }

    #[test]
    fn json_without_known_keys_is_plain() {
        let env = parse_envelope("{\"value\": 50}");
        assert_eq!(env.format, EnvelopeFormat::Plain);
        assert_eq!(env.response, "{\"value\": 50}");
    }

    #[test]
    fn extract_json_variants() {
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json("Sure: {\"a\":1} done"), "{\"a\":1}");
        assert_eq!(extract_json("no json"), "no json");
    }

    #[test]
    fn superego_unparseable_fails_closed_to_caution() {
        let parsed = parse_superego_output("<decision>MAYBE</decision><response>hmm</response>");
        assert_eq!(parsed.decision, SuperegoDecision::Caution);
        let guidance = parsed.agent_guidance.unwrap();
        assert!(guidance.contains("MAYBE"));

        let parsed = parse_superego_output("I think this is fine");
        assert_eq!(parsed.decision, SuperegoDecision::Caution);
        assert!(parsed.agent_guidance.is_some());
        assert_eq!(parsed.response, "I think this is fine");
    }

    #[test]
    fn superego_decision_is_normalised() {
        let parsed = parse_superego_output(
            "<decision> needs clarification </decision><response>Which one?</response>",
        );
        assert_eq!(parsed.decision, SuperegoDecision::NeedsClarification);
        assert!(parsed.agent_guidance.is_none());
    }

    #[test]
    fn agent_plain_text_uses_fallback() {
        let parsed = parse_agent_output("5 * 10 = 50", &AgentDecision::complete());
        assert_eq!(parsed.decision.as_str(), "COMPLETE");
        assert_eq!(parsed.response, "5 * 10 = 50");
        assert!(parsed.agent_guidance.is_none());
    }

    #[test]
    fn agent_envelope_without_decision_fails_closed_to_error() {
        let parsed = parse_agent_output(
            "<agent_guidance>check it</agent_guidance><response>50</response>",
            &AgentDecision::complete(),
        );
        assert!(parsed.decision.is_error());
        let guidance = parsed.agent_guidance.unwrap();
        assert!(guidance.contains("no decision"));
        assert!(guidance.ends_with("check it"));
    }

    #[test]
    fn agent_malformed_decision_fails_closed_to_error() {
        let parsed =
            parse_agent_output("<decision>done!?</decision>50", &AgentDecision::complete());
        assert!(parsed.decision.is_error());
    }

    #[test]
    fn agent_open_set_decision() {
        let parsed = parse_agent_output(
            "<decision>needs review</decision><response>draft</response>",
            &AgentDecision::complete(),
        );
        assert_eq!(parsed.decision.as_str(), "NEEDS_REVIEW");
    }

    #[test]
    fn filter_tagged_stream_shows_only_response() {
        let text = "<thinking>secret plan</thinking><decision>ACCEPT</decision>\
                    <agent_guidance>hidden note</agent_guidance><response>Looks fine.</response>";
        for size in [1, 3, 7, 50] {
            let mut filter = VisibleTextFilter::new();
            assert_eq!(stream(&mut filter, text, size), "Looks fine.", "chunk size {size}");
        }
    }

    #[test]
    fn filter_plain_stream_passes_through() {
        let mut filter = VisibleTextFilter::new();
        assert_eq!(stream(&mut filter, "  The answer is 50.", 4), "The answer is 50.");
    }

    #[test]
    fn filter_plain_then_tags() {
        let mut filter = VisibleTextFilter::new();
        let out = stream(&mut filter, "Sure. <thinking>x</thinking><response>50</response>", 5);
        assert_eq!(out, "Sure. 50");
    }

    #[test]
    fn filter_text_starting_with_angle_bracket_is_plain() {
        let mut filter = VisibleTextFilter::new();
        assert_eq!(stream(&mut filter, "<3 arithmetic", 2), "<3 arithmetic");
    }

    #[test]
    fn filter_json_stream_shows_nothing() {
        let mut filter = VisibleTextFilter::new();
        assert_eq!(stream(&mut filter, "{\"decision\":\"ACCEPT\",\"response\":\"ok\"}", 6), "");
    }

    #[test]
    fn filter_holds_fenced_envelope_after_prose() {
        let text = "Here is my verdict:\n```json\n{\"thinking\": \"SECRET-THOUGHT\", \
                    \"decision\": \"ACCEPT\", \"agent_guidance\": \"SECRET-GUIDANCE\", \
                    \"response\": \"ok\"}\n```";
        let env = parse_envelope(text);
        assert_eq!(env.format, EnvelopeFormat::Json);
        assert_eq!(env.thinking.as_deref(), Some("SECRET-THOUGHT"));

        for size in [1, 2, 5, 64] {
            let mut filter = VisibleTextFilter::new();
            let out = stream(&mut filter, text, size);
            assert!(!out.contains("SECRET"), "chunk size {size}: {out}");
            assert_eq!(out, "Here is my verdict:\n", "chunk size {size}");
        }
    }

    #[test]
    fn filter_releases_plain_code_block_at_finish() {
        let text = "Use this:\n```\nprint(5 * 10)\n```\nIt prints 50.";
        assert_eq!(parse_envelope(text).format, EnvelopeFormat::Plain);
        for size in [1, 4, 100] {
            let mut filter = VisibleTextFilter::new();
            assert_eq!(stream(&mut filter, text, size), text, "chunk size {size}");
        }
    }

    #[test]
    fn filter_inline_code_is_plain() {
        for size in [1, 2, 3] {
            let mut filter = VisibleTextFilter::new();
            let out = stream(&mut filter, "`5*10` = 50", size);
            assert_eq!(out, "`5*10` = 50", "chunk size {size}");
        }
    }

    #[test]
    fn partial_fence_detection() {
        assert_eq!(partial_fence_len("see ``"), 2);
        assert_eq!(partial_fence_len("see `x`"), 1);
        assert_eq!(partial_fence_len("see x"), 0);
    }

    #[test]
    fn filter_unterminated_response_is_flushed() {
        let mut filter = VisibleTextFilter::new();
        assert_eq!(stream(&mut filter, "<response>half an ans", 4), "half an ans");
    }

    #[test]
    fn partial_suffix_detection() {
        assert_eq!(partial_suffix_len("abc</resp", ["</response>"]), 6);
        assert_eq!(partial_suffix_len("abc<b", ["</response>"]), 0);
        assert_eq!(partial_suffix_len("abc", ["</response>"]), 0);
    }
}
