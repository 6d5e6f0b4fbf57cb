//! Streaming function-call parser
//!
//! Consumes chunks of the host agent's stdout and turns the interleaved
//! `<function_calls>` / `<function_results>` wire format into structured
//! [`FcCall`] records. The parser is a line-oriented state machine: chunks
//! are split on `\n` with the trailing partial line carried across calls,
//! each line is matched after whitespace trim, and anything that matches no
//! transition in the current state is consumed inertly. Malformed input
//! never produces an error; the offending line is dropped and state is
//! preserved.
//!
//! An `<invoke>` closed by `</invoke>` is parked until its paired
//! `<function_results>` block arrives. When results arrive the most recently
//! parked call is restored; if the parser joined the stream mid-conversation
//! this pairing is best-effort and the restored arguments may belong to an
//! earlier invocation. At most 10 incomplete calls are parked; the oldest is
//! evicted beyond that.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tokens::estimate;

/// Maximum characters kept per argument value
pub const MAX_ARG_CHARS: usize = 5_000;
/// Maximum characters kept per result
pub const MAX_RESULT_CHARS: usize = 10_000;
/// Maximum incomplete calls parked while waiting for results
pub const MAX_PARKED: usize = 10;

static INVOKE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^<invoke name="([^"]+)">$"#).unwrap());
static PARAM_INLINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^<parameter name="([^"]+)">(.*)</parameter>$"#).unwrap());
static PARAM_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^<parameter name="([^"]+)">$"#).unwrap());
static SYSTEM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^<system>(.*)</system>$").unwrap());
static ERROR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^<error>(.*)</error>$").unwrap());

/// Outcome of a completed function call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FcStatus {
    Success,
    Error,
}

/// One completed tool invocation, arguments and result included
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FcCall {
    /// Random id assigned at `<invoke>`
    pub id: String,
    /// Tool name from the invoke tag
    pub name: String,
    /// Parameter values, truncated to [`MAX_ARG_CHARS`] each
    pub args: HashMap<String, String>,
    /// Result text, truncated to [`MAX_RESULT_CHARS`]
    pub result: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    /// Estimate over the result plus the serialized arguments
    pub tokens: usize,
    pub status: FcStatus,
    pub error: Option<String>,
    /// Filled later by the session manager's summarizer
    pub summary: String,
}

/// Event raised while parsing a chunk
#[derive(Debug, Clone)]
pub enum FcEvent {
    /// An `<invoke>` tag opened a new call
    Started { id: String, name: String },
    /// A `</function_results>` tag completed a call
    Completed(Box<FcCall>),
}

/// Parser states, one per region of the wire format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Idle,
    InFunctionCalls,
    InInvoke,
    InParameter,
    WaitingResults,
    InResults,
}

#[derive(Debug, Clone)]
struct PartialFc {
    id: String,
    name: String,
    args: HashMap<String, String>,
    result_lines: Vec<String>,
    start_time: DateTime<Utc>,
    error: Option<String>,
}

impl PartialFc {
    fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            args: HashMap::new(),
            result_lines: Vec::new(),
            start_time: Utc::now(),
            error: None,
        }
    }

    fn complete(self) -> FcCall {
        let end_time = Utc::now();
        let duration_ms = (end_time - self.start_time).num_milliseconds();
        let result = truncate_marked(&self.result_lines.join("\n"), MAX_RESULT_CHARS);
        let args_text = serde_json::to_string(&self.args).unwrap_or_default();
        let tokens = estimate(&result) + estimate(&args_text);
        let status = if self.error.is_some() {
            FcStatus::Error
        } else {
            FcStatus::Success
        };

        FcCall {
            id: self.id,
            name: self.name,
            args: self.args,
            result,
            start_time: self.start_time,
            end_time,
            duration_ms,
            tokens,
            status,
            error: self.error,
            summary: String::new(),
        }
    }
}

/// Streaming parser over the host agent's output
pub struct FcParser {
    state: ParserState,
    /// Trailing partial line carried between chunks
    carry: String,
    current: Option<PartialFc>,
    /// Incomplete calls awaiting their results block, oldest first
    parked: VecDeque<PartialFc>,
    param_name: Option<String>,
    param_lines: Vec<String>,
}

impl FcParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::Idle,
            carry: String::new(),
            current: None,
            parked: VecDeque::new(),
            param_name: None,
            param_lines: Vec::new(),
        }
    }

    /// Whether the parser is back at its initial state with nothing pending.
    pub fn is_idle(&self) -> bool {
        self.state == ParserState::Idle && self.carry.is_empty()
    }

    /// Number of incomplete calls currently parked.
    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    /// Feed a chunk and collect the events it raises. The trailing partial
    /// line, if any, is retained for the next chunk.
    pub fn parse(&mut self, chunk: &str) -> Vec<FcEvent> {
        self.carry.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.carry.find('\n') {
            let line: String = self.carry.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            self.process_line(line, &mut events);
        }

        events
    }

    /// Like [`parse`](Self::parse), keeping only completed calls.
    pub fn completed_calls(&mut self, chunk: &str) -> Vec<FcCall> {
        self.parse(chunk)
            .into_iter()
            .filter_map(|event| match event {
                FcEvent::Completed(call) => Some(*call),
                FcEvent::Started { .. } => None,
            })
            .collect()
    }

    /// Process any residual buffered line and return the calls it completed.
    pub fn flush(&mut self) -> Vec<FcCall> {
        let mut events = Vec::new();
        if !self.carry.is_empty() {
            let line = std::mem::take(&mut self.carry);
            let line = line.trim_end_matches('\r');
            self.process_line(line, &mut events);
        }
        events
            .into_iter()
            .filter_map(|event| match event {
                FcEvent::Completed(call) => Some(*call),
                FcEvent::Started { .. } => None,
            })
            .collect()
    }

    /// Drop all buffered state and return to idle.
    pub fn reset(&mut self) {
        self.state = ParserState::Idle;
        self.carry.clear();
        self.current = None;
        self.parked.clear();
        self.param_name = None;
        self.param_lines.clear();
    }

    fn process_line(&mut self, raw: &str, events: &mut Vec<FcEvent>) {
        let line = raw.trim();

        match self.state {
            ParserState::Idle => {
                if line == "<function_calls>" {
                    self.state = ParserState::InFunctionCalls;
                }
                // anything else outside a block is discarded
            }
            ParserState::InFunctionCalls => {
                if let Some(captures) = INVOKE_RE.captures(line) {
                    let fc = PartialFc::new(&captures[1]);
                    events.push(FcEvent::Started {
                        id: fc.id.clone(),
                        name: fc.name.clone(),
                    });
                    self.current = Some(fc);
                    self.state = ParserState::InInvoke;
                } else if line == "</function_calls>" {
                    self.state = ParserState::Idle;
                }
            }
            ParserState::InInvoke => {
                if let Some(captures) = PARAM_INLINE_RE.captures(line) {
                    if let Some(fc) = self.current.as_mut() {
                        fc.args.insert(
                            captures[1].to_string(),
                            truncate_marked(&captures[2], MAX_ARG_CHARS),
                        );
                    }
                } else if let Some(captures) = PARAM_OPEN_RE.captures(line) {
                    self.param_name = Some(captures[1].to_string());
                    self.param_lines.clear();
                    self.state = ParserState::InParameter;
                } else if line == "</invoke>" {
                    self.park_current();
                    self.state = ParserState::WaitingResults;
                }
            }
            ParserState::InParameter => {
                if line == "</parameter>" {
                    let value = self.param_lines.join("\n");
                    if let (Some(name), Some(fc)) =
                        (self.param_name.take(), self.current.as_mut())
                    {
                        fc.args.insert(name, truncate_marked(&value, MAX_ARG_CHARS));
                    }
                    self.param_lines.clear();
                    self.state = ParserState::InInvoke;
                } else {
                    self.param_lines.push(raw.to_string());
                }
            }
            ParserState::WaitingResults => {
                if line == "<function_results>" {
                    // best-effort pairing: most recently parked call
                    self.current = self.parked.pop_back();
                    if self.current.is_none() {
                        tracing::debug!("results block with no parked invoke");
                    }
                    self.state = ParserState::InResults;
                } else if line == "<function_calls>" {
                    // a new block may open before the pending results arrive;
                    // the parked call keeps waiting
                    self.state = ParserState::InFunctionCalls;
                }
            }
            ParserState::InResults => {
                if line == "</function_results>" {
                    if let Some(fc) = self.current.take() {
                        events.push(FcEvent::Completed(Box::new(fc.complete())));
                    }
                    self.state = ParserState::Idle;
                } else if let Some(captures) = SYSTEM_RE.captures(line) {
                    if let Some(fc) = self.current.as_mut() {
                        fc.result_lines.push(captures[1].to_string());
                    }
                } else if let Some(captures) = ERROR_RE.captures(line) {
                    if let Some(fc) = self.current.as_mut() {
                        let message = captures[1].to_string();
                        fc.result_lines.push(format!("ERROR: {message}"));
                        fc.error = Some(message);
                    }
                } else if let Some(fc) = self.current.as_mut() {
                    fc.result_lines.push(raw.to_string());
                }
            }
        }
    }

    fn park_current(&mut self) {
        if let Some(fc) = self.current.take() {
            self.parked.push_back(fc);
            if self.parked.len() > MAX_PARKED {
                if let Some(evicted) = self.parked.pop_front() {
                    tracing::warn!(name = %evicted.name, "evicting oldest incomplete call");
                }
            }
        }
    }
}

impl Default for FcParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncate to `max_chars`, appending an explicit marker with the number of
/// characters removed.
pub(crate) fn truncate_marked(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        text.to_string()
    } else {
        let kept: String = text.chars().take(max_chars).collect();
        format!("{kept}… [truncated {} chars]", total - max_chars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const HAPPY: &str = "<function_calls>\n\
        <invoke name=\"Read\">\n\
        <parameter name=\"file_path\">/a.ts</parameter>\n\
        </invoke>\n\
        </function_calls>\n\
        <function_results>\n\
        <system>ok</system>\n\
        </function_results>\n";

    #[test]
    fn test_happy_path() {
        let mut parser = FcParser::new();
        let calls = parser.completed_calls(HAPPY);

        assert_eq!(calls.len(), 1);
        let call = &calls[0];
        assert_eq!(call.name, "Read");
        assert_eq!(call.args.get("file_path").unwrap(), "/a.ts");
        assert!(call.result.contains("ok"));
        assert_eq!(call.status, FcStatus::Success);
        assert!(call.tokens > 0);
        assert!(parser.is_idle());
    }

    #[test]
    fn test_started_event_precedes_completed() {
        let mut parser = FcParser::new();
        let events = parser.parse(HAPPY);
        assert!(matches!(events[0], FcEvent::Started { ref name, .. } if name == "Read"));
        assert!(matches!(events[1], FcEvent::Completed(_)));
    }

    #[test]
    fn test_chunk_boundaries_anywhere() {
        let mut parser = FcParser::new();
        let mut calls = Vec::new();
        // feed one character at a time
        for c in HAPPY.chars() {
            calls.extend(parser.completed_calls(&c.to_string()));
        }
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "Read");
        assert_eq!(calls[0].args.get("file_path").unwrap(), "/a.ts");
    }

    #[test]
    fn test_multi_line_parameter() {
        let input = "<function_calls>\n\
            <invoke name=\"Write\">\n\
            <parameter name=\"content\">\n\
            line one\n\
            line two\n\
            line three\n\
            </parameter>\n\
            </invoke>\n\
            </function_calls>\n\
            <function_results>\n\
            <system>done</system>\n\
            </function_results>\n";

        let mut parser = FcParser::new();
        let calls = parser.completed_calls(input);
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].args.get("content").unwrap(),
            "line one\nline two\nline three"
        );
    }

    #[test]
    fn test_error_result() {
        let input = "<function_calls>\n\
            <invoke name=\"Bash\">\n\
            <parameter name=\"command\">false</parameter>\n\
            </invoke>\n\
            </function_calls>\n\
            <function_results>\n\
            <error>exit status 1</error>\n\
            </function_results>\n";

        let mut parser = FcParser::new();
        let calls = parser.completed_calls(input);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].status, FcStatus::Error);
        assert_eq!(calls[0].error.as_deref(), Some("exit status 1"));
        assert!(calls[0].result.starts_with("ERROR: exit status 1"));
    }

    #[test]
    fn test_malformed_lines_are_inert() {
        let noisy = "random prose before\n\
            <unknown_tag>\n\
            <function_calls>\n\
            garbage inside block\n\
            <invoke name=\"Read\">\n\
            not a parameter line\n\
            <parameter name=\"file_path\">/a.ts</parameter>\n\
            </invoke>\n\
            </function_calls>\n\
            stray text between blocks\n\
            <function_results>\n\
            <system>ok</system>\n\
            </function_results>\n";

        let mut parser = FcParser::new();
        let calls = parser.completed_calls(noisy);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args.len(), 1);
        assert!(parser.is_idle());
    }

    #[test]
    fn test_results_without_invoke_are_ignored() {
        let mut parser = FcParser::new();
        // WaitingResults is unreachable without an </invoke>, so the whole
        // block falls through Idle and produces nothing
        let calls =
            parser.completed_calls("<function_results>\n<system>ok</system>\n</function_results>\n");
        assert!(calls.is_empty());
        assert!(parser.is_idle());
    }

    #[test]
    fn test_results_bind_to_most_recently_parked() {
        let mut parser = FcParser::new();
        parser.completed_calls(
            "<function_calls>\n<invoke name=\"First\">\n</invoke>\n</function_calls>\n",
        );
        parser.completed_calls(
            "<function_calls>\n<invoke name=\"Second\">\n</invoke>\n</function_calls>\n",
        );
        assert_eq!(parser.parked_count(), 2);

        let calls =
            parser.completed_calls("<function_results>\n<system>r</system>\n</function_results>\n");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "Second");
        assert_eq!(parser.parked_count(), 1);
    }

    #[test]
    fn test_parked_eviction_beyond_cap() {
        let mut parser = FcParser::new();
        for i in 0..(MAX_PARKED + 3) {
            parser.completed_calls(&format!(
                "<function_calls>\n<invoke name=\"fc{i}\">\n</invoke>\n</function_calls>\n"
            ));
        }
        assert_eq!(parser.parked_count(), MAX_PARKED);
    }

    #[test]
    fn test_argument_truncation() {
        let long = "x".repeat(MAX_ARG_CHARS + 25);
        let input = format!(
            "<function_calls>\n<invoke name=\"Write\">\n\
             <parameter name=\"content\">{long}</parameter>\n\
             </invoke>\n</function_calls>\n\
             <function_results>\n<system>ok</system>\n</function_results>\n"
        );

        let mut parser = FcParser::new();
        let calls = parser.completed_calls(&input);
        let content = calls[0].args.get("content").unwrap();
        assert!(content.ends_with("… [truncated 25 chars]"));
        assert!(content.chars().count() < long.chars().count());
    }

    #[test]
    fn test_result_truncation() {
        let mut parser = FcParser::new();
        parser.completed_calls(
            "<function_calls>\n<invoke name=\"Read\">\n</invoke>\n</function_calls>\n<function_results>\n",
        );
        let big_line = "y".repeat(MAX_RESULT_CHARS + 100);
        let calls = parser.completed_calls(&format!("{big_line}\n</function_results>\n"));
        assert_eq!(calls.len(), 1);
        assert!(calls[0].result.contains("… [truncated"));
    }

    #[test]
    fn test_flush_and_reset() {
        let mut parser = FcParser::new();
        // a partial line without newline stays buffered
        parser.parse("<function_calls>");
        assert!(!parser.is_idle());
        assert!(parser.flush().is_empty());

        parser.reset();
        assert!(parser.is_idle());
        assert_eq!(parser.parked_count(), 0);
    }

    #[test]
    fn test_tokens_cover_args_and_result() {
        let mut parser = FcParser::new();
        let calls = parser.completed_calls(HAPPY);
        let call = &calls[0];
        let args_text = serde_json::to_string(&call.args).unwrap();
        assert_eq!(
            call.tokens,
            estimate(&call.result) + estimate(&args_text)
        );
    }

    proptest! {
        #[test]
        fn prop_arbitrary_input_never_panics(chunks in proptest::collection::vec(".*", 0..12)) {
            let mut parser = FcParser::new();
            for chunk in &chunks {
                let _ = parser.parse(chunk);
            }
            let _ = parser.flush();
        }

        #[test]
        fn prop_well_formed_transcript_ends_idle(n in 1usize..5) {
            let mut parser = FcParser::new();
            for _ in 0..n {
                parser.parse(HAPPY);
            }
            prop_assert!(parser.is_idle());
        }
    }
}
