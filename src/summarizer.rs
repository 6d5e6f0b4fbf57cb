//! Pluggable summarization capability
//!
//! The LLM call is modeled as a capability: a function from prompt to
//! summary. The runtime never talks to a model itself; callers inject an
//! implementation, and every consumer (the session manager, the semantic
//! compression head) falls back to deterministic rule-based output when the
//! capability fails or is absent.

use async_trait::async_trait;

/// Summarization capability: `summarize(prompt) -> Result<String>`.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Deterministic summarizer used as the default and in tests.
///
/// Collapses whitespace and returns the first `max_chars` characters of the
/// prompt's payload. Deliberately model-free so test output is stable.
#[derive(Debug, Clone)]
pub struct RuleBasedSummarizer {
    max_chars: usize,
}

impl RuleBasedSummarizer {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

impl Default for RuleBasedSummarizer {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl Summarizer for RuleBasedSummarizer {
    async fn summarize(&self, prompt: &str) -> anyhow::Result<String> {
        let collapsed = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
        Ok(truncate_chars(&collapsed, self.max_chars))
    }
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}
