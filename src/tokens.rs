//! Token estimation for context budgeting
//!
//! All token accounting in the runtime goes through [`estimate`]: the session
//! manager, the layered memory retrieval, and the multi-head compressor share
//! the same numbers so budgets compose. The heuristic is dual-rate: CJK
//! ideographs tokenize much denser than Latin text, so they are counted at
//! roughly one token per 1.5 characters while everything else is counted at
//! one per 4.

/// CJK Unified Ideographs range counted at the dense rate.
const CJK_START: char = '\u{4E00}';
const CJK_END: char = '\u{9FA5}';

/// Per-class character counts and the resulting token estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBreakdown {
    /// Characters in the CJK Unified Ideographs range
    pub cjk_chars: usize,
    /// All remaining characters
    pub other_chars: usize,
    /// Tokens attributed to CJK characters
    pub cjk_tokens: usize,
    /// Tokens attributed to other characters
    pub other_tokens: usize,
    /// Total token estimate
    pub total: usize,
}

/// Estimate the token count of a string.
///
/// `estimate("")` is 0, and the estimate is deterministic. Concatenation is
/// monotonic up to ceiling rounding: `estimate(a ++ b)` never exceeds
/// `estimate(a) + estimate(b)` and falls short by at most one per character
/// class.
pub fn estimate(text: &str) -> usize {
    estimate_detailed(text).total
}

/// Estimate with the per-class breakdown.
pub fn estimate_detailed(text: &str) -> TokenBreakdown {
    let mut cjk_chars = 0usize;
    let mut other_chars = 0usize;

    for c in text.chars() {
        if (CJK_START..=CJK_END).contains(&c) {
            cjk_chars += 1;
        } else {
            other_chars += 1;
        }
    }

    // ceil(cjk / 1.5) == ceil(2 * cjk / 3), in integer arithmetic
    let cjk_tokens = (cjk_chars * 2).div_ceil(3);
    let other_tokens = other_chars.div_ceil(4);

    TokenBreakdown {
        cjk_chars,
        other_chars,
        cjk_tokens,
        other_tokens,
        total: cjk_tokens + other_tokens,
    }
}
