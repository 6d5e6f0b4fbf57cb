//! Multi-head context compression
//!
//! Four specialized heads project the layered-memory snapshot into weighted
//! segments concurrently; a deterministic fusion step packs the segments
//! into a single summary under a token budget, ordered by
//! `importance × weight`. Token accounting uses the shared estimator
//! everywhere so the output composes with the session manager's budgets.

pub mod heads;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::ErrorRecord;
use crate::parser::FcStatus;
use crate::summarizer::Summarizer;
use crate::tokens::estimate;

/// Minimum budget left over for a truncated tail segment
const TRUNCATION_FLOOR_TOKENS: usize = 50;

/// One recent call as the compressor sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextCall {
    pub name: String,
    pub summary: String,
    pub args: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub status: FcStatus,
}

/// Snapshot of layered memory handed to the heads
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawContext {
    pub function_calls: Vec<ContextCall>,
    pub files: Vec<String>,
    pub user_messages: Vec<String>,
    pub assistant_responses: Vec<String>,
    pub errors: Vec<ErrorRecord>,
    pub current_goal: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RawContext {
    /// Token estimate over everything the heads can read.
    pub fn total_tokens(&self) -> usize {
        let mut total = 0;
        for call in &self.function_calls {
            total += estimate(&call.name) + estimate(&call.summary);
            for value in call.args.values() {
                total += estimate(value);
            }
        }
        for text in self
            .files
            .iter()
            .chain(self.user_messages.iter())
            .chain(self.assistant_responses.iter())
        {
            total += estimate(text);
        }
        for error in &self.errors {
            total += estimate(&error.message);
        }
        if let Some(goal) = &self.current_goal {
            total += estimate(goal);
        }
        total
    }
}

/// Output of a single head
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressedSegment {
    pub head_name: String,
    pub content: String,
    pub tokens: usize,
    /// In `[0, 1]`
    pub importance: f64,
}

/// Fused result of a compression run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressedOutput {
    pub content: String,
    pub segments: Vec<CompressedSegment>,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    pub compression_ratio: f64,
    pub timestamp: DateTime<Utc>,
}

/// Fusion weights per head
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeadWeights {
    pub semantic: f64,
    pub structural: f64,
    pub temporal: f64,
    pub entity: f64,
}

impl Default for HeadWeights {
    fn default() -> Self {
        Self {
            semantic: 0.4,
            structural: 0.3,
            temporal: 0.2,
            entity: 0.1,
        }
    }
}

impl HeadWeights {
    fn for_head(&self, head_name: &str) -> f64 {
        match head_name {
            "semantic" => self.semantic,
            "structural" => self.structural,
            "temporal" => self.temporal,
            "entity" => self.entity,
            _ => 0.0,
        }
    }
}

/// Compressor configuration
#[derive(Debug, Clone)]
pub struct CompressorConfig {
    /// Budget for the fused output
    pub max_output_tokens: usize,
    pub weights: HeadWeights,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            max_output_tokens: 2_000,
            weights: HeadWeights::default(),
        }
    }
}

/// Runs the four heads concurrently and fuses their segments
pub struct MultiHeadCompressor {
    config: CompressorConfig,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl MultiHeadCompressor {
    pub fn new(config: CompressorConfig) -> Self {
        Self {
            config,
            summarizer: None,
        }
    }

    /// Inject the summarization capability used by the semantic head.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Compress a snapshot. The four heads run concurrently; only the
    /// semantic head can suspend (on the summarizer call).
    pub async fn compress(&self, ctx: &RawContext) -> CompressedOutput {
        let (semantic, structural, temporal, entity) = tokio::join!(
            heads::semantic_head(ctx, self.summarizer.clone()),
            async { heads::structural_head(ctx) },
            async { heads::temporal_head(ctx) },
            async { heads::entity_head(ctx) },
        );

        let output = self.fuse(ctx, vec![semantic, structural, temporal, entity]);
        tracing::info!(
            original = output.original_tokens,
            compressed = output.compressed_tokens,
            ratio = output.compression_ratio,
            "context compressed"
        );
        output
    }

    /// Deterministic packing of segments under the output budget.
    fn fuse(&self, ctx: &RawContext, mut segments: Vec<CompressedSegment>) -> CompressedOutput {
        segments.retain(|segment| !segment.content.trim().is_empty());
        segments.sort_by(|a, b| {
            let score_a = a.importance * self.config.weights.for_head(&a.head_name);
            let score_b = b.importance * self.config.weights.for_head(&b.head_name);
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let header = "# Session Context (compressed)\n";
        let mut content = String::from(header);
        let mut total = estimate(header);
        let mut included = Vec::new();

        for segment in segments {
            let section_header = format!("\n## {}\n", segment.head_name);
            let section_cost = estimate(&section_header) + segment.tokens;

            if total + section_cost <= self.config.max_output_tokens {
                content.push_str(&section_header);
                content.push_str(&segment.content);
                total += section_cost;
                included.push(segment);
            } else {
                let remaining = self.config.max_output_tokens.saturating_sub(total);
                if remaining >= TRUNCATION_FLOOR_TOKENS {
                    // approximate the remaining budget as characters
                    let clipped: String =
                        segment.content.chars().take(remaining * 4).collect();
                    let clipped = format!("{clipped}…\n");
                    content.push_str(&section_header);
                    content.push_str(&clipped);
                    let tokens = estimate(&clipped);
                    total += estimate(&section_header) + tokens;
                    included.push(CompressedSegment {
                        head_name: segment.head_name,
                        content: clipped,
                        tokens,
                        importance: segment.importance,
                    });
                }
                break;
            }
        }

        let original_tokens = ctx.total_tokens();
        let compressed_tokens = estimate(&content);
        let compression_ratio = if original_tokens == 0 {
            0.0
        } else {
            compressed_tokens as f64 / original_tokens as f64
        };

        CompressedOutput {
            content,
            segments: included,
            original_tokens,
            compressed_tokens,
            compression_ratio,
            timestamp: Utc::now(),
        }
    }
}

impl Default for MultiHeadCompressor {
    fn default() -> Self {
        Self::new(CompressorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_ctx(calls: usize) -> RawContext {
        RawContext {
            function_calls: (0..calls)
                .map(|i| ContextCall {
                    name: if i % 4 == 0 { "Write" } else { "Read" }.to_string(),
                    summary: format!("processed file number {i} and updated its contents"),
                    args: [(
                        "file_path".to_string(),
                        format!("/project/src/module{i}.rs"),
                    )]
                    .into_iter()
                    .collect(),
                    timestamp: Utc::now() + Duration::seconds(i as i64),
                    status: FcStatus::Success,
                })
                .collect(),
            files: vec!["/project/src/lib.rs".to_string()],
            user_messages: Vec::new(),
            assistant_responses: Vec::new(),
            errors: Vec::new(),
            current_goal: Some("refactor the module tree".to_string()),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_compress_produces_all_heads() {
        let compressor = MultiHeadCompressor::default();
        let output = compressor.compress(&sample_ctx(12)).await;

        let names: Vec<_> = output
            .segments
            .iter()
            .map(|s| s.head_name.as_str())
            .collect();
        assert!(names.contains(&"semantic"));
        assert!(names.contains(&"structural"));
        assert!(names.contains(&"temporal"));
        assert!(names.contains(&"entity"));
        assert!(output.content.starts_with("# Session Context"));
        assert!(output.compressed_tokens > 0);
    }

    #[tokio::test]
    async fn test_segments_sorted_by_weighted_importance() {
        let compressor = MultiHeadCompressor::default();
        let output = compressor.compress(&sample_ctx(12)).await;

        let weights = HeadWeights::default();
        let scores: Vec<f64> = output
            .segments
            .iter()
            .map(|s| s.importance * weights.for_head(&s.head_name))
            .collect();
        for pair in scores.windows(2) {
            assert!(pair[0] >= pair[1], "segments out of order: {scores:?}");
        }
    }

    #[tokio::test]
    async fn test_budget_respected_with_tail_allowance() {
        let compressor = MultiHeadCompressor::new(CompressorConfig {
            max_output_tokens: 120,
            weights: HeadWeights::default(),
        });
        let output = compressor.compress(&sample_ctx(40)).await;

        let segment_total: usize = output.segments.iter().map(|s| s.tokens).sum();
        assert!(
            segment_total <= 120 + TRUNCATION_FLOOR_TOKENS,
            "segment tokens {segment_total} blew the budget"
        );
        assert!(output.compressed_tokens <= 120 + TRUNCATION_FLOOR_TOKENS);
    }

    #[tokio::test]
    async fn test_ratio_uses_shared_estimator() {
        let compressor = MultiHeadCompressor::default();
        let ctx = sample_ctx(20);
        let output = compressor.compress(&ctx).await;

        assert_eq!(output.original_tokens, ctx.total_tokens());
        assert_eq!(output.compressed_tokens, estimate(&output.content));
        let expected = output.compressed_tokens as f64 / output.original_tokens as f64;
        assert!((output.compression_ratio - expected).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_empty_context() {
        let compressor = MultiHeadCompressor::default();
        let output = compressor.compress(&RawContext::default()).await;

        assert!(output.segments.is_empty());
        assert_eq!(output.original_tokens, 0);
        assert_eq!(output.compression_ratio, 0.0);
    }
}
