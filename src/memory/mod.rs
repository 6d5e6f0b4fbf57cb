//! Layered memory
//!
//! Three tiers with different churn rates feed the compressor:
//!
//! - **L1 static** ([`static_layer::StaticKnowledge`]): project tree, code
//!   patterns, command templates, indexed decisions
//! - **L2 session** ([`session_layer::SessionCache`]): recent function
//!   calls, active files, the current goal
//! - **L3 dynamic** ([`dynamic_layer::DynamicContext`]): task stack,
//!   pending decisions, unresolved errors
//!
//! The memory is rebuilt from scratch on session start and can be exported
//! to JSON (and re-imported) for persistence across sessions.

pub mod dynamic_layer;
pub mod session_layer;
pub mod static_layer;

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::compressor::{ContextCall, RawContext};
use crate::error::Result;
use crate::parser::{FcCall, FcStatus};
use crate::session::FcSummary;
use crate::tokens::estimate;

pub use dynamic_layer::{DynamicContext, ErrorRecord};
pub use session_layer::SessionCache;
pub use static_layer::{CodePattern, CommandTemplate, Decision, StaticKnowledge, TreeNode};

/// Per-kind caps applied during relevance retrieval
const MAX_RELEVANT_PATTERNS: usize = 5;
const MAX_RELEVANT_TEMPLATES: usize = 5;
const MAX_RELEVANT_DECISIONS: usize = 3;

/// Argument keys treated as file references
const FILE_ARG_KEYS: [&str; 3] = ["file_path", "path", "notebook_path"];

/// Result of a relevance query against the memory
#[derive(Debug, Clone)]
pub struct RelevantContext {
    pub static_summary: String,
    pub session_summary: String,
    pub dynamic_summary: String,
    pub total_tokens: usize,
    /// Retrieved tokens over the tokens of everything searched
    pub compression_ratio: f64,
}

/// The three-tier memory plus the raw-call window the compressor snapshots
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayeredMemory {
    pub static_knowledge: StaticKnowledge,
    pub session_cache: SessionCache,
    pub dynamic_context: DynamicContext,
    /// Recent calls with their arguments, bounded like the L2 FC window;
    /// source material for [`LayeredMemory::snapshot`]
    recent_calls: VecDeque<ContextCall>,
}

impl LayeredMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb one completed function call and its summary into all layers.
    pub fn observe_call(&mut self, call: &FcCall, summary: &FcSummary) {
        self.session_cache.push_fc(summary.clone());

        for key in FILE_ARG_KEYS {
            if let Some(path) = call.args.get(key) {
                self.session_cache.touch_file(path);
            }
        }

        if let Some(command) = call.args.get("command") {
            let key = command.split_whitespace().next().unwrap_or(command);
            self.static_knowledge
                .record_template(key, &format!("{} command", call.name), Some(command));
        }

        if call.status == FcStatus::Error {
            let message = call.error.as_deref().unwrap_or("unknown error");
            self.dynamic_context.record_error(message, Some(&call.name));
        }

        self.recent_calls.push_back(ContextCall {
            name: call.name.clone(),
            summary: summary.summary.clone(),
            args: call.args.clone(),
            timestamp: call.end_time,
            status: call.status,
        });
        while self.recent_calls.len() > self.session_cache.max_recent_fcs {
            self.recent_calls.pop_front();
        }
    }

    pub fn set_goal(&mut self, goal: &str) {
        self.session_cache.current_goal = Some(goal.to_string());
    }

    pub fn set_working_directory(&mut self, dir: &str) {
        self.session_cache.working_directory = Some(dir.to_string());
    }

    pub fn set_project_tree(&mut self, tree: TreeNode) {
        self.static_knowledge.project_tree = Some(tree);
    }

    /// Build the snapshot the multi-head compressor consumes.
    pub fn snapshot(&self) -> RawContext {
        RawContext {
            function_calls: self.recent_calls.iter().cloned().collect(),
            files: self.session_cache.active_files().to_vec(),
            user_messages: Vec::new(),
            assistant_responses: Vec::new(),
            errors: self.dynamic_context.errors().cloned().collect(),
            current_goal: self.session_cache.current_goal.clone(),
            metadata: Default::default(),
        }
    }

    /// Query the memory with a case-insensitive substring match and
    /// assemble per-layer summaries under a token budget.
    pub fn retrieve_relevant_context(&self, query: &str, max_tokens: usize) -> RelevantContext {
        let needle = query.to_lowercase();

        let mut patterns: Vec<&CodePattern> = self
            .static_knowledge
            .patterns()
            .filter(|p| {
                contains(&p.name, &needle)
                    || contains(&p.description, &needle)
                    || contains(&p.category, &needle)
            })
            .collect();
        patterns.sort_by(|a, b| b.frequency.cmp(&a.frequency));
        patterns.truncate(MAX_RELEVANT_PATTERNS);

        let mut templates: Vec<&CommandTemplate> = self
            .static_knowledge
            .templates()
            .filter(|t| contains(&t.command, &needle) || contains(&t.description, &needle))
            .collect();
        templates.sort_by(|a, b| b.frequency.cmp(&a.frequency));
        templates.truncate(MAX_RELEVANT_TEMPLATES);

        let mut decisions: Vec<&Decision> = self
            .static_knowledge
            .decisions()
            .iter()
            .filter(|d| {
                contains(&d.context, &needle)
                    || contains(&d.decision, &needle)
                    || d.tags.iter().any(|tag| contains(tag, &needle))
            })
            .collect();
        decisions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        decisions.truncate(MAX_RELEVANT_DECISIONS);

        let mut static_summary = String::new();
        if !patterns.is_empty() {
            static_summary.push_str("## Patterns\n");
            for p in &patterns {
                static_summary.push_str(&format!(
                    "- {} ({}, seen {}×): {}\n",
                    p.name, p.category, p.frequency, p.description
                ));
            }
        }
        if !templates.is_empty() {
            static_summary.push_str("## Commands\n");
            for t in &templates {
                static_summary.push_str(&format!("- {} (seen {}×): {}\n", t.command, t.frequency, t.description));
            }
        }
        if !decisions.is_empty() {
            static_summary.push_str("## Decisions\n");
            for d in &decisions {
                static_summary.push_str(&format!("- {}: {}\n", d.context, d.decision));
            }
        }
        if let Some(outline) = self.static_knowledge.render_tree_outline() {
            static_summary.push_str("## Project layout\n");
            static_summary.push_str(&outline);
        }

        let mut session_summary = String::new();
        if let Some(goal) = &self.session_cache.current_goal {
            session_summary.push_str(&format!("Goal: {goal}\n"));
        }
        if let Some(dir) = &self.session_cache.working_directory {
            session_summary.push_str(&format!("Working directory: {dir}\n"));
        }
        if self.session_cache.recent_fc_count() > 0 {
            session_summary.push_str("Recent calls:\n");
            for fc in self.session_cache.recent_fcs() {
                session_summary.push_str(&format!("- {}: {}\n", fc.fc_name, fc.summary));
            }
        }
        if !self.session_cache.active_files().is_empty() {
            session_summary.push_str(&format!(
                "Active files: {}\n",
                self.session_cache.active_files().join(", ")
            ));
        }

        let mut dynamic_summary = String::new();
        if let Some(task) = self.dynamic_context.current_task() {
            dynamic_summary.push_str(&format!("Current task: {task}\n"));
        }
        if !self.dynamic_context.pending_decisions.is_empty() {
            dynamic_summary.push_str(&format!(
                "Pending decisions: {}\n",
                self.dynamic_context.pending_decisions.join("; ")
            ));
        }
        if self.dynamic_context.error_count() > 0 {
            dynamic_summary.push_str("Unresolved errors:\n");
            for error in self.dynamic_context.errors() {
                dynamic_summary.push_str(&format!(
                    "- {}{}\n",
                    error.message,
                    error
                        .fc_name
                        .as_deref()
                        .map(|n| format!(" ({n})"))
                        .unwrap_or_default()
                ));
            }
        }

        // keep the assembled context under the budget, one third per layer
        let per_section = max_tokens / 3;
        let total: usize = [&static_summary, &session_summary, &dynamic_summary]
            .iter()
            .map(|s| estimate(s))
            .sum();
        if total > max_tokens {
            static_summary = clip_to_tokens(&static_summary, per_section);
            session_summary = clip_to_tokens(&session_summary, per_section);
            dynamic_summary = clip_to_tokens(&dynamic_summary, per_section);
        }

        let total_tokens = estimate(&static_summary) + estimate(&session_summary) + estimate(&dynamic_summary);
        let original_tokens = self.searchable_tokens();
        let compression_ratio = if original_tokens == 0 {
            1.0
        } else {
            total_tokens as f64 / original_tokens as f64
        };

        RelevantContext {
            static_summary,
            session_summary,
            dynamic_summary,
            total_tokens,
            compression_ratio,
        }
    }

    /// Token estimate over everything retrieval can search.
    fn searchable_tokens(&self) -> usize {
        let mut total = 0;
        for p in self.static_knowledge.patterns() {
            total += estimate(&p.name) + estimate(&p.description) + estimate(&p.category);
        }
        for t in self.static_knowledge.templates() {
            total += estimate(&t.command) + estimate(&t.description);
        }
        for d in self.static_knowledge.decisions() {
            total += estimate(&d.context) + estimate(&d.decision);
        }
        for fc in self.session_cache.recent_fcs() {
            total += estimate(&fc.summary);
        }
        for file in self.session_cache.active_files() {
            total += estimate(file);
        }
        for error in self.dynamic_context.errors() {
            total += estimate(&error.message);
        }
        total
    }

    /// Serialize the whole memory to JSON.
    pub fn export(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Rebuild a memory from exported JSON.
    pub fn import(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

fn contains(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

/// Approximate clip to a token budget (4 chars per token).
fn clip_to_tokens(text: &str, max_tokens: usize) -> String {
    let max_chars = max_tokens * 4;
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn call(name: &str, args: &[(&str, &str)], error: Option<&str>) -> FcCall {
        FcCall {
            id: name.to_string(),
            name: name.to_string(),
            args: args
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            result: "ok".to_string(),
            start_time: Utc::now(),
            end_time: Utc::now(),
            duration_ms: 1,
            tokens: 1,
            status: if error.is_some() {
                FcStatus::Error
            } else {
                FcStatus::Success
            },
            error: error.map(str::to_string),
            summary: String::new(),
        }
    }

    fn summary_for(call: &FcCall) -> FcSummary {
        FcSummary {
            fc_id: call.id.clone(),
            fc_name: call.name.clone(),
            summary: format!("{} ran", call.name),
            tokens: 1,
            timestamp: call.end_time,
        }
    }

    #[test]
    fn test_observe_call_feeds_all_layers() {
        let mut memory = LayeredMemory::new();

        let read = call("Read", &[("file_path", "/src/main.rs")], None);
        memory.observe_call(&read, &summary_for(&read));

        let bash = call("Bash", &[("command", "cargo test --lib")], Some("exit 1"));
        memory.observe_call(&bash, &summary_for(&bash));

        assert_eq!(memory.session_cache.recent_fc_count(), 2);
        assert_eq!(memory.session_cache.active_files(), &["/src/main.rs"]);
        assert!(memory.static_knowledge.get_template("cargo").is_some());
        assert_eq!(memory.dynamic_context.error_count(), 1);
    }

    #[test]
    fn test_bounds_hold_under_load() {
        let mut memory = LayeredMemory::new();
        for i in 0..200 {
            let name = format!("Read{i}");
            let path = format!("/f{i}.rs");
            let c = call(
                &name,
                &[("file_path", path.as_str())],
                (i % 3 == 0).then_some("boom"),
            );
            memory.observe_call(&c, &summary_for(&c));
        }

        assert!(memory.session_cache.recent_fc_count() <= memory.session_cache.max_recent_fcs);
        assert!(memory.session_cache.active_files().len() <= memory.session_cache.max_active_files);
        assert!(memory.dynamic_context.error_count() <= dynamic_layer::MAX_ERRORS);
        assert!(memory.snapshot().function_calls.len() <= memory.session_cache.max_recent_fcs);
    }

    #[test]
    fn test_retrieval_matches_and_caps() {
        let mut memory = LayeredMemory::new();
        for i in 0..8 {
            let name = format!("async-worker-{i}");
            // make the first pattern strictly the most frequent
            for _ in 0..(if i == 0 { 3 } else { 1 }) {
                memory.static_knowledge.record_pattern(
                    &name,
                    "spawn background worker",
                    "concurrency",
                    None,
                );
            }
        }
        memory
            .static_knowledge
            .record_pattern("unrelated", "logging setup", "observability", None);
        memory
            .static_knowledge
            .record_decision("worker pool", "bound to 4 workers", vec!["concurrency".into()]);

        let relevant = memory.retrieve_relevant_context("worker", 2_000);
        assert!(relevant.static_summary.contains("async-worker-0"));
        assert!(!relevant.static_summary.contains("logging setup"));
        // patterns capped at 5
        assert_eq!(relevant.static_summary.matches("async-worker-").count(), 5);
        assert!(relevant.static_summary.contains("bound to 4 workers"));
        assert!(relevant.total_tokens > 0);
        assert!(relevant.compression_ratio > 0.0);
    }

    #[test]
    fn test_retrieval_respects_budget() {
        let mut memory = LayeredMemory::new();
        for i in 0..50 {
            let path = format!("/long/path/file{i}.rs");
            let c = call("Read", &[("file_path", path.as_str())], None);
            let mut s = summary_for(&c);
            s.summary = format!("read a fairly long file number {i} with lots of text");
            memory.observe_call(&c, &s);
        }

        let relevant = memory.retrieve_relevant_context("file", 50);
        assert!(relevant.total_tokens <= 60, "budget overshot: {}", relevant.total_tokens);
    }

    #[test]
    fn test_export_import_roundtrip() {
        let mut memory = LayeredMemory::new();
        memory.set_goal("ship the parser");
        memory.set_working_directory("/proj");
        memory
            .static_knowledge
            .record_pattern("p", "d", "c", Some("ex"));
        memory
            .static_knowledge
            .record_decision("ctx", "dec", vec!["tag".into()]);
        memory.dynamic_context.push_task("task-1");
        let c = call("Read", &[("file_path", "/a.rs")], None);
        memory.observe_call(&c, &summary_for(&c));

        let exported = memory.export().unwrap();
        let imported = LayeredMemory::import(exported.clone()).unwrap();
        let re_exported = imported.export().unwrap();
        assert_eq!(exported, re_exported);

        assert_eq!(
            imported.session_cache.current_goal.as_deref(),
            Some("ship the parser")
        );
        assert_eq!(imported.dynamic_context.current_task(), Some("task-1"));
        assert_eq!(imported.session_cache.active_files(), &["/a.rs"]);
    }
}
