//! Compression heads
//!
//! Each head is a specialized projection of the raw context into one
//! weighted segment. The semantic head may call the pluggable summarizer;
//! every other head is rule-based, and the semantic head degrades to a
//! rule-based extraction when the capability fails.

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::parser::FcStatus;
use crate::summarizer::Summarizer;
use crate::tokens::estimate;

use super::{CompressedSegment, ContextCall, RawContext};

/// Files listed per action group in the structural head
const MAX_FILES_PER_GROUP: usize = 10;
/// Events selected by the temporal head
const MAX_KEY_EVENTS: usize = 10;
/// Entity caps: files, functions, variables, dependencies
const MAX_ENTITY_FILES: usize = 10;
const MAX_ENTITY_FUNCTIONS: usize = 10;
const MAX_ENTITY_VARIABLES: usize = 10;
const MAX_ENTITY_DEPS: usize = 5;

static FILE_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\w@~./-]*/[\w./-]+\.\w{1,8}").unwrap());
static FUNCTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([a-zA-Z_][a-zA-Z0-9_]{2,})\s*\(").unwrap());
static VARIABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:const|let|var)\s+([a-zA-Z_$][\w$]*)").unwrap());
static DEPENDENCY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"npm (?:i|install)\s+([@\w/.-]+)").unwrap());

static TEMPORAL_KEYWORDS: [&str; 6] = ["error", "success", "complete", "create", "delete", "fix"];
static CODE_KEYWORDS: [&str; 6] = ["import", "export", "function", "class", "test", "config"];

/// Semantic head: goal, decisions, and outcomes. Prompt-driven when a
/// summarizer is available, rule-based otherwise.
pub async fn semantic_head(
    ctx: &RawContext,
    summarizer: Option<Arc<dyn Summarizer>>,
) -> CompressedSegment {
    if let Some(summarizer) = summarizer {
        let prompt = build_semantic_prompt(ctx);
        match summarizer.summarize(&prompt).await {
            Ok(content) if !content.trim().is_empty() => {
                let content = content.trim().to_string();
                return CompressedSegment {
                    head_name: "semantic".to_string(),
                    tokens: estimate(&content),
                    content,
                    importance: 0.9,
                };
            }
            Ok(_) => {
                tracing::debug!("summarizer returned empty semantic summary, falling back");
            }
            Err(e) => {
                tracing::warn!(error = %e, "semantic head summarizer failed, falling back");
            }
        }
    }

    let content = rule_based_semantic(ctx);
    CompressedSegment {
        head_name: "semantic".to_string(),
        tokens: estimate(&content),
        content,
        importance: 0.8,
    }
}

fn build_semantic_prompt(ctx: &RawContext) -> String {
    let mut prompt = String::from(
        "Extract the session goal, the decisions made, and their outcomes from this activity log.\n",
    );
    if let Some(goal) = &ctx.current_goal {
        prompt.push_str(&format!("Goal: {goal}\n"));
    }
    for call in ctx.function_calls.iter().rev().take(20) {
        prompt.push_str(&format!("- {}: {}\n", call.name, call.summary));
    }
    for error in ctx.errors.iter().rev().take(5) {
        prompt.push_str(&format!("! {}\n", error.message));
    }
    prompt
}

fn rule_based_semantic(ctx: &RawContext) -> String {
    let mut out = String::new();
    if let Some(goal) = &ctx.current_goal {
        out.push_str(&format!("Goal: {goal}\n"));
    }

    let recent: Vec<&ContextCall> = ctx.function_calls.iter().rev().take(10).collect();
    if !recent.is_empty() {
        out.push_str("Recent activity:\n");
        for call in recent.iter().rev() {
            out.push_str(&format!("- {}: {}\n", call.name, call.summary));
        }
    }

    let errors: Vec<_> = ctx.errors.iter().rev().take(3).collect();
    if !errors.is_empty() {
        out.push_str("Errors:\n");
        for error in errors.iter().rev() {
            out.push_str(&format!("- {}\n", error.message));
        }
    }
    out
}

/// Structural head: files grouped by action, plus code-shape keywords
/// spotted in recent summaries.
pub fn structural_head(ctx: &RawContext) -> CompressedSegment {
    // group files by the action that touched them, preserving name order
    let mut groups: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
    for call in &ctx.function_calls {
        let action = classify_action(&call.name);
        let Some(action) = action else { continue };
        for path in file_args(call) {
            let bucket = groups.entry(action).or_default();
            if !bucket.iter().any(|existing| existing == &path) {
                let annotated = match line_count(call) {
                    Some(lines) => format!("{path} ({lines} lines)"),
                    None => path,
                };
                bucket.push(annotated);
            }
        }
    }

    let mut out = String::new();
    for (action, files) in &groups {
        out.push_str(&format!("{action}:\n"));
        for file in files.iter().take(MAX_FILES_PER_GROUP) {
            out.push_str(&format!("  - {file}\n"));
        }
        if files.len() > MAX_FILES_PER_GROUP {
            out.push_str(&format!("  … and {} more\n", files.len() - MAX_FILES_PER_GROUP));
        }
    }

    let mut seen_keywords = Vec::new();
    for keyword in CODE_KEYWORDS {
        if ctx
            .function_calls
            .iter()
            .any(|call| call.summary.to_lowercase().contains(keyword))
        {
            seen_keywords.push(keyword);
        }
    }
    if !seen_keywords.is_empty() {
        out.push_str(&format!("Code activity: {}\n", seen_keywords.join(", ")));
    }

    CompressedSegment {
        head_name: "structural".to_string(),
        tokens: estimate(&out),
        content: out,
        importance: 0.7,
    }
}

fn classify_action(name: &str) -> Option<&'static str> {
    let lower = name.to_lowercase();
    if lower.contains("read") || lower.contains("open") || lower.contains("cat") {
        Some("read")
    } else if lower.contains("write") || lower.contains("create") {
        Some("write")
    } else if lower.contains("edit") || lower.contains("patch") || lower.contains("update") {
        Some("edit")
    } else if lower.contains("delete") || lower.contains("remove") {
        Some("delete")
    } else {
        None
    }
}

fn file_args(call: &ContextCall) -> Vec<String> {
    ["file_path", "path", "notebook_path"]
        .iter()
        .filter_map(|key| call.args.get(*key))
        .cloned()
        .collect()
}

fn line_count(call: &ContextCall) -> Option<usize> {
    call.args
        .get("content")
        .or_else(|| call.args.get("new_string"))
        .map(|content| content.lines().count())
}

/// Temporal head: first, last, keyword-flagged, and evenly spaced events.
pub fn temporal_head(ctx: &RawContext) -> CompressedSegment {
    let mut ordered: Vec<&ContextCall> = ctx.function_calls.iter().collect();
    ordered.sort_by_key(|call| call.timestamp);

    let mut selected: Vec<usize> = Vec::new();
    if !ordered.is_empty() {
        selected.push(0);
        if ordered.len() > 1 {
            selected.push(ordered.len() - 1);
        }
    }

    // keyword matches next
    for (index, call) in ordered.iter().enumerate() {
        if selected.len() >= MAX_KEY_EVENTS {
            break;
        }
        let text = format!("{} {}", call.name, call.summary).to_lowercase();
        let flagged = call.status == FcStatus::Error
            || TEMPORAL_KEYWORDS.iter().any(|k| text.contains(k));
        if flagged && !selected.contains(&index) {
            selected.push(index);
        }
    }

    // evenly spaced filler until the cap
    if ordered.len() > selected.len() {
        let step = (ordered.len() / MAX_KEY_EVENTS).max(1);
        let mut index = 0;
        while index < ordered.len() && selected.len() < MAX_KEY_EVENTS {
            if !selected.contains(&index) {
                selected.push(index);
            }
            index += step;
        }
    }

    selected.sort_unstable();
    let mut out = String::new();
    if !selected.is_empty() {
        out.push_str("Timeline:\n");
        for index in selected {
            let call = ordered[index];
            out.push_str(&format!(
                "- [{}] {}: {}\n",
                call.timestamp.format("%H:%M:%S"),
                call.name,
                call.summary
            ));
        }
    }

    CompressedSegment {
        head_name: "temporal".to_string(),
        tokens: estimate(&out),
        content: out,
        importance: 0.5,
    }
}

/// Entity head: file paths, function names, variables, and dependencies
/// pulled out with regexes, each list bounded.
pub fn entity_head(ctx: &RawContext) -> CompressedSegment {
    let mut files = Vec::new();
    let mut functions = Vec::new();
    let mut variables = Vec::new();
    let mut deps = Vec::new();

    for path in &ctx.files {
        push_unique(&mut files, path.clone(), MAX_ENTITY_FILES);
    }

    for call in &ctx.function_calls {
        for value in call.args.values() {
            for capture in FILE_PATH_RE.find_iter(value) {
                push_unique(&mut files, capture.as_str().to_string(), MAX_ENTITY_FILES);
            }
            for capture in VARIABLE_RE.captures_iter(value) {
                push_unique(&mut variables, capture[1].to_string(), MAX_ENTITY_VARIABLES);
            }
            for capture in DEPENDENCY_RE.captures_iter(value) {
                push_unique(&mut deps, capture[1].to_string(), MAX_ENTITY_DEPS);
            }
        }
        for capture in FUNCTION_RE.captures_iter(&call.summary) {
            push_unique(&mut functions, capture[1].to_string(), MAX_ENTITY_FUNCTIONS);
        }
    }

    let mut out = String::new();
    if !files.is_empty() {
        out.push_str(&format!("Files: {}\n", files.join(", ")));
    }
    if !functions.is_empty() {
        out.push_str(&format!("Functions: {}\n", functions.join(", ")));
    }
    if !variables.is_empty() {
        out.push_str(&format!("Variables: {}\n", variables.join(", ")));
    }
    if !deps.is_empty() {
        out.push_str(&format!("Dependencies: {}\n", deps.join(", ")));
    }

    CompressedSegment {
        head_name: "entity".to_string(),
        tokens: estimate(&out),
        content: out,
        importance: 0.4,
    }
}

fn push_unique(list: &mut Vec<String>, value: String, cap: usize) {
    if list.len() >= cap || list.contains(&value) {
        return;
    }
    list.push(value);
}
