//! L1: static project knowledge
//!
//! Slow-changing facts about the project: the directory tree, recognized
//! code patterns, command templates, and indexed decisions. Lookups are
//! O(1) by key; decisions are additionally indexed by tag into bounded
//! per-tag lists.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Examples kept per pattern or template
pub const MAX_EXAMPLES: usize = 5;
/// Decisions kept per tag before the oldest is evicted
pub const MAX_DECISIONS_PER_TAG: usize = 100;

/// Node of the scanned project tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub name: String,
    pub is_dir: bool,
    #[serde(default)]
    pub children: Vec<TreeNode>,
    /// Children that existed but were not recorded
    #[serde(default)]
    pub truncated: usize,
}

impl TreeNode {
    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dir: true,
            children: Vec::new(),
            truncated: 0,
        }
    }

    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dir: false,
            children: Vec::new(),
            truncated: 0,
        }
    }
}

/// A recurring code construct seen in the project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodePattern {
    pub name: String,
    pub description: String,
    pub category: String,
    /// Monotonically increasing observation count
    pub frequency: u32,
    pub examples: Vec<String>,
    pub last_seen: DateTime<Utc>,
}

/// A shell command the agent keeps reaching for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandTemplate {
    pub command: String,
    pub description: String,
    pub frequency: u32,
    pub examples: Vec<String>,
    pub last_seen: DateTime<Utc>,
}

/// A recorded decision with its tags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub context: String,
    pub decision: String,
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// The static knowledge layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticKnowledge {
    pub project_tree: Option<TreeNode>,
    patterns: HashMap<String, CodePattern>,
    templates: HashMap<String, CommandTemplate>,
    decisions: Vec<Decision>,
    tag_index: HashMap<String, VecDeque<usize>>,
    pub last_updated: DateTime<Utc>,
}

impl Default for StaticKnowledge {
    fn default() -> Self {
        Self {
            project_tree: None,
            patterns: HashMap::new(),
            templates: HashMap::new(),
            decisions: Vec::new(),
            tag_index: HashMap::new(),
            last_updated: Utc::now(),
        }
    }
}

impl StaticKnowledge {
    /// Insert or reinforce a code pattern. Frequency only ever grows;
    /// examples are deduplicated and bounded.
    pub fn record_pattern(
        &mut self,
        name: &str,
        description: &str,
        category: &str,
        example: Option<&str>,
    ) {
        let now = Utc::now();
        let pattern = self
            .patterns
            .entry(name.to_string())
            .or_insert_with(|| CodePattern {
                name: name.to_string(),
                description: description.to_string(),
                category: category.to_string(),
                frequency: 0,
                examples: Vec::new(),
                last_seen: now,
            });
        pattern.frequency += 1;
        pattern.last_seen = now;
        if let Some(example) = example {
            push_example(&mut pattern.examples, example);
        }
        self.last_updated = now;
    }

    /// Insert or reinforce a command template, keyed by the command text.
    pub fn record_template(&mut self, command: &str, description: &str, example: Option<&str>) {
        let now = Utc::now();
        let template = self
            .templates
            .entry(command.to_string())
            .or_insert_with(|| CommandTemplate {
                command: command.to_string(),
                description: description.to_string(),
                frequency: 0,
                examples: Vec::new(),
                last_seen: now,
            });
        template.frequency += 1;
        template.last_seen = now;
        if let Some(example) = example {
            push_example(&mut template.examples, example);
        }
        self.last_updated = now;
    }

    /// Record a decision and index it under each of its tags.
    pub fn record_decision(&mut self, context: &str, decision: &str, tags: Vec<String>) {
        let index = self.decisions.len();
        self.decisions.push(Decision {
            context: context.to_string(),
            decision: decision.to_string(),
            tags: tags.clone(),
            timestamp: Utc::now(),
        });

        for tag in tags {
            let bucket = self.tag_index.entry(tag).or_default();
            bucket.push_back(index);
            if bucket.len() > MAX_DECISIONS_PER_TAG {
                bucket.pop_front();
            }
        }
        self.last_updated = Utc::now();
    }

    pub fn get_pattern(&self, name: &str) -> Option<&CodePattern> {
        self.patterns.get(name)
    }

    pub fn get_template(&self, command: &str) -> Option<&CommandTemplate> {
        self.templates.get(command)
    }

    pub fn patterns(&self) -> impl Iterator<Item = &CodePattern> {
        self.patterns.values()
    }

    pub fn templates(&self) -> impl Iterator<Item = &CommandTemplate> {
        self.templates.values()
    }

    pub fn decisions(&self) -> &[Decision] {
        &self.decisions
    }

    /// Decisions indexed under a tag, oldest first.
    pub fn decisions_for_tag(&self, tag: &str) -> Vec<&Decision> {
        self.tag_index
            .get(tag)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter_map(|&index| self.decisions.get(index))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Render the project tree as an indented outline, depth-capped at 3
    /// with at most 10 children listed per directory.
    pub fn render_tree_outline(&self) -> Option<String> {
        const MAX_DEPTH: usize = 3;
        const MAX_CHILDREN: usize = 10;

        fn walk(node: &TreeNode, depth: usize, out: &mut String) {
            let indent = "  ".repeat(depth);
            let suffix = if node.is_dir { "/" } else { "" };
            out.push_str(&format!("{indent}{}{suffix}\n", node.name));

            if !node.is_dir || depth >= MAX_DEPTH {
                return;
            }
            for child in node.children.iter().take(MAX_CHILDREN) {
                walk(child, depth + 1, out);
            }
            let hidden = node.children.len().saturating_sub(MAX_CHILDREN) + node.truncated;
            if hidden > 0 {
                let indent = "  ".repeat(depth + 1);
                out.push_str(&format!("{indent}… and {hidden} more\n"));
            }
        }

        self.project_tree.as_ref().map(|root| {
            let mut out = String::new();
            walk(root, 0, &mut out);
            out
        })
    }
}

fn push_example(examples: &mut Vec<String>, example: &str) {
    if examples.iter().any(|existing| existing == example) {
        return;
    }
    examples.push(example.to_string());
    if examples.len() > MAX_EXAMPLES {
        examples.remove(0);
    }
}
