//! L3: dynamic task and error context
//!
//! The fastest-moving layer: the task stack the agent is working through,
//! decisions still waiting on the user, and a rolling window of unresolved
//! errors.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Errors retained in the rolling window
pub const MAX_ERRORS: usize = 10;

/// One captured error with its origin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub message: String,
    pub fc_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// The dynamic context layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicContext {
    pub pending_decisions: Vec<String>,
    error_context: VecDeque<ErrorRecord>,
    task_stack: Vec<String>,
}

impl DynamicContext {
    /// Push a task; it becomes the current task.
    pub fn push_task(&mut self, task: &str) {
        self.task_stack.push(task.to_string());
    }

    /// Pop the current task, exposing the one beneath it.
    pub fn pop_task(&mut self) -> Option<String> {
        self.task_stack.pop()
    }

    /// Top of the task stack.
    pub fn current_task(&self) -> Option<&str> {
        self.task_stack.last().map(String::as_str)
    }

    pub fn task_stack(&self) -> &[String] {
        &self.task_stack
    }

    /// Record an error, evicting the oldest past the window size.
    pub fn record_error(&mut self, message: &str, fc_name: Option<&str>) {
        self.error_context.push_back(ErrorRecord {
            message: message.to_string(),
            fc_name: fc_name.map(str::to_string),
            timestamp: Utc::now(),
        });
        while self.error_context.len() > MAX_ERRORS {
            self.error_context.pop_front();
        }
    }

    pub fn errors(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.error_context.iter()
    }

    pub fn error_count(&self) -> usize {
        self.error_context.len()
    }

    pub fn add_pending_decision(&mut self, decision: &str) {
        self.pending_decisions.push(decision.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_stack_mirrors_top() {
        let mut l3 = DynamicContext::default();
        assert!(l3.current_task().is_none());

        l3.push_task("implement parser");
        l3.push_task("fix edge case");
        assert_eq!(l3.current_task(), Some("fix edge case"));

        assert_eq!(l3.pop_task().as_deref(), Some("fix edge case"));
        assert_eq!(l3.current_task(), Some("implement parser"));
    }

    #[test]
    fn test_error_window_bounded() {
        let mut l3 = DynamicContext::default();
        for i in 0..(MAX_ERRORS + 5) {
            l3.record_error(&format!("boom {i}"), Some("Bash"));
        }

        assert_eq!(l3.error_count(), MAX_ERRORS);
        let first = l3.errors().next().unwrap();
        assert_eq!(first.message, "boom 5");
    }
}
