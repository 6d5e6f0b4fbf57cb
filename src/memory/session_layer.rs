//! L2: bounded session cache
//!
//! Recent activity for the running session: a FIFO window of function-call
//! summaries, an insertion-ordered set of active files, and the current
//! goal. Every structure is bounded, so the cache never grows past its
//! configured capacities regardless of session length.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::FcSummary;

pub const DEFAULT_MAX_RECENT_FCS: usize = 50;
pub const DEFAULT_MAX_ACTIVE_FILES: usize = 20;

/// The session cache layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCache {
    recent_fcs: VecDeque<FcSummary>,
    pub max_recent_fcs: usize,
    /// Insertion-ordered, no duplicates
    active_files: Vec<String>,
    pub max_active_files: usize,
    pub current_goal: Option<String>,
    pub working_directory: Option<String>,
    pub session_start_time: DateTime<Utc>,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self {
            recent_fcs: VecDeque::new(),
            max_recent_fcs: DEFAULT_MAX_RECENT_FCS,
            active_files: Vec::new(),
            max_active_files: DEFAULT_MAX_ACTIVE_FILES,
            current_goal: None,
            working_directory: None,
            session_start_time: Utc::now(),
        }
    }
}

impl SessionCache {
    /// Append a summary, evicting the oldest once the window is full.
    pub fn push_fc(&mut self, summary: FcSummary) {
        self.recent_fcs.push_back(summary);
        while self.recent_fcs.len() > self.max_recent_fcs {
            self.recent_fcs.pop_front();
        }
    }

    /// Mark a file active. Re-touching an already-active file keeps its
    /// original position.
    pub fn touch_file(&mut self, path: &str) {
        if self.active_files.iter().any(|existing| existing == path) {
            return;
        }
        self.active_files.push(path.to_string());
        while self.active_files.len() > self.max_active_files {
            self.active_files.remove(0);
        }
    }

    pub fn recent_fcs(&self) -> impl Iterator<Item = &FcSummary> {
        self.recent_fcs.iter()
    }

    pub fn recent_fc_count(&self) -> usize {
        self.recent_fcs.len()
    }

    pub fn active_files(&self) -> &[String] {
        &self.active_files
    }
}
