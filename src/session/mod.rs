//! In-memory session management
//!
//! The [`SessionManager`] keeps the live projection of the current session:
//! accumulated tokens, function-call count, and the rolling list of
//! per-call summaries. It derives the tri-level threshold status from the
//! configured context window and emits lifecycle events on the bus as the
//! session progresses. Durable state lives in the session store; the
//! manager only mirrors what the orchestrator needs to make decisions
//! without touching disk.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::events::{EventBus, SessionEvent};
use crate::store::{SessionMeta, SessionStatus};
use crate::summarizer::{truncate_chars, Summarizer};
use crate::tokens::estimate;

/// Maximum characters in a per-call summary
pub const MAX_SUMMARY_CHARS: usize = 100;
/// Summaries shown in the generated session report
const RECENT_IN_REPORT: usize = 10;

/// Context usage status derived from token accumulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdLevel {
    #[default]
    Normal,
    Warning,
    Critical,
}

/// Compact record of one summarized function call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FcSummary {
    pub fc_id: String,
    pub fc_name: String,
    /// At most [`MAX_SUMMARY_CHARS`] characters
    pub summary: String,
    pub tokens: usize,
    pub timestamp: DateTime<Utc>,
}

/// Live view of the session being recorded
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    pub id: String,
    pub project_path: String,
    pub project_hash: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub token_count: usize,
    pub fc_count: usize,
    pub summaries: Vec<FcSummary>,
}

/// What [`SessionManager::add_function_call`] observed
#[derive(Debug, Clone)]
pub struct AddOutcome {
    pub summary: FcSummary,
    pub level: ThresholdLevel,
    /// Set when this call moved the level upward
    pub crossed: Option<ThresholdLevel>,
}

/// Threshold portion of the runtime config
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub max_context_tokens: usize,
    pub context_threshold: usize,
    pub auto_summarize: bool,
}

impl From<&RuntimeConfig> for ManagerConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            max_context_tokens: config.max_context_tokens,
            context_threshold: config.context_threshold,
            auto_summarize: config.auto_summarize,
        }
    }
}

/// Manager for the in-memory session projection
pub struct SessionManager {
    config: ManagerConfig,
    summarizer: Option<Arc<dyn Summarizer>>,
    bus: EventBus,
    current: Option<ActiveSession>,
    history: Vec<ActiveSession>,
    last_level: ThresholdLevel,
}

impl SessionManager {
    pub fn new(config: ManagerConfig, bus: EventBus) -> Self {
        Self {
            config,
            summarizer: None,
            bus,
            current: None,
            history: Vec::new(),
            last_level: ThresholdLevel::Normal,
        }
    }

    /// Inject the summarization capability.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Replace the summarization capability in place.
    pub fn set_summarizer(&mut self, summarizer: Arc<dyn Summarizer>) {
        self.summarizer = Some(summarizer);
    }

    pub fn current(&self) -> Option<&ActiveSession> {
        self.current.as_ref()
    }

    pub fn history(&self) -> &[ActiveSession] {
        &self.history
    }

    /// Start a fresh session for a project path, completing any session
    /// already in flight.
    pub fn create_session(&mut self, project_path: &Path) -> &ActiveSession {
        let identity = crate::store::ProjectIdentity::resolve(project_path);
        let session = ActiveSession {
            id: Uuid::new_v4().to_string(),
            project_path: identity.normalized_path,
            project_hash: identity.hash,
            start_time: Utc::now(),
            end_time: None,
            status: SessionStatus::Active,
            token_count: 0,
            fc_count: 0,
            summaries: Vec::new(),
        };
        self.install(session)
    }

    /// Mirror a session already created in the store.
    pub fn create_session_from(&mut self, meta: &SessionMeta) -> &ActiveSession {
        let session = ActiveSession {
            id: meta.id.clone(),
            project_path: meta.project_path.clone(),
            project_hash: meta.project_hash.clone(),
            start_time: meta.start_time,
            end_time: None,
            status: SessionStatus::Active,
            token_count: meta.token_count,
            fc_count: meta.fc_count,
            summaries: Vec::new(),
        };
        self.install(session)
    }

    fn install(&mut self, session: ActiveSession) -> &ActiveSession {
        if self.current.is_some() {
            self.complete_session();
        }
        self.last_level = ThresholdLevel::Normal;
        self.bus.emit(SessionEvent::SessionCreated {
            session_id: session.id.clone(),
            project_path: session.project_path.clone(),
            timestamp: Utc::now(),
        });
        self.current.insert(session)
    }

    /// Record a completed function call: summarize it, accumulate its
    /// tokens, and re-derive the threshold level.
    ///
    /// Summarizer failures degrade to the rule-based summary; they are never
    /// surfaced from here.
    pub async fn add_function_call(
        &mut self,
        fc_id: &str,
        name: &str,
        args: &HashMap<String, String>,
        result: &str,
    ) -> Result<Option<AddOutcome>> {
        if self.current.is_none() {
            return Ok(None);
        }

        let (summary_text, summarized) = self.summarize_call(name, args, result).await;
        // summarized calls cost their summary; unsummarized ones cost the
        // raw result
        let tokens = if summarized {
            estimate(&summary_text)
        } else {
            estimate(result)
        };

        let summary = FcSummary {
            fc_id: fc_id.to_string(),
            fc_name: name.to_string(),
            summary: summary_text,
            tokens,
            timestamp: Utc::now(),
        };

        let Some(session) = self.current.as_mut() else {
            return Ok(None);
        };
        session.token_count += tokens;
        session.fc_count += 1;
        session.summaries.push(summary.clone());
        let session_id = session.id.clone();

        self.bus.emit(SessionEvent::FcSummarized {
            session_id,
            fc_id: summary.fc_id.clone(),
            fc_name: summary.fc_name.clone(),
            tokens: summary.tokens,
            timestamp: summary.timestamp,
        });

        let (level, crossed) = self.check_thresholds();
        Ok(Some(AddOutcome {
            summary,
            level,
            crossed,
        }))
    }

    async fn summarize_call(
        &self,
        name: &str,
        args: &HashMap<String, String>,
        result: &str,
    ) -> (String, bool) {
        if self.config.auto_summarize {
            if let Some(summarizer) = &self.summarizer {
                let prompt = build_fc_prompt(name, args, result);
                match summarizer.summarize(&prompt).await {
                    Ok(text) => return (truncate_chars(text.trim(), MAX_SUMMARY_CHARS), true),
                    Err(e) => {
                        tracing::warn!(fc = name, error = %e, "summarizer failed, using rule-based summary");
                    }
                }
            }
            return (fallback_fc_summary(name, args, result), true);
        }
        (fallback_fc_summary(name, args, result), false)
    }

    /// Current threshold level plus the upward transition, if one happened.
    /// Emits the matching event on an upward move.
    pub fn check_thresholds(&mut self) -> (ThresholdLevel, Option<ThresholdLevel>) {
        let level = self.threshold_level();
        let mut crossed = None;

        if level > self.last_level {
            if let Some(session) = &self.current {
                if let Some(event) = SessionEvent::for_threshold(
                    &session.id,
                    level,
                    self.usage_percent(),
                    session.token_count,
                ) {
                    self.bus.emit(event);
                }
            }
            crossed = Some(level);
        }
        self.last_level = level;
        (level, crossed)
    }

    /// Derive the level from current usage.
    pub fn threshold_level(&self) -> ThresholdLevel {
        let usage = self.usage_percent();
        let critical_at = self.threshold_fraction() * 100.0;
        let warning_at = (self.threshold_fraction() - 0.10) * 100.0;

        if usage >= critical_at {
            ThresholdLevel::Critical
        } else if usage >= warning_at {
            ThresholdLevel::Warning
        } else {
            ThresholdLevel::Normal
        }
    }

    /// Session token usage as a percentage of the context window.
    pub fn usage_percent(&self) -> f64 {
        let tokens = self
            .current
            .as_ref()
            .map(|s| s.token_count)
            .unwrap_or_default();
        100.0 * tokens as f64 / self.config.max_context_tokens as f64
    }

    fn threshold_fraction(&self) -> f64 {
        self.config.context_threshold as f64 / self.config.max_context_tokens as f64
    }

    /// Deterministic markdown report over the current session.
    pub fn generate_session_summary(&self) -> String {
        let Some(session) = &self.current else {
            return String::new();
        };

        let duration = Utc::now() - session.start_time;
        let minutes = duration.num_minutes();
        let seconds = duration.num_seconds() % 60;

        let mut out = String::new();
        out.push_str("## Session Summary\n\n");
        out.push_str(&format!("- Project: {}\n", session.project_path));
        out.push_str(&format!("- Session: {}\n", session.id));
        out.push_str(&format!("- Duration: {minutes}m {seconds}s\n"));
        out.push_str(&format!("- Function calls: {}\n", session.fc_count));
        out.push_str(&format!("- Context usage: {:.1}%\n", self.usage_percent()));

        if !session.summaries.is_empty() {
            out.push_str("\n### Recent activity\n\n");
            let start = session.summaries.len().saturating_sub(RECENT_IN_REPORT);
            for fc in &session.summaries[start..] {
                out.push_str(&format!(
                    "- [{}] {}: {}\n",
                    fc.timestamp.format("%H:%M:%S"),
                    fc.fc_name,
                    fc.summary
                ));
            }
        }
        out
    }

    /// Close the current session and move it into history.
    pub fn complete_session(&mut self) -> Option<ActiveSession> {
        let mut session = self.current.take()?;
        session.status = SessionStatus::Completed;
        session.end_time = Some(Utc::now());
        self.last_level = ThresholdLevel::Normal;

        self.bus.emit(SessionEvent::SessionCompleted {
            session_id: session.id.clone(),
            token_count: session.token_count,
            fc_count: session.fc_count,
            timestamp: Utc::now(),
        });

        self.history.push(session.clone());
        Some(session)
    }
}

fn build_fc_prompt(name: &str, args: &HashMap<String, String>, result: &str) -> String {
    let args_text = serde_json::to_string(args).unwrap_or_default();
    format!(
        "Summarize this tool call in one short line.\nTool: {name}\nArguments: {args_text}\nResult: {result}"
    )
}

/// Deterministic summary used when no summarizer is configured or the
/// capability fails.
pub fn fallback_fc_summary(name: &str, args: &HashMap<String, String>, result: &str) -> String {
    let target = args
        .get("file_path")
        .or_else(|| args.get("path"))
        .or_else(|| args.get("command"))
        .map(String::as_str)
        .unwrap_or("");
    let first_line = result.lines().next().unwrap_or("").trim();

    let text = if target.is_empty() {
        format!("{name}: {first_line}")
    } else {
        format!("{name} {target}: {first_line}")
    };
    truncate_chars(text.trim_end_matches([':', ' ']), MAX_SUMMARY_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max: usize, threshold: usize) -> SessionManager {
        SessionManager::new(
            ManagerConfig {
                max_context_tokens: max,
                context_threshold: threshold,
                auto_summarize: false,
            },
            EventBus::default(),
        )
    }

    #[tokio::test]
    async fn test_accumulates_tokens_and_count() {
        let mut mgr = manager(1_000, 800);
        mgr.create_session(Path::new("/proj"));

        // 400 ascii chars -> 100 tokens
        let result = "x".repeat(400);
        let outcome = mgr
            .add_function_call("fc1", "Read", &HashMap::new(), &result)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.summary.tokens, 100);

        let session = mgr.current().unwrap();
        assert_eq!(session.fc_count, 1);
        assert_eq!(session.token_count, 100);
    }

    #[tokio::test]
    async fn test_threshold_transitions() {
        let mut mgr = manager(1_000, 800);
        let bus = mgr.bus.clone();
        let mut rx = bus.subscribe();
        mgr.create_session(Path::new("/proj"));
        let result = "x".repeat(400); // 100 tokens per call

        let mut crossings = Vec::new();
        for i in 0..8 {
            let outcome = mgr
                .add_function_call(&format!("fc{i}"), "Read", &HashMap::new(), &result)
                .await
                .unwrap()
                .unwrap();
            if let Some(level) = outcome.crossed {
                crossings.push((i, level));
            }
        }

        // warning at 70% (7th call), critical at 80% (8th call)
        assert_eq!(
            crossings,
            vec![(6, ThresholdLevel::Warning), (7, ThresholdLevel::Critical)]
        );

        // drain events and keep the threshold ones, in order
        let mut threshold_events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event.kind() {
                "threshold_warning" | "threshold_critical" => threshold_events.push(event),
                _ => {}
            }
        }
        assert_eq!(threshold_events.len(), 2);
        assert_eq!(threshold_events[0].kind(), "threshold_warning");
        assert_eq!(threshold_events[1].kind(), "threshold_critical");
    }

    #[tokio::test]
    async fn test_no_repeat_events_at_same_level() {
        let mut mgr = manager(1_000, 800);
        mgr.create_session(Path::new("/proj"));
        let result = "x".repeat(400 * 8); // 800 tokens, straight to critical

        let outcome = mgr
            .add_function_call("fc1", "Read", &HashMap::new(), &result)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.crossed, Some(ThresholdLevel::Critical));

        let outcome = mgr
            .add_function_call("fc2", "Read", &HashMap::new(), "tiny")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.level, ThresholdLevel::Critical);
        assert!(outcome.crossed.is_none());
    }

    #[tokio::test]
    async fn test_summarizer_failure_falls_back() {
        use crate::summarizer::RuleBasedSummarizer;

        struct Failing;
        #[async_trait::async_trait]
        impl Summarizer for Failing {
            async fn summarize(&self, _prompt: &str) -> anyhow::Result<String> {
                anyhow::bail!("down")
            }
        }

        let mut mgr = SessionManager::new(
            ManagerConfig {
                max_context_tokens: 1_000,
                context_threshold: 800,
                auto_summarize: true,
            },
            EventBus::default(),
        )
        .with_summarizer(Arc::new(Failing));
        mgr.create_session(Path::new("/proj"));

        let mut args = HashMap::new();
        args.insert("file_path".to_string(), "/a.ts".to_string());
        let outcome = mgr
            .add_function_call("fc1", "Read", &args, "file contents here")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.summary.summary, "Read /a.ts: file contents here");

        // and a working summarizer is actually used
        let mut mgr = SessionManager::new(
            ManagerConfig {
                max_context_tokens: 1_000,
                context_threshold: 800,
                auto_summarize: true,
            },
            EventBus::default(),
        )
        .with_summarizer(Arc::new(RuleBasedSummarizer::default()));
        mgr.create_session(Path::new("/proj"));
        let outcome = mgr
            .add_function_call("fc1", "Read", &HashMap::new(), "ok")
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.summary.summary.chars().count() <= MAX_SUMMARY_CHARS);
    }

    #[tokio::test]
    async fn test_session_report_shape() {
        let mut mgr = manager(1_000, 800);
        mgr.create_session(Path::new("/proj/demo"));
        mgr.add_function_call("fc1", "Read", &HashMap::new(), "ok")
            .await
            .unwrap();

        let report = mgr.generate_session_summary();
        assert!(report.starts_with("## Session Summary"));
        assert!(report.contains("- Project: /proj/demo"));
        assert!(report.contains("- Function calls: 1"));
        assert!(report.contains("### Recent activity"));
        assert!(report.contains("Read"));
    }

    #[tokio::test]
    async fn test_complete_moves_to_history() {
        let mut mgr = manager(1_000, 800);
        mgr.create_session(Path::new("/proj"));
        let completed = mgr.complete_session().unwrap();

        assert_eq!(completed.status, SessionStatus::Completed);
        assert!(completed.end_time.is_some());
        assert!(mgr.current().is_none());
        assert_eq!(mgr.history().len(), 1);
    }

    #[tokio::test]
    async fn test_new_session_completes_previous() {
        let mut mgr = manager(1_000, 800);
        let first_id = mgr.create_session(Path::new("/proj")).id.clone();
        let second_id = mgr.create_session(Path::new("/proj")).id.clone();

        assert_ne!(first_id, second_id);
        assert_eq!(mgr.history().len(), 1);
        assert_eq!(mgr.history()[0].id, first_id);
    }

    #[test]
    fn test_fallback_summary_is_bounded() {
        let mut args = HashMap::new();
        args.insert("file_path".to_string(), "p".repeat(300));
        let summary = fallback_fc_summary("Read", &args, &"r".repeat(300));
        assert!(summary.chars().count() <= MAX_SUMMARY_CHARS);
    }
}
