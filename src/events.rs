//! Session event bus
//!
//! Statically-named lifecycle events carried over a broadcast channel.
//! Sending never blocks and tolerates having no subscribers; slow
//! subscribers may observe lag and miss events, which is acceptable for
//! observers (the persisted log, not the bus, is the durable record).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::session::ThresholdLevel;

/// Lifecycle events emitted by the session manager and orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionCreated {
        session_id: String,
        project_path: String,
        timestamp: DateTime<Utc>,
    },
    FcSummarized {
        session_id: String,
        fc_id: String,
        fc_name: String,
        tokens: usize,
        timestamp: DateTime<Utc>,
    },
    ThresholdWarning {
        session_id: String,
        usage_percent: f64,
        token_count: usize,
        timestamp: DateTime<Utc>,
    },
    ThresholdCritical {
        session_id: String,
        usage_percent: f64,
        token_count: usize,
        timestamp: DateTime<Utc>,
    },
    SessionCompleted {
        session_id: String,
        token_count: usize,
        fc_count: usize,
        timestamp: DateTime<Utc>,
    },
    CompressionCompleted {
        session_id: String,
        original_tokens: usize,
        compressed_tokens: usize,
        compression_ratio: f64,
        timestamp: DateTime<Utc>,
    },
    SyncEnqueued {
        item_id: String,
        item_type: String,
        session_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl SessionEvent {
    /// Stable event kind name
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::SessionCreated { .. } => "session_created",
            SessionEvent::FcSummarized { .. } => "fc_summarized",
            SessionEvent::ThresholdWarning { .. } => "threshold_warning",
            SessionEvent::ThresholdCritical { .. } => "threshold_critical",
            SessionEvent::SessionCompleted { .. } => "session_completed",
            SessionEvent::CompressionCompleted { .. } => "compression_completed",
            SessionEvent::SyncEnqueued { .. } => "sync_enqueued",
        }
    }

    /// Build the threshold event for an upward level transition, if the new
    /// level warrants one.
    pub fn for_threshold(
        session_id: &str,
        level: ThresholdLevel,
        usage_percent: f64,
        token_count: usize,
    ) -> Option<Self> {
        match level {
            ThresholdLevel::Normal => None,
            ThresholdLevel::Warning => Some(SessionEvent::ThresholdWarning {
                session_id: session_id.to_string(),
                usage_percent,
                token_count,
                timestamp: Utc::now(),
            }),
            ThresholdLevel::Critical => Some(SessionEvent::ThresholdCritical {
                session_id: session_id.to_string(),
                usage_percent,
                token_count,
                timestamp: Utc::now(),
            }),
        }
    }
}

/// Broadcast bus for [`SessionEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event. A bus with no subscribers swallows the event.
    pub fn emit(&self, event: SessionEvent) {
        tracing::debug!(kind = event.kind(), "session event");
        let _ = self.sender.send(event);
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
