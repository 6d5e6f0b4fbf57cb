//! Runtime orchestration
//!
//! The [`Orchestrator`] binds the pipeline together: parser events flow
//! into the session store and layered memory, threshold crossings trigger
//! the multi-head compressor, and compressed summaries land in the store
//! and the sync queue. One orchestrator owns one active session at a time;
//! the base directory is owned by convention, not lock files.
//!
//! Error recovery follows the taxonomy: parser noise and summarizer
//! failures never surface (the parser drops lines, the session manager
//! falls back to rule-based summaries), sync failures are retried on the
//! queue's schedule, and configuration or storage errors propagate to the
//! caller.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::process::Child;

use crate::compressor::{CompressedOutput, CompressorConfig, MultiHeadCompressor};
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::events::{EventBus, SessionEvent};
use crate::memory::LayeredMemory;
use crate::parser::{FcCall, FcEvent, FcParser};
use crate::scanner::ProjectScanner;
use crate::session::{ManagerConfig, SessionManager, ThresholdLevel};
use crate::store::{FcLogEntry, Session, SessionStore};
use crate::summarizer::Summarizer;
use crate::sync::{NewSyncItem, SyncArtifact, SyncItemType, SyncQueue};

/// Grace period between SIGTERM and SIGKILL on shutdown
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Driver binding parser, store, memory, compressor, and sync queue
pub struct Orchestrator {
    config: RuntimeConfig,
    store: SessionStore,
    queue: Arc<SyncQueue>,
    manager: SessionManager,
    memory: LayeredMemory,
    compressor: MultiHeadCompressor,
    parser: FcParser,
    bus: EventBus,
    scanner: Option<Box<dyn ProjectScanner>>,
    session: Option<Session>,
    child: Option<Child>,
    /// One compression per upward critical crossing
    compressed_at_critical: bool,
}

impl Orchestrator {
    /// Build an orchestrator from a validated configuration.
    pub async fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;

        let store = SessionStore::with_sessions_dir(config.storage.sessions_path()).await?;
        let queue = Arc::new(SyncQueue::new(config.storage.sync_queue_path()).await?);
        let bus = EventBus::default();
        let manager = SessionManager::new(ManagerConfig::from(&config), bus.clone());
        let compressor = MultiHeadCompressor::new(CompressorConfig::default());

        Ok(Self {
            config,
            store,
            queue,
            manager,
            memory: LayeredMemory::new(),
            compressor,
            parser: FcParser::new(),
            bus,
            scanner: None,
            session: None,
            child: None,
            compressed_at_critical: false,
        })
    }

    /// Inject the summarization capability, shared by the session manager
    /// and the semantic compression head.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.manager.set_summarizer(summarizer.clone());
        self.compressor = MultiHeadCompressor::new(CompressorConfig::default())
            .with_summarizer(summarizer);
        self
    }

    /// Inject a project scanner run at session start.
    pub fn with_scanner(mut self, scanner: Box<dyn ProjectScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn queue(&self) -> Arc<SyncQueue> {
        self.queue.clone()
    }

    pub fn current_session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Create a session for a project path and make it current. Any session
    /// already in flight is completed first. Returns the new session id.
    pub async fn start_session(&mut self, project_path: &Path) -> Result<String> {
        if self.session.is_some() {
            self.finish_session().await?;
        }

        let session = self.store.create_session(project_path, None).await?;
        self.manager.create_session_from(&session.meta);

        self.memory = LayeredMemory::new();
        self.memory
            .set_working_directory(&session.meta.project_path);
        if let Some(scanner) = &self.scanner {
            match scanner.scan(project_path) {
                Ok(tree) => self.memory.set_project_tree(tree),
                Err(e) => tracing::warn!(error = %e, "project scan failed, continuing without tree"),
            }
        }

        self.parser.reset();
        self.compressed_at_critical = false;
        let id = session.meta.id.clone();
        self.session = Some(session);
        Ok(id)
    }

    /// Set the goal the compressor's semantic head anchors on.
    pub fn set_goal(&mut self, goal: &str) {
        self.memory.set_goal(goal);
    }

    /// Feed a chunk of host-agent output through the pipeline.
    pub async fn handle_chunk(&mut self, chunk: &str) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let events = self.parser.parse(chunk);
        for event in events {
            match event {
                FcEvent::Started { id, name } => {
                    tracing::debug!(fc_id = %id, fc = %name, "function call started");
                }
                FcEvent::Completed(call) => {
                    self.process_call(*call).await?;
                }
            }
        }
        Ok(())
    }

    async fn process_call(&mut self, call: FcCall) -> Result<()> {
        let Some(session) = &self.session else {
            tracing::debug!(fc = %call.name, "dropping call with no active session");
            return Ok(());
        };
        let session_id = session.meta.id.clone();
        let project_hash = session.meta.project_hash.clone();

        let Some(outcome) = self
            .manager
            .add_function_call(&call.id, &call.name, &call.args, &call.result)
            .await?
        else {
            return Ok(());
        };

        let entry = FcLogEntry::from_call(&call, &outcome.summary.summary);
        self.store
            .append_fc_log(&session_id, &entry, Some(&project_hash))
            .await?;

        self.memory.observe_call(&call, &outcome.summary);

        match outcome.level {
            ThresholdLevel::Critical => {
                if !self.compressed_at_critical {
                    self.compressed_at_critical = true;
                    self.compress_now().await?;
                }
            }
            _ => {
                self.compressed_at_critical = false;
            }
        }
        Ok(())
    }

    /// Compress the current memory snapshot, persist it as the session's
    /// summary, and enqueue the artifact for upload.
    pub async fn compress_now(&mut self) -> Result<CompressedOutput> {
        let session_id = match &self.session {
            Some(session) => session.meta.id.clone(),
            None => {
                return Err(crate::error::ContextError::SessionNotFound(
                    "no active session".into(),
                ))
            }
        };

        let snapshot = self.memory.snapshot();
        let output = self.compressor.compress(&snapshot).await;

        self.store
            .save_summary(&session_id, &output.content, None)
            .await?;

        let artifact = SyncArtifact::prepare(output.content.as_bytes())?;
        let item = self
            .queue
            .enqueue(NewSyncItem {
                item_type: SyncItemType::Summary,
                session_id: session_id.clone(),
                data: artifact.to_item_data(),
            })
            .await?;

        self.bus.emit(SessionEvent::CompressionCompleted {
            session_id: session_id.clone(),
            original_tokens: output.original_tokens,
            compressed_tokens: output.compressed_tokens,
            compression_ratio: output.compression_ratio,
            timestamp: Utc::now(),
        });
        self.bus.emit(SessionEvent::SyncEnqueued {
            item_id: item.id,
            item_type: item.item_type.as_str().to_string(),
            session_id,
            timestamp: Utc::now(),
        });

        Ok(output)
    }

    /// Adopt the host-agent child process so shutdown can terminate it.
    pub fn attach_child(&mut self, child: Child) {
        self.child = Some(child);
    }

    /// Flush the parser, complete the session, persist the memory
    /// snapshot, and terminate an attached host-agent process.
    pub async fn shutdown(&mut self) -> Result<()> {
        for call in self.parser.flush() {
            self.process_call(call).await?;
        }

        self.finish_session().await?;

        if self.config.cleanup.auto_cleanup {
            let max_age =
                Duration::from_secs(u64::from(self.config.cleanup.max_session_age) * 24 * 60 * 60);
            match self.store.clean_old_sessions(max_age).await {
                Ok(report) if report.removed > 0 => {
                    tracing::info!(removed = report.removed, "auto-cleanup removed old sessions");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "auto-cleanup failed"),
            }
        }

        if let Some(mut child) = self.child.take() {
            terminate_child(&mut child).await?;
        }
        Ok(())
    }

    async fn finish_session(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        self.manager.complete_session();
        self.store
            .complete_session(&session.meta.id, Some(&session.meta.project_hash))
            .await?;

        let snapshot = self.memory.export()?;
        self.store
            .save_memory_snapshot(&session.meta.id, &snapshot, Some(&session.meta.project_hash))
            .await?;
        Ok(())
    }
}

/// SIGTERM, a grace period, then SIGKILL.
#[cfg(unix)]
async fn terminate_child(child: &mut Child) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        // already exited
        return Ok(());
    };

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::debug!(error = %e, "SIGTERM failed, process likely gone");
    }

    match tokio::time::timeout(TERM_GRACE, child.wait()).await {
        Ok(status) => {
            let _ = status?;
        }
        Err(_) => {
            tracing::warn!(pid, "host agent ignored SIGTERM, sending SIGKILL");
            child.kill().await?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn terminate_child(child: &mut Child) -> Result<()> {
    child.kill().await?;
    Ok(())
}
