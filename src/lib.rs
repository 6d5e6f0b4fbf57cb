//! # Context-Compression Runtime for AI Agent CLIs
//!
//! `ccjk-context` sits transparently between an interactive LLM-agent CLI
//! and its terminal. It observes the agent's tool-call stream, builds a
//! durable session record on disk, and distills the conversation into
//! compact summaries as the agent's token budget approaches its threshold,
//! extending the effective context length.
//!
//! ## Key Features
//!
//! - **Streaming tool-call parsing**: a line-oriented state machine turns
//!   the agent's interleaved `<function_calls>` / `<function_results>`
//!   output into structured records, tolerating malformed input
//! - **Durable session store**: append-only per-session logs with atomic
//!   metadata writes, safe across crashes
//! - **Layered memory**: static project knowledge, a bounded session
//!   cache, and dynamic task/error context
//! - **Multi-head compression**: semantic, structural, temporal, and
//!   entity projections fused under a token budget
//! - **Sync queue**: directory-backed upload queue with exponential
//!   backoff and compressed, checksummed artifacts
//!
//! ## Quick Start
//!
//! ```no_run
//! use ccjk_context::{Orchestrator, RuntimeConfig};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut orchestrator = Orchestrator::new(RuntimeConfig::default()).await?;
//!     orchestrator.start_session(Path::new("/my/project")).await?;
//!
//!     // feed the host agent's stdout as it arrives
//!     orchestrator.handle_chunk("<function_calls>\n").await?;
//!     // ... more chunks ...
//!
//!     orchestrator.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture Overview
//!
//! - [`tokens`] - shared token estimation
//! - [`parser`] - streaming function-call parser
//! - [`store`] - durable session storage and project identity
//! - [`session`] - in-memory session manager and threshold levels
//! - [`memory`] - three-tier layered memory
//! - [`compressor`] - multi-head compression and fusion
//! - [`sync`] - upload queue, backoff driver, artifacts
//! - [`orchestrator`] - the driver binding everything
//! - [`config`] - typed runtime configuration
//! - [`events`] - session lifecycle event bus
//! - [`summarizer`] - pluggable summarization capability
//! - [`scanner`] - project-tree scanner feeding static memory

pub mod compressor;
pub mod config;
pub mod error;
pub mod events;
pub mod memory;
pub mod orchestrator;
pub mod parser;
pub mod scanner;
pub mod session;
pub mod store;
pub mod summarizer;
pub mod sync;
pub mod tokens;

pub use compressor::{CompressedOutput, CompressorConfig, MultiHeadCompressor, RawContext};
pub use config::{RuntimeConfig, SummaryModel};
pub use error::{ContextError, Result};
pub use events::{EventBus, SessionEvent};
pub use memory::LayeredMemory;
pub use orchestrator::Orchestrator;
pub use parser::{FcCall, FcEvent, FcParser, FcStatus};
pub use session::{FcSummary, SessionManager, ThresholdLevel};
pub use store::{Session, SessionMeta, SessionStatus, SessionStore};
pub use summarizer::{RuleBasedSummarizer, Summarizer};
pub use sync::{SyncDriver, SyncQueue, SyncTransport};
pub use tokens::estimate;
