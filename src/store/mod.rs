//! Durable session storage
//!
//! Content-addressed per-project hierarchy under the configured base
//! directory:
//!
//! ```text
//! sessions/<projectHash>/current.json
//! sessions/<projectHash>/<sessionId>/meta.json
//! sessions/<projectHash>/<sessionId>/fc-log.jsonl
//! sessions/<projectHash>/<sessionId>/summary.md
//! ```
//!
//! The store is the sole writer of this layout. Metadata, summaries, and the
//! current-session pointer go through write-temp-then-rename so a failed
//! write leaves the previous state intact; the function-call log is
//! append-only JSON Lines. The store behaves single-writer per session:
//! meta is rewritten only after an append completes, so a reader never
//! observes a meta `fcCount` ahead of the log.

pub mod project;

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::error::{ContextError, Result};
use crate::parser::{truncate_marked, FcCall, FcStatus, MAX_ARG_CHARS, MAX_RESULT_CHARS};
use crate::tokens::estimate;

pub use project::ProjectIdentity;

/// Lifecycle state of a persisted session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Archived,
}

/// Session metadata persisted as `meta.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub id: String,
    pub project_path: String,
    pub project_hash: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub token_count: usize,
    pub summary_tokens: usize,
    pub fc_count: usize,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// A session with its resolved on-disk locations
#[derive(Debug, Clone)]
pub struct Session {
    pub meta: SessionMeta,
    pub dir: PathBuf,
    pub fc_log_path: PathBuf,
    pub summary_path: PathBuf,
}

impl Session {
    fn at(dir: PathBuf, meta: SessionMeta) -> Self {
        Self {
            fc_log_path: dir.join("fc-log.jsonl"),
            summary_path: dir.join("summary.md"),
            dir,
            meta,
        }
    }
}

/// One line of `fc-log.jsonl`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FcLogEntry {
    pub ts: DateTime<Utc>,
    pub id: String,
    /// Function name
    pub fc: String,
    pub args: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub tokens: usize,
    /// Wall-clock duration in milliseconds
    pub duration: i64,
    pub summary: String,
    pub status: FcStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FcLogEntry {
    /// Build a log entry from a completed call and its summary.
    pub fn from_call(call: &FcCall, summary: &str) -> Self {
        let args = call
            .args
            .iter()
            .map(|(key, value)| {
                (
                    key.clone(),
                    serde_json::Value::String(truncate_marked(value, MAX_ARG_CHARS)),
                )
            })
            .collect();

        Self {
            ts: call.end_time,
            id: call.id.clone(),
            fc: call.name.clone(),
            args,
            result: Some(truncate_marked(&call.result, MAX_RESULT_CHARS)),
            tokens: call.tokens,
            duration: call.duration_ms,
            summary: summary.to_string(),
            status: call.status,
            error: call.error.clone(),
        }
    }
}

/// Content of `current.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurrentPointer {
    session_id: String,
    /// ISO-8601 timestamp
    last_updated: String,
}

/// Filter for [`SessionStore::list_sessions`]
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub project_hash: Option<String>,
    pub status: Option<SessionStatus>,
    pub limit: Option<usize>,
}

/// Filter applied while iterating `fc-log.jsonl`
#[derive(Debug, Clone, Default)]
pub struct FcLogFilter {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub fc_name: Option<String>,
    pub status: Option<FcStatus>,
    pub limit: Option<usize>,
}

/// Result of [`SessionStore::clean_old_sessions`]
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub removed: usize,
    pub bytes_freed: u64,
    pub removed_session_ids: Vec<String>,
}

/// Aggregate storage statistics
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub project_count: usize,
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub total_bytes: u64,
    pub oldest_session: Option<DateTime<Utc>>,
    pub newest_session: Option<DateTime<Utc>>,
}

/// Session store rooted at a base directory
pub struct SessionStore {
    sessions_dir: PathBuf,
}

impl SessionStore {
    /// Open (and create if needed) a store under `base_dir`, with the
    /// session hierarchy at `base_dir/sessions`.
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_sessions_dir(base_dir.into().join("sessions")).await
    }

    /// Open a store with an explicit sessions directory.
    pub async fn with_sessions_dir(sessions_dir: impl Into<PathBuf>) -> Result<Self> {
        let sessions_dir = sessions_dir.into();
        fs::create_dir_all(&sessions_dir).await?;
        Ok(Self { sessions_dir })
    }

    fn sessions_dir(&self) -> PathBuf {
        self.sessions_dir.clone()
    }

    fn project_dir(&self, project_hash: &str) -> PathBuf {
        self.sessions_dir().join(project_hash)
    }

    fn session_dir(&self, project_hash: &str, id: &str) -> PathBuf {
        self.project_dir(project_hash).join(id)
    }

    /// Create a session for a project path, write its metadata, and point
    /// the project's current-session pointer at it.
    pub async fn create_session(
        &self,
        project_path: &Path,
        description: Option<String>,
    ) -> Result<Session> {
        let identity = ProjectIdentity::resolve(project_path);
        let now = Utc::now();
        let meta = SessionMeta {
            id: Uuid::new_v4().to_string(),
            project_path: identity.normalized_path.clone(),
            project_hash: identity.hash.clone(),
            start_time: now,
            end_time: None,
            status: SessionStatus::Active,
            token_count: 0,
            summary_tokens: 0,
            fc_count: 0,
            version: 1,
            description,
            last_updated: now,
        };

        let dir = self.session_dir(&meta.project_hash, &meta.id);
        fs::create_dir_all(&dir).await?;

        let session = Session::at(dir, meta);
        write_json_atomic(&session.dir.join("meta.json"), &session.meta)?;
        // the log exists from the start so recovery never distinguishes
        // "no log yet" from "empty log"
        if !session.fc_log_path.exists() {
            std::fs::File::create(&session.fc_log_path)?;
        }
        self.set_current_session(&session.meta.project_hash, &session.meta.id)
            .await?;

        tracing::debug!(session_id = %session.meta.id, hash = %session.meta.project_hash, "session created");
        Ok(session)
    }

    /// Load a session by id. Without a project hash every project directory
    /// is searched. Returns `None` when the session does not exist.
    pub async fn get_session(&self, id: &str, project_hash: Option<&str>) -> Result<Option<Session>> {
        match self.find_session_dir(id, project_hash)? {
            Some(dir) => {
                let meta = read_meta(&dir.join("meta.json"))?;
                Ok(Some(Session::at(dir, meta)))
            }
            None => Ok(None),
        }
    }

    /// Rewrite a session's metadata atomically.
    pub async fn update_session(&self, session: &Session) -> Result<()> {
        write_json_atomic(&session.dir.join("meta.json"), &session.meta)?;
        Ok(())
    }

    /// Mark a session completed and stamp its end time.
    pub async fn complete_session(&self, id: &str, project_hash: Option<&str>) -> Result<Session> {
        self.transition(id, project_hash, SessionStatus::Completed)
            .await
    }

    /// Mark a session archived.
    pub async fn archive_session(&self, id: &str, project_hash: Option<&str>) -> Result<Session> {
        self.transition(id, project_hash, SessionStatus::Archived)
            .await
    }

    async fn transition(
        &self,
        id: &str,
        project_hash: Option<&str>,
        status: SessionStatus,
    ) -> Result<Session> {
        let mut session = self
            .get_session(id, project_hash)
            .await?
            .ok_or_else(|| ContextError::SessionNotFound(id.to_string()))?;
        let now = Utc::now();
        session.meta.status = status;
        if session.meta.end_time.is_none() {
            session.meta.end_time = Some(now);
        }
        session.meta.last_updated = now;
        self.update_session(&session).await?;
        Ok(session)
    }

    /// List session metadata matching a filter, newest first.
    pub async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionMeta>> {
        let mut metas = Vec::new();

        for project_dir in read_dirs(&self.sessions_dir())? {
            if let Some(wanted) = &filter.project_hash {
                if project_dir.file_name().and_then(|n| n.to_str()) != Some(wanted.as_str()) {
                    continue;
                }
            }
            for session_dir in read_dirs(&project_dir)? {
                let meta_path = session_dir.join("meta.json");
                let meta = match read_meta(&meta_path) {
                    Ok(meta) => meta,
                    Err(_) => {
                        tracing::warn!(path = %meta_path.display(), "skipping unreadable meta");
                        continue;
                    }
                };
                if let Some(status) = filter.status {
                    if meta.status != status {
                        continue;
                    }
                }
                metas.push(meta);
            }
        }

        metas.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        if let Some(limit) = filter.limit {
            metas.truncate(limit);
        }
        Ok(metas)
    }

    /// Append one entry to a session's function-call log, then recompute the
    /// session counters from the log and rewrite the metadata atomically.
    ///
    /// Recomputing from the log (rather than incrementing) makes the meta
    /// self-heal after a crash between an append and its meta rewrite.
    pub async fn append_fc_log(
        &self,
        id: &str,
        entry: &FcLogEntry,
        project_hash: Option<&str>,
    ) -> Result<()> {
        let mut session = self
            .get_session(id, project_hash)
            .await?
            .ok_or_else(|| ContextError::SessionNotFound(id.to_string()))?;

        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&session.fc_log_path)?;
        file.write_all(&line)?;

        let (fc_count, token_count) = scan_log_totals(&session.fc_log_path)?;
        session.meta.fc_count = fc_count;
        session.meta.token_count = token_count;
        session.meta.last_updated = Utc::now();
        self.update_session(&session).await?;
        Ok(())
    }

    /// Lazily iterate a session's log entries, applying the filter during
    /// iteration. Unparseable lines are skipped silently. The iterator is
    /// finite and non-restartable.
    pub fn get_fc_logs(
        &self,
        id: &str,
        project_hash: Option<&str>,
        filter: FcLogFilter,
    ) -> Result<FcLogIter> {
        let dir = self
            .find_session_dir(id, project_hash)?
            .ok_or_else(|| ContextError::SessionNotFound(id.to_string()))?;
        let file = std::fs::File::open(dir.join("fc-log.jsonl"))?;
        Ok(FcLogIter {
            lines: BufReader::new(file).lines(),
            filter,
            yielded: 0,
        })
    }

    /// Write a session's `summary.md` atomically and record the compressed
    /// token count on its metadata.
    pub async fn save_summary(
        &self,
        id: &str,
        content: &str,
        project_hash: Option<&str>,
    ) -> Result<()> {
        let mut session = self
            .get_session(id, project_hash)
            .await?
            .ok_or_else(|| ContextError::SessionNotFound(id.to_string()))?;

        write_atomic(&session.summary_path, content.as_bytes())?;
        session.meta.summary_tokens = estimate(content);
        session.meta.last_updated = Utc::now();
        self.update_session(&session).await
    }

    /// Read a session's saved summary, if any.
    pub async fn get_summary(&self, id: &str, project_hash: Option<&str>) -> Result<Option<String>> {
        let dir = self
            .find_session_dir(id, project_hash)?
            .ok_or_else(|| ContextError::SessionNotFound(id.to_string()))?;
        match fs::read_to_string(dir.join("summary.md")).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist an exported layered-memory snapshot beside the session, so a
    /// later session can re-import the project's static knowledge.
    pub async fn save_memory_snapshot(
        &self,
        id: &str,
        snapshot: &serde_json::Value,
        project_hash: Option<&str>,
    ) -> Result<()> {
        let dir = self
            .find_session_dir(id, project_hash)?
            .ok_or_else(|| ContextError::SessionNotFound(id.to_string()))?;
        write_json_atomic(&dir.join("memory.json"), snapshot)
    }

    /// Read a previously saved memory snapshot.
    pub async fn get_memory_snapshot(
        &self,
        id: &str,
        project_hash: Option<&str>,
    ) -> Result<Option<serde_json::Value>> {
        let dir = self
            .find_session_dir(id, project_hash)?
            .ok_or_else(|| ContextError::SessionNotFound(id.to_string()))?;
        match fs::read(dir.join("memory.json")).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve the project's current session, if the pointer is valid.
    pub async fn get_current_session(&self, project_hash: &str) -> Result<Option<Session>> {
        let pointer_path = self.project_dir(project_hash).join("current.json");
        let data = match fs::read(&pointer_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let pointer: CurrentPointer = match serde_json::from_slice(&data) {
            Ok(pointer) => pointer,
            Err(_) => return Ok(None),
        };
        self.get_session(&pointer.session_id, Some(project_hash))
            .await
    }

    /// Atomically repoint the project's current session.
    pub async fn set_current_session(&self, project_hash: &str, id: &str) -> Result<()> {
        let pointer = CurrentPointer {
            session_id: id.to_string(),
            last_updated: Utc::now().to_rfc3339(),
        };
        let dir = self.project_dir(project_hash);
        fs::create_dir_all(&dir).await?;
        write_json_atomic(&dir.join("current.json"), &pointer)
    }

    /// Delete a session directory. Clears the current-session pointer if it
    /// referenced the deleted session.
    pub async fn delete_session(&self, id: &str, project_hash: Option<&str>) -> Result<()> {
        let dir = self
            .find_session_dir(id, project_hash)?
            .ok_or_else(|| ContextError::SessionNotFound(id.to_string()))?;
        let project_dir = dir.parent().map(Path::to_path_buf);
        fs::remove_dir_all(&dir).await?;

        if let Some(project_dir) = project_dir {
            let pointer_path = project_dir.join("current.json");
            if let Ok(data) = std::fs::read(&pointer_path) {
                if let Ok(pointer) = serde_json::from_slice::<CurrentPointer>(&data) {
                    if pointer.session_id == id {
                        let _ = std::fs::remove_file(&pointer_path);
                    }
                }
            }
        }
        Ok(())
    }

    /// Remove non-active sessions whose `endTime` (falling back to
    /// `lastUpdated`) is older than `max_age`.
    pub async fn clean_old_sessions(&self, max_age: Duration) -> Result<CleanupReport> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut report = CleanupReport::default();

        for project_dir in read_dirs(&self.sessions_dir())? {
            for session_dir in read_dirs(&project_dir)? {
                let meta = match read_meta(&session_dir.join("meta.json")) {
                    Ok(meta) => meta,
                    Err(_) => continue,
                };
                if meta.status == SessionStatus::Active {
                    continue;
                }
                let reference = meta.end_time.unwrap_or(meta.last_updated);
                if reference >= cutoff {
                    continue;
                }

                report.bytes_freed += dir_size(&session_dir)?;
                fs::remove_dir_all(&session_dir).await?;
                report.removed += 1;
                report.removed_session_ids.push(meta.id);
            }
        }

        tracing::info!(
            removed = report.removed,
            bytes = report.bytes_freed,
            "old sessions cleaned"
        );
        Ok(report)
    }

    /// Aggregate counts and byte totals across all projects.
    pub async fn storage_stats(&self) -> Result<StorageStats> {
        let mut stats = StorageStats::default();

        for project_dir in read_dirs(&self.sessions_dir())? {
            stats.project_count += 1;
            for session_dir in read_dirs(&project_dir)? {
                let meta = match read_meta(&session_dir.join("meta.json")) {
                    Ok(meta) => meta,
                    Err(_) => continue,
                };
                stats.total_sessions += 1;
                if meta.status == SessionStatus::Active {
                    stats.active_sessions += 1;
                }
                stats.total_bytes += dir_size(&session_dir)?;
                stats.oldest_session = match stats.oldest_session {
                    Some(t) if t <= meta.start_time => Some(t),
                    _ => Some(meta.start_time),
                };
                stats.newest_session = match stats.newest_session {
                    Some(t) if t >= meta.start_time => Some(t),
                    _ => Some(meta.start_time),
                };
            }
        }
        Ok(stats)
    }

    fn find_session_dir(&self, id: &str, project_hash: Option<&str>) -> Result<Option<PathBuf>> {
        match project_hash {
            Some(hash) => {
                let dir = self.session_dir(hash, id);
                Ok(dir.join("meta.json").exists().then_some(dir))
            }
            None => {
                for project_dir in read_dirs(&self.sessions_dir())? {
                    let dir = project_dir.join(id);
                    if dir.join("meta.json").exists() {
                        return Ok(Some(dir));
                    }
                }
                Ok(None)
            }
        }
    }
}

/// Lazy iterator over `fc-log.jsonl`
pub struct FcLogIter {
    lines: std::io::Lines<BufReader<std::fs::File>>,
    filter: FcLogFilter,
    yielded: usize,
}

impl Iterator for FcLogIter {
    type Item = FcLogEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(limit) = self.filter.limit {
            if self.yielded >= limit {
                return None;
            }
        }

        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(_) => return None,
            };
            let entry: FcLogEntry = match serde_json::from_str(&line) {
                Ok(entry) => entry,
                Err(_) => continue, // corrupt line, skip
            };

            if let Some(start) = self.filter.start_time {
                if entry.ts < start {
                    continue;
                }
            }
            if let Some(end) = self.filter.end_time {
                if entry.ts > end {
                    continue;
                }
            }
            if let Some(name) = &self.filter.fc_name {
                if &entry.fc != name {
                    continue;
                }
            }
            if let Some(status) = self.filter.status {
                if entry.status != status {
                    continue;
                }
            }

            self.yielded += 1;
            return Some(entry);
        }
    }
}

/// Write bytes to `path` through a temp file in the same directory followed
/// by an atomic rename.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| ContextError::Storage(std::io::Error::other("path has no parent")))?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(data)?;
    temp.persist(path)
        .map_err(|e| ContextError::Storage(e.error))?;
    Ok(())
}

/// Serialize a value as 2-space-indented JSON and write it atomically.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &data)
}

fn read_meta(path: &Path) -> Result<SessionMeta> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Count parseable lines and sum their token fields.
fn scan_log_totals(path: &Path) -> Result<(usize, usize)> {
    let file = std::fs::File::open(path)?;
    let mut fc_count = 0usize;
    let mut token_count = 0usize;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if let Ok(entry) = serde_json::from_str::<FcLogEntry>(&line) {
            fc_count += 1;
            token_count += entry.tokens;
        }
    }
    Ok((fc_count, token_count))
}

fn read_dirs(path: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_file() {
            total += metadata.len();
        } else if metadata.is_dir() {
            total += dir_size(&entry.path())?;
        }
    }
    Ok(total)
}
