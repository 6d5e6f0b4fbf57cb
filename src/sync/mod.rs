//! Upload sync queue
//!
//! Directory-backed FIFO of artifacts awaiting upload. Each item is its own
//! JSON file under the queue directory, so concurrent readers never corrupt
//! the queue; a single driver is expected to run the
//! `dequeue → mark_syncing → mark_synced` sequence to avoid double-sends.
//! Failed items carry a retry schedule with exponential backoff; items that
//! exhaust their retries stay `failed` with the last error recorded and no
//! further retry time.
//!
//! The transport that actually ships the bytes is an external collaborator
//! behind [`SyncTransport`]; the queue only prepares compressed,
//! checksummed payloads.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::error::{ContextError, Result};

/// What kind of artifact an item carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncItemType {
    Session,
    Summary,
    FcLog,
}

impl SyncItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncItemType::Session => "session",
            SyncItemType::Summary => "summary",
            SyncItemType::FcLog => "fc-log",
        }
    }
}

/// Item lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncItemStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

/// One queued upload, persisted as `<queueDir>/<id>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: SyncItemType,
    pub session_id: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub status: SyncItemStatus,
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry: Option<DateTime<Utc>>,
}

/// Fields the caller supplies on enqueue
#[derive(Debug, Clone)]
pub struct NewSyncItem {
    pub item_type: SyncItemType,
    pub session_id: String,
    pub data: serde_json::Value,
}

/// Aggregate queue statistics
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub total: usize,
    pub pending: usize,
    pub syncing: usize,
    pub synced: usize,
    pub failed: usize,
}

/// Directory-backed sync queue
pub struct SyncQueue {
    queue_dir: PathBuf,
}

impl SyncQueue {
    pub async fn new(queue_dir: impl Into<PathBuf>) -> Result<Self> {
        let queue_dir = queue_dir.into();
        fs::create_dir_all(&queue_dir).await?;
        Ok(Self { queue_dir })
    }

    fn item_path(&self, id: &str) -> PathBuf {
        self.queue_dir.join(format!("{id}.json"))
    }

    /// Persist a new pending item. Ids are time-prefixed so lexicographic
    /// and chronological order agree.
    pub async fn enqueue(&self, new_item: NewSyncItem) -> Result<SyncQueueItem> {
        let suffix: u32 = rand::rng().random();
        let item = SyncQueueItem {
            id: format!("{}-{suffix:08x}", Utc::now().timestamp_millis()),
            item_type: new_item.item_type,
            session_id: new_item.session_id,
            data: new_item.data,
            created_at: Utc::now(),
            status: SyncItemStatus::Pending,
            retries: 0,
            last_error: None,
            next_retry: None,
        };
        self.write_item(&item)?;
        tracing::debug!(id = %item.id, kind = item.item_type.as_str(), "sync item enqueued");
        Ok(item)
    }

    /// Oldest pending item, without mutating it.
    pub async fn dequeue(&self) -> Result<Option<SyncQueueItem>> {
        let mut pending: Vec<SyncQueueItem> = self
            .load_all()?
            .into_iter()
            .filter(|item| item.status == SyncItemStatus::Pending)
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(pending.into_iter().next())
    }

    pub async fn get_item(&self, id: &str) -> Result<Option<SyncQueueItem>> {
        let path = self.item_path(id);
        match std::fs::read(&path) {
            Ok(data) => Ok(serde_json::from_slice(&data).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Rewrite an existing item in place.
    pub async fn update_item(&self, item: &SyncQueueItem) -> Result<()> {
        if !self.item_path(&item.id).exists() {
            return Err(ContextError::SessionNotFound(item.id.clone()));
        }
        self.write_item(item)
    }

    pub async fn mark_syncing(&self, id: &str) -> Result<SyncQueueItem> {
        self.patch(id, |item| {
            item.status = SyncItemStatus::Syncing;
        })
        .await
    }

    pub async fn mark_synced(&self, id: &str) -> Result<SyncQueueItem> {
        self.patch(id, |item| {
            item.status = SyncItemStatus::Synced;
            item.next_retry = None;
        })
        .await
    }

    /// Record a failure. With a retry delay the item becomes retryable at
    /// `now + delay`; without one it stays failed for good.
    pub async fn mark_failed(
        &self,
        id: &str,
        error: &str,
        retry_delay: Option<Duration>,
    ) -> Result<SyncQueueItem> {
        self.patch(id, |item| {
            item.status = SyncItemStatus::Failed;
            item.retries += 1;
            item.last_error = Some(error.to_string());
            item.next_retry = retry_delay.map(|delay| {
                Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
            });
        })
        .await
    }

    async fn patch(
        &self,
        id: &str,
        apply: impl FnOnce(&mut SyncQueueItem),
    ) -> Result<SyncQueueItem> {
        let mut item = self
            .get_item(id)
            .await?
            .ok_or_else(|| ContextError::SessionNotFound(id.to_string()))?;
        apply(&mut item);
        self.write_item(&item)?;
        Ok(item)
    }

    pub async fn remove_item(&self, id: &str) -> Result<()> {
        match fs::remove_file(self.item_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All items, optionally filtered by status, oldest first.
    pub async fn list_items(&self, status: Option<SyncItemStatus>) -> Result<Vec<SyncQueueItem>> {
        let mut items = self.load_all()?;
        if let Some(status) = status {
            items.retain(|item| item.status == status);
        }
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    /// Failed items whose retry time has arrived.
    pub async fn retryable_items(&self) -> Result<Vec<SyncQueueItem>> {
        let now = Utc::now();
        Ok(self
            .list_items(Some(SyncItemStatus::Failed))
            .await?
            .into_iter()
            .filter(|item| item.next_retry.map(|at| at <= now).unwrap_or(false))
            .collect())
    }

    /// Remove synced items older than `max_age`. Returns how many were
    /// removed.
    pub async fn cleanup_synced(&self, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut removed = 0;
        for item in self.list_items(Some(SyncItemStatus::Synced)).await? {
            if item.created_at < cutoff {
                self.remove_item(&item.id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<SyncStats> {
        let mut stats = SyncStats::default();
        for item in self.load_all()? {
            stats.total += 1;
            match item.status {
                SyncItemStatus::Pending => stats.pending += 1,
                SyncItemStatus::Syncing => stats.syncing += 1,
                SyncItemStatus::Synced => stats.synced += 1,
                SyncItemStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    /// Remove every item regardless of status. Returns how many were
    /// removed.
    pub async fn clear(&self) -> Result<usize> {
        let items = self.load_all()?;
        let count = items.len();
        for item in items {
            self.remove_item(&item.id).await?;
        }
        Ok(count)
    }

    fn load_all(&self) -> Result<Vec<SyncQueueItem>> {
        let mut items = Vec::new();
        let entries = match std::fs::read_dir(&self.queue_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(items),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry.path().extension().map(|ext| ext == "json") != Some(true) {
                continue;
            }
            let data = match std::fs::read(entry.path()) {
                Ok(data) => data,
                Err(_) => continue,
            };
            match serde_json::from_slice::<SyncQueueItem>(&data) {
                Ok(item) => items.push(item),
                Err(_) => {
                    tracing::warn!(path = %entry.path().display(), "skipping unreadable queue item");
                }
            }
        }
        Ok(items)
    }

    fn write_item(&self, item: &SyncQueueItem) -> Result<()> {
        let data = serde_json::to_vec_pretty(item)?;
        let mut temp = tempfile::NamedTempFile::new_in(&self.queue_dir)?;
        std::io::Write::write_all(&mut temp, &data)?;
        temp.persist(self.item_path(&item.id))
            .map_err(|e| ContextError::Storage(e.error))?;
        Ok(())
    }
}

/// Transport capability the external uploader implements
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn send(&self, item: &SyncQueueItem) -> anyhow::Result<()>;
}

/// Exponential backoff schedule with jitter
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    /// Upper bound of the random jitter added to every delay
    pub jitter_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(60_000),
            max_retries: 3,
            jitter_ms: 1_000,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt` (1-based):
    /// `min(base × 2^(attempt−1), max) + jitter(0..jitter_ms)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let scaled = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay);
        if self.jitter_ms == 0 {
            return scaled;
        }
        scaled + Duration::from_millis(rand::rng().random_range(0..self.jitter_ms))
    }
}

/// Drives the queue against a transport
pub struct SyncDriver {
    queue: Arc<SyncQueue>,
    transport: Arc<dyn SyncTransport>,
    policy: BackoffPolicy,
}

impl SyncDriver {
    pub fn new(queue: Arc<SyncQueue>, transport: Arc<dyn SyncTransport>) -> Self {
        Self {
            queue,
            transport,
            policy: BackoffPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Send the oldest pending item. Returns the item's final state, or
    /// `None` when the queue has nothing pending. A send that exhausts its
    /// retries surfaces [`ContextError::SyncFailed`].
    pub async fn process_next(&self) -> Result<Option<SyncQueueItem>> {
        let Some(item) = self.queue.dequeue().await? else {
            return Ok(None);
        };
        self.attempt(item).await.map(Some)
    }

    /// Re-send every failed item whose retry time has arrived.
    pub async fn retry_due(&self) -> Result<Vec<SyncQueueItem>> {
        let mut results = Vec::new();
        for item in self.queue.retryable_items().await? {
            match self.attempt(item).await {
                Ok(item) => results.push(item),
                Err(ContextError::SyncFailed { id, .. }) => {
                    // permanently failed items stay in the queue for
                    // inspection; keep going
                    tracing::warn!(id = %id, "sync item exhausted retries");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }

    async fn attempt(&self, item: SyncQueueItem) -> Result<SyncQueueItem> {
        let item = self.queue.mark_syncing(&item.id).await?;

        match self.transport.send(&item).await {
            Ok(()) => self.queue.mark_synced(&item.id).await,
            Err(e) => {
                let attempts = item.retries + 1;
                if attempts >= self.policy.max_retries {
                    let failed = self
                        .queue
                        .mark_failed(&item.id, &e.to_string(), None)
                        .await?;
                    Err(ContextError::SyncFailed {
                        id: failed.id,
                        attempts,
                        message: e.to_string(),
                    })
                } else {
                    let delay = self.policy.delay_for_attempt(attempts);
                    self.queue
                        .mark_failed(&item.id, &e.to_string(), Some(delay))
                        .await
                }
            }
        }
    }
}

/// Compressed, checksummed payload ready for upload
#[derive(Debug, Clone)]
pub struct SyncArtifact {
    /// Hex SHA-256 over the original payload
    pub checksum: String,
    pub original_bytes: usize,
    pub compressed_bytes: usize,
    /// Zstd-compressed payload
    pub data: Vec<u8>,
}

impl SyncArtifact {
    /// Compress and checksum a payload.
    pub fn prepare(payload: &[u8]) -> Result<Self> {
        let data = zstd::encode_all(payload, 3)?;
        let digest = Sha256::digest(payload);
        let checksum: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        Ok(Self {
            checksum,
            original_bytes: payload.len(),
            compressed_bytes: data.len(),
            data,
        })
    }

    /// Decompress and verify against the stored checksum.
    pub fn open(&self) -> Result<Vec<u8>> {
        let payload = zstd::decode_all(self.data.as_slice())?;
        let digest = Sha256::digest(&payload);
        let checksum: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        if checksum != self.checksum {
            return Err(ContextError::Storage(std::io::Error::other(
                "artifact checksum mismatch",
            )));
        }
        Ok(payload)
    }

    /// JSON payload embedded in a queue item: checksum, sizes, and the
    /// compressed bytes hex-encoded.
    pub fn to_item_data(&self) -> serde_json::Value {
        let hex: String = self.data.iter().map(|b| format!("{b:02x}")).collect();
        serde_json::json!({
            "checksum": self.checksum,
            "originalBytes": self.original_bytes,
            "compressedBytes": self.compressed_bytes,
            "payload": hex,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn new_item(session: &str) -> NewSyncItem {
        NewSyncItem {
            item_type: SyncItemType::Summary,
            session_id: session.to_string(),
            data: serde_json::json!({"k": "v"}),
        }
    }

    struct FlakyTransport {
        failures: AtomicUsize,
    }

    #[async_trait]
    impl SyncTransport for FlakyTransport {
        async fn send(&self, _item: &SyncQueueItem) -> anyhow::Result<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("connection reset")
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_fifo() {
        let temp = TempDir::new().unwrap();
        let queue = SyncQueue::new(temp.path()).await.unwrap();

        let first = queue.enqueue(new_item("s1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.enqueue(new_item("s2")).await.unwrap();

        let head = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(head.id, first.id);
        // dequeue does not mutate
        let again = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let temp = TempDir::new().unwrap();
        let queue = SyncQueue::new(temp.path()).await.unwrap();
        let item = queue.enqueue(new_item("s1")).await.unwrap();

        let syncing = queue.mark_syncing(&item.id).await.unwrap();
        assert_eq!(syncing.status, SyncItemStatus::Syncing);

        let synced = queue.mark_synced(&item.id).await.unwrap();
        assert_eq!(synced.status, SyncItemStatus::Synced);
        // synced items never come back out of dequeue
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_failed_schedules_retry() {
        let temp = TempDir::new().unwrap();
        let queue = SyncQueue::new(temp.path()).await.unwrap();
        let item = queue.enqueue(new_item("s1")).await.unwrap();

        let failed = queue
            .mark_failed(&item.id, "timeout", Some(Duration::from_millis(0)))
            .await
            .unwrap();
        assert_eq!(failed.status, SyncItemStatus::Failed);
        assert_eq!(failed.retries, 1);
        assert_eq!(failed.last_error.as_deref(), Some("timeout"));
        assert!(failed.next_retry.is_some());

        let due = queue.retryable_items().await.unwrap();
        assert_eq!(due.len(), 1);

        // a failed item without next_retry is never retryable
        let permanent = queue.mark_failed(&item.id, "fatal", None).await.unwrap();
        assert!(permanent.next_retry.is_none());
        assert!(queue.retryable_items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_driver_gives_up_at_max_retries() {
        let temp = TempDir::new().unwrap();
        let queue = Arc::new(SyncQueue::new(temp.path()).await.unwrap());
        queue.enqueue(new_item("s1")).await.unwrap();

        let transport = Arc::new(FlakyTransport {
            failures: AtomicUsize::new(usize::MAX),
        });
        let driver = SyncDriver::new(queue.clone(), transport).with_policy(BackoffPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_retries: 3,
            jitter_ms: 0,
        });

        // attempts 1 and 2 schedule retries
        let after_first = driver.process_next().await.unwrap().unwrap();
        assert_eq!(after_first.status, SyncItemStatus::Failed);
        assert_eq!(after_first.retries, 1);
        let first_retry_at = after_first.next_retry.unwrap();

        let after_second = driver.retry_due().await.unwrap();
        // may be empty if the retry time has not arrived yet on a fast box
        let after_second = if after_second.is_empty() {
            tokio::time::sleep(Duration::from_millis(70)).await;
            driver.retry_due().await.unwrap()
        } else {
            after_second
        };
        assert_eq!(after_second.len(), 1);
        assert_eq!(after_second[0].retries, 2);
        let second_retry_at = after_second[0].next_retry.unwrap();
        assert!(second_retry_at >= first_retry_at);

        // attempt 3 hits max_retries: surfaced error, no next_retry
        tokio::time::sleep(Duration::from_millis(120)).await;
        let result = driver.retry_due().await.unwrap();
        assert!(result.is_empty());
        let items = queue.list_items(None).await.unwrap();
        let item = &items[0];
        assert_eq!(item.status, SyncItemStatus::Failed);
        assert_eq!(item.retries, 3);
        assert!(item.next_retry.is_none());
        assert!(item.last_error.is_some());
    }

    #[tokio::test]
    async fn test_driver_success_path() {
        let temp = TempDir::new().unwrap();
        let queue = Arc::new(SyncQueue::new(temp.path()).await.unwrap());
        queue.enqueue(new_item("s1")).await.unwrap();

        let transport = Arc::new(FlakyTransport {
            failures: AtomicUsize::new(0),
        });
        let driver = SyncDriver::new(queue.clone(), transport);

        let sent = driver.process_next().await.unwrap().unwrap();
        assert_eq!(sent.status, SyncItemStatus::Synced);
        assert!(driver.process_next().await.unwrap().is_none());
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = BackoffPolicy::default();
        let d1 = policy.delay_for_attempt(1);
        let d2 = policy.delay_for_attempt(2);
        let d3 = policy.delay_for_attempt(3);

        // base values double: 1s, 2s, 4s (each plus up to 1s jitter)
        assert!(d1 >= Duration::from_millis(1_000) && d1 < Duration::from_millis(2_000));
        assert!(d2 >= Duration::from_millis(2_000) && d2 < Duration::from_millis(3_000));
        assert!(d3 >= Duration::from_millis(4_000) && d3 < Duration::from_millis(5_000));

        // capped at 60s plus jitter
        let huge = policy.delay_for_attempt(30);
        assert!(huge < Duration::from_millis(61_000));
    }

    #[tokio::test]
    async fn test_cleanup_and_stats() {
        let temp = TempDir::new().unwrap();
        let queue = SyncQueue::new(temp.path()).await.unwrap();

        let a = queue.enqueue(new_item("s1")).await.unwrap();
        queue.enqueue(new_item("s2")).await.unwrap();
        queue.mark_synced(&a.id).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.synced, 1);

        let removed = queue.cleanup_synced(Duration::ZERO).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(queue.stats().await.unwrap().total, 1);

        assert_eq!(queue.clear().await.unwrap(), 1);
        assert_eq!(queue.stats().await.unwrap().total, 0);
    }

    #[test]
    fn test_artifact_roundtrip() {
        let payload = b"session summary markdown".repeat(50);
        let artifact = SyncArtifact::prepare(&payload).unwrap();

        assert_eq!(artifact.original_bytes, payload.len());
        assert!(artifact.compressed_bytes < artifact.original_bytes);
        assert_eq!(artifact.checksum.len(), 64);

        let opened = artifact.open().unwrap();
        assert_eq!(opened, payload);

        let data = artifact.to_item_data();
        assert_eq!(data["originalBytes"], payload.len());
        assert!(data["payload"].as_str().unwrap().len() > 0);
    }

    #[test]
    fn test_artifact_detects_corruption() {
        let artifact = SyncArtifact::prepare(b"payload").unwrap();
        let tampered = SyncArtifact {
            checksum: "0".repeat(64),
            ..artifact
        };
        assert!(tampered.open().is_err());
    }
}
