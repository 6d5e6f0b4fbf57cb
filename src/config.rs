//! Runtime configuration
//!
//! Typed view of the JSON config the external CLI wrapper loads. Unknown
//! fields are ignored and missing fields take defaults; validation runs on
//! load and on every update. Patches are applied with a documented deep
//! merge: arrays replace, nulls replace, other scalars replace, and map-like
//! objects merge key-wise.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::error::{ContextError, Result};

/// Capability selector for the pluggable summarizer. Not a vendor binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SummaryModel {
    /// Small, fast summarization model
    #[default]
    #[serde(rename = "haiku")]
    Haiku,
    /// Whatever model the host agent is already configured with
    #[serde(rename = "user-default")]
    UserDefault,
}

/// Cloud sync settings. The transport itself is an external collaborator;
/// the runtime only validates the credentials are present when enabled.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct CloudSyncConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
}

/// Session cleanup policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CleanupConfig {
    /// Sessions older than this many days become eligible for removal
    pub max_session_age: u32,
    /// Soft cap on total storage, in megabytes
    pub max_storage_size: u32,
    pub auto_cleanup: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            max_session_age: 30,
            max_storage_size: 500,
            auto_cleanup: false,
        }
    }
}

/// Storage layout roots
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageConfig {
    /// Root directory for everything the runtime persists
    pub base_dir: PathBuf,
    /// Session hierarchy, relative to `base_dir` unless absolute
    pub sessions_dir: PathBuf,
    /// Sync queue directory, relative to `base_dir` unless absolute
    pub sync_queue_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            sessions_dir: PathBuf::from("sessions"),
            sync_queue_dir: PathBuf::from("sync-queue"),
        }
    }
}

impl StorageConfig {
    /// Absolute sessions directory
    pub fn sessions_path(&self) -> PathBuf {
        resolve_under(&self.base_dir, &self.sessions_dir)
    }

    /// Absolute sync queue directory
    pub fn sync_queue_path(&self) -> PathBuf {
        resolve_under(&self.base_dir, &self.sync_queue_dir)
    }
}

fn resolve_under(base: &PathBuf, dir: &PathBuf) -> PathBuf {
    if dir.is_absolute() {
        dir.clone()
    } else {
        base.join(dir)
    }
}

/// Default storage root: `~/.ccjk/context`
pub fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ccjk")
        .join("context")
}

/// Top-level runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Master on/off switch
    pub enabled: bool,
    /// Whether the summarizer runs on each function call
    pub auto_summarize: bool,
    /// Token count at which compression triggers; must stay below
    /// `max_context_tokens`
    pub context_threshold: usize,
    /// Assumed context window of the host agent, in tokens
    pub max_context_tokens: usize,
    pub summary_model: SummaryModel,
    pub cloud_sync: CloudSyncConfig,
    pub cleanup: CleanupConfig,
    pub storage: StorageConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_summarize: true,
            context_threshold: 100_000,
            max_context_tokens: 150_000,
            summary_model: SummaryModel::default(),
            cloud_sync: CloudSyncConfig::default(),
            cleanup: CleanupConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parse a config from a JSON value, applying defaults for missing
    /// fields and ignoring unknown ones. Validation errors are fatal for the
    /// load, not the process.
    pub fn from_value(value: Value) -> Result<Self> {
        let config: RuntimeConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply a JSON patch to this config and return the merged result.
    ///
    /// Merge rules: arrays replace, nulls replace, other scalars replace,
    /// objects merge key-wise.
    pub fn merge_patch(&self, patch: Value) -> Result<Self> {
        let mut base = serde_json::to_value(self)?;
        deep_merge(&mut base, patch);
        Self::from_value(base)
    }

    /// Check the invariants enumerated for the config surface.
    pub fn validate(&self) -> Result<()> {
        if self.max_context_tokens == 0 {
            return Err(ContextError::ConfigInvalid(
                "maxContextTokens must be greater than 0".into(),
            ));
        }
        if self.context_threshold == 0 {
            return Err(ContextError::ConfigInvalid(
                "contextThreshold must be greater than 0".into(),
            ));
        }
        if self.context_threshold >= self.max_context_tokens {
            return Err(ContextError::ConfigInvalid(format!(
                "contextThreshold ({}) must be below maxContextTokens ({})",
                self.context_threshold, self.max_context_tokens
            )));
        }
        if self.cloud_sync.enabled {
            let missing_key = self
                .cloud_sync
                .api_key
                .as_deref()
                .map(str::is_empty)
                .unwrap_or(true);
            let missing_endpoint = self
                .cloud_sync
                .endpoint
                .as_deref()
                .map(str::is_empty)
                .unwrap_or(true);
            if missing_key || missing_endpoint {
                return Err(ContextError::ConfigInvalid(
                    "cloudSync.apiKey and cloudSync.endpoint are required when cloudSync.enabled"
                        .into(),
                ));
            }
        }
        if self.cleanup.max_session_age == 0 {
            return Err(ContextError::ConfigInvalid(
                "cleanup.maxSessionAge must be greater than 0".into(),
            ));
        }
        if self.cleanup.max_storage_size == 0 {
            return Err(ContextError::ConfigInvalid(
                "cleanup.maxStorageSize must be greater than 0".into(),
            ));
        }
        if self.storage.base_dir.as_os_str().is_empty() {
            return Err(ContextError::ConfigInvalid(
                "storage.baseDir is required".into(),
            ));
        }
        Ok(())
    }

    /// Compression trigger as a fraction of the context window.
    pub fn threshold_fraction(&self) -> f64 {
        self.context_threshold as f64 / self.max_context_tokens as f64
    }
}

/// Recursive merge of `patch` into `base`.
///
/// Arrays replace, nulls replace, other scalars replace; objects merge
/// key-wise with patch keys winning recursively.
pub fn deep_merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(base_value) => deep_merge(base_value, patch_value),
                    None => {
                        base_map.insert(key, patch_value);
                    }
                }
            }
        }
        (base_slot, patch_value) => {
            *base_slot = patch_value;
        }
    }
}
