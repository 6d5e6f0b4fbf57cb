//! Stable project identity
//!
//! Sessions are grouped on disk by a 16-hex-character hash derived from the
//! normalized project path plus optional git remote and branch. The hash is
//! stable across processes and platforms: trailing separators are stripped
//! before hashing, and the same inputs always produce the same digest.
//! Resolved identities are cached for five minutes per path.

use std::path::Path;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const CACHE_TTL: Duration = Duration::from_secs(300);

static IDENTITY_CACHE: Lazy<DashMap<String, (ProjectIdentity, Instant)>> =
    Lazy::new(DashMap::new);

/// Identity of a project directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectIdentity {
    pub normalized_path: String,
    pub git_remote: Option<String>,
    pub git_branch: Option<String>,
    /// First 16 hex characters of the SHA-256 over the joined inputs
    pub hash: String,
}

impl ProjectIdentity {
    /// Resolve an identity from the path alone.
    pub fn resolve(path: &Path) -> Self {
        Self::resolve_with(path, None, None)
    }

    /// Resolve an identity with git metadata supplied by the caller. Results
    /// are cached per normalized path for five minutes.
    pub fn resolve_with(path: &Path, git_remote: Option<&str>, git_branch: Option<&str>) -> Self {
        let normalized = normalize_path(path);
        let cache_key = format!(
            "{normalized}|{}|{}",
            git_remote.unwrap_or(""),
            git_branch.unwrap_or("")
        );

        if let Some(entry) = IDENTITY_CACHE.get(&cache_key) {
            let (identity, stamp) = entry.value();
            if stamp.elapsed() < CACHE_TTL {
                return identity.clone();
            }
        }

        let identity = Self {
            hash: project_hash(&normalized, git_remote, git_branch),
            normalized_path: normalized,
            git_remote: git_remote.map(str::to_string),
            git_branch: git_branch.map(str::to_string),
        };
        IDENTITY_CACHE.insert(cache_key, (identity.clone(), Instant::now()));
        identity
    }

    /// Drop all cached identities. Intended for tests.
    pub fn clear_cache() {
        IDENTITY_CACHE.clear();
    }
}

/// Strip trailing separators from the path's string form.
pub fn normalize_path(path: &Path) -> String {
    let text = path.to_string_lossy();
    let trimmed = text.trim_end_matches(['/', '\\']);
    if trimmed.is_empty() {
        // the filesystem root normalizes to itself
        text.into_owned()
    } else {
        trimmed.to_string()
    }
}

/// 16-hex-char digest over `normalized | remote? | branch?` joined by `|`,
/// absent parts omitted.
pub fn project_hash(normalized: &str, remote: Option<&str>, branch: Option<&str>) -> String {
    let mut parts = vec![normalized];
    if let Some(remote) = remote {
        parts.push(remote);
    }
    if let Some(branch) = branch {
        parts.push(branch);
    }

    let digest = Sha256::digest(parts.join("|").as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}
