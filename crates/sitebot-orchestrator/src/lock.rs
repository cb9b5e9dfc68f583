//! TTL-bounded mutual exclusion keyed by task fingerprint.
//!
//! The contract is the same for every backing store; only the blast radius
//! differs. [`MemoryLockStore`] excludes within one process,
//! [`FileLockStore`] excludes every process sharing the lock directory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sitebot_core::{SitebotError, SitebotResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Backing store for named claims.
///
/// Every claim carries an owner token; `release` only removes a claim the
/// caller owns, so a holder whose TTL lapsed cannot drop its successor's lock.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Claim `key` for `owner` unless an unexpired claim exists.
    async fn try_claim(&self, key: &str, owner: &str, ttl: Duration) -> SitebotResult<bool>;

    /// Drop the claim on `key` if `owner` still holds it.
    async fn release(&self, key: &str, owner: &str) -> SitebotResult<()>;
}

struct Claim {
    owner: String,
    expires_at: Instant,
}

/// Process-local lock store.
#[derive(Default)]
pub struct MemoryLockStore {
    claims: Mutex<HashMap<String, Claim>>,
}

impl MemoryLockStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_claim(&self, key: &str, owner: &str, ttl: Duration) -> SitebotResult<bool> {
        let now = Instant::now();
        let mut claims = self.claims.lock();
        if let Some(existing) = claims.get(key) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }
        claims.insert(
            key.to_string(),
            Claim {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, owner: &str) -> SitebotResult<()> {
        let mut claims = self.claims.lock();
        if claims.get(key).is_some_and(|c| c.owner == owner) {
            claims.remove(key);
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Marker {
    owner: String,
    expires_at: DateTime<Utc>,
}

/// What a claimant found at an occupied marker path.
enum Observed {
    Gone,
    Live,
    /// Expired (or abandoned half-written); holds the exact bytes read.
    Stale(String),
}

/// Lock store backed by one marker file per key.
///
/// Markers are only ever removed by moving them to a unique tombstone
/// first and checking that the tombstone still holds the bytes that were
/// judged removable, so a claimant never deletes a marker written after
/// its own read.
pub struct FileLockStore {
    dir: PathBuf,
    ops: tokio::sync::Mutex<()>,
}

impl FileLockStore {
    /// Open (and create) the lock directory.
    pub async fn new(dir: impl Into<PathBuf>) -> SitebotResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            ops: tokio::sync::Mutex::new(()),
        })
    }

    /// Directory holding the marker files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Marker file for `key`: the SHA-256 of the key, so distinct keys
    /// never share a file.
    pub fn marker_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{}.lock", hex::encode(digest)))
    }

    async fn observe(path: &Path, ttl: Duration) -> SitebotResult<Observed> {
        let data = match tokio::fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Observed::Gone),
            Err(e) => return Err(e.into()),
        };
        let stale = match serde_json::from_str::<Marker>(&data) {
            Ok(marker) => marker.expires_at <= Utc::now(),
            Err(_) => {
                // Half-written marker: only reclaim once it is older than a TTL.
                let modified = match tokio::fs::metadata(path).await {
                    Ok(meta) => meta.modified()?,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Ok(Observed::Gone)
                    }
                    Err(e) => return Err(e.into()),
                };
                modified.elapsed().unwrap_or_default() >= ttl
            }
        };
        Ok(if stale {
            Observed::Stale(data)
        } else {
            Observed::Live
        })
    }

    /// Remove the marker at `path` only if it still holds `expected`.
    /// Returns whether the path is now free of that marker.
    async fn evict(&self, path: &Path, expected: &str) -> SitebotResult<bool> {
        let tombstone = self.dir.join(format!("{}.tomb", Uuid::new_v4()));
        match tokio::fs::rename(path, &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }
        let moved = tokio::fs::read_to_string(&tombstone).await?;
        if moved == expected {
            tokio::fs::remove_file(&tombstone).await?;
            return Ok(true);
        }

        // Another process replaced the marker after it was read: put it back.
        let restored = tokio::fs::hard_link(&tombstone, path).await;
        tokio::fs::remove_file(&tombstone).await?;
        match restored {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!(path = %path.display(), "Lock marker replaced while restoring it");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(false)
    }
}

#[async_trait]
impl LockStore for FileLockStore {
    async fn try_claim(&self, key: &str, owner: &str, ttl: Duration) -> SitebotResult<bool> {
        let _ops = self.ops.lock().await;
        let path = self.marker_path(key);
        for _ in 0..2 {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    let expires_at = Utc::now()
                        + chrono::Duration::from_std(ttl)
                            .map_err(|e| SitebotError::Config(format!("lock ttl: {e}")))?;
                    let marker = Marker {
                        owner: owner.to_string(),
                        expires_at,
                    };
                    file.write_all(serde_json::to_string(&marker)?.as_bytes())
                        .await?;
                    file.flush().await?;
                    return Ok(true);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match Self::observe(&path, ttl).await? {
                        Observed::Live => return Ok(false),
                        Observed::Gone => {}
                        Observed::Stale(data) => {
                            debug!(key = %key, "Reclaiming expired lock marker");
                            if !self.evict(&path, &data).await? {
                                return Ok(false);
                            }
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    async fn release(&self, key: &str, owner: &str) -> SitebotResult<()> {
        let _ops = self.ops.lock().await;
        let path = self.marker_path(key);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let owned = serde_json::from_str::<Marker>(&data).is_ok_and(|m| m.owner == owner);
        if owned {
            self.evict(&path, &data).await?;
        }
        Ok(())
    }
}

/// Hands out [`LockGuard`]s over an injected [`LockStore`].
///
/// Acquisition is never retried here; callers pick their own retry policy.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
}

impl LockManager {
    /// Wrap a lock store.
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    /// Manager over a fresh process-local store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryLockStore::new()))
    }

    /// Claim `key` for `ttl`, failing with [`SitebotError::Locked`] if held.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> SitebotResult<LockGuard> {
        let owner = Uuid::new_v4().to_string();
        if self.store.try_claim(key, &owner, ttl).await? {
            debug!(key = %key, ttl_secs = ttl.as_secs(), "Lock acquired");
            Ok(LockGuard {
                key: key.to_string(),
                owner,
                store: Arc::clone(&self.store),
                released: AtomicBool::new(false),
            })
        } else {
            Err(SitebotError::Locked(key.to_string()))
        }
    }
}

/// An exclusive claim. Released exactly once: explicitly via
/// [`LockGuard::release`], or on drop.
pub struct LockGuard {
    key: String,
    owner: String,
    store: Arc<dyn LockStore>,
    released: AtomicBool,
}

impl LockGuard {
    /// The locked key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the claim has been given back.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Give the claim back. Later calls are no-ops.
    pub async fn release(&self) -> SitebotResult<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(key = %self.key, "Lock released");
        self.store.release(&self.key, &self.owner).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "Lock guard dropped outside a runtime; claim left to expire");
            return;
        };
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);
        handle.spawn(async move {
            if let Err(e) = store.release(&key, &owner).await {
                warn!(key = %key, error = %e, "Failed to release dropped lock");
            }
        });
    }
}
