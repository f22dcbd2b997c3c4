//! Advisory stack locks
//!
//! A lock is a marker blob `<lock dir>/<lock id>.json` written by one backend
//! instance. Nothing in the blob store enforces exclusion: two instances can
//! race and both write a marker. The protocol is check, write, check again;
//! whichever instance sees a foreign marker on its second check backs off.
//! Markers left behind by crashed processes are removed with [`LockManager::cancel`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, BackendResult};
use crate::blob::{BlobStore, ListEntry};
use crate::layout::{lock_dir, lock_path};
use crate::reference::StackReference;

/// Locks older than this are reported as stale (15 minutes)
pub const DEFAULT_LOCK_TIMEOUT_SECS: i64 = 900;

/// Contents of a lock marker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Lock ID of the backend instance holding the lock
    pub id: String,
    /// The operation being performed (e.g., "update", "rename")
    pub operation: String,
    /// Who acquired the lock (username@hostname)
    pub who: String,
    #[serde(default)]
    pub pid: u32,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(id: impl Into<String>, operation: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            operation: operation.into(),
            who: get_lock_owner(),
            pid: std::process::id(),
            created: now,
            expires: now + Duration::seconds(DEFAULT_LOCK_TIMEOUT_SECS),
        }
    }

    /// Placeholder for a marker whose contents could not be decoded
    fn unreadable(entry: &ListEntry) -> Self {
        let id = entry.file_name().trim_end_matches(".json").to_string();
        let created = entry.modified.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Self {
            id,
            operation: "unknown".to_string(),
            who: "unknown".to_string(),
            pid: 0,
            created,
            expires: created + Duration::seconds(DEFAULT_LOCK_TIMEOUT_SECS),
        }
    }

    /// Check if the lock has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires
    }

    /// One-line summary for conflict messages
    pub fn describe(&self) -> String {
        let stale = if self.is_expired() {
            format!(", stale since {}", self.expires.to_rfc3339())
        } else {
            String::new()
        };
        format!(
            "{} (operation: {}, pid: {}, lock ID: {}, acquired {}{})",
            self.who,
            self.operation,
            self.pid,
            self.id,
            self.created.to_rfc3339(),
            stale
        )
    }
}

/// Get the lock owner string (username@hostname)
fn get_lock_owner() -> String {
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{}@{}", username, hostname)
}

/// Takes and releases the locks of one backend instance
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn BlobStore>,
    lock_id: String,
}

impl LockManager {
    /// A manager with a fresh lock ID
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            lock_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// Fail with [`BackendError::Locked`] if another instance holds a lock on the stack
    pub async fn check_for_lock(&self, reference: &StackReference) -> BackendResult<()> {
        let own = lock_path(reference, &self.lock_id);
        let entries = self
            .store
            .list(&format!("{}/", lock_dir(reference)), Some("/"))
            .await?;

        let mut foreign: Vec<LockInfo> = Vec::new();
        for entry in entries.iter().filter(|e| !e.is_dir && e.key != own) {
            match self.store.read_all(&entry.key).await {
                Ok(data) => foreign.push(
                    serde_json::from_slice(&data).unwrap_or_else(|_| LockInfo::unreadable(entry)),
                ),
                // Released between the listing and the read.
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err.into()),
            }
        }

        if foreign.is_empty() {
            Ok(())
        } else {
            Err(BackendError::locked(&foreign))
        }
    }

    /// Lock a stack for `operation`
    ///
    /// Locks are not re-entrant: while this instance holds the stack, a
    /// second acquisition fails with [`BackendError::Locked`] instead of
    /// sharing the marker.
    pub async fn lock(&self, reference: &StackReference, operation: &str) -> BackendResult<LockGuard> {
        self.check_for_lock(reference).await?;

        let own = lock_path(reference, &self.lock_id);
        match self.store.read_all(&own).await {
            Ok(data) => {
                let held = serde_json::from_slice(&data)
                    .unwrap_or_else(|_| LockInfo::new(self.lock_id.clone(), "unknown"));
                return Err(BackendError::locked(&[held]));
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        let info = LockInfo::new(self.lock_id.clone(), operation);
        let data = serde_json::to_vec_pretty(&info)?;
        self.store
            .write_all(
                &own,
                &data,
                Some("application/json"),
            )
            .await?;
        log::debug!("locked {} for {} ({})", reference, operation, self.lock_id);

        let guard = LockGuard {
            manager: self.clone(),
            reference: reference.clone(),
            released: false,
        };
        if let Err(err) = self.check_for_lock(reference).await {
            if let Err(unlock_err) = guard.release().await {
                log::warn!("failed to remove lock on {}: {}", reference, unlock_err);
            }
            return Err(err);
        }
        Ok(guard)
    }

    /// Remove this instance's marker; a missing marker is not an error
    pub async fn unlock(&self, reference: &StackReference) -> BackendResult<()> {
        match self.store.delete(&lock_path(reference, &self.lock_id)).await {
            Ok(()) => {
                log::debug!("unlocked {} ({})", reference, self.lock_id);
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove every marker on the stack, whoever wrote it
    pub async fn cancel(&self, reference: &StackReference) -> BackendResult<()> {
        let entries = self
            .store
            .list(&format!("{}/", lock_dir(reference)), Some("/"))
            .await?;
        for entry in entries.iter().filter(|e| !e.is_dir) {
            match self.store.delete(&entry.key).await {
                Ok(()) => log::info!("removed lock {} on {}", entry.file_name(), reference),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

/// A held stack lock
///
/// Call [`LockGuard::release`] when done. A guard dropped without being
/// released (an early return, a panic or a cancelled future) schedules the
/// unlock on the current tokio runtime instead.
#[must_use = "dropping the guard releases the lock in the background"]
pub struct LockGuard {
    manager: LockManager,
    reference: StackReference,
    released: bool,
}

impl LockGuard {
    pub fn reference(&self) -> &StackReference {
        &self.reference
    }

    pub async fn release(mut self) -> BackendResult<()> {
        self.released = true;
        self.manager.unlock(&self.reference).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let manager = self.manager.clone();
        let reference = self.reference.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::warn!("releasing lock on {} after an interrupted operation", reference);
                handle.spawn(async move {
                    if let Err(err) = manager.unlock(&reference).await {
                        log::warn!("failed to remove lock on {}: {}", reference, err);
                    }
                });
            }
            Err(_) => log::warn!(
                "lock on {} could not be released; remove it with `bookkeeper cancel`",
                reference
            ),
        }
    }
}
