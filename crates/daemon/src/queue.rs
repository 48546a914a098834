//! Per-user media queues
//!
//! Each user owns an ordered, bounded list of [`MediaItem`]s. A merge run takes the
//! whole list at once through [`QueueManager::begin_run`], which also enforces one
//! in-flight run per user.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Chat-platform user identifier
pub type UserId = i64;

/// Minimum number of items a merge needs
pub const MIN_MERGE_ITEMS: usize = 2;

/// Error type for queue operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue already holds `max` items
    #[error("queue is full ({max} videos max)")]
    QueueFull { max: usize },

    /// Fewer items than a merge needs
    #[error("need at least {need} videos to merge, have {have}")]
    InsufficientItems { have: usize, need: usize },

    /// The user already has a merge in flight
    #[error("a merge is already running for this user")]
    RunInProgress,
}

/// Where a queued item came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaOrigin {
    LocalUpload,
    RemoteFetch,
}

/// One video waiting to be merged
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaItem {
    pub path: PathBuf,
    pub origin: MediaOrigin,
    pub size_bytes: u64,
    pub enqueued_at: SystemTime,
}

impl MediaItem {
    pub fn new(path: impl Into<PathBuf>, origin: MediaOrigin, size_bytes: u64) -> Self {
        Self {
            path: path.into(),
            origin,
            size_bytes,
            enqueued_at: SystemTime::now(),
        }
    }

    /// Build an item for an existing file, reading its size from disk.
    pub fn from_file(path: &Path, origin: MediaOrigin) -> std::io::Result<Self> {
        let size = std::fs::metadata(path)?.len();
        Ok(Self::new(path, origin, size))
    }
}

/// Request to reclaim a user's scratch space, handed to the janitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimRequest {
    pub user_id: UserId,
    /// Only remove files older than the retention window
    pub keep_recent: bool,
    /// Inputs of the in-flight run; never removed
    pub protected: Vec<PathBuf>,
}

/// Backing storage for the per-user queues
///
/// Every method is atomic with respect to the other methods for the same user.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append unless the queue already holds `max` items. Returns the 1-based position.
    async fn push_bounded(
        &self,
        user: UserId,
        item: MediaItem,
        max: usize,
    ) -> Result<usize, QueueError>;

    /// Remove the item with `path`. Returns whether anything was removed.
    async fn remove(&self, user: UserId, path: &Path) -> bool;

    /// Take every item if there are at least `min`, leaving the queue empty.
    async fn take_all(&self, user: UserId, min: usize) -> Result<Vec<MediaItem>, QueueError>;

    /// Empty the queue, returning how many items were dropped.
    async fn clear(&self, user: UserId) -> usize;

    async fn snapshot(&self, user: UserId) -> Vec<MediaItem>;

    async fn len(&self, user: UserId) -> usize;

    /// Items queued across all users
    async fn total_len(&self) -> usize;
}

type Slot = Arc<tokio::sync::Mutex<Vec<MediaItem>>>;

/// In-memory [`QueueStore`] with one mutex per user id
#[derive(Default)]
pub struct InMemoryQueueStore {
    slots: Mutex<HashMap<UserId, Slot>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, user: UserId) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(user).or_default().clone()
    }

    /// Slot of `user` if one exists; read-only queries never create one.
    fn existing(&self, user: UserId) -> Option<Slot> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(&user).cloned()
    }

    /// Forget the user's slot once it is empty and nobody else holds it.
    ///
    /// Clones are only handed out under the map lock, so a strong count of one seen
    /// under that lock means no concurrent push can still land in the slot.
    fn release(&self, user: UserId, slot: Slot) {
        drop(slot);
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let idle = slots.get(&user).is_some_and(|slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|items| items.is_empty())
        });
        if idle {
            slots.remove(&user);
        }
    }

    /// Number of users with a live slot
    pub fn tracked_users(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn all_slots(&self) -> Vec<Slot> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.values().cloned().collect()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn push_bounded(
        &self,
        user: UserId,
        item: MediaItem,
        max: usize,
    ) -> Result<usize, QueueError> {
        let slot = self.slot(user);
        let mut items = slot.lock().await;
        if items.len() >= max {
            return Err(QueueError::QueueFull { max });
        }
        items.push(item);
        Ok(items.len())
    }

    async fn remove(&self, user: UserId, path: &Path) -> bool {
        let Some(slot) = self.existing(user) else {
            return false;
        };
        let removed = {
            let mut items = slot.lock().await;
            let before = items.len();
            items.retain(|item| item.path != path);
            items.len() != before
        };
        self.release(user, slot);
        removed
    }

    async fn take_all(&self, user: UserId, min: usize) -> Result<Vec<MediaItem>, QueueError> {
        let Some(slot) = self.existing(user) else {
            return Err(QueueError::InsufficientItems { have: 0, need: min });
        };
        let taken = {
            let mut items = slot.lock().await;
            if items.len() < min {
                return Err(QueueError::InsufficientItems {
                    have: items.len(),
                    need: min,
                });
            }
            std::mem::take(&mut *items)
        };
        self.release(user, slot);
        Ok(taken)
    }

    async fn clear(&self, user: UserId) -> usize {
        let Some(slot) = self.existing(user) else {
            return 0;
        };
        let dropped = {
            let mut items = slot.lock().await;
            let dropped = items.len();
            items.clear();
            dropped
        };
        self.release(user, slot);
        dropped
    }

    async fn snapshot(&self, user: UserId) -> Vec<MediaItem> {
        match self.existing(user) {
            Some(slot) => slot.lock().await.clone(),
            None => Vec::new(),
        }
    }

    async fn len(&self, user: UserId) -> usize {
        match self.existing(user) {
            Some(slot) => slot.lock().await.len(),
            None => 0,
        }
    }

    async fn total_len(&self) -> usize {
        let mut total = 0;
        for slot in self.all_slots() {
            total += slot.lock().await.len();
        }
        total
    }
}

/// Bookkeeping for one in-flight run
struct ActiveRun {
    token: CancellationToken,
    inputs: Vec<PathBuf>,
}

type ActiveRuns = Arc<Mutex<HashMap<UserId, ActiveRun>>>;

/// Marks a user's run as in flight; dropping it releases the user
pub struct RunGuard {
    user_id: UserId,
    token: CancellationToken,
    active: ActiveRuns,
}

impl RunGuard {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Token fired by [`QueueManager::cancel_run`]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.user_id);
        debug!(user_id = self.user_id, "run guard released");
    }
}

impl std::fmt::Debug for RunGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunGuard")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Entry and exit gate for the merge pipeline
pub struct QueueManager {
    store: Arc<dyn QueueStore>,
    max_videos: usize,
    active: ActiveRuns,
}

impl QueueManager {
    pub fn new(store: Arc<dyn QueueStore>, max_videos: usize) -> Self {
        Self {
            store,
            max_videos,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn in_memory(max_videos: usize) -> Self {
        Self::new(Arc::new(InMemoryQueueStore::new()), max_videos)
    }

    /// Append `item`; fails with `QueueFull` without touching the queue.
    pub async fn enqueue(&self, user: UserId, item: MediaItem) -> Result<usize, QueueError> {
        let path = item.path.clone();
        let position = self.store.push_bounded(user, item, self.max_videos).await?;
        info!(user_id = user, position, path = %path.display(), "video queued");
        Ok(position)
    }

    /// Remove a specific item; no-op if it is not queued.
    pub async fn remove(&self, user: UserId, path: &Path) -> bool {
        self.store.remove(user, path).await
    }

    /// Empty the queue and hand back the reclamation the caller should schedule.
    ///
    /// While a run is in flight only files past the retention window may be
    /// reclaimed, and the run's own inputs are excluded.
    pub async fn clear(&self, user: UserId) -> ReclaimRequest {
        let dropped = self.store.clear(user).await;
        let protected = self.run_inputs(user);
        let keep_recent = protected.is_some();
        info!(user_id = user, dropped, keep_recent, "queue cleared");
        ReclaimRequest {
            user_id: user,
            keep_recent,
            protected: protected.unwrap_or_default(),
        }
    }

    /// Inputs taken by the user's in-flight run, or `None` when nothing runs.
    pub fn run_inputs(&self, user: UserId) -> Option<Vec<PathBuf>> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.get(&user).map(|run| run.inputs.clone())
    }

    pub async fn snapshot(&self, user: UserId) -> Vec<MediaItem> {
        self.store.snapshot(user).await
    }

    /// Atomically take the queue for a merge run.
    ///
    /// Fails with `RunInProgress` while the user's previous run holds its guard, and
    /// with `InsufficientItems` (leaving the queue intact) below two items.
    pub async fn begin_run(&self, user: UserId) -> Result<(Vec<MediaItem>, RunGuard), QueueError> {
        let token = {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.contains_key(&user) {
                return Err(QueueError::RunInProgress);
            }
            let token = CancellationToken::new();
            active.insert(
                user,
                ActiveRun {
                    token: token.clone(),
                    inputs: Vec::new(),
                },
            );
            token
        };
        let guard = RunGuard {
            user_id: user,
            token,
            active: self.active.clone(),
        };

        // On error the guard drops here and releases the claim.
        let items = self.store.take_all(user, MIN_MERGE_ITEMS).await?;
        if let Some(run) = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&user)
        {
            run.inputs = items.iter().map(|item| item.path.clone()).collect();
        }
        info!(user_id = user, items = items.len(), "run started");
        Ok((items, guard))
    }

    /// Fire the cancellation token of the user's in-flight run.
    pub fn cancel_run(&self, user: UserId) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.get(&user) {
            Some(run) => {
                run.token.cancel();
                info!(user_id = user, "run cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, user: UserId) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.contains_key(&user)
    }

    pub async fn len(&self, user: UserId) -> usize {
        self.store.len(user).await
    }

    pub async fn total_len(&self) -> usize {
        self.store.total_len().await
    }

    pub fn capacity(&self) -> usize {
        self.max_videos
    }
}
