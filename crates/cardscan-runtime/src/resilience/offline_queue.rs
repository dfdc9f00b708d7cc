//! FIFO of deferred mutating actions, replayed once connectivity returns.
//!
//! The queue lives in memory and, when a path is configured, is mirrored to a
//! JSON snapshot after every change. Replay happens outside the state lock so
//! enqueues never wait on dependency I/O.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::QueueSettings;
use crate::error::DependencyError;

/// Errors reading or writing the queue snapshot.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue snapshot is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A mutating operation waiting for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineAction {
    pub id: u64,
    pub action_kind: String,
    pub payload: Map<String, Value>,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// An action before it is assigned an id.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    pub kind: String,
    pub payload: Map<String, Value>,
}

impl PendingAction {
    pub fn new(kind: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Build an action from any serializable value. Non-object values are
    /// stored under a `value` key.
    pub fn from_serialize<T: Serialize>(
        kind: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        let payload = match serde_json::to_value(value)? {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Ok(Self::new(kind, payload))
    }
}

/// Replays queued actions against the real dependency.
#[async_trait]
pub trait ActionReplayer: Send + Sync {
    async fn replay(&self, action: &OfflineAction) -> Result<(), DependencyError>;
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Actions replayed successfully and removed
    pub processed: usize,

    /// Actions dropped after reaching the retry cap
    pub dropped: Vec<OfflineAction>,

    /// Actions still queued when the pass ended
    pub remaining: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueSnapshot {
    next_id: u64,
    actions: Vec<OfflineAction>,
}

#[derive(Debug)]
struct QueueState {
    actions: VecDeque<OfflineAction>,
    next_id: u64,
}

/// Durable offline action queue.
#[derive(Debug)]
pub struct OfflineQueue {
    state: Mutex<QueueState>,
    max_retries: u32,
    path: Option<PathBuf>,
    drain_lock: tokio::sync::Mutex<()>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl OfflineQueue {
    /// Memory-only queue. Nothing survives a restart.
    pub fn in_memory(max_retries: u32) -> Self {
        Self::with_actions(max_retries, None, VecDeque::new(), 1)
    }

    /// Create a queue, restoring any snapshot left at `settings.path`.
    ///
    /// This is the only way to attach a snapshot file, so a restart never
    /// overwrites actions queued before it.
    pub async fn open(settings: &QueueSettings) -> Result<Self, QueueError> {
        let snapshot = match &settings.path {
            Some(path) => Self::read_snapshot(path).await?,
            None => None,
        };
        let (actions, next_id) = match snapshot {
            Some(snapshot) => {
                let after_last = snapshot.actions.iter().map(|a| a.id + 1).max().unwrap_or(1);
                let next_id = snapshot.next_id.max(after_last);
                (snapshot.actions, next_id)
            }
            None => (Vec::new(), 1),
        };
        if !actions.is_empty() {
            tracing::info!(restored = actions.len(), next_id, "Restored offline queue");
        }
        Ok(Self::with_actions(
            settings.max_retries,
            settings.path.clone(),
            actions.into(),
            next_id,
        ))
    }

    fn with_actions(
        max_retries: u32,
        path: Option<PathBuf>,
        actions: VecDeque<OfflineAction>,
        next_id: u64,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState { actions, next_id }),
            max_retries: max_retries.max(1),
            path,
            drain_lock: tokio::sync::Mutex::new(()),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Read the actions stored in a snapshot file. A missing file is empty.
    pub async fn load(path: impl AsRef<Path>) -> Result<Vec<OfflineAction>, QueueError> {
        Ok(Self::read_snapshot(path.as_ref())
            .await?
            .map(|snapshot| snapshot.actions)
            .unwrap_or_default())
    }

    async fn read_snapshot(path: &Path) -> Result<Option<QueueSnapshot>, QueueError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Append an action and return its id.
    pub async fn enqueue(&self, action: PendingAction) -> u64 {
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.actions.push_back(OfflineAction {
                id,
                action_kind: action.kind,
                payload: action.payload,
                enqueued_at: Utc::now(),
                retry_count: 0,
            });
            id
        };
        tracing::info!(id, size = self.size(), "Queued offline action");
        self.persist_logged().await;
        id
    }

    /// Replay queued actions in FIFO order.
    ///
    /// A failed replay increments the action's retry count and ends the pass
    /// with the action still at the front. Once the count reaches the cap the
    /// action is dropped and the pass continues with the next one. Only one
    /// drain runs at a time; concurrent callers wait their turn.
    ///
    /// The front action stays in the queue while it is being replayed, so
    /// dropping the returned future never loses it.
    pub async fn drain(&self, replayer: &dyn ActionReplayer) -> DrainReport {
        let _drain = self.drain_lock.lock().await;
        let mut report = DrainReport::default();

        loop {
            let Some(action) = self.state.lock().actions.front().cloned() else {
                break;
            };

            let result = replayer.replay(&action).await;

            let mut state = self.state.lock();
            match result {
                Ok(()) => {
                    state.actions.pop_front();
                    report.processed += 1;
                    tracing::debug!(id = action.id, kind = %action.action_kind, "Replayed offline action");
                }
                Err(error) => {
                    let retry_count = action.retry_count + 1;
                    if retry_count < self.max_retries {
                        if let Some(front) = state.actions.front_mut() {
                            front.retry_count = retry_count;
                        }
                        tracing::warn!(
                            id = action.id,
                            kind = %action.action_kind,
                            retry_count,
                            error = %error,
                            "Offline action replay failed, keeping at front"
                        );
                        break;
                    }

                    if let Some(mut dropped) = state.actions.pop_front() {
                        dropped.retry_count = retry_count;
                        tracing::error!(
                            id = dropped.id,
                            kind = %dropped.action_kind,
                            retry_count,
                            error = %error,
                            "Dropping offline action after repeated replay failures"
                        );
                        report.dropped.push(dropped);
                    }
                }
            }
        }

        report.remaining = self.size();
        self.persist_logged().await;
        report
    }

    pub fn size(&self) -> usize {
        self.state.lock().actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Queued actions, front first.
    pub fn snapshot(&self) -> Vec<OfflineAction> {
        self.state.lock().actions.iter().cloned().collect()
    }

    /// Write the current contents to the snapshot file, if one is configured.
    pub async fn persist(&self) -> Result<(), QueueError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let _persist = self.persist_lock.lock().await;
        let snapshot = {
            let state = self.state.lock();
            QueueSnapshot {
                next_id: state.next_id,
                actions: state.actions.iter().cloned().collect(),
            }
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            tracing::warn!(error = %e, "Failed to persist offline queue");
        }
    }
}
