//! Merging remote data into the local store.
//!
//! Subscriptions, sync queries, mutation responses and conflict resolution
//! all write remote records through [`Merger`]. Each merge runs inside the
//! record's critical section, shared with local writes, so the version
//! check and the write are atomic with respect to each other.

use crate::error::Result;
use crate::outbox::MutationOutbox;
use crate::storage::LocalStore;
use dashmap::DashMap;
use harbor_engine::{merge, Initiator, MergeAction, QueryPredicate, Record, RecordKey, VersionRule};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-record async locks.
///
/// Entries are created on demand and dropped once nobody holds or waits
/// for them.
#[derive(Debug, Clone, Default)]
pub struct KeyLocks {
    locks: Arc<DashMap<RecordKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the critical section for `key`.
    pub async fn lock(&self, key: &RecordKey) -> KeyGuard {
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyGuard {
            key: key.clone(),
            locks: self.locks.clone(),
            _guard: guard,
        }
    }

    /// Number of keys with a live lock.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held for the duration of a per-record critical section.
pub struct KeyGuard {
    key: RecordKey,
    locks: Arc<DashMap<RecordKey, Arc<Mutex<()>>>>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // The map and this guard hold the only references when nobody waits
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) <= 2);
    }
}

/// What a merge did to the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Created,
    Updated,
    Deleted,
    /// Only the version and timestamps were adopted
    MetadataOnly,
    /// The incoming record was not newer
    Stale,
}

impl MergeOutcome {
    pub fn applied(self) -> bool {
        !matches!(self, MergeOutcome::Stale)
    }
}

#[derive(Clone)]
pub struct Merger {
    store: Arc<dyn LocalStore>,
    outbox: Arc<MutationOutbox>,
    locks: KeyLocks,
}

impl Merger {
    pub fn new(store: Arc<dyn LocalStore>, outbox: Arc<MutationOutbox>, locks: KeyLocks) -> Self {
        Self {
            store,
            outbox,
            locks,
        }
    }

    pub fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    /// Merge a subscription or sync record.
    pub async fn merge_remote(&self, record: Record, rule: VersionRule) -> Result<MergeOutcome> {
        self.merge(record, rule, None).await
    }

    /// Merge the server's response to a delivered mutation.
    ///
    /// The delivering entry itself does not count as a pending change.
    pub async fn merge_response(&self, record: Record, mutation_id: &str) -> Result<MergeOutcome> {
        self.merge(record, VersionRule::Newer, Some(mutation_id)).await
    }

    /// Force the remote copy into the store regardless of versions.
    pub async fn apply_remote(&self, record: Record) -> Result<MergeOutcome> {
        self.merge(record, VersionRule::Always, None).await
    }

    pub async fn merge(
        &self,
        incoming: Record,
        rule: VersionRule,
        exclude: Option<&str>,
    ) -> Result<MergeOutcome> {
        let key = incoming.key();
        let _guard = self.locks.lock(&key).await;

        let local = self.store.get(&key.model, &key.id).await?;
        let has_pending = match exclude {
            Some(id) => self.outbox.has_pending_except(&key, id).await,
            None => self.outbox.has_pending(&key).await,
        };

        let action = merge::decide(local.as_ref(), &incoming, rule, has_pending);
        let outcome = match action {
            MergeAction::Skip => MergeOutcome::Stale,
            MergeAction::Save => {
                let write = self
                    .store
                    .save(incoming, Initiator::SyncEngine, &QueryPredicate::All)
                    .await?;
                match write.previous {
                    Some(prev) if prev.is_active() => MergeOutcome::Updated,
                    _ => MergeOutcome::Created,
                }
            }
            MergeAction::Delete => {
                self.store
                    .delete(incoming, Initiator::SyncEngine, &QueryPredicate::All)
                    .await?;
                MergeOutcome::Deleted
            }
            MergeAction::MetadataOnly => {
                let Some(mut local) = local else {
                    return Ok(MergeOutcome::Stale);
                };
                local.adopt_sync_metadata(&incoming);
                if local.deleted {
                    self.store
                        .delete(local, Initiator::SyncEngine, &QueryPredicate::All)
                        .await?;
                } else {
                    self.store
                        .save(local, Initiator::SyncEngine, &QueryPredicate::All)
                        .await?;
                }
                MergeOutcome::MetadataOnly
            }
        };

        tracing::debug!(key = %key, ?rule, ?outcome, "Merged remote record");
        Ok(outcome)
    }
}
