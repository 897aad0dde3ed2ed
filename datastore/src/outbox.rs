//! Mutation outbox - the durable FIFO queue of local changes.
//!
//! Entries are persisted as `PendingMutation` system records through the
//! local store, and the in-memory index only changes after the write
//! commits. Delivery is FIFO by enqueue sequence with at most one entry in
//! flight per record key.

use crate::error::Result;
use crate::events::{DataStoreEvent, EventHub};
use crate::storage::LocalStore;
use crate::now_millis;
use harbor_engine::{
    collapse, Collapse, Initiator, MutationId, MutationStatus, PendingMutation, QueryOptions,
    QueryPredicate, RecordKey, StorageItemChange, PENDING_MUTATION_MODEL,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};

/// Outbox size change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxEvent {
    pub pending: usize,
}

#[derive(Debug, Default)]
struct OutboxState {
    /// Entries by sequence number
    entries: BTreeMap<u64, PendingMutation>,
    by_id: HashMap<MutationId, u64>,
    in_flight: HashSet<MutationId>,
    next_sequence: u64,
}

impl OutboxState {
    fn get(&self, id: &str) -> Option<&PendingMutation> {
        self.by_id.get(id).and_then(|seq| self.entries.get(seq))
    }

    fn latest_for(&self, key: &RecordKey) -> Option<&PendingMutation> {
        self.entries.values().rev().find(|m| &m.key() == key)
    }

    fn key_in_flight(&self, key: &RecordKey) -> bool {
        self.in_flight
            .iter()
            .filter_map(|id| self.get(id))
            .any(|m| &m.key() == key)
    }

    /// Oldest entry whose key has nothing in flight and no parked
    /// predecessor.
    fn next_deliverable(&self) -> Option<&PendingMutation> {
        let mut blocked: HashSet<RecordKey> = self
            .in_flight
            .iter()
            .filter_map(|id| self.get(id))
            .map(|m| m.key())
            .collect();
        for mutation in self.entries.values() {
            let key = mutation.key();
            if blocked.contains(&key) {
                continue;
            }
            if mutation.is_parked() {
                blocked.insert(key);
                continue;
            }
            return Some(mutation);
        }
        None
    }

    fn insert(&mut self, mutation: PendingMutation) {
        self.by_id.insert(mutation.id.clone(), mutation.sequence);
        self.next_sequence = self.next_sequence.max(mutation.sequence + 1);
        self.entries.insert(mutation.sequence, mutation);
    }

    fn remove(&mut self, id: &str) -> Option<PendingMutation> {
        let seq = self.by_id.remove(id)?;
        self.in_flight.remove(id);
        self.entries.remove(&seq)
    }
}

pub struct MutationOutbox {
    store: Arc<dyn LocalStore>,
    events: EventHub,
    state: Mutex<OutboxState>,
    work: Notify,
    changes: broadcast::Sender<OutboxEvent>,
}

impl MutationOutbox {
    pub fn new(store: Arc<dyn LocalStore>, events: EventHub) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            store,
            events,
            state: Mutex::new(OutboxState::default()),
            work: Notify::new(),
            changes,
        }
    }

    /// Enqueue a local change.
    ///
    /// If the record's latest entry is not in flight the change is folded
    /// into it; otherwise it is appended. Returns the resulting entry, or
    /// `None` when the change cancelled the pending one.
    pub async fn enqueue(&self, change: StorageItemChange) -> Result<Option<PendingMutation>> {
        let mut state = self.state.lock().await;
        let key = change.key();

        let existing = state
            .latest_for(&key)
            .filter(|m| !state.in_flight.contains(&m.id))
            .cloned();

        let result = match existing {
            Some(existing) => match collapse(&existing, change)? {
                Collapse::Replace(merged) => {
                    self.persist(&merged).await?;
                    tracing::debug!(
                        mutation_id = %merged.id,
                        key = %key,
                        change = %merged.change_type(),
                        "Collapsed outbox entry"
                    );
                    state.insert(merged.clone());
                    Some(merged)
                }
                Collapse::Cancel => {
                    self.store.purge(PENDING_MUTATION_MODEL, &existing.id).await?;
                    state.remove(&existing.id);
                    tracing::debug!(mutation_id = %existing.id, key = %key, "Outbox entry cancelled");
                    None
                }
            },
            None => {
                let mutation = PendingMutation::new(
                    uuid::Uuid::now_v7().to_string(),
                    state.next_sequence,
                    change,
                    now_millis(),
                );
                self.persist(&mutation).await?;
                tracing::debug!(
                    mutation_id = %mutation.id,
                    key = %key,
                    change = %mutation.change_type(),
                    "Enqueued mutation"
                );
                state.insert(mutation.clone());
                Some(mutation)
            }
        };

        let pending = state.entries.len();
        drop(state);

        if let Some(mutation) = &result {
            self.events.publish(DataStoreEvent::OutboxMutationEnqueued {
                mutation_id: mutation.id.clone(),
                model: mutation.change.model.clone(),
                id: mutation.change.item.id.clone(),
                change_type: mutation.change_type(),
            });
            self.work.notify_one();
        }
        self.announce(pending);
        Ok(result)
    }

    /// Oldest deliverable entry without claiming it.
    ///
    /// Skips keys with an entry in flight or a parked entry at their head.
    pub async fn peek_next(&self) -> Option<PendingMutation> {
        self.state.lock().await.next_deliverable().cloned()
    }

    /// Claim the oldest deliverable entry for delivery.
    pub async fn next_for_delivery(&self) -> Option<PendingMutation> {
        let mut state = self.state.lock().await;
        let next = state.next_deliverable().cloned()?;
        state.in_flight.insert(next.id.clone());
        Some(next)
    }

    /// Claim a specific entry. Fails if it is unknown or its key is busy.
    pub async fn mark_in_flight(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = state
            .get(id)
            .map(|m| m.key())
            .ok_or_else(|| unknown_mutation(id))?;
        if state.key_in_flight(&key) {
            return Err(crate::DataStoreError::InvalidState {
                expected: format!("no mutation in flight for {}", key),
                actual: "in flight".into(),
            });
        }
        state.in_flight.insert(id.to_string());
        Ok(())
    }

    /// Return a claimed entry to the queue.
    pub async fn release(&self, id: &str) {
        let released = self.state.lock().await.in_flight.remove(id);
        if released {
            self.work.notify_one();
        }
    }

    /// Return every claimed entry to the queue.
    pub async fn release_all(&self) {
        let mut state = self.state.lock().await;
        if !state.in_flight.is_empty() {
            tracing::debug!(count = state.in_flight.len(), "Releasing in-flight mutations");
            state.in_flight.clear();
            self.work.notify_one();
        }
    }

    /// Remove an entry after it was delivered or dropped.
    pub async fn remove(&self, id: &str) -> Result<Option<PendingMutation>> {
        let mut state = self.state.lock().await;
        if state.get(id).is_none() {
            return Ok(None);
        }
        self.store.purge(PENDING_MUTATION_MODEL, id).await?;
        let removed = state.remove(id);
        let pending = state.entries.len();
        drop(state);

        self.work.notify_one();
        self.announce(pending);
        Ok(removed)
    }

    /// Record a failed delivery attempt. Returns the attempt count.
    pub async fn record_attempt(&self, id: &str, error: &str) -> Result<u32> {
        let mut state = self.state.lock().await;
        let mut updated = state.get(id).cloned().ok_or_else(|| unknown_mutation(id))?;
        updated.attempts += 1;
        updated.last_error = Some(error.to_string());
        self.persist(&updated).await?;
        let attempts = updated.attempts;
        state.insert(updated);
        Ok(attempts)
    }

    /// Park an entry: it stays in the outbox but is no longer delivered.
    pub async fn park(&self, id: &str, error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut updated = state.get(id).cloned().ok_or_else(|| unknown_mutation(id))?;
        updated.status = MutationStatus::Parked;
        updated.last_error = Some(error.to_string());
        self.persist(&updated).await?;
        tracing::warn!(mutation_id = %id, key = %updated.key(), error, "Parked mutation");
        state.insert(updated);
        state.in_flight.remove(id);
        drop(state);

        self.work.notify_one();
        Ok(())
    }

    /// Rebuild the index from storage. Nothing is in flight afterwards.
    pub async fn load(&self) -> Result<usize> {
        let records = self
            .store
            .query(PENDING_MUTATION_MODEL, &QueryOptions::new())
            .await?;

        let mut loaded = OutboxState::default();
        for record in &records {
            loaded.insert(PendingMutation::from_record(record)?);
        }
        let count = loaded.entries.len();

        *self.state.lock().await = loaded;
        tracing::info!(count, "Loaded outbox");
        if count > 0 {
            self.work.notify_one();
        }
        self.announce(count);
        Ok(count)
    }

    /// Drop the in-memory index. Storage is cleared by the caller.
    pub async fn clear(&self) {
        *self.state.lock().await = OutboxState::default();
        self.announce(0);
    }

    pub fn observe(&self) -> broadcast::Receiver<OutboxEvent> {
        self.changes.subscribe()
    }

    /// Wait until new work may be available.
    pub async fn wait_for_work(&self) {
        self.work.notified().await
    }

    /// Whether any entry (parked included) exists for the key.
    pub async fn has_pending(&self, key: &RecordKey) -> bool {
        let state = self.state.lock().await;
        state.entries.values().any(|m| &m.key() == key)
    }

    /// Like [`has_pending`](Self::has_pending), ignoring one entry.
    pub async fn has_pending_except(&self, key: &RecordKey, id: &str) -> bool {
        let state = self.state.lock().await;
        state
            .entries
            .values()
            .any(|m| m.id != id && &m.key() == key)
    }

    /// The latest entry queued behind `id` for the same key.
    pub async fn successor_of(&self, id: &str) -> Option<PendingMutation> {
        let state = self.state.lock().await;
        let mutation = state.get(id)?;
        let key = mutation.key();
        state
            .entries
            .range(mutation.sequence + 1..)
            .rev()
            .map(|(_, m)| m)
            .find(|m| m.key() == key)
            .cloned()
    }

    pub async fn get(&self, id: &str) -> Option<PendingMutation> {
        self.state.lock().await.get(id).cloned()
    }

    /// Deliverable entries in FIFO order.
    pub async fn pending(&self) -> Vec<PendingMutation> {
        let state = self.state.lock().await;
        state.entries.values().filter(|m| !m.is_parked()).cloned().collect()
    }

    pub async fn parked(&self) -> Vec<PendingMutation> {
        let state = self.state.lock().await;
        state.entries.values().filter(|m| m.is_parked()).cloned().collect()
    }

    pub async fn in_flight_count(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn persist(&self, mutation: &PendingMutation) -> Result<()> {
        let record = mutation.to_record()?;
        self.store
            .save(record, Initiator::SyncEngine, &QueryPredicate::All)
            .await?;
        Ok(())
    }

    fn announce(&self, pending: usize) {
        let _ = self.changes.send(OutboxEvent { pending });
        self.events.publish(DataStoreEvent::OutboxStatus {
            is_empty: pending == 0,
        });
    }
}

fn unknown_mutation(id: &str) -> crate::DataStoreError {
    crate::DataStoreError::Internal(format!("unknown mutation {}", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use harbor_engine::{ChangeType, FieldDef, FieldType, ModelSchema, Record, SchemaRegistry};
    use serde_json::json;

    fn memory_store() -> Arc<MemoryStore> {
        let registry = SchemaRegistry::new(1).with_model(ModelSchema::new(
            "Post",
            vec![FieldDef::required("id", FieldType::String)],
        ));
        Arc::new(MemoryStore::new(Arc::new(registry)))
    }

    fn outbox_over(store: Arc<MemoryStore>) -> MutationOutbox {
        MutationOutbox::new(store, EventHub::default())
    }

    fn change(id: &str, change_type: ChangeType, title: &str) -> StorageItemChange {
        StorageItemChange::new(
            Record::new("Post", id, json!({"id": id, "title": title})),
            change_type,
            Initiator::LocalApi,
        )
    }

    #[tokio::test]
    async fn enqueue_persists_and_orders() {
        let store = memory_store();
        let outbox = outbox_over(store.clone());

        let first = outbox.enqueue(change("p1", ChangeType::Create, "a")).await.unwrap().unwrap();
        let second = outbox.enqueue(change("p2", ChangeType::Create, "b")).await.unwrap().unwrap();

        assert!(first.sequence < second.sequence);
        assert_eq!(outbox.len().await, 2);
        assert_eq!(outbox.peek_next().await.unwrap().id, first.id);
        assert!(store
            .get(PENDING_MUTATION_MODEL, &first.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn collapse_in_place_and_cancel() {
        let store = memory_store();
        let outbox = outbox_over(store.clone());

        let created = outbox.enqueue(change("p1", ChangeType::Create, "a")).await.unwrap().unwrap();
        let updated = outbox.enqueue(change("p1", ChangeType::Update, "b")).await.unwrap().unwrap();

        assert_eq!(updated.id, created.id);
        assert_eq!(updated.change_type(), ChangeType::Create);
        assert_eq!(outbox.len().await, 1);

        let cancelled = outbox.enqueue(change("p1", ChangeType::Delete, "b")).await.unwrap();
        assert!(cancelled.is_none());
        assert!(outbox.is_empty().await);
        assert!(store
            .get(PENDING_MUTATION_MODEL, &created.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn invalid_sequence_leaves_outbox_unchanged() {
        let outbox = outbox_over(memory_store());

        outbox.enqueue(change("p1", ChangeType::Delete, "a")).await.unwrap();
        let result = outbox.enqueue(change("p1", ChangeType::Update, "b")).await;

        assert!(result.is_err());
        assert_eq!(outbox.len().await, 1);
        assert_eq!(outbox.pending().await[0].change_type(), ChangeType::Delete);
    }

    #[tokio::test]
    async fn in_flight_entry_gets_a_successor() {
        let outbox = outbox_over(memory_store());

        let first = outbox.enqueue(change("p1", ChangeType::Create, "a")).await.unwrap().unwrap();
        let claimed = outbox.next_for_delivery().await.unwrap();
        assert_eq!(claimed.id, first.id);

        let second = outbox.enqueue(change("p1", ChangeType::Update, "b")).await.unwrap().unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(outbox.len().await, 2);

        // Same key is blocked while the first is in flight
        assert!(outbox.next_for_delivery().await.is_none());

        outbox.remove(&first.id).await.unwrap();
        assert_eq!(outbox.next_for_delivery().await.unwrap().id, second.id);
    }

    #[tokio::test]
    async fn other_keys_deliver_concurrently() {
        let outbox = outbox_over(memory_store());

        outbox.enqueue(change("p1", ChangeType::Create, "a")).await.unwrap();
        outbox.enqueue(change("p1", ChangeType::Update, "b")).await.unwrap();
        outbox.enqueue(change("p2", ChangeType::Create, "c")).await.unwrap();

        let a = outbox.next_for_delivery().await.unwrap();
        let b = outbox.next_for_delivery().await.unwrap();
        assert_eq!(a.key().id, "p1");
        assert_eq!(b.key().id, "p2");
        assert!(outbox.next_for_delivery().await.is_none());
        assert_eq!(outbox.in_flight_count().await, 2);
        assert!(outbox.mark_in_flight(&a.id).await.is_err());
    }

    #[tokio::test]
    async fn parked_entries_are_skipped_until_collapsed() {
        let outbox = outbox_over(memory_store());

        let entry = outbox.enqueue(change("p1", ChangeType::Update, "a")).await.unwrap().unwrap();
        outbox.next_for_delivery().await.unwrap();
        outbox.park(&entry.id, "gave up").await.unwrap();

        assert!(outbox.peek_next().await.is_none());
        assert_eq!(outbox.parked().await.len(), 1);
        assert!(outbox.has_pending(&entry.key()).await);

        let revived = outbox.enqueue(change("p1", ChangeType::Update, "b")).await.unwrap().unwrap();
        assert_eq!(revived.id, entry.id);
        assert_eq!(revived.status, MutationStatus::Pending);
        assert!(outbox.peek_next().await.is_some());
    }

    #[tokio::test]
    async fn parked_entry_blocks_its_successors() {
        let outbox = outbox_over(memory_store());

        let first = outbox.enqueue(change("p1", ChangeType::Update, "a")).await.unwrap().unwrap();
        outbox.next_for_delivery().await.unwrap();
        let second = outbox.enqueue(change("p1", ChangeType::Update, "b")).await.unwrap().unwrap();
        outbox.enqueue(change("p2", ChangeType::Create, "c")).await.unwrap();
        outbox.park(&first.id, "gave up").await.unwrap();

        let next = outbox.next_for_delivery().await.unwrap();
        assert_eq!(next.key().id, "p2");
        assert!(outbox.next_for_delivery().await.is_none());
        assert_eq!(outbox.successor_of(&first.id).await.unwrap().id, second.id);
        assert!(outbox.successor_of(&second.id).await.is_none());
    }

    #[tokio::test]
    async fn record_attempt_persists() {
        let store = memory_store();
        let outbox = outbox_over(store.clone());

        let entry = outbox.enqueue(change("p1", ChangeType::Create, "a")).await.unwrap().unwrap();
        assert_eq!(outbox.record_attempt(&entry.id, "timeout").await.unwrap(), 1);
        assert_eq!(outbox.record_attempt(&entry.id, "timeout").await.unwrap(), 2);

        let stored = store.get(PENDING_MUTATION_MODEL, &entry.id).await.unwrap().unwrap();
        let decoded = PendingMutation::from_record(&stored).unwrap();
        assert_eq!(decoded.attempts, 2);
        assert_eq!(decoded.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn load_restores_queue_and_sequence() {
        let store = memory_store();
        let outbox = outbox_over(store.clone());
        outbox.enqueue(change("p1", ChangeType::Create, "a")).await.unwrap();
        outbox.enqueue(change("p2", ChangeType::Create, "b")).await.unwrap();
        outbox.next_for_delivery().await.unwrap();

        let restarted = outbox_over(store);
        assert_eq!(restarted.load().await.unwrap(), 2);
        assert_eq!(restarted.in_flight_count().await, 0);

        let third = restarted
            .enqueue(change("p3", ChangeType::Create, "c"))
            .await
            .unwrap()
            .unwrap();
        let ids: Vec<String> = restarted.pending().await.into_iter().map(|m| m.key().id).collect();
        assert_eq!(ids, vec!["p1", "p2", "p3"]);
        assert_eq!(third.sequence, 2);
    }

    #[tokio::test]
    async fn has_pending_except_ignores_named_entry() {
        let outbox = outbox_over(memory_store());
        let entry = outbox.enqueue(change("p1", ChangeType::Create, "a")).await.unwrap().unwrap();

        assert!(outbox.has_pending(&entry.key()).await);
        assert!(!outbox.has_pending_except(&entry.key(), &entry.id).await);
    }

    #[tokio::test]
    async fn observe_reports_size() {
        let outbox = outbox_over(memory_store());
        let mut events = outbox.observe();

        let entry = outbox.enqueue(change("p1", ChangeType::Create, "a")).await.unwrap().unwrap();
        outbox.remove(&entry.id).await.unwrap();

        assert_eq!(events.recv().await.unwrap(), OutboxEvent { pending: 1 });
        assert_eq!(events.recv().await.unwrap(), OutboxEvent { pending: 0 });
    }
}
