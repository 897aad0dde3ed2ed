//! Mock RemoteApi for testing.
//!
//! Keeps a versioned copy of every record like a real backend would:
//! writes against a stale version are rejected with a conflict carrying the
//! server copy. Failures can be scripted per call kind, sync results are
//! paged by offset tokens, and subscriptions can be fed or dropped.

use async_trait::async_trait;
use harbor_datastore::engine::{ChangeType, Record, RecordKey};
use harbor_datastore::{
    MutationRequest, RecordStream, RemoteApi, RemoteError, SubscriptionType, SyncPage,
    SyncRequest,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use futures::StreamExt;

type Subscriber = mpsc::UnboundedSender<Result<Record, RemoteError>>;

#[derive(Default)]
struct ServerState {
    records: BTreeMap<RecordKey, Record>,
    clock: u64,
    mutate_failures: VecDeque<RemoteError>,
    sync_failures: HashMap<String, VecDeque<RemoteError>>,
    subscribe_failures: VecDeque<RemoteError>,
    mutations: Vec<MutationRequest>,
    sync_requests: Vec<SyncRequest>,
    subscribers: HashMap<(String, SubscriptionType), Vec<Subscriber>>,
}

impl ServerState {
    /// Wall-clock milliseconds, strictly increasing.
    fn tick(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.clock = (self.clock + 1).max(now);
        self.clock
    }

    /// Store a record with the next version and change time.
    fn write(&mut self, mut record: Record) -> Record {
        let key = record.key();
        let version = self
            .records
            .get(&key)
            .and_then(|r| r.version)
            .unwrap_or(0)
            + 1;
        let changed_at = self.tick();
        record.version = Some(version);
        record.metadata.last_changed_at = Some(changed_at);
        record.metadata.updated_at = Some(changed_at);
        self.records.insert(key, record.clone());
        record
    }
}

/// Scriptable in-memory backend.
#[derive(Default)]
pub struct MockRemoteApi {
    state: Mutex<ServerState>,
    latency: std::sync::Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    in_flight_by_key: std::sync::Mutex<HashMap<RecordKey, usize>>,
    max_in_flight_per_key: AtomicUsize,
}

impl MockRemoteApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every mutation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Write a record server-side as another client would, bumping its version.
    pub async fn seed(&self, record: Record) -> Record {
        self.state.lock().await.write(record)
    }

    /// Store a record exactly as given, version included.
    pub async fn put(&self, record: Record) {
        let mut state = self.state.lock().await;
        let changed_at = state.tick();
        let mut record = record;
        record.metadata.last_changed_at = Some(changed_at);
        state.records.insert(record.key(), record);
    }

    pub async fn server_record(&self, model: &str, id: &str) -> Option<Record> {
        self.state
            .lock()
            .await
            .records
            .get(&RecordKey::new(model, id))
            .cloned()
    }

    pub async fn fail_next_mutations(&self, errors: impl IntoIterator<Item = RemoteError>) {
        self.state.lock().await.mutate_failures.extend(errors);
    }

    pub async fn fail_next_syncs(&self, model: &str, errors: impl IntoIterator<Item = RemoteError>) {
        self.state
            .lock()
            .await
            .sync_failures
            .entry(model.to_string())
            .or_default()
            .extend(errors);
    }

    pub async fn fail_next_subscribes(&self, errors: impl IntoIterator<Item = RemoteError>) {
        self.state.lock().await.subscribe_failures.extend(errors);
    }

    /// Every mutation request received, failed ones included.
    pub async fn mutations(&self) -> Vec<MutationRequest> {
        self.state.lock().await.mutations.clone()
    }

    pub async fn sync_requests(&self) -> Vec<SyncRequest> {
        self.state.lock().await.sync_requests.clone()
    }

    /// Live subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.state
            .lock()
            .await
            .subscribers
            .values()
            .flatten()
            .filter(|s| !s.is_closed())
            .count()
    }

    /// Write a record server-side and notify matching subscribers.
    pub async fn push(&self, record: Record, kind: SubscriptionType) -> Record {
        let mut state = self.state.lock().await;
        let stored = state.write(record);
        Self::notify(&mut state, stored.clone(), kind);
        stored
    }

    /// Deliver a record to subscribers without touching server state.
    pub async fn deliver(&self, record: Record, kind: SubscriptionType) {
        let mut state = self.state.lock().await;
        Self::notify(&mut state, record, kind);
    }

    /// Close every open subscription stream.
    pub async fn drop_subscriptions(&self) {
        self.state.lock().await.subscribers.clear();
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Most mutations ever outstanding for a single record.
    pub fn max_in_flight_per_key(&self) -> usize {
        self.max_in_flight_per_key.load(Ordering::SeqCst)
    }

    fn notify(state: &mut ServerState, record: Record, kind: SubscriptionType) {
        if let Some(subscribers) = state.subscribers.get_mut(&(record.model.clone(), kind)) {
            subscribers.retain(|s| s.send(Ok(record.clone())).is_ok());
        }
    }

    async fn apply(&self, request: MutationRequest) -> Result<Record, RemoteError> {
        let mut state = self.state.lock().await;
        state.mutations.push(request.clone());
        if let Some(error) = state.mutate_failures.pop_front() {
            return Err(error);
        }

        let key = request.record.key();
        let existing = state.records.get(&key).cloned();

        match (&request.mutation_type, &existing) {
            (ChangeType::Create, Some(current)) if !current.deleted => {
                return Err(RemoteError::conflict(current.clone()));
            }
            (ChangeType::Update | ChangeType::Delete, Some(current))
                if request.version != current.version =>
            {
                return Err(RemoteError::conflict(current.clone()));
            }
            _ => {}
        }

        if let Some(current) = existing.as_ref().filter(|r| !r.deleted) {
            if !request.condition.matches(&current.payload) {
                return Err(RemoteError::ConditionalCheckFailed(key.to_string()));
            }
        }

        let mut record = request.record;
        record.deleted = request.mutation_type == ChangeType::Delete;
        Ok(state.write(record))
    }
}

#[async_trait]
impl RemoteApi for MockRemoteApi {
    async fn mutate(&self, request: MutationRequest) -> Result<Record, RemoteError> {
        let key = request.record.key();
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        {
            let mut by_key = self.in_flight_by_key.lock().unwrap();
            let count = by_key.entry(key.clone()).or_default();
            *count += 1;
            self.max_in_flight_per_key.fetch_max(*count, Ordering::SeqCst);
        }

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let result = self.apply(request).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(count) = self.in_flight_by_key.lock().unwrap().get_mut(&key) {
            *count -= 1;
        }
        result
    }

    async fn sync(&self, request: SyncRequest) -> Result<SyncPage, RemoteError> {
        let mut state = self.state.lock().await;
        state.sync_requests.push(request.clone());
        if let Some(error) = state
            .sync_failures
            .get_mut(&request.model)
            .and_then(|q| q.pop_front())
        {
            return Err(error);
        }

        let matching: Vec<Record> = state
            .records
            .values()
            .filter(|r| r.model == request.model)
            .filter(|r| match request.last_sync {
                Some(since) => r.metadata.last_changed_at.unwrap_or(0) > since,
                None => true,
            })
            .cloned()
            .collect();

        let offset: usize = request
            .next_token
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or(0);
        let end = (offset + request.limit).min(matching.len());
        let items = matching[offset.min(end)..end].to_vec();
        let next_token = (end < matching.len()).then(|| end.to_string());

        Ok(SyncPage { items, next_token })
    }

    async fn subscribe(
        &self,
        model: &str,
        kind: SubscriptionType,
    ) -> Result<RecordStream, RemoteError> {
        let mut state = self.state.lock().await;
        if let Some(error) = state.subscribe_failures.pop_front() {
            return Err(error);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state
            .subscribers
            .entry((model.to_string(), kind))
            .or_default()
            .push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
