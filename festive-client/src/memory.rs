//! In-process collaborators
//!
//! Same-process stand-ins for the backend, the push stream and the host
//! network. Used by the test suites and handy for demos without a server.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::backend::{ListQuery, RecordBackend};
use crate::transport::{
    DisconnectEvent, HostEvent, HostNetwork, RealtimeTransport, RecordEvent, Subscription,
};
use crate::{ClientError, ClientResult};

const CHANNEL_CAPACITY: usize = 64;

/// Failure injected into the next backend call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Request never reached the backend
    Network,
    /// Backend answered with this status
    Server(u16),
}

impl Failure {
    fn to_error(self) -> ClientError {
        match self {
            Failure::Network => ClientError::Network("connection refused".to_string()),
            Failure::Server(400) => ClientError::Validation("rejected".to_string()),
            Failure::Server(status) => ClientError::Server {
                status,
                message: "scripted failure".to_string(),
            },
        }
    }
}

/// One `write` call as seen by the backend
#[derive(Debug, Clone)]
pub struct WriteCall {
    pub collection: String,
    pub id: Option<String>,
    pub fields: Value,
    pub at: Instant,
    /// Whether the call was answered with a record
    pub succeeded: bool,
}

#[derive(Debug, Default)]
struct BackendState {
    collections: HashMap<String, Vec<Value>>,
    write_failures: VecDeque<Failure>,
    list_failure: Option<Failure>,
    next_ids: VecDeque<String>,
    id_seq: u64,
    writes: Vec<WriteCall>,
}

/// Record backend held in memory
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<BackendState>,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record (must carry an `id`)
    pub fn insert(&self, collection: &str, record: Value) {
        self.state
            .lock()
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(record);
    }

    pub fn records(&self, collection: &str) -> Vec<Value> {
        self.state
            .lock()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Fail the next `count` writes
    pub fn fail_next_writes(&self, count: usize, failure: Failure) {
        let mut state = self.state.lock();
        state.write_failures.extend(std::iter::repeat_n(failure, count));
    }

    /// Fail every `list` call until cleared with `None`
    pub fn fail_lists(&self, failure: Option<Failure>) {
        self.state.lock().list_failure = failure;
    }

    /// Id handed to the next created record
    pub fn push_next_id(&self, id: impl Into<String>) {
        self.state.lock().next_ids.push_back(id.into());
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    pub fn writes(&self) -> Vec<WriteCall> {
        self.state.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl BackendState {
    fn apply_write(
        &mut self,
        collection: &str,
        id: Option<&str>,
        fields: Value,
    ) -> ClientResult<Value> {
        let Value::Object(fields) = fields else {
            return Err(ClientError::Validation("fields must be an object".to_string()));
        };

        match id {
            Some(id) => {
                let record = self
                    .collections
                    .get_mut(collection)
                    .and_then(|records| records.iter_mut().find(|r| r["id"] == id))
                    .ok_or_else(|| ClientError::NotFound(format!("{collection}/{id}")))?;
                if let Value::Object(existing) = record {
                    existing.extend(fields);
                }
                Ok(record.clone())
            }
            None => {
                let id = match self.next_ids.pop_front() {
                    Some(id) => id,
                    None => {
                        self.id_seq += 1;
                        format!("rec_{:03}", self.id_seq)
                    }
                };
                let mut record = Map::new();
                record.insert("id".to_string(), Value::String(id));
                record.extend(fields);
                let record = Value::Object(record);
                self.collections
                    .entry(collection.to_string())
                    .or_default()
                    .push(record.clone());
                Ok(record)
            }
        }
    }
}

/// `field = "value"` is the only filter form understood here
fn parse_filter(filter: &str) -> ClientResult<(&str, String)> {
    let (field, value) = filter
        .split_once('=')
        .ok_or_else(|| ClientError::Validation(format!("unsupported filter: {filter}")))?;
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .ok_or_else(|| ClientError::Validation(format!("unsupported filter: {filter}")))?;
    Ok((field.trim(), value.replace("\\\"", "\"").replace("\\\\", "\\")))
}

#[async_trait]
impl RecordBackend for InMemoryBackend {
    async fn write(
        &self,
        collection: &str,
        id: Option<&str>,
        fields: Value,
    ) -> ClientResult<Value> {
        self.simulate_latency().await;

        let mut state = self.state.lock();
        let result = match state.write_failures.pop_front() {
            Some(failure) => Err(failure.to_error()),
            None => state.apply_write(collection, id, fields.clone()),
        };
        state.writes.push(WriteCall {
            collection: collection.to_string(),
            id: id.map(str::to_string),
            fields,
            at: Instant::now(),
            succeeded: result.is_ok(),
        });
        result
    }

    async fn list(&self, collection: &str, query: &ListQuery) -> ClientResult<Vec<Value>> {
        self.simulate_latency().await;

        let state = self.state.lock();
        if let Some(failure) = state.list_failure {
            return Err(failure.to_error());
        }

        let mut records = state
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default();

        if let Some(filter) = &query.filter {
            let (field, value) = parse_filter(filter)?;
            records.retain(|r| r.get(field).and_then(Value::as_str) == Some(value.as_str()));
        }

        if let Some(sort) = &query.sort {
            let (field, descending) = match sort.strip_prefix('-') {
                Some(field) => (field, true),
                None => (sort.as_str(), false),
            };
            records.sort_by(|a, b| {
                let a = a.get(field).and_then(Value::as_str).unwrap_or_default();
                let b = b.get(field).and_then(Value::as_str).unwrap_or_default();
                if descending { b.cmp(a) } else { a.cmp(b) }
            });
        }

        Ok(records)
    }
}

/// Counts live subscriptions handed out by a source
#[derive(Debug, Clone, Default)]
struct ListenerCount(Arc<AtomicUsize>);

impl ListenerCount {
    fn track<T: Clone>(&self, rx: broadcast::Receiver<T>) -> Subscription<T> {
        let count = self.0.clone();
        count.fetch_add(1, Ordering::SeqCst);
        Subscription::with_release(rx, move || {
            count.fetch_sub(1, Ordering::SeqCst);
        })
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Push stream driven by hand
#[derive(Debug)]
pub struct ManualTransport {
    connected: AtomicBool,
    disconnects: broadcast::Sender<DisconnectEvent>,
    connects: broadcast::Sender<()>,
    collections: Mutex<HashMap<String, broadcast::Sender<RecordEvent>>>,
    fail_connect: AtomicBool,
    fail_collections: AtomicBool,
    listeners: ListenerCount,
}

impl ManualTransport {
    pub fn new() -> Self {
        let (disconnects, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (connects, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            connected: AtomicBool::new(false),
            disconnects,
            connects,
            collections: Mutex::new(HashMap::new()),
            fail_connect: AtomicBool::new(false),
            fail_collections: AtomicBool::new(false),
            listeners: ListenerCount::default(),
        }
    }

    /// Flip the connected flag without emitting a signal
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Stream (re)connected
    pub fn emit_connect(&self) {
        self.set_connected(true);
        let _ = self.connects.send(());
    }

    /// Stream dropped with these topics subscribed
    pub fn emit_disconnect(&self, active_subscriptions: Vec<String>) {
        self.set_connected(false);
        let _ = self.disconnects.send(DisconnectEvent {
            active_subscriptions,
        });
    }

    /// Deliver a record event to listeners of `collection`
    pub fn push(&self, collection: &str, event: RecordEvent) {
        if let Some(tx) = self.collections.lock().get(collection) {
            let _ = tx.send(event);
        }
    }

    pub fn fail_connect_subscription(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_collection_subscription(&self, fail: bool) {
        self.fail_collections.store(fail, Ordering::SeqCst);
    }

    /// Live subscriptions of any kind
    pub fn listener_count(&self) -> usize {
        self.listeners.get()
    }
}

impl Default for ManualTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeTransport for ManualTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn on_disconnect(&self) -> Subscription<DisconnectEvent> {
        self.listeners.track(self.disconnects.subscribe())
    }

    async fn subscribe_connect(&self) -> ClientResult<Subscription<()>> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ClientError::Subscription(
                "connect subscription refused".to_string(),
            ));
        }
        Ok(self.listeners.track(self.connects.subscribe()))
    }

    async fn subscribe_collection(
        &self,
        collection: &str,
    ) -> ClientResult<Subscription<RecordEvent>> {
        if self.fail_collections.load(Ordering::SeqCst) {
            return Err(ClientError::Subscription(format!(
                "subscription to {collection} refused"
            )));
        }
        let rx = self
            .collections
            .lock()
            .entry(collection.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        Ok(self.listeners.track(rx))
    }
}

/// Host network driven by hand
#[derive(Debug)]
pub struct ManualHost {
    online: AtomicBool,
    events: broadcast::Sender<HostEvent>,
    listeners: ListenerCount,
}

impl ManualHost {
    pub fn new(online: bool) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            online: AtomicBool::new(online),
            events,
            listeners: ListenerCount::default(),
        }
    }

    pub fn go_online(&self) {
        self.online.store(true, Ordering::SeqCst);
        let _ = self.events.send(HostEvent::Online);
    }

    pub fn go_offline(&self) {
        self.online.store(false, Ordering::SeqCst);
        let _ = self.events.send(HostEvent::Offline);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.get()
    }
}

impl HostNetwork for ManualHost {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> Subscription<HostEvent> {
        self.listeners.track(self.events.subscribe())
    }
}
