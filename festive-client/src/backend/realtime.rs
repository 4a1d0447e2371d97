//! PocketBase realtime stream (server-sent events)
//!
//! ```text
//! GET  /api/realtime   ──▶ PB_CONNECT { clientId }   stream opened
//! POST /api/realtime   ◀── { clientId, subscriptions: ["dining_records/*"] }
//!                      ──▶ event: dining_records/*   { action, record }
//! ```
//!
//! Topics are re-submitted after every `PB_CONNECT`, so listeners survive a
//! reconnect. The stream reconnects until the transport is dropped.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::transport::{DisconnectEvent, RealtimeTransport, RecordEvent, Subscription};
use crate::{ClientConfig, ClientError, ClientResult};

const REALTIME_PATH: &str = "/api/realtime";
const CONNECT_EVENT: &str = "PB_CONNECT";

/// Connect timeout for the stream; the stream itself has no deadline
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// First wait before reopening a dropped stream
const RECONNECT_DELAY: Duration = Duration::from_millis(500);
/// Cap on the doubling reconnect wait
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(10);

const CHANNEL_CAPACITY: usize = 64;

/// One dispatched server-sent message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseMessage {
    pub id: Option<String>,
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    last_id: Option<String>,
    event: Option<String>,
    data: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every message completed by them
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.buffer.extend_from_slice(chunk);

        let mut messages = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.as_ref();
            let line = line.strip_suffix('\r').unwrap_or(line);
            if let Some(message) = self.process_line(line) {
                messages.push(message);
            }
        }
        messages
    }

    fn process_line(&mut self, line: &str) -> Option<SseMessage> {
        if line.is_empty() {
            let event = self.event.take();
            let data = self.data.take()?;
            return Some(SseMessage {
                id: self.last_id.clone(),
                event: event.unwrap_or_else(|| "message".to_string()),
                data,
            });
        }

        // Comment line
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            "id" => self.last_id = Some(value.to_string()),
            _ => {}
        }
        None
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectPayload {
    client_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeRequest {
    client_id: String,
    subscriptions: Vec<String>,
}

#[derive(Debug)]
struct Topic {
    sender: broadcast::Sender<RecordEvent>,
    listeners: usize,
}

#[derive(Debug)]
struct Shared {
    client: Client,
    base_url: String,
    token: Option<String>,
    connected: AtomicBool,
    started: AtomicBool,
    client_id: Mutex<Option<String>>,
    topics: Mutex<HashMap<String, Topic>>,
    connects: broadcast::Sender<()>,
    disconnects: broadcast::Sender<DisconnectEvent>,
    shutdown: CancellationToken,
}

/// [`RealtimeTransport`] over the PocketBase realtime API
#[derive(Debug)]
pub struct PocketBaseRealtime {
    shared: Arc<Shared>,
}

impl PocketBaseRealtime {
    pub fn new(config: &ClientConfig) -> ClientResult<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ClientError::Config(format!("Failed to build HTTP client: {e}")))?;

        let (connects, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (disconnects, _) = broadcast::channel(CHANNEL_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared {
                client,
                base_url: config.base_url.trim_end_matches('/').to_string(),
                token: config.token.clone(),
                connected: AtomicBool::new(false),
                started: AtomicBool::new(false),
                client_id: Mutex::new(None),
                topics: Mutex::new(HashMap::new()),
                connects,
                disconnects,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Open the stream on first use
    fn ensure_started(&self) {
        if !self.shared.started.swap(true, Ordering::SeqCst) {
            tokio::spawn(run(self.shared.clone()));
        }
    }
}

impl Drop for PocketBaseRealtime {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

#[async_trait]
impl RealtimeTransport for PocketBaseRealtime {
    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn on_disconnect(&self) -> Subscription<DisconnectEvent> {
        Subscription::new(self.shared.disconnects.subscribe())
    }

    async fn subscribe_connect(&self) -> ClientResult<Subscription<()>> {
        let subscription = Subscription::new(self.shared.connects.subscribe());
        self.ensure_started();
        Ok(subscription)
    }

    async fn subscribe_collection(
        &self,
        collection: &str,
    ) -> ClientResult<Subscription<RecordEvent>> {
        let topic = format!("{collection}/*");
        let rx = {
            let mut topics = self.shared.topics.lock();
            let entry = topics.entry(topic.clone()).or_insert_with(|| Topic {
                sender: broadcast::channel(CHANNEL_CAPACITY).0,
                listeners: 0,
            });
            entry.listeners += 1;
            entry.sender.subscribe()
        };

        let shared = self.shared.clone();
        let subscription = Subscription::with_release(rx, move || shared.release_topic(&topic));

        self.ensure_started();
        if self.is_connected() {
            self.shared
                .submit_subscriptions()
                .await
                .map_err(|e| ClientError::Subscription(e.to_string()))?;
        }
        Ok(subscription)
    }
}

impl Shared {
    fn realtime_url(&self) -> String {
        format!("{}{}", self.base_url, REALTIME_PATH)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(reqwest::header::AUTHORIZATION, token),
            None => request,
        }
    }

    fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Drop one listener; the last one unsubscribes the topic server-side
    fn release_topic(self: &Arc<Self>, topic: &str) {
        let emptied = {
            let mut topics = self.topics.lock();
            match topics.get_mut(topic) {
                Some(entry) if entry.listeners > 1 => {
                    entry.listeners -= 1;
                    false
                }
                Some(_) => {
                    topics.remove(topic);
                    true
                }
                None => false,
            }
        };

        if emptied
            && self.connected.load(Ordering::SeqCst)
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            let shared = self.clone();
            handle.spawn(async move {
                if let Err(e) = shared.submit_subscriptions().await {
                    tracing::warn!(error = %e, "Failed to update realtime subscriptions");
                }
            });
        }
    }

    /// Send the current topic set for this stream's client id
    async fn submit_subscriptions(&self) -> ClientResult<()> {
        let Some(client_id) = self.client_id.lock().clone() else {
            return Ok(());
        };
        let subscriptions = self.active_topics();

        let request = self.client.post(self.realtime_url()).json(&SubscribeRequest {
            client_id,
            subscriptions: subscriptions.clone(),
        });
        let response = self.authorize(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Server {
                status: status.as_u16(),
                message,
            });
        }

        tracing::debug!(?subscriptions, "Realtime subscriptions submitted");
        Ok(())
    }

    /// One stream lifetime, from `GET` to end of body
    async fn session(&self) -> ClientResult<()> {
        let request = self
            .client
            .get(self.realtime_url())
            .header(reqwest::header::ACCEPT, "text/event-stream");
        let mut response = self.authorize(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Server {
                status: status.as_u16(),
                message: "realtime stream refused".to_string(),
            });
        }

        let mut decoder = SseDecoder::new();
        while let Some(chunk) = response.chunk().await? {
            for message in decoder.feed(&chunk) {
                self.dispatch(message).await?;
            }
        }
        Ok(())
    }

    async fn dispatch(&self, message: SseMessage) -> ClientResult<()> {
        if message.event == CONNECT_EVENT {
            let payload: ConnectPayload = serde_json::from_str(&message.data)?;
            tracing::info!(client_id = %payload.client_id, "Realtime stream connected");
            *self.client_id.lock() = Some(payload.client_id);

            self.submit_subscriptions().await?;
            self.connected.store(true, Ordering::SeqCst);
            let _ = self.connects.send(());
            return Ok(());
        }

        let sender = self
            .topics
            .lock()
            .get(&message.event)
            .map(|t| t.sender.clone());
        let Some(sender) = sender else {
            tracing::debug!(topic = %message.event, "Realtime message without listener");
            return Ok(());
        };

        match serde_json::from_str::<RecordEvent>(&message.data) {
            Ok(event) => {
                let _ = sender.send(event);
            }
            Err(e) => {
                tracing::warn!(topic = %message.event, error = %e, "Malformed realtime message");
            }
        }
        Ok(())
    }
}

async fn run(shared: Arc<Shared>) {
    let mut delay = RECONNECT_DELAY;

    loop {
        let result = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            result = shared.session() => result,
        };

        *shared.client_id.lock() = None;
        if shared.connected.swap(false, Ordering::SeqCst) {
            delay = RECONNECT_DELAY;
            let _ = shared.disconnects.send(DisconnectEvent {
                active_subscriptions: shared.active_topics(),
            });
        }

        match result {
            Ok(()) => tracing::info!("Realtime stream closed by server"),
            Err(e) => tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64, "Realtime stream failed"),
        }

        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(MAX_RECONNECT_DELAY);
    }

    shared.connected.store(false, Ordering::SeqCst);
    tracing::debug!("Realtime stream stopped");
}
