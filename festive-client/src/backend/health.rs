//! Host reachability from the backend's health endpoint
//!
//! Any HTTP answer counts as reachable; only transport failures (refused,
//! timed out, DNS) count as offline.

use parking_lot::Mutex;
use reqwest::Client;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::transport::{HostEvent, HostNetwork, Subscription};
use crate::{ClientConfig, ClientError, ClientResult};

const HEALTH_PATH: &str = "/api/health";

/// Time between reachability checks
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Deadline for one check
const CHECK_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug)]
struct Shared {
    client: Client,
    url: String,
    online: AtomicBool,
    events: broadcast::Sender<HostEvent>,
}

impl Shared {
    async fn check(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => {
                tracing::trace!(status = %response.status(), "Health check answered");
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "Health check failed");
                false
            }
        }
    }

    fn record(&self, online: bool) {
        if self.online.swap(online, Ordering::SeqCst) == online {
            return;
        }
        let event = if online {
            HostEvent::Online
        } else {
            HostEvent::Offline
        };
        tracing::info!(?event, "Host reachability changed");
        let _ = self.events.send(event);
    }
}

/// [`HostNetwork`] that polls the backend's health endpoint
///
/// Starts out online; the first failed check flips it.
#[derive(Debug)]
pub struct HealthMonitor {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Start polling at [`HEALTH_CHECK_INTERVAL`]
    pub fn start(config: &ClientConfig) -> ClientResult<Self> {
        Self::with_interval(config, HEALTH_CHECK_INTERVAL)
    }

    pub fn with_interval(config: &ClientConfig, interval: Duration) -> ClientResult<Self> {
        let client = Client::builder()
            .timeout(CHECK_TIMEOUT)
            .build()
            .map_err(|e| ClientError::Config(format!("Failed to build HTTP client: {e}")))?;
        let (events, _) = broadcast::channel(16);

        let shared = Arc::new(Shared {
            client,
            url: format!("{}{}", config.base_url.trim_end_matches('/'), HEALTH_PATH),
            online: AtomicBool::new(true),
            events,
        });
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(poll(shared.clone(), interval, shutdown.clone()));

        Ok(Self {
            shared,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// Check once now and record the result
    pub async fn check_now(&self) -> bool {
        let online = self.shared.check().await;
        self.shared.record(online);
        online
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl HostNetwork for HealthMonitor {
    fn is_online(&self) -> bool {
        self.shared.online.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> Subscription<HostEvent> {
        Subscription::new(self.shared.events.subscribe())
    }
}

async fn poll(shared: Arc<Shared>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let online = shared.check().await;
                shared.record(online);
            }
        }
    }
    tracing::debug!("Health monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_unreachable_host_goes_offline() {
        let config = ClientConfig::new(closed_port().await);
        let monitor = HealthMonitor::with_interval(&config, Duration::from_millis(50)).unwrap();
        let mut events = monitor.subscribe();
        assert!(monitor.is_online());

        let event = timeout(Duration::from_secs(5), events.recv()).await.unwrap();
        assert_eq!(event, Some(HostEvent::Offline));
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn test_error_status_still_counts_as_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
            }
        });

        let config = ClientConfig::new(format!("http://{addr}"));
        let monitor = HealthMonitor::with_interval(&config, Duration::from_secs(3600)).unwrap();
        let mut events = monitor.subscribe();

        assert!(monitor.check_now().await);
        assert!(monitor.is_online());
        assert!(
            timeout(Duration::from_millis(100), events.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_recovery_is_reported() {
        let config = ClientConfig::new(closed_port().await);
        let monitor = HealthMonitor::with_interval(&config, Duration::from_secs(3600)).unwrap();
        let mut events = monitor.subscribe();

        assert!(!monitor.check_now().await);
        assert_eq!(events.recv().await, Some(HostEvent::Offline));

        monitor.shared.record(true);
        assert_eq!(events.recv().await, Some(HostEvent::Online));
        assert!(monitor.is_online());
    }
}
