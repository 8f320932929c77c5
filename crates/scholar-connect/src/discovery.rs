// Sidecar discovery - descriptor establishment via push notifications and a bounded poll
use crate::client::{ApiClient, ConnectionDescriptor};
use scholar_observability::{emit_event, ObservabilityEvent, ProcessKind};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Level;

pub const POLL_ATTEMPTS: u32 = 5;
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Process-wide connectivity state. Starts as `Searching`; per-request
/// errors never touch it (a failed chat call must not flip the whole
/// application into an error state).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SidecarStatus {
    Searching,
    Connected,
    Error(String),
}

/// Notifications delivered by the host runtime that supervises the sidecar
/// process: `Ready` once it has parsed a port/token announcement, `Error`
/// when the process failed to come up.
#[derive(Debug, Clone)]
pub enum SidecarEvent {
    Ready(ConnectionDescriptor),
    Error(String),
}

/// Push notification hub. The host runtime keeps the sender side; the
/// discovery coordinator (and any diagnostics UI) subscribes.
pub struct SidecarEvents {
    tx: broadcast::Sender<SidecarEvent>,
}

impl SidecarEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SidecarEvent> {
        self.tx.subscribe()
    }

    pub fn emit_ready(&self, descriptor: ConnectionDescriptor) {
        let _ = self.tx.send(SidecarEvent::Ready(descriptor));
    }

    pub fn emit_error(&self, message: impl Into<String>) {
        let _ = self.tx.send(SidecarEvent::Error(message.into()));
    }
}

impl Default for SidecarEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Establishes the connection descriptor with minimal latency while the
/// sidecar may still be starting up.
///
/// Two tasks race to resolve discovery: a listener on the push channel and a
/// bounded poll against the host runtime's pull query. Whichever succeeds
/// first installs the descriptor into the [`ApiClient`]; later `Ready`
/// deliveries are treated as descriptor refreshes (backend restart).
pub struct DiscoveryCoordinator {
    status_rx: watch::Receiver<SidecarStatus>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryCoordinator {
    /// Spawn the discovery tasks. `events` must be subscribed before this
    /// call so a sidecar that becomes ready between poll attempts is never
    /// missed. `query` is the pull side: "give me the current descriptor if
    /// one exists".
    pub fn start<F, Fut>(
        client: Arc<ApiClient>,
        events: broadcast::Receiver<SidecarEvent>,
        query: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Option<ConnectionDescriptor>> + Send + 'static,
    {
        let (status_tx, status_rx) = watch::channel(SidecarStatus::Searching);
        let status_tx = Arc::new(status_tx);
        let cancel = CancellationToken::new();

        emit_event(
            Level::INFO,
            ProcessKind::Desktop,
            ObservabilityEvent {
                event: "discovery.wait.start",
                component: "discovery",
                correlation_id: None,
                status: Some("start"),
                error_code: None,
                detail: Some(&format!(
                    "attempts={} interval_ms={}",
                    POLL_ATTEMPTS,
                    POLL_INTERVAL.as_millis()
                )),
            },
        );

        let listener = tokio::spawn(listen_for_events(
            client.clone(),
            events,
            status_tx.clone(),
            cancel.clone(),
        ));
        let poller = tokio::spawn(poll_for_descriptor(
            client,
            query,
            status_tx,
            cancel.clone(),
        ));

        Self {
            status_rx,
            cancel,
            tasks: Mutex::new(vec![listener, poller]),
        }
    }

    /// Current status snapshot.
    pub fn status(&self) -> SidecarStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch for status transitions (UI layers render from this).
    pub fn subscribe(&self) -> watch::Receiver<SidecarStatus> {
        self.status_rx.clone()
    }

    /// Cancel both discovery tasks and wait for them to finish. No poll
    /// attempt runs after this returns.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }
}

fn mark_connected(status_tx: &watch::Sender<SidecarStatus>, port: &str) {
    let changed = status_tx.send_if_modified(|status| {
        if *status == SidecarStatus::Connected {
            return false;
        }
        *status = SidecarStatus::Connected;
        true
    });
    if changed {
        tracing::info!("Sidecar connected on port {}", port);
        emit_event(
            Level::INFO,
            ProcessKind::Desktop,
            ObservabilityEvent {
                event: "discovery.wait.ready",
                component: "discovery",
                correlation_id: None,
                status: Some("ok"),
                error_code: None,
                detail: Some(&format!("port={}", port)),
            },
        );
    }
}

async fn listen_for_events(
    client: Arc<ApiClient>,
    mut events: broadcast::Receiver<SidecarEvent>,
    status_tx: Arc<watch::Sender<SidecarStatus>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = events.recv() => match received {
                Ok(SidecarEvent::Ready(descriptor)) => {
                    if !descriptor.is_complete() {
                        tracing::warn!("Ignoring incomplete sidecar descriptor (missing port or token)");
                        continue;
                    }
                    client.apply_descriptor(&descriptor).await;
                    mark_connected(&status_tx, &descriptor.port);
                }
                Ok(SidecarEvent::Error(message)) => {
                    tracing::error!("Sidecar reported failure: {}", message);
                    emit_event(
                        Level::ERROR,
                        ProcessKind::Desktop,
                        ObservabilityEvent {
                            event: "discovery.error",
                            component: "discovery",
                            correlation_id: None,
                            status: Some("error"),
                            error_code: Some("SIDECAR_FAILED"),
                            detail: Some(&message),
                        },
                    );
                    let _ = status_tx.send(SidecarStatus::Error(message));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Sidecar event listener lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

async fn poll_for_descriptor<F, Fut>(
    client: Arc<ApiClient>,
    query: F,
    status_tx: Arc<watch::Sender<SidecarStatus>>,
    cancel: CancellationToken,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Option<ConnectionDescriptor>> + Send,
{
    for attempt in 1..=POLL_ATTEMPTS {
        if cancel.is_cancelled() {
            return;
        }
        // The push path may have resolved (or failed) discovery meanwhile.
        if *status_tx.borrow() != SidecarStatus::Searching {
            return;
        }

        match query().await {
            Some(descriptor) if descriptor.is_complete() => {
                client.apply_descriptor(&descriptor).await;
                mark_connected(&status_tx, &descriptor.port);
                return;
            }
            Some(_) => {
                tracing::warn!(
                    "Pull query returned incomplete descriptor on attempt {}/{}",
                    attempt,
                    POLL_ATTEMPTS
                );
            }
            None => {
                tracing::debug!(
                    "Sidecar descriptor not available yet (attempt {}/{})",
                    attempt,
                    POLL_ATTEMPTS
                );
            }
        }

        if attempt < POLL_ATTEMPTS {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    let timed_out = status_tx.send_if_modified(|status| {
        if *status != SidecarStatus::Searching {
            return false;
        }
        *status = SidecarStatus::Error(format!(
            "Timed out waiting for the sidecar after {} attempts",
            POLL_ATTEMPTS
        ));
        true
    });

    if timed_out {
        tracing::error!(
            "Sidecar discovery exhausted its retry budget ({} attempts)",
            POLL_ATTEMPTS
        );
        emit_event(
            Level::WARN,
            ProcessKind::Desktop,
            ObservabilityEvent {
                event: "discovery.wait.timeout",
                component: "discovery",
                correlation_id: None,
                status: Some("timeout"),
                error_code: Some("DISCOVERY_TIMEOUT"),
                detail: Some(&format!("attempts={}", POLL_ATTEMPTS)),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn descriptor(port: &str) -> ConnectionDescriptor {
        ConnectionDescriptor {
            host_hint: None,
            port: port.to_string(),
            token: format!("tok-{}", port),
        }
    }

    async fn wait_for<FP>(coordinator: &DiscoveryCoordinator, predicate: FP) -> SidecarStatus
    where
        FP: FnMut(&SidecarStatus) -> bool,
    {
        let mut rx = coordinator.subscribe();
        let status = tokio::time::timeout(Duration::from_secs(60), rx.wait_for(predicate))
            .await
            .expect("status transition timed out")
            .expect("status channel closed")
            .clone();
        status
    }

    #[tokio::test(start_paused = true)]
    async fn pull_success_on_first_attempt_connects_immediately() {
        let client = Arc::new(ApiClient::new());
        let events = SidecarEvents::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let coordinator = DiscoveryCoordinator::start(client.clone(), events.subscribe(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Some(descriptor("4242"))
            }
        });

        let status = wait_for(&coordinator, |s| *s == SidecarStatus::Connected).await;
        assert_eq!(status, SidecarStatus::Connected);
        assert_eq!(client.port().await.as_deref(), Some("4242"));

        // No further attempts are scheduled after a hit.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_poll_budget_reports_timeout() {
        let client = Arc::new(ApiClient::new());
        let events = SidecarEvents::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let coordinator = DiscoveryCoordinator::start(client.clone(), events.subscribe(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            }
        });

        let status = wait_for(&coordinator, |s| matches!(s, SidecarStatus::Error(_))).await;
        match status {
            SidecarStatus::Error(message) => {
                assert!(message.contains("after 5 attempts"), "got: {}", message)
            }
            other => panic!("expected error status, got {:?}", other),
        }

        // A sixth attempt must never be scheduled.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), POLL_ATTEMPTS as usize);
        assert_eq!(client.port().await, None);

        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn ready_notification_wins_over_polling() {
        let client = Arc::new(ApiClient::new());
        let events = SidecarEvents::new();

        let coordinator =
            DiscoveryCoordinator::start(client.clone(), events.subscribe(), || async { None });

        events.emit_ready(descriptor("5151"));

        let status = wait_for(&coordinator, |s| *s == SidecarStatus::Connected).await;
        assert_eq!(status, SidecarStatus::Connected);
        assert_eq!(client.port().await.as_deref(), Some("5151"));

        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn incomplete_ready_descriptor_is_ignored() {
        let client = Arc::new(ApiClient::new());
        let events = SidecarEvents::new();

        let coordinator =
            DiscoveryCoordinator::start(client.clone(), events.subscribe(), || async { None });

        events.emit_ready(ConnectionDescriptor {
            host_hint: None,
            port: "6000".to_string(),
            token: String::new(),
        });
        events.emit_ready(descriptor("6001"));

        let status = wait_for(&coordinator, |s| *s == SidecarStatus::Connected).await;
        assert_eq!(status, SidecarStatus::Connected);
        assert_eq!(client.port().await.as_deref(), Some("6001"));

        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn ready_event_refreshes_descriptor() {
        let client = Arc::new(ApiClient::new());
        let events = SidecarEvents::new();

        let coordinator =
            DiscoveryCoordinator::start(client.clone(), events.subscribe(), || async { None });

        events.emit_ready(ConnectionDescriptor {
            host_hint: Some("127.0.0.1".to_string()),
            port: "7000".to_string(),
            token: "tok-a".to_string(),
        });
        let status = wait_for(&coordinator, |s| *s == SidecarStatus::Connected).await;
        assert_eq!(status, SidecarStatus::Connected);
        assert_eq!(client.active_host().await, Some("127.0.0.1"));

        // Backend restart: a second ready event replaces the descriptor and
        // resets the cached host, status stays Connected.
        events.emit_ready(descriptor("7001"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.port().await.as_deref(), Some("7001"));
        assert_eq!(coordinator.status(), SidecarStatus::Connected);
        assert_eq!(client.active_host().await, None);

        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn error_notification_surfaces_sidecar_failure() {
        let client = Arc::new(ApiClient::new());
        let events = SidecarEvents::new();

        let coordinator =
            DiscoveryCoordinator::start(client.clone(), events.subscribe(), || async { None });

        events.emit_ready(descriptor("8080"));
        let _ = wait_for(&coordinator, |s| *s == SidecarStatus::Connected).await;

        // The host runtime reporting the process dead outranks Connected.
        events.emit_error("sidecar crashed");
        let status = wait_for(&coordinator, |s| matches!(s, SidecarStatus::Error(_))).await;
        assert_eq!(status, SidecarStatus::Error("sidecar crashed".to_string()));

        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_outstanding_poll_retries() {
        let client = Arc::new(ApiClient::new());
        let events = SidecarEvents::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let coordinator = DiscoveryCoordinator::start(client, events.subscribe(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            }
        });

        coordinator.shutdown().await;
        let after_shutdown = attempts.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), after_shutdown);
        assert!(after_shutdown <= 1);
    }
}
