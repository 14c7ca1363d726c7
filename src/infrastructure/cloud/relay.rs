//! Cloud Relay Module
//!
//! Owns the broker session: connect, subscribe to the control topic, publish
//! telemetry, forward control deliveries, reconnect with backoff.

use crate::domain::backoff::{Backoff, BackoffPolicy};
use crate::domain::models::{CloudSessionState, Credentials, Reading};
use crate::error::{BridgeError, Result};
use crate::infrastructure::bluetooth::protocol::MAX_COMMAND_LEN;
use crate::infrastructure::cloud::link::{BrokerEvent, BrokerLink};
use crate::infrastructure::cloud::protocol::{self, SessionParams, TelemetryPayload};
use crate::infrastructure::task::{guarded, pause, Step, Worker};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub subscribe_timeout: Duration,
    pub publish_timeout: Duration,
    /// Upper bound for `stop()`
    pub shutdown_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Control deliveries larger than this are rejected
    pub max_command_len: usize,
    pub mailbox_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            keep_alive: protocol::DEFAULT_KEEP_ALIVE,
            connect_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(3),
            backoff: BackoffPolicy::default(),
            max_command_len: MAX_COMMAND_LEN,
            mailbox_capacity: 32,
        }
    }
}

/// Callbacks invoked from the relay worker. Must not block.
pub trait RelayObserver: Send + Sync + 'static {
    fn on_state(&self, _state: CloudSessionState) {}
    /// A size-checked control-topic delivery
    fn on_control(&self, _payload: Vec<u8>) {}
    fn on_fault(&self, _error: &BridgeError) {}
}

impl RelayObserver for () {}

#[derive(Debug, Default)]
pub struct RelayStats {
    published: AtomicU64,
    dropped: AtomicU64,
    control_received: AtomicU64,
    control_rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayStatsSnapshot {
    pub published: u64,
    /// Session not Active, publish failed or timed out
    pub dropped: u64,
    pub control_received: u64,
    pub control_rejected: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            control_received: self.control_received.load(Ordering::Relaxed),
            control_rejected: self.control_rejected.load(Ordering::Relaxed),
        }
    }
}

struct PublishRequest {
    payload: Vec<u8>,
    reply: oneshot::Sender<Result<()>>,
}

struct RelayShared {
    config: RelayConfig,
    params: SessionParams,
    data_topic: String,
    control_topic: String,
    observer: Arc<dyn RelayObserver>,
    stats: Arc<RelayStats>,
    state: watch::Sender<CloudSessionState>,
}

/// Cloneable publishing handle
#[derive(Clone)]
pub struct RelayHandle {
    requests: mpsc::Sender<PublishRequest>,
    state: watch::Receiver<CloudSessionState>,
    stats: Arc<RelayStats>,
    publish_timeout: Duration,
}

impl RelayHandle {
    /// Publish one reading to the data topic.
    ///
    /// Fails fast with `SessionUnavailable` unless the session is Active;
    /// the reading is dropped, never queued.
    pub async fn publish(&self, reading: &Reading) -> Result<()> {
        let result = self.try_publish(reading).await;
        if let Err(e) = &result {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Dropped reading {}: {}", reading.sequence, e);
        }
        result
    }

    async fn try_publish(&self, reading: &Reading) -> Result<()> {
        let state = *self.state.borrow();
        if !state.is_active() {
            return Err(BridgeError::SessionUnavailable { state });
        }

        let payload = TelemetryPayload::from(reading).to_json();
        let (reply, response) = oneshot::channel();
        let limit = self.publish_timeout * 2;
        let exchange = async {
            self.requests
                .send(PublishRequest { payload, reply })
                .await
                .map_err(|_| self.unavailable())?;
            response.await.map_err(|_| self.unavailable())?
        };
        tokio::time::timeout(limit, exchange).await.map_err(|_| {
            // The session may have dropped while the request sat in the mailbox
            let state = *self.state.borrow();
            if state.is_active() {
                BridgeError::timeout("publish", limit)
            } else {
                BridgeError::SessionUnavailable { state }
            }
        })?
    }

    pub fn state(&self) -> CloudSessionState {
        *self.state.borrow()
    }

    fn unavailable(&self) -> BridgeError {
        BridgeError::SessionUnavailable { state: *self.state.borrow() }
    }
}

enum Served {
    Lost(String),
    Cancelled,
}

struct RelayWorker<'a, C: BrokerLink> {
    link: &'a mut C,
    requests: &'a mut mpsc::Receiver<PublishRequest>,
    shared: &'a RelayShared,
    cancel: CancellationToken,
    backoff: Backoff,
    connected: bool,
    subscribed: bool,
}

impl<'a, C: BrokerLink> RelayWorker<'a, C> {
    async fn run(mut self) {
        info!("Relay worker started for {}:{}", self.shared.params.host, self.shared.params.port);
        self.session().await;
        self.release().await;
        self.transition(CloudSessionState::Disconnected);
        info!("Relay worker stopped");
    }

    async fn session(&mut self) {
        let cancel = self.cancel.clone();
        let shared = self.shared;
        let config = &shared.config;

        loop {
            self.transition(CloudSessionState::Connecting);
            self.connected = true;
            match guarded(&cancel, "broker connect", config.connect_timeout, self.link.connect(&shared.params)).await {
                Step::Done(()) => info!("Broker session open as {}", shared.params.client_id),
                Step::Cancelled => return,
                Step::Failed(e @ BridgeError::AuthenticationFailed { .. }) => {
                    self.transition(CloudSessionState::Disconnected);
                    self.release().await;
                    error!("Broker refused credentials, not retrying: {}", e);
                    shared.observer.on_fault(&e);
                    cancel.cancelled().await;
                    return;
                }
                Step::Failed(e) => {
                    warn!("Broker connect failed: {}", e);
                    if !self.recover(&cancel).await {
                        return;
                    }
                    continue;
                }
            }

            self.transition(CloudSessionState::Connected);
            self.transition(CloudSessionState::Subscribing);
            match guarded(
                &cancel,
                "control subscribe",
                config.subscribe_timeout,
                self.link.subscribe(&shared.control_topic),
            )
            .await
            {
                Step::Done(()) => self.subscribed = true,
                Step::Cancelled => return,
                Step::Failed(e) => {
                    warn!("Subscribe to {} failed: {}", shared.control_topic, e);
                    if !self.recover(&cancel).await {
                        return;
                    }
                    continue;
                }
            }

            self.transition(CloudSessionState::Active);
            self.backoff.reset();
            match self.serve(&cancel).await {
                Served::Cancelled => return,
                Served::Lost(reason) => {
                    warn!("Broker session lost: {}", reason);
                    if !self.recover(&cancel).await {
                        return;
                    }
                }
            }
        }
    }

    async fn serve(&mut self, cancel: &CancellationToken) -> Served {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Served::Cancelled,
                event = self.link.next_event() => match event {
                    Ok(BrokerEvent::Message { topic, payload }) => self.accept_control(&topic, payload),
                    Ok(BrokerEvent::ConnectionLost { reason }) => return Served::Lost(reason),
                    Err(e) => return Served::Lost(e.to_string()),
                },
                Some(request) = self.requests.recv() => {
                    if !self.publish(request, cancel).await {
                        return Served::Cancelled;
                    }
                }
            }
        }
    }

    fn accept_control(&self, topic: &str, payload: Vec<u8>) {
        let shared = self.shared;
        if topic != shared.control_topic {
            debug!("Ignoring delivery on {}", topic);
            return;
        }
        let max = shared.config.max_command_len;
        if payload.is_empty() || payload.len() > max {
            shared.stats.control_rejected.fetch_add(1, Ordering::Relaxed);
            warn!("Rejecting control message of {} bytes (max {})", payload.len(), max);
            return;
        }
        shared.stats.control_received.fetch_add(1, Ordering::Relaxed);
        debug!("Control message of {} bytes", payload.len());
        shared.observer.on_control(payload);
    }

    /// Returns `false` if cancelled mid-publish.
    async fn publish(&mut self, request: PublishRequest, cancel: &CancellationToken) -> bool {
        if request.reply.is_closed() {
            return true;
        }
        let shared = self.shared;
        let result = match guarded(
            cancel,
            "publish",
            shared.config.publish_timeout,
            self.link.publish(&shared.data_topic, request.payload),
        )
        .await
        {
            Step::Done(()) => {
                shared.stats.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Step::Failed(e) => {
                warn!("Publish failed: {}", e);
                Err(e)
            }
            Step::Cancelled => {
                let _ = request.reply.send(Err(BridgeError::SessionUnavailable {
                    state: CloudSessionState::Disconnected,
                }));
                return false;
            }
        };
        let _ = request.reply.send(result);
        true
    }

    async fn recover(&mut self, cancel: &CancellationToken) -> bool {
        self.transition(CloudSessionState::Disconnected);
        self.release().await;
        let delay = self.backoff.next_delay();
        debug!("Broker retry {} in {:?}", self.backoff.attempts(), delay);
        pause(cancel, delay).await
    }

    /// Unsubscribe and close, each step bounded by half the shutdown timeout.
    async fn release(&mut self) {
        let limit = self.shared.config.shutdown_timeout / 2;
        if self.subscribed {
            self.subscribed = false;
            match tokio::time::timeout(limit, self.link.unsubscribe(&self.shared.control_topic)).await {
                Ok(Ok(())) => debug!("Unsubscribed from {}", self.shared.control_topic),
                Ok(Err(e)) => debug!("Unsubscribe failed: {}", e),
                Err(_) => debug!("Unsubscribe timed out after {:?}", limit),
            }
        }
        if self.connected {
            self.connected = false;
            match tokio::time::timeout(limit, self.link.disconnect()).await {
                Ok(Ok(())) => debug!("Broker session closed"),
                Ok(Err(e)) => warn!("Broker disconnect failed: {}", e),
                Err(_) => warn!("Broker disconnect timed out after {:?}", limit),
            }
        }
    }

    fn transition(&mut self, next: CloudSessionState) {
        let shared = self.shared;
        let previous = *shared.state.borrow();
        if previous == next {
            return;
        }
        if !previous.can_transition_to(next) {
            error!("Refusing illegal session transition {:?} -> {:?}", previous, next);
            return;
        }
        shared.state.send_replace(next);
        info!("Cloud session: {:?} -> {:?}", previous, next);
        shared.observer.on_state(next);

        let reported = if next.is_active() { previous } else { next };
        while let Ok(request) = self.requests.try_recv() {
            let _ = request.reply.send(Err(BridgeError::SessionUnavailable { state: reported }));
        }
    }
}

/// Cloud session manager
pub struct CloudRelay<C: BrokerLink> {
    link: Arc<tokio::sync::Mutex<C>>,
    requests: Arc<tokio::sync::Mutex<mpsc::Receiver<PublishRequest>>>,
    shared: Arc<RelayShared>,
    handle: RelayHandle,
    worker: Mutex<Option<Worker>>,
}

impl<C: BrokerLink> CloudRelay<C> {
    pub fn new(link: C, credentials: &Credentials, config: RelayConfig, observer: Arc<dyn RelayObserver>) -> Self {
        let (requests_tx, requests_rx) = mpsc::channel(config.mailbox_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(CloudSessionState::Disconnected);
        let stats = Arc::new(RelayStats::default());

        let handle = RelayHandle {
            requests: requests_tx,
            state: state_rx,
            stats: Arc::clone(&stats),
            publish_timeout: config.publish_timeout,
        };
        let shared = RelayShared {
            params: SessionParams::new(credentials, config.keep_alive),
            data_topic: protocol::data_topic(credentials),
            control_topic: protocol::control_topic(credentials),
            config,
            observer,
            stats,
            state: state_tx,
        };

        Self {
            link: Arc::new(tokio::sync::Mutex::new(link)),
            requests: Arc::new(tokio::sync::Mutex::new(requests_rx)),
            shared: Arc::new(shared),
            handle,
            worker: Mutex::new(None),
        }
    }

    /// Begin connecting. No-op while already running.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.lock_worker();
        if worker.as_ref().is_some_and(Worker::is_alive) {
            debug!("Relay already running");
            return Ok(());
        }

        let link = Arc::clone(&self.link);
        let requests = Arc::clone(&self.requests);
        let shared = Arc::clone(&self.shared);
        *worker = Some(Worker::spawn("network", |cancel| async move {
            let mut link = link.lock_owned().await;
            let mut requests = requests.lock_owned().await;
            RelayWorker {
                link: &mut *link,
                requests: &mut *requests,
                backoff: Backoff::new(shared.config.backoff),
                shared: &shared,
                cancel,
                connected: false,
                subscribed: false,
            }
            .run()
            .await;
        })?);

        info!("Cloud relay started");
        Ok(())
    }

    /// Unsubscribe, close the session and stop reconnecting. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let worker = self.lock_worker().take();
        let outcome = match worker {
            Some(worker) => worker.shutdown("cloud relay", self.shared.config.shutdown_timeout).await,
            None => Ok(()),
        };
        let previous = self.shared.state.send_replace(CloudSessionState::Disconnected);
        if previous != CloudSessionState::Disconnected {
            self.shared.observer.on_state(CloudSessionState::Disconnected);
        }
        info!("Cloud relay stopped");
        outcome
    }

    pub async fn publish(&self, reading: &Reading) -> Result<()> {
        self.handle.publish(reading).await
    }

    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> CloudSessionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CloudSessionState> {
        self.shared.state.subscribe()
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.lock_worker().as_ref().is_some_and(Worker::is_alive)
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
