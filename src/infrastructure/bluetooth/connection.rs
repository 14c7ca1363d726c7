//! BLE Connection Module
//!
//! The device-link state machine. One worker task owns the link for the
//! lifetime of a `start()` / `stop()` cycle and is the only writer of
//! [`ConnectionState`].

use crate::domain::backoff::{Backoff, BackoffPolicy};
use crate::domain::buffer::TelemetryBuffer;
use crate::domain::models::ConnectionState;
use crate::error::{BridgeError, Result};
use crate::infrastructure::bluetooth::link::{DeviceLink, GattProfile, LinkEvent, LinkEvents};
use crate::infrastructure::bluetooth::protocol::{self, AxisMapping};
use crate::infrastructure::bluetooth::service::{DeviceObserver, DeviceStats};
use crate::infrastructure::task::{guarded, pause, Step};
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Extra time granted on top of the scan window before the scan is abandoned
const SCAN_SLACK: Duration = Duration::from_secs(1);

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long one scan pass looks for the bracelet
    pub scan_window: Duration,
    pub connect_timeout: Duration,
    /// Bounds service discovery and the notification subscription
    pub discovery_timeout: Duration,
    pub write_timeout: Duration,
    /// Upper bound for `stop()`
    pub shutdown_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub mapping: AxisMapping,
    pub max_command_len: usize,
    /// Pending control writes accepted while Ready
    pub mailbox_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            scan_window: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(3),
            backoff: BackoffPolicy::default(),
            mapping: AxisMapping::RAW,
            max_command_len: protocol::MAX_COMMAND_LEN,
            mailbox_capacity: 16,
        }
    }
}

/// One control write waiting for the worker
pub(crate) struct CommandRequest {
    pub payload: Vec<u8>,
    pub reply: oneshot::Sender<Result<()>>,
}

/// State shared between the service handle and its worker
pub(crate) struct DeviceShared {
    pub config: ConnectionConfig,
    pub advertised_name: String,
    pub profile: GattProfile,
    pub buffer: Arc<TelemetryBuffer>,
    pub observer: Arc<dyn DeviceObserver>,
    pub stats: Arc<DeviceStats>,
    pub state: watch::Sender<ConnectionState>,
    /// Last sequence number handed out; survives reconnects and restarts
    pub sequence: AtomicU64,
}

enum Served {
    Dropped,
    Cancelled,
}

pub(crate) struct ConnectionWorker<'a, L: DeviceLink> {
    link: &'a mut L,
    commands: &'a mut mpsc::Receiver<CommandRequest>,
    shared: &'a DeviceShared,
    cancel: CancellationToken,
    backoff: Backoff,
    /// A connect was attempted and the link has not been released since
    linked: bool,
}

impl<'a, L: DeviceLink> ConnectionWorker<'a, L> {
    pub(crate) fn new(
        link: &'a mut L,
        commands: &'a mut mpsc::Receiver<CommandRequest>,
        shared: &'a DeviceShared,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            link,
            commands,
            shared,
            cancel,
            backoff: Backoff::new(shared.config.backoff),
            linked: false,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("Device worker started, looking for {:?}", self.shared.advertised_name);
        self.transition(ConnectionState::Scanning);

        self.cycle().await;

        self.release_link().await;
        self.transition(ConnectionState::Idle);
        info!("Device worker stopped");
    }

    /// Scan → connect → discover → serve, forever. Returns on cancellation.
    async fn cycle(&mut self) {
        let cancel = self.cancel.clone();
        let shared = self.shared;
        let config = &shared.config;

        loop {
            // Scanning
            let device = match guarded(
                &cancel,
                "scan",
                config.scan_window + SCAN_SLACK,
                self.link.scan(&shared.advertised_name, config.scan_window),
            )
            .await
            {
                Step::Done(device) => device,
                Step::Cancelled => return,
                Step::Failed(e) => {
                    debug!("Scan pass found nothing: {}", e);
                    if !self.retry_pause(&cancel).await {
                        return;
                    }
                    continue;
                }
            };

            // Connecting
            self.transition(ConnectionState::Connecting);
            self.linked = true;
            match guarded(&cancel, "connect", config.connect_timeout, self.link.connect(&device)).await {
                Step::Done(()) => info!("Connected to {}", device.id),
                Step::Cancelled => return,
                Step::Failed(e) => {
                    warn!("Connect to {} failed: {}", device.id, e);
                    self.release_link().await;
                    if !self.retry_pause(&cancel).await {
                        return;
                    }
                    self.transition(ConnectionState::Scanning);
                    continue;
                }
            }

            // DiscoveringServices
            self.transition(ConnectionState::DiscoveringServices);
            let discovered = guarded(
                &cancel,
                "service discovery",
                config.discovery_timeout,
                self.link.discover(&shared.profile),
            )
            .await;
            let subscribed = match discovered {
                Step::Done(()) => {
                    guarded(
                        &cancel,
                        "notification subscribe",
                        config.discovery_timeout,
                        self.link.subscribe(),
                    )
                    .await
                }
                Step::Failed(e) => Step::Failed(e),
                Step::Cancelled => Step::Cancelled,
            };
            let events = match subscribed {
                Step::Done(events) => events,
                Step::Cancelled => return,
                Step::Failed(e @ BridgeError::DeviceIncompatible { .. }) => {
                    self.transition(ConnectionState::Disconnected);
                    self.release_link().await;
                    error!("Device {} is incompatible, not retrying: {}", device.id, e);
                    shared.observer.on_fault(&e);
                    cancel.cancelled().await;
                    return;
                }
                Step::Failed(e) => {
                    warn!("Service setup on {} failed: {}", device.id, e);
                    if !self.recover(&cancel).await {
                        return;
                    }
                    continue;
                }
            };

            // Ready
            self.transition(ConnectionState::Ready);
            self.backoff.reset();
            match self.serve(events, &cancel).await {
                Served::Cancelled => return,
                Served::Dropped => {
                    warn!("Link to {} dropped", device.id);
                    if !self.recover(&cancel).await {
                        return;
                    }
                }
            }
        }
    }

    async fn serve(&mut self, mut events: LinkEvents, cancel: &CancellationToken) -> Served {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Served::Cancelled,
                event = events.next() => match event {
                    Some(LinkEvent::Notification(frame)) => self.accept_frame(&frame),
                    Some(LinkEvent::Disconnected) | None => return Served::Dropped,
                },
                Some(request) = self.commands.recv() => {
                    if !self.execute(request, cancel).await {
                        return Served::Cancelled;
                    }
                }
            }
        }
    }

    fn accept_frame(&self, frame: &[u8]) {
        let shared = self.shared;
        let sequence = shared.sequence.load(Ordering::Acquire) + 1;
        match protocol::decode_frame(frame, sequence, &shared.config.mapping) {
            Ok(reading) => {
                shared.sequence.store(sequence, Ordering::Release);
                shared.buffer.push(reading);
                shared.stats.record_frame();
                shared.observer.on_reading(&reading);
            }
            Err(e) => {
                shared.stats.record_malformed();
                debug!("Discarding frame: {}", e);
            }
        }
    }

    /// Perform one control write. Returns `false` if cancelled mid-write.
    async fn execute(&mut self, request: CommandRequest, cancel: &CancellationToken) -> bool {
        if request.reply.is_closed() {
            debug!("Dropping abandoned command ({} bytes)", request.payload.len());
            return true;
        }

        let shared = self.shared;
        let stats = &shared.stats;
        let write_timeout = shared.config.write_timeout;
        let result = match guarded(cancel, "control write", write_timeout, self.link.write_control(&request.payload)).await {
            Step::Done(()) => {
                stats.record_command_sent();
                debug!("Wrote {} byte command", request.payload.len());
                Ok(())
            }
            Step::Failed(e) => {
                stats.record_command_failed();
                warn!("Control write failed: {}", e);
                Err(e)
            }
            Step::Cancelled => {
                let _ = request.reply.send(Err(BridgeError::DeviceNotReady {
                    state: ConnectionState::Idle,
                }));
                return false;
            }
        };
        let _ = request.reply.send(result);
        true
    }

    /// Ready/DiscoveringServices → Disconnected → (backoff) → Scanning
    async fn recover(&mut self, cancel: &CancellationToken) -> bool {
        self.transition(ConnectionState::Disconnected);
        self.release_link().await;
        if !self.retry_pause(cancel).await {
            return false;
        }
        self.transition(ConnectionState::Scanning);
        true
    }

    async fn retry_pause(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.backoff.next_delay();
        debug!("Device retry {} in {:?}", self.backoff.attempts(), delay);
        pause(cancel, delay).await
    }

    async fn release_link(&mut self) {
        if !self.linked {
            return;
        }
        self.linked = false;
        let limit = self.shared.config.shutdown_timeout / 2;
        match tokio::time::timeout(limit, self.link.disconnect()).await {
            Ok(Ok(())) => debug!("Device link released"),
            Ok(Err(e)) => warn!("Device disconnect failed: {}", e),
            Err(_) => warn!("Device disconnect timed out after {:?}", limit),
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        let shared = self.shared;
        let previous = *shared.state.borrow();
        if previous == next {
            return;
        }
        if !previous.can_transition_to(next) {
            error!("Refusing illegal device transition {:?} -> {:?}", previous, next);
            return;
        }
        shared.state.send_replace(next);
        info!("Device link: {:?} -> {:?}", previous, next);
        shared.observer.on_state(next);

        // Commands are never carried across a transition
        let reported = if next.is_ready() { previous } else { next };
        while let Ok(request) = self.commands.try_recv() {
            shared.stats.record_command_rejected();
            let _ = request.reply.send(Err(BridgeError::DeviceNotReady { state: reported }));
        }
    }
}
