//! Bridge Coordinator
//!
//! Wires the device manager and the cloud relay together:
//!
//! ```text
//! DeviceLink ─frames─▶ DeviceService ─push─▶ TelemetryBuffer ─snapshot─▶ UI
//!                          │  on_reading
//!                          ▼
//!                      uplink pump ─publish─▶ CloudRelay ─▶ BrokerLink
//!                                                 │ on_control
//!                      downlink pump ◀────────────┘
//!                          │ send_command
//!                          ▼
//!                      DeviceService ─write─▶ DeviceLink
//! ```

use crate::domain::buffer::{AxisSeries, TelemetryBuffer, DEFAULT_CAPACITY};
use crate::domain::host::{Capabilities, KeepAlive, KeepAliveLatch, NoopKeepAlive};
use crate::domain::models::{BridgeFault, BridgeStatus, CloudSessionState, ConnectionState, Credentials, Reading};
use crate::error::{BridgeError, Result};
use crate::infrastructure::bluetooth::{
    ConnectionConfig, DeviceHandle, DeviceLink, DeviceObserver, DeviceService, DeviceStatsSnapshot,
};
use crate::infrastructure::cloud::{BrokerLink, CloudRelay, RelayConfig, RelayHandle, RelayObserver, RelayStatsSnapshot};
use crate::infrastructure::task::Worker;
use futures::Stream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub buffer_capacity: usize,
    pub device: ConnectionConfig,
    pub relay: RelayConfig,
    /// Readings waiting for the uplink pump
    pub uplink_capacity: usize,
    /// Control messages waiting for the downlink pump
    pub downlink_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_CAPACITY,
            device: ConnectionConfig::default(),
            relay: RelayConfig::default(),
            uplink_capacity: 64,
            downlink_capacity: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BridgeStats {
    pub device: DeviceStatsSnapshot,
    pub relay: RelayStatsSnapshot,
    pub buffered: usize,
    pub evicted: u64,
    /// Readings dropped because the uplink queue was full
    pub uplink_overflow: u64,
    /// Control messages dropped because the downlink queue was full
    pub downlink_overflow: u64,
}

fn fault_of(error: &BridgeError) -> Option<BridgeFault> {
    match error {
        BridgeError::DeviceIncompatible { reason } => Some(BridgeFault::DeviceIncompatible(reason.clone())),
        BridgeError::AuthenticationFailed { reason } => Some(BridgeFault::AuthenticationFailed(reason.clone())),
        _ => None,
    }
}

/// Receives callbacks from both managers and fans them into the status
/// channel and the pump queues.
struct BridgeObserver {
    status: watch::Sender<BridgeStatus>,
    keep_alive: KeepAliveLatch,
    uplink: mpsc::Sender<Reading>,
    downlink: mpsc::Sender<Vec<u8>>,
    uplink_overflow: AtomicU64,
    downlink_overflow: AtomicU64,
}

impl BridgeObserver {
    // The latch is updated under the status lock so concurrent updates from
    // the two workers cannot leave it out of step with the status.
    fn update(&self, apply: impl FnOnce(&mut BridgeStatus)) {
        self.status.send_modify(|status| {
            apply(status);
            self.keep_alive.set(status.is_live());
        });
    }

    fn surface(&self, error: &BridgeError) {
        if let Some(fault) = fault_of(error) {
            error!("Bridge fault: {} ({:?})", error, error.recovery_suggestions());
            self.update(|status| status.fault = Some(fault));
        }
    }
}

impl DeviceObserver for BridgeObserver {
    fn on_reading(&self, reading: &Reading) {
        if self.uplink.try_send(*reading).is_err() {
            self.uplink_overflow.fetch_add(1, Ordering::Relaxed);
            debug!("Uplink queue full, dropping reading {}", reading.sequence);
        }
    }

    fn on_state(&self, state: ConnectionState) {
        self.update(|status| status.device = state);
    }

    fn on_fault(&self, error: &BridgeError) {
        self.surface(error);
    }
}

impl RelayObserver for BridgeObserver {
    fn on_state(&self, state: CloudSessionState) {
        self.update(|status| status.cloud = state);
    }

    fn on_control(&self, payload: Vec<u8>) {
        if self.downlink.try_send(payload).is_err() {
            self.downlink_overflow.fetch_add(1, Ordering::Relaxed);
            warn!("Downlink queue full, dropping control message");
        }
    }

    fn on_fault(&self, error: &BridgeError) {
        self.surface(error);
    }
}

/// One device session relayed to one broker session.
pub struct Bridge<D: DeviceLink, C: BrokerLink> {
    credentials: Arc<Credentials>,
    buffer: Arc<TelemetryBuffer>,
    device: DeviceService<D>,
    relay: CloudRelay<C>,
    observer: Arc<BridgeObserver>,
    status: watch::Receiver<BridgeStatus>,
    capabilities: Mutex<Option<Capabilities>>,
    uplink: Arc<tokio::sync::Mutex<mpsc::Receiver<Reading>>>,
    downlink: Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>>,
    pumps: Mutex<Vec<Worker>>,
    pump_shutdown: std::time::Duration,
}

impl<D: DeviceLink, C: BrokerLink> Bridge<D, C> {
    pub fn new(credentials: Credentials, config: BridgeConfig, device_link: D, broker_link: C) -> Self {
        Self::with_keep_alive(credentials, config, device_link, broker_link, Arc::new(NoopKeepAlive))
    }

    pub fn with_keep_alive(
        credentials: Credentials,
        config: BridgeConfig,
        device_link: D,
        broker_link: C,
        keep_alive: Arc<dyn KeepAlive>,
    ) -> Self {
        let credentials = Arc::new(credentials);
        let buffer = Arc::new(TelemetryBuffer::new(config.buffer_capacity));
        let (status_tx, status_rx) = watch::channel(BridgeStatus::default());
        let (uplink_tx, uplink_rx) = mpsc::channel(config.uplink_capacity.max(1));
        let (downlink_tx, downlink_rx) = mpsc::channel(config.downlink_capacity.max(1));

        let observer = Arc::new(BridgeObserver {
            status: status_tx,
            keep_alive: KeepAliveLatch::new(keep_alive),
            uplink: uplink_tx,
            downlink: downlink_tx,
            uplink_overflow: AtomicU64::new(0),
            downlink_overflow: AtomicU64::new(0),
        });
        let pump_shutdown = config.device.shutdown_timeout.min(config.relay.shutdown_timeout);

        let device = DeviceService::new(
            device_link,
            &credentials,
            config.device,
            Arc::clone(&buffer),
            observer.clone(),
        );
        let relay = CloudRelay::new(broker_link, &credentials, config.relay, observer.clone());

        Self {
            credentials,
            buffer,
            device,
            relay,
            observer,
            status: status_rx,
            capabilities: Mutex::new(None),
            uplink: Arc::new(tokio::sync::Mutex::new(uplink_rx)),
            downlink: Arc::new(tokio::sync::Mutex::new(downlink_rx)),
            pumps: Mutex::new(Vec::new()),
            pump_shutdown,
        }
    }

    /// Record the link permissions the host obtained.
    pub fn confirm_capabilities(&self, capabilities: Capabilities) {
        info!(
            "Capabilities confirmed: bluetooth={} network={}",
            capabilities.bluetooth, capabilities.network
        );
        *lock(&self.capabilities) = Some(capabilities);
    }

    /// Start both managers. Idempotent.
    ///
    /// Fails with `LinkUnavailable` unless both capabilities were confirmed.
    pub fn start(&self) -> Result<()> {
        let confirmed = *lock(&self.capabilities);
        let capabilities =
            confirmed.ok_or_else(|| BridgeError::unavailable("host", "capabilities not confirmed"))?;
        if let Some(missing) = capabilities.missing() {
            return Err(BridgeError::unavailable(missing, "permission not granted"));
        }

        if !self.device.is_running() && !self.relay.is_running() {
            self.observer.update(|status| status.fault = None);
        }
        self.start_pumps()?;
        self.device.start()?;
        self.relay.start()?;
        info!("Bridge started for {}", self.credentials.device_name);
        Ok(())
    }

    fn start_pumps(&self) -> Result<()> {
        let mut pumps = lock(&self.pumps);
        if !pumps.is_empty() && pumps.iter().all(Worker::is_alive) {
            return Ok(());
        }
        pumps.clear();

        let uplink = Arc::clone(&self.uplink);
        let relay = self.relay.handle();
        pumps.push(Worker::spawn("network", |cancel| async move {
            let mut readings = uplink.lock_owned().await;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    Some(reading) = readings.recv() => forward_reading(&relay, reading).await,
                    else => break,
                }
            }
        })?);

        let downlink = Arc::clone(&self.downlink);
        let device = self.device.handle();
        pumps.push(Worker::spawn("bluetooth", |cancel| async move {
            let mut commands = downlink.lock_owned().await;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    Some(payload) = commands.recv() => forward_command(&device, payload).await,
                    else => break,
                }
            }
        })?);
        Ok(())
    }

    /// Stop both managers and clear the buffer.
    ///
    /// Each side is stopped even if the other fails; the first error is
    /// returned.
    pub async fn stop(&self) -> Result<()> {
        let device = self.device.stop().await;
        if let Err(e) = &device {
            warn!("Device shutdown: {}", e);
        }
        let relay = self.relay.stop().await;
        if let Err(e) = &relay {
            warn!("Relay shutdown: {}", e);
        }

        let pumps: Vec<Worker> = lock(&self.pumps).drain(..).collect();
        let mut pumped = Ok(());
        for pump in pumps {
            let stopped = pump.shutdown("bridge pump", self.pump_shutdown).await;
            pumped = pumped.and(stopped);
        }
        if let Ok(mut readings) = self.uplink.try_lock() {
            while readings.try_recv().is_ok() {}
        }
        if let Ok(mut commands) = self.downlink.try_lock() {
            while commands.try_recv().is_ok() {}
        }

        self.buffer.clear();
        self.observer.update(|status| {
            status.device = ConnectionState::Idle;
            status.cloud = CloudSessionState::Disconnected;
        });
        info!("Bridge stopped");
        device.and(relay).and(pumped)
    }

    /// Buffered readings, oldest first
    pub fn snapshot(&self) -> Vec<Reading> {
        self.buffer.snapshot()
    }

    pub fn axis_snapshot(&self) -> AxisSeries {
        self.buffer.axis_snapshot()
    }

    pub fn status(&self) -> BridgeStatus {
        self.status.borrow().clone()
    }

    /// Current status followed by every change.
    pub fn status_updates(&self) -> impl Stream<Item = BridgeStatus> + Send + 'static {
        WatchStream::new(self.status.clone())
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            device: self.device.stats(),
            relay: self.relay.stats(),
            buffered: self.buffer.len(),
            evicted: self.buffer.evicted(),
            uplink_overflow: self.observer.uplink_overflow.load(Ordering::Relaxed),
            downlink_overflow: self.observer.downlink_overflow.load(Ordering::Relaxed),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn device(&self) -> &DeviceService<D> {
        &self.device
    }

    pub fn relay(&self) -> &CloudRelay<C> {
        &self.relay
    }

    pub fn keep_alive_held(&self) -> bool {
        self.observer.keep_alive.is_held()
    }
}

async fn forward_reading(relay: &RelayHandle, reading: Reading) {
    // Failures are counted by the relay; the reading is not retried
    let _ = relay.publish(&reading).await;
}

async fn forward_command(device: &DeviceHandle, payload: Vec<u8>) {
    match device.send_command(&payload).await {
        Ok(()) => debug!("Relayed {} byte control message", payload.len()),
        Err(e) => warn!("Dropping control message: {}", e),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
