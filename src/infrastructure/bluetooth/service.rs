//! Bluetooth Service Module
//!
//! Public face of the device connection manager: lifecycle, command
//! submission and observation. The state machine itself lives in
//! [`connection`](super::connection).

use crate::domain::buffer::TelemetryBuffer;
use crate::domain::models::{ConnectionState, Credentials, Reading};
use crate::error::{BridgeError, Result};
use crate::infrastructure::bluetooth::connection::{
    CommandRequest, ConnectionConfig, ConnectionWorker, DeviceShared,
};
use crate::infrastructure::bluetooth::link::{DeviceLink, GattProfile};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::task::Worker;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

/// Callbacks invoked from the device worker.
///
/// Called inline on the worker task, so implementations must not block.
pub trait DeviceObserver: Send + Sync + 'static {
    fn on_reading(&self, _reading: &Reading) {}
    fn on_state(&self, _state: ConnectionState) {}
    /// Terminal failure; the worker stops retrying until restarted
    fn on_fault(&self, _error: &BridgeError) {}
}

impl DeviceObserver for () {}

/// Device-side counters
#[derive(Debug, Default)]
pub struct DeviceStats {
    frames: AtomicU64,
    malformed_frames: AtomicU64,
    commands_sent: AtomicU64,
    commands_rejected: AtomicU64,
    commands_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStatsSnapshot {
    pub frames: u64,
    pub malformed_frames: u64,
    pub commands_sent: u64,
    /// Refused before reaching the link (not Ready, bad size)
    pub commands_rejected: u64,
    /// Reached the link but the write failed or timed out
    pub commands_failed: u64,
}

impl DeviceStats {
    pub(crate) fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn record_malformed(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn record_command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn record_command_rejected(&self) {
        self.commands_rejected.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn record_command_failed(&self) {
        self.commands_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeviceStatsSnapshot {
        DeviceStatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable handle for submitting control writes
#[derive(Clone)]
pub struct DeviceHandle {
    commands: mpsc::Sender<CommandRequest>,
    state: watch::Receiver<ConnectionState>,
    stats: Arc<DeviceStats>,
    max_command_len: usize,
    write_timeout: Duration,
}

impl DeviceHandle {
    /// Write `payload` to the control characteristic.
    ///
    /// Fails fast with `DeviceNotReady` unless the link is Ready; nothing is
    /// queued for later delivery.
    pub async fn send_command(&self, payload: &[u8]) -> Result<()> {
        let state = *self.state.borrow();
        if !state.is_ready() {
            self.stats.record_command_rejected();
            debug!("Dropping {} byte command, device is {:?}", payload.len(), state);
            return Err(BridgeError::DeviceNotReady { state });
        }
        let payload = match protocol::encode_command(payload, self.max_command_len) {
            Ok(payload) => payload.to_vec(),
            Err(e) => {
                self.stats.record_command_rejected();
                return Err(e);
            }
        };

        let (reply, response) = oneshot::channel();
        let request = CommandRequest { payload, reply };
        // Worker-side write is bounded by write_timeout; allow as much again for queueing
        let limit = self.write_timeout * 2;
        let exchange = async {
            self.commands.send(request).await.map_err(|_| self.not_ready())?;
            response.await.map_err(|_| self.not_ready())?
        };
        tokio::time::timeout(limit, exchange).await.map_err(|_| {
            // The link may have dropped while the command sat in the mailbox
            let state = *self.state.borrow();
            if state.is_ready() {
                BridgeError::timeout("control write", limit)
            } else {
                BridgeError::DeviceNotReady { state }
            }
        })?
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn not_ready(&self) -> BridgeError {
        BridgeError::DeviceNotReady { state: *self.state.borrow() }
    }
}

/// Device Connection Manager
pub struct DeviceService<L: DeviceLink> {
    link: Arc<tokio::sync::Mutex<L>>,
    commands: Arc<tokio::sync::Mutex<mpsc::Receiver<CommandRequest>>>,
    shared: Arc<DeviceShared>,
    handle: DeviceHandle,
    worker: Mutex<Option<Worker>>,
}

impl<L: DeviceLink> DeviceService<L> {
    pub fn new(
        link: L,
        credentials: &Credentials,
        config: ConnectionConfig,
        buffer: Arc<TelemetryBuffer>,
        observer: Arc<dyn DeviceObserver>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(config.mailbox_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let stats = Arc::new(DeviceStats::default());

        let handle = DeviceHandle {
            commands: commands_tx,
            state: state_rx,
            stats: Arc::clone(&stats),
            max_command_len: config.max_command_len,
            write_timeout: config.write_timeout,
        };
        let shared = DeviceShared {
            advertised_name: credentials.advertised_name.clone(),
            profile: GattProfile {
                service: credentials.service_uuid,
                notify: credentials.notify_char_uuid,
                control: credentials.control_char_uuid,
            },
            config,
            buffer,
            observer,
            stats,
            state: state_tx,
            sequence: AtomicU64::new(0),
        };

        Self {
            link: Arc::new(tokio::sync::Mutex::new(link)),
            commands: Arc::new(tokio::sync::Mutex::new(commands_rx)),
            shared: Arc::new(shared),
            handle,
            worker: Mutex::new(None),
        }
    }

    /// Begin the scan/connect cycle. No-op while already running.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.lock_worker();
        if worker.as_ref().is_some_and(Worker::is_alive) {
            debug!("Device service already running");
            return Ok(());
        }

        let link = Arc::clone(&self.link);
        let commands = Arc::clone(&self.commands);
        let shared = Arc::clone(&self.shared);
        *worker = Some(Worker::spawn("bluetooth", |cancel| async move {
            let mut link = link.lock_owned().await;
            let mut commands = commands.lock_owned().await;
            ConnectionWorker::new(&mut *link, &mut *commands, &shared, cancel)
                .run()
                .await;
        })?);

        info!("Device service started");
        Ok(())
    }

    /// Cancel in-flight work, release the link and settle in `Idle`.
    ///
    /// Bounded by the configured shutdown timeout; a worker that does not
    /// unwind in time is aborted and reported as a `Shutdown` error.
    pub async fn stop(&self) -> Result<()> {
        let worker = self.lock_worker().take();
        let outcome = match worker {
            Some(worker) => {
                worker
                    .shutdown("device link", self.shared.config.shutdown_timeout)
                    .await
            }
            None => Ok(()),
        };
        self.settle_idle();
        info!("Device service stopped");
        outcome
    }

    pub async fn send_command(&self, payload: &[u8]) -> Result<()> {
        self.handle.send_command(payload).await
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch every state transition
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn stats(&self) -> DeviceStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.lock_worker().as_ref().is_some_and(Worker::is_alive)
    }

    // Only reached once the worker is gone, so this is still the sole writer
    fn settle_idle(&self) {
        let previous = self.shared.state.send_replace(ConnectionState::Idle);
        if previous != ConnectionState::Idle {
            self.shared.observer.on_state(ConnectionState::Idle);
        }
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backoff::BackoffPolicy;
    use crate::test_utils::{self, MockDevice, RecordingObserver};
    use std::time::Instant;

    fn service(
        mock: &MockDevice,
        config: ConnectionConfig,
    ) -> (DeviceService<test_utils::MockDeviceLink>, Arc<TelemetryBuffer>, Arc<RecordingObserver>) {
        let buffer = Arc::new(TelemetryBuffer::new(100));
        let observer = Arc::new(RecordingObserver::default());
        let service = DeviceService::new(
            mock.link(),
            &test_utils::credentials(),
            config,
            Arc::clone(&buffer),
            observer.clone(),
        );
        (service, buffer, observer)
    }

    #[tokio::test]
    async fn reaches_ready_and_buffers_frames() {
        let mock = MockDevice::new(test_utils::DEVICE_NAME);
        let (service, buffer, observer) = service(&mock, test_utils::fast_connection_config());

        service.start().unwrap();
        let mut state = service.subscribe_state();
        test_utils::wait_for(&mut state, ConnectionState::Ready).await;

        mock.notify(&[10, 251, 3]);
        mock.notify(&[1, 2, 3]);
        // The observer is notified last, after the buffer and counters
        test_utils::eventually(|| observer.readings().len() == 2).await;

        let snapshot = buffer.snapshot();
        assert_eq!(snapshot[0], Reading::new(1, 10.0, -5.0, 3.0));
        assert_eq!(snapshot[1].sequence, 2);
        assert_eq!(buffer.len(), 2);
        assert_eq!(service.stats().frames, 2);

        service.stop().await.unwrap();
        assert_eq!(service.state(), ConnectionState::Idle);
        assert!(mock.disconnects() >= 1);
    }

    #[tokio::test]
    async fn transitions_follow_legal_edges() {
        let mock = MockDevice::new(test_utils::DEVICE_NAME);
        mock.fail_next_connects(2);
        let (service, _buffer, observer) = service(&mock, test_utils::fast_connection_config());

        service.start().unwrap();
        let mut state = service.subscribe_state();
        test_utils::wait_for(&mut state, ConnectionState::Ready).await;
        mock.drop_link();
        test_utils::eventually(|| mock.connects() >= 4).await;
        test_utils::wait_for(&mut state, ConnectionState::Ready).await;
        service.stop().await.unwrap();

        let states = observer.states();
        let mut previous = ConnectionState::Idle;
        for next in &states {
            assert!(previous.can_transition_to(*next), "{previous:?} -> {next:?} in {states:?}");
            previous = *next;
        }
        // Two failed connects fall back to scanning without discovery
        assert_eq!(
            &states[..4],
            &[
                ConnectionState::Scanning,
                ConnectionState::Connecting,
                ConnectionState::Scanning,
                ConnectionState::Connecting,
            ]
        );
        assert_eq!(states.last(), Some(&ConnectionState::Idle));
    }

    #[tokio::test]
    async fn transient_discovery_failure_is_retried() {
        let mock = MockDevice::new(test_utils::DEVICE_NAME);
        mock.fail_next_discoveries(1);
        let (service, _buffer, observer) = service(&mock, test_utils::fast_connection_config());

        service.start().unwrap();
        let mut state = service.subscribe_state();
        test_utils::wait_for(&mut state, ConnectionState::Ready).await;
        service.stop().await.unwrap();

        let states = observer.states();
        let mut previous = ConnectionState::Idle;
        for next in &states {
            assert!(previous.can_transition_to(*next), "{previous:?} -> {next:?} in {states:?}");
            previous = *next;
        }
        assert_eq!(
            &states[..6],
            &[
                ConnectionState::Scanning,
                ConnectionState::Connecting,
                ConnectionState::DiscoveringServices,
                ConnectionState::Disconnected,
                ConnectionState::Scanning,
                ConnectionState::Connecting,
            ]
        );
        assert_eq!(mock.connects(), 2);
        assert_eq!(observer.faults(), 0);
    }

    #[tokio::test]
    async fn backoff_restarts_after_ready() {
        let mock = MockDevice::new(test_utils::DEVICE_NAME);
        mock.fail_next_connects(4);
        let config = ConnectionConfig {
            backoff: BackoffPolicy {
                initial: Duration::from_millis(20),
                max: Duration::from_secs(2),
            },
            ..test_utils::fast_connection_config()
        };
        let (service, _buffer, _observer) = service(&mock, config);

        // 20 + 40 + 80 + 160 ms to get through the failed connects
        service.start().unwrap();
        let mut state = service.subscribe_state();
        test_utils::wait_for(&mut state, ConnectionState::Ready).await;
        assert_eq!(mock.connects(), 5);

        // Without a reset the next delay would be 320 ms
        let dropped = Instant::now();
        mock.drop_link();
        test_utils::eventually(|| mock.connects() == 6).await;
        assert!(dropped.elapsed() < Duration::from_millis(200), "took {:?}", dropped.elapsed());

        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn timed_out_connect_is_released() {
        let mock = MockDevice::new(test_utils::DEVICE_NAME);
        mock.stall_next_connects(1);
        let (service, _buffer, _observer) = service(&mock, test_utils::fast_connection_config());

        service.start().unwrap();
        let mut state = service.subscribe_state();
        test_utils::wait_for(&mut state, ConnectionState::Ready).await;

        assert_eq!(mock.connects(), 2);
        assert_eq!(mock.disconnects(), 1);
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn link_lost_while_queued_reports_not_ready() {
        let (commands, _pending) = mpsc::channel(1);
        let (state_tx, state) = watch::channel(ConnectionState::Ready);
        let handle = DeviceHandle {
            commands,
            state,
            stats: Arc::new(DeviceStats::default()),
            max_command_len: protocol::MAX_COMMAND_LEN,
            write_timeout: Duration::from_millis(20),
        };

        let send = handle.send_command(&[0x01]);
        tokio::pin!(send);
        assert!(tokio::time::timeout(Duration::from_millis(10), &mut send).await.is_err());
        state_tx.send_replace(ConnectionState::Disconnected);
        let err = send.await.unwrap_err();
        assert!(matches!(err, BridgeError::DeviceNotReady { state: ConnectionState::Disconnected }));
    }

    #[tokio::test]
    async fn recovers_after_link_drop() {
        let mock = MockDevice::new(test_utils::DEVICE_NAME);
        let (service, _buffer, _observer) = service(&mock, test_utils::fast_connection_config());

        service.start().unwrap();
        let mut state = service.subscribe_state();
        test_utils::wait_for(&mut state, ConnectionState::Ready).await;

        mock.drop_link();
        test_utils::wait_for(&mut state, ConnectionState::Disconnected).await;
        test_utils::wait_for(&mut state, ConnectionState::Ready).await;
        assert_eq!(mock.connects(), 2);

        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_frames_are_counted_not_fatal() {
        let mock = MockDevice::new(test_utils::DEVICE_NAME);
        let (service, buffer, _observer) = service(&mock, test_utils::fast_connection_config());

        service.start().unwrap();
        let mut state = service.subscribe_state();
        test_utils::wait_for(&mut state, ConnectionState::Ready).await;

        mock.notify(&[1, 2]);
        mock.notify(&[1, 2, 3, 4]);
        mock.notify(&[4, 5, 6]);
        test_utils::eventually(|| buffer.len() == 1).await;

        assert_eq!(service.stats().malformed_frames, 2);
        assert_eq!(service.state(), ConnectionState::Ready);
        // Malformed frames do not consume sequence numbers
        assert_eq!(buffer.snapshot()[0].sequence, 1);

        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn incompatible_device_is_terminal() {
        let mock = MockDevice::new(test_utils::DEVICE_NAME);
        mock.set_incompatible(true);
        let (service, _buffer, observer) = service(&mock, test_utils::fast_connection_config());

        service.start().unwrap();
        let mut state = service.subscribe_state();
        test_utils::wait_for(&mut state, ConnectionState::Disconnected).await;
        test_utils::eventually(|| observer.faults() == 1).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mock.connects(), 1, "incompatible devices are not retried");
        assert_eq!(service.state(), ConnectionState::Disconnected);

        service.stop().await.unwrap();
        assert_eq!(service.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn send_command_requires_ready() {
        let mock = MockDevice::new("someone else");
        let (service, _buffer, _observer) = service(&mock, test_utils::fast_connection_config());

        let err = service.send_command(&[0x01]).await.unwrap_err();
        assert!(matches!(err, BridgeError::DeviceNotReady { state: ConnectionState::Idle }));

        service.start().unwrap();
        let mut state = service.subscribe_state();
        test_utils::wait_for(&mut state, ConnectionState::Scanning).await;
        let err = service.send_command(&[0x01]).await.unwrap_err();
        assert!(matches!(err, BridgeError::DeviceNotReady { state: ConnectionState::Scanning }));

        assert!(mock.writes().is_empty());
        assert_eq!(service.stats().commands_rejected, 2);
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn send_command_writes_when_ready() {
        let mock = MockDevice::new(test_utils::DEVICE_NAME);
        let (service, _buffer, _observer) = service(&mock, test_utils::fast_connection_config());

        service.start().unwrap();
        let mut state = service.subscribe_state();
        test_utils::wait_for(&mut state, ConnectionState::Ready).await;

        service.send_command(&[0x05, 0x10]).await.unwrap();
        let oversized = service.send_command(&[0u8; 21]).await.unwrap_err();
        assert!(matches!(oversized, BridgeError::CommandTooLarge { len: 21, max: 20 }));

        assert_eq!(mock.writes(), vec![vec![0x05, 0x10]]);
        assert_eq!(service.stats().commands_sent, 1);
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stalled_write_times_out() {
        let mock = MockDevice::new(test_utils::DEVICE_NAME);
        mock.stall_writes(true);
        let (service, _buffer, _observer) = service(&mock, test_utils::fast_connection_config());

        service.start().unwrap();
        let mut state = service.subscribe_state();
        test_utils::wait_for(&mut state, ConnectionState::Ready).await;

        let err = service.send_command(&[0x01]).await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }), "{err:?}");
        assert_eq!(service.state(), ConnectionState::Ready);
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let mock = MockDevice::new(test_utils::DEVICE_NAME);
        let (service, _buffer, _observer) = service(&mock, test_utils::fast_connection_config());

        service.start().unwrap();
        service.start().unwrap();
        let mut state = service.subscribe_state();
        test_utils::wait_for(&mut state, ConnectionState::Ready).await;
        service.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(mock.connects(), 1);
        service.stop().await.unwrap();
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let mock = MockDevice::new(test_utils::DEVICE_NAME);
        let (service, buffer, _observer) = service(&mock, test_utils::fast_connection_config());

        service.start().unwrap();
        let mut state = service.subscribe_state();
        test_utils::wait_for(&mut state, ConnectionState::Ready).await;
        mock.notify(&[1, 1, 1]);
        test_utils::eventually(|| buffer.len() == 1).await;
        service.stop().await.unwrap();

        service.start().unwrap();
        test_utils::wait_for(&mut state, ConnectionState::Ready).await;
        mock.notify(&[2, 2, 2]);
        test_utils::eventually(|| buffer.len() == 2).await;
        assert_eq!(buffer.latest().map(|r| r.sequence), Some(2));
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_during_backoff_is_prompt() {
        let mock = MockDevice::new(test_utils::DEVICE_NAME);
        mock.fail_next_connects(u32::MAX);
        let config = ConnectionConfig {
            backoff: BackoffPolicy {
                initial: Duration::from_secs(30),
                max: Duration::from_secs(30),
            },
            ..test_utils::fast_connection_config()
        };
        let (service, _buffer, _observer) = service(&mock, config);

        service.start().unwrap();
        test_utils::eventually(|| mock.connects() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        service.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(service.state(), ConnectionState::Idle);
        assert!(!service.is_running());
        assert_eq!(mock.connects(), 1);
    }
}
