//! Scripted links and helpers for the async tests.

use crate::domain::backoff::BackoffPolicy;
use crate::domain::models::{CloudSessionState, ConnectionState, Credentials, Reading};
use crate::error::{BridgeError, Result};
use crate::infrastructure::bluetooth::connection::ConnectionConfig;
use crate::infrastructure::bluetooth::link::{DeviceLink, GattProfile, LinkEvent, LinkEvents};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::scanner::Advertisement;
use crate::infrastructure::bluetooth::service::DeviceObserver;
use crate::infrastructure::cloud::link::{BrokerEvent, BrokerLink};
use crate::infrastructure::cloud::protocol::SessionParams;
use crate::infrastructure::cloud::relay::{RelayConfig, RelayObserver};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

pub const DEVICE_NAME: &str = protocol::DEVICE_NAME;
const WAIT: Duration = Duration::from_secs(3);

pub fn credentials() -> Credentials {
    Credentials {
        broker_host: "broker.example".to_string(),
        broker_port: 8883,
        use_tls: true,
        product_id: "PRODUCT01".to_string(),
        device_name: "bracelet-7".to_string(),
        device_secret: "s3cret".to_string(),
        advertised_name: DEVICE_NAME.to_string(),
        service_uuid: protocol::SERVICE_UUID,
        notify_char_uuid: protocol::NOTIFY_CHAR_UUID,
        control_char_uuid: protocol::CONTROL_CHAR_UUID,
    }
}

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        initial: Duration::from_millis(5),
        max: Duration::from_millis(20),
    }
}

pub fn fast_connection_config() -> ConnectionConfig {
    ConnectionConfig {
        scan_window: Duration::from_millis(50),
        connect_timeout: Duration::from_millis(200),
        discovery_timeout: Duration::from_millis(200),
        write_timeout: Duration::from_millis(50),
        shutdown_timeout: Duration::from_millis(500),
        backoff: fast_backoff(),
        ..ConnectionConfig::default()
    }
}

pub fn fast_relay_config() -> RelayConfig {
    RelayConfig {
        connect_timeout: Duration::from_millis(200),
        subscribe_timeout: Duration::from_millis(200),
        publish_timeout: Duration::from_millis(50),
        shutdown_timeout: Duration::from_millis(500),
        backoff: fast_backoff(),
        ..RelayConfig::default()
    }
}

/// Wait until the watched value equals `target`, panicking after a few seconds.
pub async fn wait_for<T: PartialEq + Debug>(rx: &mut watch::Receiver<T>, target: T) {
    let reached = tokio::time::timeout(WAIT, rx.wait_for(|value| *value == target))
        .await
        .map(|seen| seen.is_ok());
    match reached {
        Ok(true) => {}
        Ok(false) => panic!("state channel closed before reaching {target:?}"),
        Err(_) => panic!("timed out waiting for {target:?}, last seen {:?}", *rx.borrow()),
    }
}

/// Poll `condition` until it holds, panicking after a few seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    let polled = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not met in {WAIT:?}");
}

/// Records every observer callback from both managers.
#[derive(Default)]
pub struct RecordingObserver {
    readings: Mutex<Vec<Reading>>,
    states: Mutex<Vec<ConnectionState>>,
    cloud_states: Mutex<Vec<CloudSessionState>>,
    controls: Mutex<Vec<Vec<u8>>>,
    faults: Mutex<u32>,
}

impl RecordingObserver {
    pub fn readings(&self) -> Vec<Reading> {
        self.readings.lock().unwrap().clone()
    }
    pub fn states(&self) -> Vec<ConnectionState> {
        self.states.lock().unwrap().clone()
    }
    pub fn cloud_states(&self) -> Vec<CloudSessionState> {
        self.cloud_states.lock().unwrap().clone()
    }
    pub fn controls(&self) -> Vec<Vec<u8>> {
        self.controls.lock().unwrap().clone()
    }
    pub fn faults(&self) -> u32 {
        *self.faults.lock().unwrap()
    }
}

impl DeviceObserver for RecordingObserver {
    fn on_reading(&self, reading: &Reading) {
        self.readings.lock().unwrap().push(*reading);
    }
    fn on_state(&self, state: ConnectionState) {
        self.states.lock().unwrap().push(state);
    }
    fn on_fault(&self, _error: &BridgeError) {
        *self.faults.lock().unwrap() += 1;
    }
}

impl RelayObserver for RecordingObserver {
    fn on_state(&self, state: CloudSessionState) {
        self.cloud_states.lock().unwrap().push(state);
    }
    fn on_control(&self, payload: Vec<u8>) {
        self.controls.lock().unwrap().push(payload);
    }
    fn on_fault(&self, _error: &BridgeError) {
        *self.faults.lock().unwrap() += 1;
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DeviceScript {
    advertised: String,
    connect_failures: u32,
    connect_stalls: u32,
    discovery_failures: u32,
    incompatible: bool,
    stall_writes: bool,
    connects: u32,
    disconnects: u32,
    writes: Vec<Vec<u8>>,
    events: Option<mpsc::UnboundedSender<LinkEvent>>,
}

/// Test-side control of a [`MockDeviceLink`]
#[derive(Clone)]
pub struct MockDevice {
    script: Arc<Mutex<DeviceScript>>,
}

impl MockDevice {
    pub fn new(advertised: &str) -> Self {
        let script = DeviceScript {
            advertised: advertised.to_string(),
            ..DeviceScript::default()
        };
        Self { script: Arc::new(Mutex::new(script)) }
    }

    pub fn link(&self) -> MockDeviceLink {
        MockDeviceLink { script: Arc::clone(&self.script) }
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.script.lock().unwrap().connect_failures = count;
    }
    /// The next `count` connects hang until the caller gives up
    pub fn stall_next_connects(&self, count: u32) {
        self.script.lock().unwrap().connect_stalls = count;
    }
    /// The next `count` discoveries fail with a transient link error
    pub fn fail_next_discoveries(&self, count: u32) {
        self.script.lock().unwrap().discovery_failures = count;
    }
    pub fn set_incompatible(&self, incompatible: bool) {
        self.script.lock().unwrap().incompatible = incompatible;
    }
    pub fn stall_writes(&self, stall: bool) {
        self.script.lock().unwrap().stall_writes = stall;
    }

    /// Deliver one notification on the live subscription, if any
    pub fn notify(&self, frame: &[u8]) {
        if let Some(events) = &self.script.lock().unwrap().events {
            let _ = events.send(LinkEvent::Notification(frame.to_vec()));
        }
    }

    pub fn drop_link(&self) {
        if let Some(events) = self.script.lock().unwrap().events.take() {
            let _ = events.send(LinkEvent::Disconnected);
        }
    }

    pub fn connects(&self) -> u32 {
        self.script.lock().unwrap().connects
    }
    pub fn disconnects(&self) -> u32 {
        self.script.lock().unwrap().disconnects
    }
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.script.lock().unwrap().writes.clone()
    }
}

pub struct MockDeviceLink {
    script: Arc<Mutex<DeviceScript>>,
}

#[async_trait::async_trait]
impl DeviceLink for MockDeviceLink {
    async fn scan(&mut self, name: &str, window: Duration) -> Result<Advertisement> {
        let advertised = self.script.lock().unwrap().advertised.clone();
        if advertised != name {
            tokio::time::sleep(window).await;
            return Err(BridgeError::timeout("scan", window));
        }
        tokio::task::yield_now().await;
        Ok(Advertisement {
            id: "AA:BB:CC:DD:EE:FF".to_string(),
            local_name: Some(advertised),
            rssi: Some(-55),
        })
    }

    async fn connect(&mut self, _device: &Advertisement) -> Result<()> {
        let stall = {
            let mut script = self.script.lock().unwrap();
            script.connects += 1;
            if script.connect_failures > 0 {
                script.connect_failures -= 1;
                return Err(BridgeError::link_failed("connection refused by peer"));
            }
            let stall = script.connect_stalls > 0;
            script.connect_stalls = script.connect_stalls.saturating_sub(1);
            stall
        };
        if stall {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn discover(&mut self, profile: &GattProfile) -> Result<()> {
        let mut script = self.script.lock().unwrap();
        if script.incompatible {
            return Err(BridgeError::incompatible(format!("service {} not found", profile.service)));
        }
        if script.discovery_failures > 0 {
            script.discovery_failures -= 1;
            return Err(BridgeError::link_failed("GATT discovery aborted"));
        }
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<LinkEvents> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().unwrap().events = Some(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn write_control(&mut self, payload: &[u8]) -> Result<()> {
        let stall = self.script.lock().unwrap().stall_writes;
        if stall {
            futures::future::pending::<()>().await;
        }
        self.script.lock().unwrap().writes.push(payload.to_vec());
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut script = self.script.lock().unwrap();
        script.disconnects += 1;
        script.events = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BrokerScript {
    reject_auth: bool,
    connect_failures: u32,
    withhold_acks: bool,
    connects: u32,
    disconnects: u32,
    unsubscriptions: u32,
    last_params: Option<SessionParams>,
    subscriptions: Vec<String>,
    published: Vec<(String, Vec<u8>)>,
    events: Option<mpsc::UnboundedSender<BrokerEvent>>,
}

/// Test-side control of a [`MockBrokerLink`]
#[derive(Clone, Default)]
pub struct MockBroker {
    script: Arc<Mutex<BrokerScript>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&self) -> MockBrokerLink {
        MockBrokerLink {
            script: Arc::clone(&self.script),
            events: None,
        }
    }

    pub fn reject_auth(&self, reject: bool) {
        self.script.lock().unwrap().reject_auth = reject;
    }
    pub fn fail_next_connects(&self, count: u32) {
        self.script.lock().unwrap().connect_failures = count;
    }
    /// Publishes reach the broker but are never acknowledged
    pub fn withhold_acks(&self, withhold: bool) {
        self.script.lock().unwrap().withhold_acks = withhold;
    }

    /// Inject a delivery on the live session
    pub fn deliver(&self, topic: &str, payload: Vec<u8>) {
        if let Some(events) = &self.script.lock().unwrap().events {
            let _ = events.send(BrokerEvent::Message {
                topic: topic.to_string(),
                payload,
            });
        }
    }

    pub fn lose_connection(&self, reason: &str) {
        if let Some(events) = self.script.lock().unwrap().events.take() {
            let _ = events.send(BrokerEvent::ConnectionLost {
                reason: reason.to_string(),
            });
        }
    }

    pub fn connects(&self) -> u32 {
        self.script.lock().unwrap().connects
    }
    pub fn disconnects(&self) -> u32 {
        self.script.lock().unwrap().disconnects
    }
    pub fn unsubscriptions(&self) -> u32 {
        self.script.lock().unwrap().unsubscriptions
    }
    pub fn last_params(&self) -> Option<SessionParams> {
        self.script.lock().unwrap().last_params.clone()
    }
    pub fn subscriptions(&self) -> Vec<String> {
        self.script.lock().unwrap().subscriptions.clone()
    }
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.script.lock().unwrap().published.clone()
    }
}

pub struct MockBrokerLink {
    script: Arc<Mutex<BrokerScript>>,
    events: Option<mpsc::UnboundedReceiver<BrokerEvent>>,
}

#[async_trait::async_trait]
impl BrokerLink for MockBrokerLink {
    async fn connect(&mut self, params: &SessionParams) -> Result<()> {
        let mut script = self.script.lock().unwrap();
        script.connects += 1;
        script.last_params = Some(params.clone());
        if script.reject_auth {
            return Err(BridgeError::AuthenticationFailed {
                reason: "BadUserNamePassword".to_string(),
            });
        }
        if script.connect_failures > 0 {
            script.connect_failures -= 1;
            return Err(BridgeError::link_failed("broker unreachable"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        script.events = Some(tx);
        self.events = Some(rx);
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.script.lock().unwrap().subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, _topic: &str) -> Result<()> {
        self.script.lock().unwrap().unsubscriptions += 1;
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let withhold = {
            let mut script = self.script.lock().unwrap();
            script.published.push((topic.to_string(), payload));
            script.withhold_acks
        };
        if withhold {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Result<BrokerEvent> {
        let Some(events) = self.events.as_mut() else {
            return Err(BridgeError::link_failed("not connected"));
        };
        Ok(events.recv().await.unwrap_or(BrokerEvent::ConnectionLost {
            reason: "session closed".to_string(),
        }))
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut script = self.script.lock().unwrap();
        script.disconnects += 1;
        script.events = None;
        self.events = None;
        Ok(())
    }
}
