use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One decoded three-axis sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Monotonic per bridge instance, starting at 1
    pub sequence: u64,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Reading {
    pub fn new(sequence: u64, x: f32, y: f32, z: f32) -> Self {
        Self { sequence, x, y, z }
    }

    pub fn axes(&self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }
}

/// Device-side link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    Ready,
    Disconnected,
}

impl ConnectionState {
    /// Whether `next` is a legal successor of `self`.
    ///
    /// `Idle` is reachable from every state because `stop()` may land anywhere.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (from, Idle) => from != Idle,
            (Idle, Scanning) => true,
            (Scanning, Connecting) => true,
            (Connecting, DiscoveringServices) => true,
            (Connecting, Scanning) => true,
            (DiscoveringServices, Ready) => true,
            (DiscoveringServices, Disconnected) => true,
            (Ready, Disconnected) => true,
            (Disconnected, Scanning) => true,
            _ => false,
        }
    }

    pub fn is_ready(self) -> bool {
        self == ConnectionState::Ready
    }
}

/// Cloud-side session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CloudSessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Subscribing,
    Active,
}

impl CloudSessionState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: CloudSessionState) -> bool {
        use CloudSessionState::*;
        match (self, next) {
            (from, Disconnected) => from != Disconnected,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Subscribing) => true,
            (Subscribing, Active) => true,
            _ => false,
        }
    }

    pub fn is_active(self) -> bool {
        self == CloudSessionState::Active
    }
}

/// Resolved connection parameters for one bridge session.
///
/// Built by the host (see [`crate::domain::settings::Settings::credentials`])
/// and shared read-only with both link managers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub broker_host: String,
    pub broker_port: u16,
    pub use_tls: bool,
    /// Account / product id, the first segment of every topic
    pub product_id: String,
    /// Cloud-side device name, the second segment of every topic
    pub device_name: String,
    pub device_secret: String,
    /// BLE advertised local name matched during scanning
    pub advertised_name: String,
    pub service_uuid: Uuid,
    pub notify_char_uuid: Uuid,
    pub control_char_uuid: Uuid,
}

/// Terminal failures surfaced to the operator once per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeFault {
    DeviceIncompatible(String),
    AuthenticationFailed(String),
}

/// Combined status published to UI / status displays.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BridgeStatus {
    pub device: ConnectionState,
    pub cloud: CloudSessionState,
    pub fault: Option<BridgeFault>,
}

impl BridgeStatus {
    /// True while at least one link is doing useful work.
    pub fn is_live(&self) -> bool {
        self.device.is_ready() || self.cloud.is_active()
    }
}
