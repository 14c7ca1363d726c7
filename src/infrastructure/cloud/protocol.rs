//! Cloud wire conventions: topics, login triple and the uplink payload.

use crate::domain::models::{Credentials, Reading};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// `<product>/<device>/data`
pub fn data_topic(credentials: &Credentials) -> String {
    format!("{}/{}/data", credentials.product_id, credentials.device_name)
}

/// `<product>/<device>/control`
pub fn control_topic(credentials: &Credentials) -> String {
    format!("{}/{}/control", credentials.product_id, credentials.device_name)
}

/// `<product>;<device>;<secret>`
pub fn username(credentials: &Credentials) -> String {
    format!(
        "{};{};{}",
        credentials.product_id, credentials.device_name, credentials.device_secret
    )
}

/// Everything a [`BrokerLink`](super::link::BrokerLink) needs to open a session
#[derive(Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub client_id: String,
    pub username: String,
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub keep_alive: Duration,
}

impl SessionParams {
    pub fn new(credentials: &Credentials, keep_alive: Duration) -> Self {
        Self {
            client_id: credentials.device_name.clone(),
            username: username(credentials),
            host: credentials.broker_host.clone(),
            port: credentials.broker_port,
            use_tls: credentials.use_tls,
            keep_alive,
        }
    }
}

// The username embeds the device secret
impl std::fmt::Debug for SessionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionParams")
            .field("client_id", &self.client_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_tls", &self.use_tls)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

/// Uplink body: `{"x": .., "y": .., "z": ..}`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl From<&Reading> for TelemetryPayload {
    fn from(reading: &Reading) -> Self {
        Self {
            x: reading.x,
            y: reading.y,
            z: reading.z,
        }
    }
}

impl TelemetryPayload {
    pub fn to_json(&self) -> Vec<u8> {
        // Cannot fail for three floats; non-finite values become null
        serde_json::to_vec(self).unwrap_or_default()
    }
}
