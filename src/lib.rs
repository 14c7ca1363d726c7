//! Relays motion telemetry from a BLE wearable to an MQTT broker and relays
//! control messages back.
//!
//! The [`Bridge`] owns one [`DeviceService`] and one [`CloudRelay`]. Both
//! are generic over a link seam ([`DeviceLink`], [`BrokerLink`]); the `ble`
//! and `mqtt` features provide `btleplug` and `rumqttc` implementations.

pub mod bridge;
pub mod domain;
pub mod error;
pub mod infrastructure;

#[cfg(test)]
pub(crate) mod test_utils;

pub use bridge::{Bridge, BridgeConfig, BridgeStats};
pub use domain::buffer::{AxisSeries, TelemetryBuffer};
pub use domain::host::{Capabilities, KeepAlive, NoopKeepAlive};
pub use domain::models::{BridgeFault, BridgeStatus, CloudSessionState, ConnectionState, Credentials, Reading};
pub use error::{BridgeError, Result};
pub use infrastructure::bluetooth::{ConnectionConfig, DeviceLink, DeviceService};
pub use infrastructure::cloud::{BrokerLink, CloudRelay, RelayConfig};
