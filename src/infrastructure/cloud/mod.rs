//! Cloud Module
//!
//! Broker side of the bridge.
//!
//! - [`protocol`] - Topics, login triple and uplink payload
//! - [`link`] - The [`BrokerLink`] backend seam
//! - [`relay`] - Session state machine and publishing handle
//! - `mqtt` - `rumqttc` backend (feature `mqtt`)

pub mod link;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod protocol;
pub mod relay;

pub use link::{BrokerEvent, BrokerLink};
pub use protocol::SessionParams;
pub use relay::{CloudRelay, RelayConfig, RelayHandle, RelayObserver, RelayStatsSnapshot};

#[cfg(feature = "mqtt")]
pub use mqtt::MqttLink;
