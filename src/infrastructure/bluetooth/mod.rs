//! Bluetooth Module
//!
//! Device side of the bridge: the bracelet's BLE link.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     DeviceService                        │
//! │   (lifecycle, command submission, state observation)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ spawns
//!                       ▼
//!              ┌──────────────────┐
//!              │ ConnectionWorker │  owns the DeviceLink
//!              └────────┬─────────┘
//!         ┌─────────────┼─────────────┐
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │  Scanner  │  │    Link    │  │ Protocol │
//! │ - name    │  │ - GATT     │  │ - UUIDs  │
//! │   filter  │  │   backend  │  │ - frames │
//! └───────────┘  └────────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - GATT identifiers, frame decoding, command validation
//! - [`scanner`] - Advertisement matching
//! - [`link`] - The [`DeviceLink`] backend seam
//! - [`connection`] - Connection state machine
//! - [`service`] - Public service handle
//! - `btle` - `btleplug` backend (feature `ble`)

#[cfg(feature = "ble")]
pub mod btle;
pub mod connection;
pub mod link;
pub mod protocol;
pub mod scanner;
pub mod service;

pub use connection::ConnectionConfig;
pub use link::{DeviceLink, GattProfile, LinkEvent, LinkEvents};
pub use service::{DeviceHandle, DeviceObserver, DeviceService, DeviceStatsSnapshot};

#[cfg(feature = "ble")]
pub use btle::BtleplugLink;
