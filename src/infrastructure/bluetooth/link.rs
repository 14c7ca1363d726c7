//! Device link abstraction
//!
//! The connection state machine drives any backend implementing
//! [`DeviceLink`]. The `ble` feature provides one on top of `btleplug`.

use crate::error::Result;
use crate::infrastructure::bluetooth::scanner::Advertisement;
use futures::Stream;
use std::pin::Pin;
use std::time::Duration;
use uuid::Uuid;

/// Service and characteristics the bracelet must expose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    pub service: Uuid,
    pub notify: Uuid,
    pub control: Uuid,
}

/// Events delivered once notifications are enabled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One raw telemetry frame
    Notification(Vec<u8>),
    /// The link dropped (any cause). Ends the event stream.
    Disconnected,
}

pub type LinkEvents = Pin<Box<dyn Stream<Item = LinkEvent> + Send>>;

/// Low-level device link.
///
/// Calls are made by a single task in state-machine order:
/// `scan` → `connect` → `discover` → `subscribe` → (`write_control`)* → `disconnect`.
/// Implementations need not bound their own latency; the caller wraps every
/// call in a timeout and may drop a future mid-flight.
#[async_trait::async_trait]
pub trait DeviceLink: Send + 'static {
    /// Scan for at most `window` and return the first advertisement whose
    /// local name equals `name`. Scanning must be stopped before returning.
    async fn scan(&mut self, name: &str, window: Duration) -> Result<Advertisement>;

    /// Open the link to a device previously returned by `scan`.
    async fn connect(&mut self, device: &Advertisement) -> Result<()>;

    /// Resolve `profile` on the connected device.
    ///
    /// Must fail with [`crate::BridgeError::DeviceIncompatible`] when the
    /// service or either characteristic is absent.
    async fn discover(&mut self, profile: &GattProfile) -> Result<()>;

    /// Enable notifications on the telemetry characteristic.
    async fn subscribe(&mut self) -> Result<LinkEvents>;

    /// Write one payload to the control characteristic.
    async fn write_control(&mut self, payload: &[u8]) -> Result<()>;

    /// Release the link. Must be safe to call when not connected.
    async fn disconnect(&mut self) -> Result<()>;
}
