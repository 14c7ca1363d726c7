//! Error types for the telemetry bridge.
//!
//! ## Error Categories
//!
//! - **Capability**: link permissions missing on the host (`LinkUnavailable`)
//! - **Structural**: incompatible device, refused credentials. Terminal for the session.
//! - **Per-message**: malformed frames, oversized commands. Counted and dropped.
//! - **Transient**: link failures and timeouts. Retried inside the owning manager.
//!
//! ```rust
//! use bracelet_bridge::BridgeError;
//!
//! let error = BridgeError::link_failed("adapter went away");
//! assert!(error.is_retryable());
//! assert!(!error.is_terminal());
//! ```

use std::time::Duration;
use thiserror::Error;

use crate::domain::models::{CloudSessionState, ConnectionState};

/// Result type alias for bridge operations.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Main error type for bridge operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BridgeError {
    #[error("{link} link unavailable: {reason}")]
    LinkUnavailable { link: &'static str, reason: String },

    #[error("Device incompatible: {reason}")]
    DeviceIncompatible { reason: String },

    #[error("Malformed frame: expected {expected} bytes, got {actual}")]
    MalformedFrame { expected: usize, actual: usize },

    #[error("Device not ready (state: {state:?})")]
    DeviceNotReady { state: ConnectionState },

    #[error("Command payload of {len} bytes outside 1..={max}")]
    CommandTooLarge { len: usize, max: usize },

    #[error("Cloud session unavailable (state: {state:?})")]
    SessionUnavailable { state: CloudSessionState },

    #[error("Broker rejected credentials: {reason}")]
    AuthenticationFailed { reason: String },

    #[error("{operation} timed out after {duration:?}")]
    Timeout { operation: &'static str, duration: Duration },

    #[error("Link failure: {reason}")]
    Link {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{component} did not shut down cleanly: {reason}")]
    Shutdown { component: &'static str, reason: String },
}

impl BridgeError {
    /// Whether the owning manager should retry after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Link { .. } => true,
            BridgeError::Timeout { .. } => true,
            BridgeError::SessionUnavailable { .. } => true,
            BridgeError::LinkUnavailable { .. } => false,
            BridgeError::DeviceIncompatible { .. } => false,
            BridgeError::MalformedFrame { .. } => false,
            BridgeError::DeviceNotReady { .. } => false,
            BridgeError::CommandTooLarge { .. } => false,
            BridgeError::AuthenticationFailed { .. } => false,
            BridgeError::Shutdown { .. } => false,
        }
    }

    /// Whether this error ends the current session until an operator intervenes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BridgeError::LinkUnavailable { .. }
                | BridgeError::DeviceIncompatible { .. }
                | BridgeError::AuthenticationFailed { .. }
        )
    }

    /// Suggested operator actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            BridgeError::LinkUnavailable { .. } => vec![
                "Grant Bluetooth and network permissions to the host process",
                "Check that a Bluetooth adapter is present and powered on",
            ],
            BridgeError::DeviceIncompatible { .. } => vec![
                "Verify the configured service and characteristic UUIDs",
                "Check the bracelet firmware version",
            ],
            BridgeError::MalformedFrame { .. } => vec![
                "Check the configured frame width against the device documentation",
            ],
            BridgeError::DeviceNotReady { .. } => vec![
                "Wait for the device link to reach Ready before sending commands",
            ],
            BridgeError::CommandTooLarge { .. } => vec![
                "Split the command or raise the configured maximum write size",
            ],
            BridgeError::SessionUnavailable { .. } => vec![
                "Wait for the broker session to become active",
                "Check network connectivity",
            ],
            BridgeError::AuthenticationFailed { .. } => vec![
                "Verify product id, device name and device secret",
                "Check that the device is registered with the broker",
            ],
            BridgeError::Timeout { .. } => vec![
                "Increase the relevant timeout in settings",
                "Move the device closer to the host",
            ],
            BridgeError::Link { .. } => vec![
                "Transient failure, the bridge retries automatically",
            ],
            BridgeError::Shutdown { .. } => vec!["Restart the host process"],
        }
    }

    /// Helper constructor for transient link failures.
    pub fn link_failed(reason: impl Into<String>) -> Self {
        BridgeError::Link { reason: reason.into(), source: None }
    }

    /// Helper constructor for transient link failures with source.
    pub fn link_failed_with_source(
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        BridgeError::Link { reason: reason.into(), source: Some(Box::new(source)) }
    }

    /// Helper constructor for an incompatible device profile.
    pub fn incompatible(reason: impl Into<String>) -> Self {
        BridgeError::DeviceIncompatible { reason: reason.into() }
    }

    /// Helper constructor for a missing host capability.
    pub fn unavailable(link: &'static str, reason: impl Into<String>) -> Self {
        BridgeError::LinkUnavailable { link, reason: reason.into() }
    }

    /// Helper constructor for timeouts.
    pub fn timeout(operation: &'static str, duration: Duration) -> Self {
        BridgeError::Timeout { operation, duration }
    }
}
