//! Broker link abstraction
//!
//! The relay drives any backend implementing [`BrokerLink`]. The `mqtt`
//! feature provides one on top of `rumqttc`.

use crate::error::Result;
use crate::infrastructure::cloud::protocol::SessionParams;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// A delivery on a subscribed topic
    Message { topic: String, payload: Vec<u8> },
    /// The session dropped; the relay reconnects
    ConnectionLost { reason: String },
}

/// Low-level broker session.
///
/// Driven by one task in order: `connect` → `subscribe` → (`publish` |
/// `next_event`)* → `unsubscribe` → `disconnect`. Every call is wrapped in a
/// timeout by the caller and may be dropped mid-flight.
#[async_trait::async_trait]
pub trait BrokerLink: Send + 'static {
    /// Open a session and wait for the broker's acknowledgement.
    ///
    /// Must fail with [`crate::BridgeError::AuthenticationFailed`] when the
    /// broker refuses the credentials.
    async fn connect(&mut self, params: &SessionParams) -> Result<()>;

    /// Subscribe at QoS 1 and wait for the acknowledgement.
    async fn subscribe(&mut self, topic: &str) -> Result<()>;

    /// Unsubscribe and wait for the acknowledgement.
    async fn unsubscribe(&mut self, topic: &str) -> Result<()>;

    /// Publish at QoS 1, not retained. Completes only once the broker has
    /// acknowledged the message.
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Next inbound event. Must be cancel safe.
    async fn next_event(&mut self) -> Result<BrokerEvent>;

    /// Close the session gracefully. Must be safe to call when not connected.
    async fn disconnect(&mut self) -> Result<()>;
}
