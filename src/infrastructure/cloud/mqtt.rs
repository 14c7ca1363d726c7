//! `rumqttc` backend for [`BrokerLink`].
//!
//! The event loop runs on its own task and forwards the packets the relay
//! cares about over a channel, so `next_event` stays cancel safe.
//!
//! `AsyncClient` calls only queue requests for the event loop. Every call
//! here therefore waits for the matching acknowledgement before returning:
//! a publish completes on PUBACK, an unsubscribe on UNSUBACK and a
//! disconnect once the DISCONNECT packet has been written.

use crate::error::{BridgeError, Result};
use crate::infrastructure::cloud::link::{BrokerEvent, BrokerLink};
use crate::infrastructure::cloud::protocol::SessionParams;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

const REQUEST_CAPACITY: usize = 10;
const EVENT_CAPACITY: usize = 64;
/// Upper bound for flushing DISCONNECT before the event loop is stopped
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

enum Polled {
    ConnAck(ConnectReturnCode),
    SubAck(bool),
    UnsubAck,
    /// Packet id assigned to an outgoing QoS 1 publish
    PublishSent(u16),
    PubAck(u16),
    /// DISCONNECT has been written to the socket
    Closed,
    Message { topic: String, payload: Vec<u8> },
    Failed(BridgeError),
}

fn refused(code: ConnectReturnCode) -> BridgeError {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            BridgeError::AuthenticationFailed { reason: format!("{code:?}") }
        }
        other => BridgeError::link_failed(format!("broker refused connection: {other:?}")),
    }
}

fn connection_error(e: ConnectionError) -> BridgeError {
    match e {
        ConnectionError::ConnectionRefused(code) => refused(code),
        other => BridgeError::link_failed_with_source("mqtt event loop", other),
    }
}

#[derive(Default)]
pub struct MqttLink {
    client: Option<AsyncClient>,
    events: Option<mpsc::Receiver<Polled>>,
    poller: Option<JoinHandle<()>>,
    /// Deliveries that arrived while waiting for an acknowledgement
    pending: VecDeque<BrokerEvent>,
}

impl MqttLink {
    pub fn new() -> Self {
        Self::default()
    }

    fn options(params: &SessionParams) -> MqttOptions {
        let mut options = MqttOptions::new(&params.client_id, &params.host, params.port);
        options.set_credentials(&params.username, "");
        options.set_keep_alive(params.keep_alive);
        options.set_clean_session(false);
        if params.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }

    fn client(&self) -> Result<&AsyncClient> {
        self.client.as_ref().ok_or_else(|| BridgeError::link_failed("not connected"))
    }

    /// Wait for the packet `accept` picks out, buffering deliveries meanwhile.
    async fn await_ack<T>(&mut self, mut accept: impl FnMut(&Polled) -> Option<Result<T>>) -> Result<T> {
        let events = self
            .events
            .as_mut()
            .ok_or_else(|| BridgeError::link_failed("not connected"))?;
        loop {
            let polled = events
                .recv()
                .await
                .ok_or_else(|| BridgeError::link_failed("mqtt event loop stopped"))?;
            if let Some(result) = accept(&polled) {
                return result;
            }
            match polled {
                Polled::Message { topic, payload } => {
                    self.pending.push_back(BrokerEvent::Message { topic, payload })
                }
                Polled::Failed(e) => return Err(e),
                _ => {}
            }
        }
    }

    /// Let the event loop flush DISCONNECT, then stop it.
    async fn close(&mut self) {
        let Some(events) = self.events.as_mut() else {
            return;
        };
        let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
            while let Some(polled) = events.recv().await {
                if matches!(polled, Polled::Closed | Polled::Failed(_)) {
                    break;
                }
            }
        })
        .await;
        if flushed.is_err() {
            debug!("DISCONNECT not flushed within {:?}", DISCONNECT_GRACE);
        }
    }

    fn teardown(&mut self) {
        self.client = None;
        self.events = None;
        self.pending.clear();
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn poll_loop(mut eventloop: rumqttc::EventLoop, events: mpsc::Sender<Polled>) {
    loop {
        let polled = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => Polled::ConnAck(ack.code),
            Ok(Event::Incoming(Packet::SubAck(ack))) => Polled::SubAck(
                ack.return_codes
                    .iter()
                    .all(|code| !matches!(code, SubscribeReasonCode::Failure)),
            ),
            Ok(Event::Incoming(Packet::UnsubAck(_))) => Polled::UnsubAck,
            Ok(Event::Incoming(Packet::PubAck(ack))) => Polled::PubAck(ack.pkid),
            Ok(Event::Incoming(Packet::Publish(publish))) => Polled::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            },
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => Polled::PublishSent(pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => Polled::Closed,
            Ok(event) => {
                trace!("mqtt event: {:?}", event);
                continue;
            }
            Err(e) => Polled::Failed(connection_error(e)),
        };
        let last = matches!(polled, Polled::Failed(_) | Polled::Closed);
        if events.send(polled).await.is_err() || last {
            break;
        }
    }
    debug!("mqtt event loop finished");
}

#[async_trait::async_trait]
impl BrokerLink for MqttLink {
    async fn connect(&mut self, params: &SessionParams) -> Result<()> {
        self.teardown();
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BridgeError::unavailable("network", format!("no async runtime: {e}")))?;

        let (client, eventloop) = AsyncClient::new(Self::options(params), REQUEST_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        self.poller = Some(runtime.spawn(poll_loop(eventloop, events_tx)));
        self.client = Some(client);
        self.events = Some(events_rx);

        self.await_ack(|polled| match polled {
            Polled::ConnAck(ConnectReturnCode::Success) => Some(Ok(())),
            Polled::ConnAck(code) => Some(Err(refused(*code))),
            _ => None,
        })
        .await
    }

    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.client()?
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| BridgeError::link_failed_with_source("subscribe", e))?;
        let topic = topic.to_string();
        self.await_ack(|polled| match polled {
            Polled::SubAck(true) => Some(Ok(())),
            Polled::SubAck(false) => Some(Err(BridgeError::link_failed(format!(
                "broker refused subscription to {topic}"
            )))),
            _ => None,
        })
        .await
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        self.client()?
            .unsubscribe(topic)
            .await
            .map_err(|e| BridgeError::link_failed_with_source("unsubscribe", e))?;
        self.await_ack(|polled| matches!(polled, Polled::UnsubAck).then_some(Ok(())))
            .await
    }

    /// Completes once the broker has acknowledged the message.
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client()?
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BridgeError::link_failed_with_source("publish", e))?;
        // Publishes are issued one at a time, so the next outgoing id is ours
        let mut sent = None;
        self.await_ack(|polled| match polled {
            Polled::PublishSent(pkid) if sent.is_none() => {
                sent = Some(*pkid);
                None
            }
            Polled::PubAck(pkid) if sent == Some(*pkid) => Some(Ok(())),
            _ => None,
        })
        .await
    }

    async fn next_event(&mut self) -> Result<BrokerEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }
        let events = self
            .events
            .as_mut()
            .ok_or_else(|| BridgeError::link_failed("not connected"))?;
        loop {
            match events.recv().await {
                Some(Polled::Message { topic, payload }) => return Ok(BrokerEvent::Message { topic, payload }),
                Some(Polled::Failed(e)) => return Ok(BrokerEvent::ConnectionLost { reason: e.to_string() }),
                Some(_) => continue,
                None => {
                    return Ok(BrokerEvent::ConnectionLost {
                        reason: "mqtt event loop stopped".to_string(),
                    })
                }
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        let result = match self.client.as_ref() {
            Some(client) => client
                .disconnect()
                .await
                .map_err(|e| BridgeError::link_failed_with_source("disconnect", e)),
            None => Ok(()),
        };
        if result.is_ok() {
            self.close().await;
        }
        self.teardown();
        result
    }
}
