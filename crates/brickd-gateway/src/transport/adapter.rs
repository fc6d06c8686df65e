//! Transport adapter trait and types

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use brickd_core::QoS;
use bytes::Bytes;
use tokio::sync::{broadcast, oneshot};

use super::TransportError;

/// Message delivered by the broker on a subscribed topic
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Timestamp when the message was received
    pub timestamp: Instant,
    /// Concrete topic the message was published on
    pub topic: String,
    /// Raw payload
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            timestamp: Instant::now(),
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
        }
    }
}

/// Per-subscription delivery callback.
///
/// Runs on the transport's I/O task and must never block.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Connection lifecycle notifications
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The broker acknowledged the connection
    Connected,
    /// A message arrived that no registered handler matched
    UnroutedMessage(InboundMessage),
    /// The connection dropped without a local disconnect request
    ConnectionLost(String),
}

/// Everything a transport needs to open an authenticated connection
#[derive(Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    /// Trust anchors (PEM) used to verify the broker certificate.
    /// `None` falls back to the platform trust store.
    pub ca_pem: Option<Vec<u8>>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("root_ca", &self.ca_pem.is_some())
            .field("keep_alive", &self.keep_alive)
            .field("connect_timeout", &self.connect_timeout)
            .field("write_timeout", &self.write_timeout)
            .finish()
    }
}

/// Completion side of an [`AckToken`], held by the transport
#[derive(Debug)]
pub struct AckSender(oneshot::Sender<Result<(), TransportError>>);

impl AckSender {
    pub fn complete(self, result: Result<(), TransportError>) {
        // The waiter may have given up already
        let _ = self.0.send(result);
    }
}

/// Pending broker acknowledgement for a publish/subscribe/unsubscribe.
///
/// Resolves once the broker confirms (or refuses) the request. Dropping the
/// [`AckSender`] without completing resolves to `ConnectionClosed`.
#[derive(Debug)]
pub struct AckToken(oneshot::Receiver<Result<(), TransportError>>);

impl AckToken {
    pub fn channel() -> (AckSender, AckToken) {
        let (tx, rx) = oneshot::channel();
        (AckSender(tx), AckToken(rx))
    }

    /// A token that is already resolved
    pub fn ready(result: Result<(), TransportError>) -> Self {
        let (tx, token) = Self::channel();
        tx.complete(result);
        token
    }

    pub async fn wait(self) -> Result<(), TransportError> {
        self.0.await.unwrap_or(Err(TransportError::ConnectionClosed))
    }
}

/// Broker-agnostic publish/subscribe interface the gateway session drives
///
/// Implementations own exactly one broker connection at a time. They never
/// reconnect on their own: connection loss is reported through
/// [`TransportEvent::ConnectionLost`] and the session decides what to do.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Open the connection and wait until the broker accepts it
    async fn connect(&self, options: &ConnectOptions) -> Result<(), TransportError>;

    /// Queue a publish and return its acknowledgement token
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<AckToken, TransportError>;

    /// Subscribe to a topic filter, routing matching messages to `handler`.
    ///
    /// Subscribing to a filter that already has a handler replaces it.
    async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<AckToken, TransportError>;

    /// Drop the handler for `filter` and cancel the broker subscription
    async fn unsubscribe(&self, filter: &str) -> Result<AckToken, TransportError>;

    /// Close the connection, giving in-flight acknowledgements up to `grace`
    async fn disconnect(&self, grace: Duration);

    /// Subscribe to lifecycle notifications
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Check if the transport is connected
    async fn is_connected(&self) -> bool;
}
