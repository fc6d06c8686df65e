//! Mock transport adapter for testing
//!
//! Behaves like a broker that lives in memory: subscriptions are routed with
//! the same wildcard rules, acknowledgements can be delayed, withheld or
//! refused, and connection loss can be triggered on demand.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use brickd_core::{topic_matches, QoS};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use super::{
    AckSender, AckToken, ConnectOptions, InboundMessage, MessageHandler, TransportAdapter,
    TransportError, TransportEvent,
};
use crate::config::MockConfig;

/// How the mock broker answers a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckMode {
    /// Acknowledge right away
    Immediate,
    /// Refuse with the given reason
    Reject(String),
    /// Never acknowledge; the ack stays pending until released or the
    /// connection goes away
    Never,
    /// Acknowledge after the given delay
    Delayed(Duration),
}

/// A publish recorded by the mock broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Bytes,
}

/// Mock transport adapter for testing
pub struct MockTransportAdapter {
    config: MockConfig,
    connected: AtomicBool,
    events_tx: broadcast::Sender<TransportEvent>,
    /// Active subscriptions in registration order
    handlers: RwLock<Vec<(String, MessageHandler)>>,
    published: Mutex<Vec<PublishedMessage>>,
    subscribe_requests: Mutex<Vec<String>>,
    unsubscribe_requests: Mutex<Vec<String>>,
    default_mode: RwLock<AckMode>,
    /// Overrides keyed by exact topic (publish) or filter (subscribe/unsubscribe)
    topic_modes: RwLock<HashMap<String, AckMode>>,
    withheld: Mutex<Vec<AckSender>>,
    connect_failures: Mutex<VecDeque<TransportError>>,
    connect_count: AtomicUsize,
    last_options: Mutex<Option<ConnectOptions>>,
}

impl MockTransportAdapter {
    pub fn new(config: &MockConfig) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            config: config.clone(),
            connected: AtomicBool::new(false),
            events_tx,
            handlers: RwLock::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            subscribe_requests: Mutex::new(Vec::new()),
            unsubscribe_requests: Mutex::new(Vec::new()),
            default_mode: RwLock::new(AckMode::Immediate),
            topic_modes: RwLock::new(HashMap::new()),
            withheld: Mutex::new(Vec::new()),
            connect_failures: Mutex::new(VecDeque::new()),
            connect_count: AtomicUsize::new(0),
            last_options: Mutex::new(None),
        }
    }

    /// Set how every request without a topic override is acknowledged
    pub fn set_ack_mode(&self, mode: AckMode) {
        *self.default_mode.write() = mode;
    }

    /// Override acknowledgement behavior for one topic or filter
    pub fn set_topic_ack_mode(&self, topic: impl Into<String>, mode: AckMode) {
        self.topic_modes.write().insert(topic.into(), mode);
    }

    /// Make the next `count` connection attempts fail with `error`
    pub fn fail_next_connects(&self, count: usize, error: TransportError) {
        let mut failures = self.connect_failures.lock();
        for _ in 0..count {
            failures.push_back(error.clone());
        }
    }

    /// Resolve every withheld acknowledgement with `result`
    pub fn release_withheld(&self, result: Result<(), TransportError>) -> usize {
        let withheld: Vec<AckSender> = self.withheld.lock().drain(..).collect();
        let count = withheld.len();
        for ack in withheld {
            ack.complete(result.clone());
        }
        count
    }

    /// Deliver a message as if the broker had received it on `topic`.
    ///
    /// Returns the number of subscriptions the message was routed to.
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        if !self.connected.load(Ordering::SeqCst) {
            return 0;
        }

        let message = InboundMessage::new(topic, payload, QoS::AtLeastOnce);
        let matching: Vec<MessageHandler> = self
            .handlers
            .read()
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, handler)| handler.clone())
            .collect();

        if matching.is_empty() {
            let _ = self.events_tx.send(TransportEvent::UnroutedMessage(message));
            return 0;
        }

        for handler in &matching {
            handler(message.clone());
        }
        matching.len()
    }

    /// Drop the connection as if the network failed
    pub fn simulate_connection_loss(&self, reason: &str) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        self.handlers.write().clear();
        self.release_withheld(Err(TransportError::ConnectionClosed));
        tracing::debug!(reason, "Mock transport: connection lost");
        let _ = self
            .events_tx
            .send(TransportEvent::ConnectionLost(reason.to_string()));
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Filters with a live handler
    pub fn active_filters(&self) -> Vec<String> {
        self.handlers.read().iter().map(|(f, _)| f.clone()).collect()
    }

    /// Every filter a subscribe was requested for, in order
    pub fn subscribe_requests(&self) -> Vec<String> {
        self.subscribe_requests.lock().clone()
    }

    /// Every filter an unsubscribe was requested for, in order
    pub fn unsubscribe_requests(&self) -> Vec<String> {
        self.unsubscribe_requests.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }

    pub fn last_connect_options(&self) -> Option<ConnectOptions> {
        self.last_options.lock().clone()
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    async fn simulate_latency(&self) {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
    }

    fn mode_for(&self, key: &str) -> AckMode {
        self.topic_modes
            .read()
            .get(key)
            .cloned()
            .unwrap_or_else(|| self.default_mode.read().clone())
    }

    fn acknowledge(&self, mode: AckMode) -> AckToken {
        match mode {
            AckMode::Immediate => AckToken::ready(Ok(())),
            AckMode::Reject(reason) => AckToken::ready(Err(TransportError::Rejected(reason))),
            AckMode::Never => {
                let (tx, token) = AckToken::channel();
                self.withheld.lock().push(tx);
                token
            }
            AckMode::Delayed(delay) => {
                let (tx, token) = AckToken::channel();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    tx.complete(Ok(()));
                });
                token
            }
        }
    }
}

#[async_trait]
impl TransportAdapter for MockTransportAdapter {
    async fn connect(&self, options: &ConnectOptions) -> Result<(), TransportError> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock() = Some(options.clone());
        self.simulate_latency().await;

        if let Some(error) = self.connect_failures.lock().pop_front() {
            return Err(error);
        }

        // Clean session: nothing survives from a previous connection
        self.handlers.write().clear();
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events_tx.send(TransportEvent::Connected);
        tracing::debug!(client_id = %options.client_id, "Mock transport: connected");
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<AckToken, TransportError> {
        self.ensure_connected()?;
        self.simulate_latency().await;

        self.published.lock().push(PublishedMessage {
            topic: topic.to_string(),
            qos,
            retain,
            payload,
        });

        if qos == QoS::AtMostOnce {
            return Ok(AckToken::ready(Ok(())));
        }
        Ok(self.acknowledge(self.mode_for(topic)))
    }

    async fn subscribe(
        &self,
        filter: &str,
        _qos: QoS,
        handler: MessageHandler,
    ) -> Result<AckToken, TransportError> {
        self.ensure_connected()?;
        self.simulate_latency().await;

        self.subscribe_requests.lock().push(filter.to_string());
        let mode = self.mode_for(filter);
        if !matches!(mode, AckMode::Reject(_)) {
            let mut handlers = self.handlers.write();
            handlers.retain(|(f, _)| f != filter);
            handlers.push((filter.to_string(), handler));
        }
        Ok(self.acknowledge(mode))
    }

    async fn unsubscribe(&self, filter: &str) -> Result<AckToken, TransportError> {
        self.ensure_connected()?;
        self.simulate_latency().await;

        self.unsubscribe_requests.lock().push(filter.to_string());
        self.handlers.write().retain(|(f, _)| f != filter);
        Ok(self.acknowledge(self.mode_for(filter)))
    }

    async fn disconnect(&self, grace: Duration) {
        if !self.withheld.lock().is_empty() {
            tokio::time::sleep(grace).await;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.handlers.write().clear();
        self.release_withheld(Err(TransportError::ConnectionClosed));
        tracing::debug!("Mock transport: disconnected");
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
