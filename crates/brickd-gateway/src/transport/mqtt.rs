//! MQTT transport adapter (rumqttc)
//!
//! One [`AsyncClient`]/[`EventLoop`] pair is created per connection and the
//! event loop is driven by a dedicated I/O task. rumqttc reports the packet
//! id of each outgoing request only once it is written, so callers' ack
//! tokens are queued per request kind and bound to a packet id when the
//! matching `Outgoing` event is seen. The broker's PUBACK/SUBACK/UNSUBACK
//! then completes the token.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use brickd_core::{topic_matches, QoS};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{
    AckSender, AckToken, ConnectOptions, InboundMessage, MessageHandler, TransportAdapter,
    TransportError, TransportEvent,
};
use crate::config::MqttConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AckKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

struct PendingAck {
    ack: AckSender,
    /// Filter of a subscribe request, dropped locally if the broker refuses it
    filter: Option<String>,
}

/// Acknowledgements waiting for their packet id or for the broker's reply
#[derive(Default)]
struct PendingAcks {
    queued: HashMap<AckKind, VecDeque<PendingAck>>,
    inflight: HashMap<(AckKind, u16), PendingAck>,
}

impl PendingAcks {
    fn enqueue(&mut self, kind: AckKind, ack: AckSender, filter: Option<String>) {
        self.queued
            .entry(kind)
            .or_default()
            .push_back(PendingAck { ack, filter });
    }

    /// Take back the most recent request of `kind` after it failed to send
    fn discard_last(&mut self, kind: AckKind) -> Option<AckSender> {
        self.queued
            .get_mut(&kind)
            .and_then(|q| q.pop_back())
            .map(|p| p.ack)
    }

    /// The oldest queued request of `kind` was written with `pkid`
    fn sent(&mut self, kind: AckKind, pkid: u16) {
        let Some(pending) = self.queued.get_mut(&kind).and_then(|q| q.pop_front()) else {
            return;
        };
        // QoS 0 publishes carry no packet id and are never acknowledged
        if pkid == 0 {
            pending.ack.complete(Ok(()));
        } else {
            self.inflight.insert((kind, pkid), pending);
        }
    }

    /// Complete the request acknowledged by the broker. Returns the filter of
    /// a refused subscription.
    fn acknowledged(
        &mut self,
        kind: AckKind,
        pkid: u16,
        result: Result<(), TransportError>,
    ) -> Option<String> {
        let pending = self.inflight.remove(&(kind, pkid))?;
        let refused = result.is_err();
        pending.ack.complete(result);
        if refused {
            pending.filter
        } else {
            None
        }
    }

    fn fail_all(&mut self, error: TransportError) {
        for (_, queue) in self.queued.drain() {
            for pending in queue {
                pending.ack.complete(Err(error.clone()));
            }
        }
        for (_, pending) in self.inflight.drain() {
            pending.ack.complete(Err(error.clone()));
        }
    }

    fn is_empty(&self) -> bool {
        self.inflight.is_empty() && self.queued.values().all(|q| q.is_empty())
    }
}

/// State shared between the adapter and its I/O task
struct Shared {
    handlers: RwLock<Vec<(String, MessageHandler)>>,
    pending: Mutex<PendingAcks>,
    events_tx: broadcast::Sender<TransportEvent>,
    connected: AtomicBool,
    closing: AtomicBool,
}

impl Shared {
    fn route(&self, message: InboundMessage) {
        let matching: Vec<MessageHandler> = self
            .handlers
            .read()
            .iter()
            .filter(|(filter, _)| topic_matches(filter, &message.topic))
            .map(|(_, handler)| handler.clone())
            .collect();

        if matching.is_empty() {
            trace!(topic = %message.topic, "No handler for inbound message");
            let _ = self.events_tx.send(TransportEvent::UnroutedMessage(message));
            return;
        }
        for handler in &matching {
            handler(message.clone());
        }
    }

    fn remove_handler(&self, filter: &str) {
        self.handlers.write().retain(|(f, _)| f != filter);
    }
}

/// MQTT 3.1.1 transport adapter
pub struct MqttTransport {
    config: MqttConfig,
    shared: Arc<Shared>,
    client: RwLock<Option<AsyncClient>>,
    io_task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes request submission so queued acks match the outgoing order
    submit: tokio::sync::Mutex<()>,
    write_timeout: RwLock<Duration>,
}

impl MqttTransport {
    pub fn new(config: &MqttConfig) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            config: config.clone(),
            shared: Arc::new(Shared {
                handlers: RwLock::new(Vec::new()),
                pending: Mutex::new(PendingAcks::default()),
                events_tx,
                connected: AtomicBool::new(false),
                closing: AtomicBool::new(false),
            }),
            client: RwLock::new(None),
            io_task: Mutex::new(None),
            submit: tokio::sync::Mutex::new(()),
            write_timeout: RwLock::new(Duration::from_secs(3)),
        }
    }

    fn mqtt_options(&self, options: &ConnectOptions) -> MqttOptions {
        let mut mqtt = MqttOptions::new(&options.client_id, &options.host, options.port);
        mqtt.set_keep_alive(options.keep_alive);
        mqtt.set_clean_session(true);
        mqtt.set_credentials(&options.username, &options.password);
        mqtt.set_max_packet_size(self.config.max_packet_size, self.config.max_packet_size);

        // TLS is never optional; without a configured anchor the system
        // trust store is used
        let transport = match &options.ca_pem {
            Some(ca) => Transport::tls_with_config(TlsConfiguration::Simple {
                ca: ca.clone(),
                alpn: None,
                client_auth: None,
            }),
            None => Transport::tls_with_default_config(),
        };
        mqtt.set_transport(transport);
        mqtt
    }

    fn current_client(&self) -> Result<AsyncClient, TransportError> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.client
            .read()
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    /// Queue an ack for `kind` and hand the request to the client
    async fn submit<F>(
        &self,
        kind: AckKind,
        filter: Option<String>,
        request: F,
    ) -> Result<AckToken, TransportError>
    where
        F: std::future::Future<Output = Result<(), rumqttc::ClientError>>,
    {
        let write_timeout = *self.write_timeout.read();
        let _guard = self.submit.lock().await;

        let (tx, token) = AckToken::channel();
        self.shared.pending.lock().enqueue(kind, tx, filter);

        let outcome = match tokio::time::timeout(write_timeout, request).await {
            Ok(Ok(())) => return Ok(token),
            Ok(Err(e)) => TransportError::SendFailed(e.to_string()),
            Err(_) => TransportError::Timeout(format!(
                "request not written within {} ms",
                write_timeout.as_millis()
            )),
        };

        // Dropping the reclaimed sender is fine; the token goes with it
        let _ = self.shared.pending.lock().discard_last(kind);
        Err(outcome)
    }

    fn stop_io_task(&self) {
        if let Some(task) = self.io_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.stop_io_task();
    }
}

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
    }
}

fn from_mqtt_qos(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn connection_error(error: ConnectionError) -> TransportError {
    match error {
        ConnectionError::ConnectionRefused(code) => {
            TransportError::ConnectionRefused(format!("{:?}", code))
        }
        other => TransportError::ConnectionFailed(other.to_string()),
    }
}

fn suback_result(codes: &[SubscribeReasonCode]) -> Result<(), TransportError> {
    if codes
        .iter()
        .any(|code| matches!(code, SubscribeReasonCode::Failure))
    {
        Err(TransportError::Rejected("subscription refused".to_string()))
    } else {
        Ok(())
    }
}

/// Drive the event loop until the connection ends
async fn run_event_loop(
    mut eventloop: EventLoop,
    shared: Arc<Shared>,
    mut ready: Option<oneshot::Sender<Result<(), TransportError>>>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                shared.connected.store(true, Ordering::SeqCst);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
                let _ = shared.events_tx.send(TransportEvent::Connected);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let mut message =
                    InboundMessage::new(publish.topic, publish.payload, from_mqtt_qos(publish.qos));
                message.retain = publish.retain;
                shared.route(message);
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                shared
                    .pending
                    .lock()
                    .acknowledged(AckKind::Publish, ack.pkid, Ok(()));
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let result = suback_result(&ack.return_codes);
                let refused =
                    shared
                        .pending
                        .lock()
                        .acknowledged(AckKind::Subscribe, ack.pkid, result);
                if let Some(filter) = refused {
                    warn!(%filter, "Broker refused subscription");
                    shared.remove_handler(&filter);
                }
            }
            Ok(Event::Incoming(Packet::UnsubAck(ack))) => {
                shared
                    .pending
                    .lock()
                    .acknowledged(AckKind::Unsubscribe, ack.pkid, Ok(()));
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                shared.pending.lock().sent(AckKind::Publish, pkid);
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                shared.pending.lock().sent(AckKind::Subscribe, pkid);
            }
            Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                shared.pending.lock().sent(AckKind::Unsubscribe, pkid);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                shared.connected.store(false, Ordering::SeqCst);
                shared
                    .pending
                    .lock()
                    .fail_all(TransportError::ConnectionClosed);

                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(connection_error(e)));
                } else if !shared.closing.load(Ordering::SeqCst) {
                    warn!(error = %e, "MQTT connection lost");
                    let _ = shared
                        .events_tx
                        .send(TransportEvent::ConnectionLost(e.to_string()));
                }
                break;
            }
        }
    }
    shared.connected.store(false, Ordering::SeqCst);
}

#[async_trait]
impl TransportAdapter for MqttTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<(), TransportError> {
        self.stop_io_task();
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.closing.store(false, Ordering::SeqCst);
        self.shared.handlers.write().clear();
        self.shared
            .pending
            .lock()
            .fail_all(TransportError::ConnectionClosed);
        *self.write_timeout.write() = options.write_timeout;

        let (client, eventloop) =
            AsyncClient::new(self.mqtt_options(options), self.config.request_capacity);
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(run_event_loop(
            eventloop,
            self.shared.clone(),
            Some(ready_tx),
        ));

        let result = match tokio::time::timeout(options.connect_timeout, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => Err(TransportError::Timeout(format!(
                "no CONNACK within {} ms",
                options.connect_timeout.as_millis()
            ))),
        };

        match result {
            Ok(()) => {
                *self.client.write() = Some(client);
                *self.io_task.lock() = Some(task);
                info!(
                    host = %options.host,
                    port = options.port,
                    client_id = %options.client_id,
                    "MQTT connected"
                );
                Ok(())
            }
            Err(e) => {
                task.abort();
                Err(e)
            }
        }
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<AckToken, TransportError> {
        let client = self.current_client()?;
        trace!(%topic, len = payload.len(), "MQTT publish");
        self.submit(
            AckKind::Publish,
            None,
            client.publish_bytes(topic, to_mqtt_qos(qos), retain, payload),
        )
        .await
    }

    async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<AckToken, TransportError> {
        let client = self.current_client()?;
        {
            let mut handlers = self.shared.handlers.write();
            handlers.retain(|(f, _)| f != filter);
            handlers.push((filter.to_string(), handler));
        }

        let result = self
            .submit(
                AckKind::Subscribe,
                Some(filter.to_string()),
                client.subscribe(filter, to_mqtt_qos(qos)),
            )
            .await;
        if result.is_err() {
            self.shared.remove_handler(filter);
        }
        result
    }

    async fn unsubscribe(&self, filter: &str) -> Result<AckToken, TransportError> {
        self.shared.remove_handler(filter);
        let client = self.current_client()?;
        self.submit(AckKind::Unsubscribe, None, client.unsubscribe(filter))
            .await
    }

    async fn disconnect(&self, grace: Duration) {
        self.shared.closing.store(true, Ordering::SeqCst);

        let drained = tokio::time::timeout(grace, async {
            while !self.shared.pending.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if drained.is_err() {
            debug!("Disconnect grace elapsed with acknowledgements outstanding");
        }

        let client = self.client.write().take();
        if let Some(client) = client {
            let _ = tokio::time::timeout(grace, client.disconnect()).await;
        }

        let task = self.io_task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                task.abort();
            }
        }

        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.handlers.write().clear();
        self.shared
            .pending
            .lock()
            .fail_all(TransportError::ConnectionClosed);
        info!("MQTT disconnected");
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events_tx.subscribe()
    }

    async fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ack_bound_to_packet_id_in_submission_order() {
        let mut pending = PendingAcks::default();
        let (first_tx, first) = AckToken::channel();
        let (second_tx, second) = AckToken::channel();
        pending.enqueue(AckKind::Publish, first_tx, None);
        pending.enqueue(AckKind::Publish, second_tx, None);

        pending.sent(AckKind::Publish, 7);
        pending.sent(AckKind::Publish, 8);
        pending.acknowledged(AckKind::Publish, 8, Ok(()));
        pending.acknowledged(
            AckKind::Publish,
            7,
            Err(TransportError::Rejected("quota".into())),
        );

        assert_eq!(first.wait().await, Err(TransportError::Rejected("quota".into())));
        assert_eq!(second.wait().await, Ok(()));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_qos0_publish_completes_when_written() {
        let mut pending = PendingAcks::default();
        let (tx, token) = AckToken::channel();
        pending.enqueue(AckKind::Publish, tx, None);
        pending.sent(AckKind::Publish, 0);
        assert_eq!(token.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn test_kinds_do_not_share_packet_ids() {
        let mut pending = PendingAcks::default();
        let (pub_tx, publish) = AckToken::channel();
        let (sub_tx, subscribe) = AckToken::channel();
        pending.enqueue(AckKind::Publish, pub_tx, None);
        pending.enqueue(AckKind::Subscribe, sub_tx, Some("/devices/a/config".into()));
        pending.sent(AckKind::Subscribe, 1);
        pending.sent(AckKind::Publish, 1);

        let refused = pending.acknowledged(
            AckKind::Subscribe,
            1,
            Err(TransportError::Rejected("denied".into())),
        );
        assert_eq!(refused.as_deref(), Some("/devices/a/config"));
        assert!(subscribe.wait().await.is_err());

        pending.acknowledged(AckKind::Publish, 1, Ok(()));
        assert_eq!(publish.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn test_fail_all_resolves_every_waiter() {
        let mut pending = PendingAcks::default();
        let (queued_tx, queued) = AckToken::channel();
        let (inflight_tx, inflight) = AckToken::channel();
        pending.enqueue(AckKind::Unsubscribe, inflight_tx, None);
        pending.sent(AckKind::Unsubscribe, 3);
        pending.enqueue(AckKind::Unsubscribe, queued_tx, None);

        pending.fail_all(TransportError::ConnectionClosed);

        assert_eq!(queued.wait().await, Err(TransportError::ConnectionClosed));
        assert_eq!(inflight.wait().await, Err(TransportError::ConnectionClosed));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_suback_failure_is_rejection() {
        assert!(suback_result(&[SubscribeReasonCode::Success(rumqttc::QoS::AtLeastOnce)]).is_ok());
        assert!(matches!(
            suback_result(&[SubscribeReasonCode::Failure]),
            Err(TransportError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_requests_need_a_connection() {
        let transport = MqttTransport::new(&MqttConfig::default());
        let result = transport
            .publish("/devices/a/events", QoS::AtLeastOnce, false, Bytes::new())
            .await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }
}
