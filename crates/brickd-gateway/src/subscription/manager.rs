//! Fan-out manager for device subscriptions
//!
//! Owns every live broker subscription of the session. Delivery callbacks
//! run on the transport's I/O task and never await. A cancelled watch stops
//! receiving right away; unsubscribing from the broker after an overflow,
//! a cancellation or a dropped stream is handed to a reaper task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use brickd_core::{address, GatewayError, GatewayResult, MessageClass, QoS};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::stream::{Delivery, DeliverySlot, DeviceStream};
use crate::ack;
use crate::transport::{InboundMessage, MessageHandler, TransportAdapter};

type SubscriptionKey = (String, MessageClass);

struct ActiveSubscription {
    id: u64,
    filter: String,
    qos: QoS,
    slot: Arc<DeliverySlot>,
    handler: MessageHandler,
    watch: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
enum TeardownReason {
    Overflow,
    ConsumerGone,
    Cancelled,
}

#[derive(Debug)]
struct Teardown {
    key: SubscriptionKey,
    id: u64,
    reason: TeardownReason,
}

struct FanoutInner {
    transport: Arc<dyn TransportAdapter>,
    buffer_size: usize,
    ack_timeout: Duration,
    active: RwLock<HashMap<SubscriptionKey, ActiveSubscription>>,
    next_id: AtomicU64,
    teardown_tx: mpsc::UnboundedSender<Teardown>,
    /// Serializes broker subscribe/unsubscribe submissions against table
    /// updates, so a stale teardown never unsubscribes a newer watch
    ops: tokio::sync::Mutex<()>,
}

impl FanoutInner {
    fn delivery_handler(
        &self,
        key: SubscriptionKey,
        id: u64,
        slot: Arc<DeliverySlot>,
        watch: CancellationToken,
    ) -> MessageHandler {
        let teardown_tx = self.teardown_tx.clone();
        Arc::new(move |message: InboundMessage| {
            // The cancel waiter reports the teardown
            if watch.is_cancelled() {
                return;
            }
            let reason = match slot.deliver(message.payload) {
                Delivery::Delivered => {
                    trace!(device_id = %key.0, class = %key.1, topic = %message.topic, "Delivered");
                    return;
                }
                Delivery::Closed => return,
                Delivery::Overflow => {
                    warn!(
                        device_id = %key.0,
                        class = %key.1,
                        "Subscription buffer full, dropping subscription"
                    );
                    TeardownReason::Overflow
                }
                Delivery::ConsumerGone => TeardownReason::ConsumerGone,
            };
            let _ = teardown_tx.send(Teardown {
                key: key.clone(),
                id,
                reason,
            });
        })
    }

    /// Remove the subscription `id` under `key` if it is still the live one
    async fn remove(&self, key: &SubscriptionKey, id: u64, unsubscribe: bool) -> bool {
        let _ops = self.ops.lock().await;

        let removed = {
            let mut active = self.active.write();
            match active.get(key) {
                Some(sub) if sub.id == id => active.remove(key),
                _ => None,
            }
        };
        let Some(sub) = removed else {
            return false;
        };

        sub.slot.close();
        sub.watch.cancel();
        if unsubscribe {
            self.send_unsubscribe(&sub.filter).await;
        }
        true
    }

    async fn send_unsubscribe(&self, filter: &str) {
        match self.transport.unsubscribe(filter).await {
            Ok(token) => {
                let bound = self.ack_timeout;
                let operation = format!("unsubscribe {}", filter);
                tokio::spawn(async move {
                    if let Err(e) = ack::wait(token, bound, &operation).await {
                        debug!(error = %e, "Unsubscribe not acknowledged");
                    }
                });
            }
            Err(e) => debug!(%filter, error = %e, "Unsubscribe not sent"),
        }
    }
}

/// Manages the bounded per-subscription channels of one session
pub struct FanoutManager {
    inner: Arc<FanoutInner>,
    reaper: Option<JoinHandle<()>>,
}

impl FanoutManager {
    pub fn new(
        transport: Arc<dyn TransportAdapter>,
        buffer_size: usize,
        ack_timeout: Duration,
    ) -> Self {
        let (teardown_tx, teardown_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(FanoutInner {
            transport,
            buffer_size: buffer_size.max(1),
            ack_timeout,
            active: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            teardown_tx,
            ops: tokio::sync::Mutex::new(()),
        });

        let reaper = tokio::spawn(Self::run_reaper(inner.clone(), teardown_rx));

        Self {
            inner,
            reaper: Some(reaper),
        }
    }

    async fn run_reaper(
        inner: Arc<FanoutInner>,
        mut teardown_rx: mpsc::UnboundedReceiver<Teardown>,
    ) {
        while let Some(teardown) = teardown_rx.recv().await {
            if inner.remove(&teardown.key, teardown.id, true).await {
                info!(
                    device_id = %teardown.key.0,
                    class = %teardown.key.1,
                    reason = ?teardown.reason,
                    "Subscription closed"
                );
            }
        }
    }

    /// Subscribe to `class` traffic of `device_id` and return its stream.
    ///
    /// Succeeds once the broker acknowledges the subscription. A previous
    /// watch for the same device and class is superseded: its stream ends.
    pub async fn watch(
        &self,
        cancel: &CancellationToken,
        device_id: &str,
        class: MessageClass,
    ) -> GatewayResult<DeviceStream> {
        let inner = &self.inner;
        let key: SubscriptionKey = (device_id.to_string(), class);
        let filter = address(device_id, class);
        let qos = class.qos();
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = mpsc::channel(inner.buffer_size);
        let slot = Arc::new(DeliverySlot::new(tx));
        let watch = cancel.child_token();
        let handler = inner.delivery_handler(key.clone(), id, slot.clone(), watch.clone());

        let token = {
            let _ops = inner.ops.lock().await;
            let token = inner
                .transport
                .subscribe(&filter, qos, handler.clone())
                .await
                .map_err(GatewayError::from)?;

            let previous = inner.active.write().insert(
                key.clone(),
                ActiveSubscription {
                    id,
                    filter: filter.clone(),
                    qos,
                    slot,
                    handler,
                    watch: watch.clone(),
                },
            );
            if let Some(previous) = previous {
                previous.slot.close();
                previous.watch.cancel();
                debug!(%device_id, %class, "Previous watch superseded");
            }
            token
        };

        let teardown_tx = inner.teardown_tx.clone();
        let cancelled = watch.clone();
        let watched_key = key.clone();
        tokio::spawn(async move {
            cancelled.cancelled().await;
            let _ = teardown_tx.send(Teardown {
                key: watched_key,
                id,
                reason: TeardownReason::Cancelled,
            });
        });

        let operation = format!("subscribe {}", filter);
        if let Err(e) = ack::wait(token, inner.ack_timeout, &operation).await {
            // Only a timed-out request may have reached the broker
            inner.remove(&key, id, e.is_ack_timeout()).await;
            return Err(e);
        }

        info!(%device_id, %class, %filter, "Watching");
        Ok(DeviceStream::new(rx, watch, device_id.to_string(), class))
    }

    /// Cancel every subscription of `device_id` and unsubscribe from the broker
    pub async fn cancel_device(&self, device_id: &str) -> usize {
        let owned: Vec<(SubscriptionKey, u64)> = self
            .inner
            .active
            .read()
            .iter()
            .filter(|(key, _)| key.0 == device_id)
            .map(|(key, sub)| (key.clone(), sub.id))
            .collect();

        let mut cancelled = 0;
        for (key, id) in owned {
            if self.inner.remove(&key, id, true).await {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!(%device_id, cancelled, "Device subscriptions cancelled");
        }
        cancelled
    }

    /// End every stream without touching the broker
    pub fn close_all(&self) {
        let drained: Vec<ActiveSubscription> = self
            .inner
            .active
            .write()
            .drain()
            .map(|(_, sub)| sub)
            .collect();
        for sub in drained {
            sub.slot.close();
            sub.watch.cancel();
        }
    }

    /// Re-issue every live subscription on a fresh connection.
    ///
    /// Returns the number of subscriptions the broker did not accept again.
    pub async fn restore(&self) -> usize {
        let snapshot: Vec<(SubscriptionKey, u64, String, QoS, MessageHandler)> = self
            .inner
            .active
            .read()
            .iter()
            .filter(|(_, sub)| !sub.slot.is_closed())
            .map(|(key, sub)| {
                (
                    key.clone(),
                    sub.id,
                    sub.filter.clone(),
                    sub.qos,
                    sub.handler.clone(),
                )
            })
            .collect();

        let mut failures = 0;
        for (key, id, filter, qos, handler) in snapshot {
            let submitted = {
                let _ops = self.inner.ops.lock().await;
                let still_live = self
                    .inner
                    .active
                    .read()
                    .get(&key)
                    .map(|sub| sub.id == id)
                    .unwrap_or(false);
                if !still_live {
                    continue;
                }
                self.inner.transport.subscribe(&filter, qos, handler).await
            };

            let result = match submitted {
                Ok(token) => {
                    let operation = format!("subscribe {}", filter);
                    ack::wait(token, self.inner.ack_timeout, &operation).await
                }
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(()) => debug!(%filter, "Subscription restored"),
                Err(e) => {
                    failures += 1;
                    warn!(%filter, error = %e, "Failed to restore subscription");
                }
            }
        }
        failures
    }

    pub fn subscription_count(&self, device_id: &str) -> usize {
        self.inner
            .active
            .read()
            .keys()
            .filter(|key| key.0 == device_id)
            .count()
    }

    pub fn total_subscriptions(&self) -> usize {
        self.inner.active.read().len()
    }
}

impl Drop for FanoutManager {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper.take() {
            handle.abort();
        }
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::transport::mock::{AckMode, MockTransportAdapter};
    use crate::transport::ConnectOptions;
    use bytes::Bytes;
    use futures::StreamExt;

    async fn connected_mock() -> Arc<MockTransportAdapter> {
        let mock = Arc::new(MockTransportAdapter::new(&MockConfig::default()));
        mock.connect(&ConnectOptions {
            host: "localhost".into(),
            port: 1883,
            client_id: "gw".into(),
            username: "unused".into(),
            password: "token".into(),
            ca_pem: None,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
        })
        .await
        .unwrap();
        mock
    }

    async fn settle<F: Fn() -> bool>(condition: F) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_delivers_in_order() {
        let mock = connected_mock().await;
        let fanout = FanoutManager::new(mock.clone(), 4, Duration::from_secs(1));
        let cancel = CancellationToken::new();

        let mut stream = fanout
            .watch(&cancel, "sensor-1", MessageClass::Config)
            .await
            .unwrap();
        mock.inject("/devices/sensor-1/config", "v1");
        mock.inject("/devices/sensor-1/config", "v2");

        assert_eq!(stream.next().await, Some(Bytes::from("v1")));
        assert_eq!(stream.next().await, Some(Bytes::from("v2")));
    }

    #[tokio::test]
    async fn test_newer_watch_supersedes_older() {
        let mock = connected_mock().await;
        let fanout = FanoutManager::new(mock.clone(), 4, Duration::from_secs(1));
        let cancel = CancellationToken::new();

        let mut first = fanout
            .watch(&cancel, "sensor-1", MessageClass::Config)
            .await
            .unwrap();
        let mut second = fanout
            .watch(&cancel, "sensor-1", MessageClass::Config)
            .await
            .unwrap();

        assert_eq!(first.next().await, None);

        // The stale teardown of the first watch must not unsubscribe the second
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(mock.unsubscribe_requests().is_empty());
        assert_eq!(fanout.subscription_count("sensor-1"), 1);

        mock.inject("/devices/sensor-1/config", "v1");
        assert_eq!(second.next().await, Some(Bytes::from("v1")));
    }

    #[tokio::test]
    async fn test_rejected_subscription_leaves_nothing_behind() {
        let mock = connected_mock().await;
        mock.set_topic_ack_mode("/devices/sensor-1/config", AckMode::Reject("denied".into()));
        let fanout = FanoutManager::new(mock.clone(), 4, Duration::from_secs(1));

        let err = fanout
            .watch(&CancellationToken::new(), "sensor-1", MessageClass::Config)
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::BrokerRejection { .. }));
        assert_eq!(fanout.subscription_count("sensor-1"), 0);
        assert!(mock.unsubscribe_requests().is_empty());
    }

    #[tokio::test]
    async fn test_dropping_stream_unsubscribes() {
        let mock = connected_mock().await;
        let fanout = FanoutManager::new(mock.clone(), 4, Duration::from_secs(1));

        let stream = fanout
            .watch(&CancellationToken::new(), "sensor-1", MessageClass::Commands)
            .await
            .unwrap();
        drop(stream);

        settle(|| fanout.subscription_count("sensor-1") == 0).await;
        settle(|| mock.unsubscribe_requests() == vec!["/devices/sensor-1/commands/#"]).await;
    }

    #[tokio::test]
    async fn test_cancelled_watch_stops_receiving_at_once() {
        let mock = connected_mock().await;
        let fanout = FanoutManager::new(mock.clone(), 4, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let mut stream = fanout
            .watch(&cancel, "sensor-1", MessageClass::Config)
            .await
            .unwrap();

        mock.inject("/devices/sensor-1/config", "before");
        cancel.cancel();
        mock.inject("/devices/sensor-1/config", "after");

        assert_eq!(stream.next().await, Some(Bytes::from("before")));
        assert_eq!(stream.next().await, None);
        settle(|| mock.unsubscribe_requests() == vec!["/devices/sensor-1/config"]).await;
        assert_eq!(fanout.subscription_count("sensor-1"), 0);
    }

    #[tokio::test]
    async fn test_restore_resubscribes_live_watches() {
        let mock = connected_mock().await;
        let fanout = FanoutManager::new(mock.clone(), 4, Duration::from_secs(1));
        let mut stream = fanout
            .watch(&CancellationToken::new(), "sensor-1", MessageClass::Config)
            .await
            .unwrap();

        mock.simulate_connection_loss("test");
        mock.connect(&mock.last_connect_options().unwrap()).await.unwrap();
        assert!(mock.active_filters().is_empty());

        assert_eq!(fanout.restore().await, 0);
        mock.inject("/devices/sensor-1/config", "after");
        assert_eq!(stream.next().await, Some(Bytes::from("after")));
    }
}
