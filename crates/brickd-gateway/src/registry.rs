//! Device binding registry
//!
//! Tracks which devices are attached to the gateway connection and
//! addresses all device traffic. A device is attached by publishing an empty
//! JSON object to its `attach` topic; the binding only changes state once the
//! broker acknowledges, so a failed attach or detach leaves it untouched.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use brickd_core::{address, validate_device_id, GatewayError, GatewayResult, MessageClass};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ack;
use crate::config::SessionConfig;
use crate::subscription::{DeviceStream, FanoutManager};
use crate::transport::TransportAdapter;

/// Payload of attach and detach requests
const EMPTY_JSON: &[u8] = b"{}";

/// Attachment state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachmentState {
    #[default]
    Detached,
    Attached,
}

/// Snapshot of one device known to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBinding {
    pub device_id: String,
    pub state: AttachmentState,
    /// When the device was last attached
    pub attached_at: Option<DateTime<Utc>>,
}

impl DeviceBinding {
    fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            state: AttachmentState::Detached,
            attached_at: None,
        }
    }
}

/// Attachment bookkeeping and device-addressed traffic for one gateway
pub struct DeviceRegistry {
    transport: Arc<dyn TransportAdapter>,
    gateway_id: String,
    ack_timeout: Duration,
    enforce_attachment: bool,
    bindings: RwLock<HashMap<String, DeviceBinding>>,
    fanout: FanoutManager,
}

impl DeviceRegistry {
    pub fn new(
        transport: Arc<dyn TransportAdapter>,
        gateway_id: impl Into<String>,
        config: &SessionConfig,
    ) -> Self {
        let fanout =
            FanoutManager::new(transport.clone(), config.buffer_size, config.ack_timeout());
        Self {
            transport,
            gateway_id: gateway_id.into(),
            ack_timeout: config.ack_timeout(),
            enforce_attachment: config.enforce_attachment,
            bindings: RwLock::new(HashMap::new()),
            fanout,
        }
    }

    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    // =========================================================================
    // Attachment
    // =========================================================================

    /// Attach `device_id` to the gateway connection
    pub async fn attach(&self, device_id: &str) -> GatewayResult<()> {
        validate_device_id(device_id)?;

        let topic = address(device_id, MessageClass::Attach);
        self.send(&topic, MessageClass::Attach, Bytes::from_static(EMPTY_JSON))
            .await
            .map_err(|source| GatewayError::Attach {
                device_id: device_id.to_string(),
                source: Box::new(source),
            })?;

        {
            let mut bindings = self.bindings.write();
            let binding = bindings
                .entry(device_id.to_string())
                .or_insert_with(|| DeviceBinding::new(device_id));
            binding.state = AttachmentState::Attached;
            binding.attached_at = Some(Utc::now());
        }

        info!(%device_id, "Device attached");
        Ok(())
    }

    /// Detach `device_id` and cancel all of its subscriptions
    pub async fn detach(&self, device_id: &str) -> GatewayResult<()> {
        validate_device_id(device_id)?;

        let topic = address(device_id, MessageClass::Detach);
        self.send(&topic, MessageClass::Detach, Bytes::from_static(EMPTY_JSON))
            .await
            .map_err(|source| GatewayError::Detach {
                device_id: device_id.to_string(),
                source: Box::new(source),
            })?;

        {
            let mut bindings = self.bindings.write();
            let binding = bindings
                .entry(device_id.to_string())
                .or_insert_with(|| DeviceBinding::new(device_id));
            binding.state = AttachmentState::Detached;
        }
        self.fanout.cancel_device(device_id).await;

        info!(%device_id, "Device detached");
        Ok(())
    }

    /// Detach every attached device, logging failures. Returns the number
    /// of devices detached.
    pub async fn detach_all(&self) -> usize {
        let mut detached = 0;
        for device_id in self.attached_devices() {
            match self.detach(&device_id).await {
                Ok(()) => detached += 1,
                Err(e) => warn!(%device_id, error = %e, "Detach failed"),
            }
        }
        detached
    }

    /// Re-announce attachments and re-issue live subscriptions after a
    /// reconnect. Binding state does not change; failures are logged.
    pub async fn restore(&self) {
        let devices = self.attached_devices();
        for device_id in &devices {
            let topic = address(device_id, MessageClass::Attach);
            if let Err(e) = self
                .send(&topic, MessageClass::Attach, Bytes::from_static(EMPTY_JSON))
                .await
            {
                warn!(%device_id, error = %e, "Failed to re-attach device");
            }
        }

        let failed = self.fanout.restore().await;
        info!(
            devices = devices.len(),
            subscriptions = self.fanout.total_subscriptions(),
            failed,
            "Attachments restored"
        );
    }

    // =========================================================================
    // Outbound traffic
    // =========================================================================

    /// Publish telemetry on behalf of `device_id`
    pub async fn publish(&self, device_id: &str, payload: Bytes) -> GatewayResult<()> {
        self.device_send(device_id, MessageClass::Events, payload).await
    }

    /// Publish telemetry from the gateway itself
    pub async fn publish_as_gateway(&self, payload: Bytes) -> GatewayResult<()> {
        self.device_send(&self.gateway_id, MessageClass::Events, payload)
            .await
    }

    /// Report state on behalf of `device_id`
    pub async fn set_state(&self, device_id: &str, payload: Bytes) -> GatewayResult<()> {
        self.device_send(device_id, MessageClass::State, payload).await
    }

    /// Report the gateway's own state
    pub async fn set_state_as_gateway(&self, payload: Bytes) -> GatewayResult<()> {
        self.device_send(&self.gateway_id, MessageClass::State, payload)
            .await
    }

    // =========================================================================
    // Inbound traffic
    // =========================================================================

    /// Watch configuration updates for `device_id`
    pub async fn watch_config(
        &self,
        cancel: &CancellationToken,
        device_id: &str,
    ) -> GatewayResult<DeviceStream> {
        self.watch(cancel, device_id, MessageClass::Config).await
    }

    /// Watch commands (every sub-topic) for `device_id`
    pub async fn watch_commands(
        &self,
        cancel: &CancellationToken,
        device_id: &str,
    ) -> GatewayResult<DeviceStream> {
        self.watch(cancel, device_id, MessageClass::Commands).await
    }

    pub async fn watch_gateway_config(
        &self,
        cancel: &CancellationToken,
    ) -> GatewayResult<DeviceStream> {
        let gateway_id = self.gateway_id.clone();
        self.watch(cancel, &gateway_id, MessageClass::Config).await
    }

    pub async fn watch_gateway_commands(
        &self,
        cancel: &CancellationToken,
    ) -> GatewayResult<DeviceStream> {
        let gateway_id = self.gateway_id.clone();
        self.watch(cancel, &gateway_id, MessageClass::Commands).await
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn state_of(&self, device_id: &str) -> AttachmentState {
        self.bindings
            .read()
            .get(device_id)
            .map(|b| b.state)
            .unwrap_or_default()
    }

    pub fn binding(&self, device_id: &str) -> Option<DeviceBinding> {
        self.bindings.read().get(device_id).cloned()
    }

    /// Attached devices, sorted by id
    pub fn attached_devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self
            .bindings
            .read()
            .values()
            .filter(|b| b.state == AttachmentState::Attached)
            .map(|b| b.device_id.clone())
            .collect();
        devices.sort();
        devices
    }

    /// Whether a fresh connection has attachments or watches to restore
    pub(crate) fn has_live_state(&self) -> bool {
        self.fanout.total_subscriptions() > 0
            || self
                .bindings
                .read()
                .values()
                .any(|b| b.state == AttachmentState::Attached)
    }

    pub fn subscription_count(&self, device_id: &str) -> usize {
        self.fanout.subscription_count(device_id)
    }

    pub fn total_subscriptions(&self) -> usize {
        self.fanout.total_subscriptions()
    }

    /// End every stream without contacting the broker
    pub(crate) fn close_all_streams(&self) {
        self.fanout.close_all();
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn is_gateway(&self, device_id: &str) -> bool {
        device_id == self.gateway_id
    }

    fn ensure_attached(&self, device_id: &str) -> GatewayResult<()> {
        if !self.enforce_attachment || self.is_gateway(device_id) {
            return Ok(());
        }
        match self.state_of(device_id) {
            AttachmentState::Attached => Ok(()),
            AttachmentState::Detached => Err(GatewayError::NotAttached(device_id.to_string())),
        }
    }

    async fn device_send(
        &self,
        device_id: &str,
        class: MessageClass,
        payload: Bytes,
    ) -> GatewayResult<()> {
        validate_device_id(device_id)?;
        self.ensure_attached(device_id)?;
        let topic = address(device_id, class);
        self.send(&topic, class, payload).await
    }

    async fn watch(
        &self,
        cancel: &CancellationToken,
        device_id: &str,
        class: MessageClass,
    ) -> GatewayResult<DeviceStream> {
        validate_device_id(device_id)?;
        self.ensure_attached(device_id)?;
        self.fanout.watch(cancel, device_id, class).await
    }

    /// Publish and wait for the broker's acknowledgement
    async fn send(&self, topic: &str, class: MessageClass, payload: Bytes) -> GatewayResult<()> {
        debug!(%topic, len = payload.len(), "Publishing");
        let token = self
            .transport
            .publish(topic, class.qos(), false, payload)
            .await
            .map_err(GatewayError::from)?;
        ack::wait(token, self.ack_timeout, &format!("publish {}", topic)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::transport::mock::{AckMode, MockTransportAdapter};
    use crate::transport::ConnectOptions;
    use brickd_core::QoS;
    use pretty_assertions::assert_eq;

    async fn setup(config: SessionConfig) -> (Arc<MockTransportAdapter>, DeviceRegistry) {
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
        let registry = DeviceRegistry::new(mock.clone(), "gw-1", &config);
        (mock, registry)
    }

    fn short_acks() -> SessionConfig {
        SessionConfig {
            ack_timeout_ms: 50,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_attach_publishes_empty_object() {
        let (mock, registry) = setup(SessionConfig::default()).await;

        registry.attach("sensor-1").await.unwrap();

        let sent = mock.published_to("/devices/sensor-1/attach");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, Bytes::from_static(b"{}"));
        assert_eq!(sent[0].qos, QoS::AtLeastOnce);
        assert!(!sent[0].retain);
        assert_eq!(registry.state_of("sensor-1"), AttachmentState::Attached);
        assert!(registry.binding("sensor-1").unwrap().attached_at.is_some());
    }

    #[tokio::test]
    async fn test_attach_timeout_keeps_prior_state() {
        let (mock, registry) = setup(short_acks()).await;
        mock.set_topic_ack_mode("/devices/sensor-1/attach", AckMode::Never);

        let err = registry.attach("sensor-1").await.unwrap_err();

        assert!(err.is_ack_timeout());
        assert!(matches!(err, GatewayError::Attach { .. }));
        assert_eq!(registry.state_of("sensor-1"), AttachmentState::Detached);
        assert!(registry.binding("sensor-1").is_none());
    }

    #[tokio::test]
    async fn test_attach_rejection_is_distinct_from_timeout() {
        let (mock, registry) = setup(short_acks()).await;
        mock.set_topic_ack_mode(
            "/devices/sensor-1/attach",
            AckMode::Reject("unknown device".into()),
        );

        match registry.attach("sensor-1").await.unwrap_err() {
            GatewayError::Attach { device_id, source } => {
                assert_eq!(device_id, "sensor-1");
                assert!(matches!(*source, GatewayError::BrokerRejection { .. }));
            }
            other => panic!("Expected attach error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_detach_failure_keeps_device_attached() {
        let (mock, registry) = setup(short_acks()).await;
        registry.attach("sensor-1").await.unwrap();
        mock.set_topic_ack_mode("/devices/sensor-1/detach", AckMode::Never);

        let err = registry.detach("sensor-1").await.unwrap_err();

        assert!(matches!(err, GatewayError::Detach { .. }));
        assert_eq!(registry.state_of("sensor-1"), AttachmentState::Attached);
    }

    #[tokio::test]
    async fn test_unattached_device_fails_fast() {
        let (mock, registry) = setup(SessionConfig::default()).await;

        let err = registry
            .publish("sensor-1", Bytes::from("21.5"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotAttached(ref id) if id == "sensor-1"));

        let err = registry
            .watch_config(&CancellationToken::new(), "sensor-1")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotAttached(_)));
        assert!(mock.published().is_empty());
        assert!(mock.subscribe_requests().is_empty());
    }

    #[tokio::test]
    async fn test_gateway_traffic_needs_no_attachment() {
        let (mock, registry) = setup(SessionConfig::default()).await;

        registry.publish_as_gateway(Bytes::from("up")).await.unwrap();
        registry.set_state_as_gateway(Bytes::from("ok")).await.unwrap();
        registry
            .publish("gw-1", Bytes::from("direct"))
            .await
            .unwrap();

        assert_eq!(mock.published_to("/devices/gw-1/events").len(), 2);
        assert_eq!(mock.published_to("/devices/gw-1/state").len(), 1);
    }

    #[tokio::test]
    async fn test_opportunistic_mode_skips_attachment_check() {
        let config = SessionConfig {
            enforce_attachment: false,
            ..Default::default()
        };
        let (mock, registry) = setup(config).await;

        registry
            .set_state("sensor-9", Bytes::from("{}"))
            .await
            .unwrap();
        assert_eq!(mock.published_to("/devices/sensor-9/state").len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_device_id_rejected() {
        let (_mock, registry) = setup(SessionConfig::default()).await;
        assert!(matches!(
            registry.attach("a/b").await,
            Err(GatewayError::InvalidIdentity(_))
        ));
        assert!(matches!(
            registry.attach("").await,
            Err(GatewayError::InvalidIdentity(_))
        ));
    }

    #[tokio::test]
    async fn test_detach_cancels_subscriptions() {
        let (mock, registry) = setup(SessionConfig::default()).await;
        registry.attach("sensor-1").await.unwrap();
        let cancel = CancellationToken::new();
        let _config = registry.watch_config(&cancel, "sensor-1").await.unwrap();
        let _commands = registry.watch_commands(&cancel, "sensor-1").await.unwrap();
        assert_eq!(registry.subscription_count("sensor-1"), 2);

        registry.detach("sensor-1").await.unwrap();

        assert_eq!(registry.subscription_count("sensor-1"), 0);
        let mut unsubscribed = mock.unsubscribe_requests();
        unsubscribed.sort();
        assert_eq!(
            unsubscribed,
            vec![
                "/devices/sensor-1/commands/#".to_string(),
                "/devices/sensor-1/config".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_detach_all() {
        let (_mock, registry) = setup(SessionConfig::default()).await;
        registry.attach("a").await.unwrap();
        registry.attach("b").await.unwrap();

        assert_eq!(registry.detach_all().await, 2);
        assert!(registry.attached_devices().is_empty());
    }
}
