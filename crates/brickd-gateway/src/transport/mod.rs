//! Transport layer for broker communication
//!
//! This module provides transport adapters the gateway session drives:
//! - MQTT adapter over TLS (`mqtt` feature, enabled by default)
//! - Mock adapter: an in-memory broker for tests and dry runs
//!
//! # Example
//!
//! ```ignore
//! use brickd_gateway::transport::{create_transport, TransportAdapter};
//! use brickd_gateway::config::TransportConfig;
//!
//! let transport = create_transport(&TransportConfig::Mock(Default::default()))?;
//! transport.connect(&options).await?;
//! let ack = transport.publish("/devices/gw/events", QoS::AtLeastOnce, false, payload).await?;
//! ack.wait().await?;
//! ```

mod adapter;
pub mod error;
pub mod mock;

#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use adapter::{
    AckSender, AckToken, ConnectOptions, InboundMessage, MessageHandler, TransportAdapter,
    TransportEvent,
};
pub use error::TransportError;

use std::sync::Arc;

use crate::config::TransportConfig;

/// Create a transport adapter based on configuration
pub fn create_transport(
    config: &TransportConfig,
) -> Result<Arc<dyn TransportAdapter>, TransportError> {
    match config {
        #[cfg(feature = "mqtt")]
        TransportConfig::Mqtt(cfg) => Ok(Arc::new(mqtt::MqttTransport::new(cfg))),
        #[cfg(not(feature = "mqtt"))]
        TransportConfig::Mqtt(_) => Err(TransportError::Unsupported(
            "MQTT requires the 'mqtt' feature".to_string(),
        )),
        TransportConfig::Mock(cfg) => Ok(Arc::new(mock::MockTransportAdapter::new(cfg))),
    }
}
