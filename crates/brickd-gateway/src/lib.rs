//! brickd-gateway - Gateway multiplexing session
//!
//! A gateway holds one authenticated broker connection and relays traffic
//! for devices that have no network presence of their own. Devices are
//! attached and detached at runtime; everything they send or receive is
//! addressed to their own topics but travels over the gateway's connection.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      GatewaySession                         │
//! │  credential lifecycle, reconnect supervisor, renewal timer  │
//! │                                                             │
//! │  ┌─────────────────────┐        ┌────────────────────────┐  │
//! │  │   DeviceRegistry    │───────▶│    FanoutManager       │  │
//! │  │ (attach / detach /  │        │ (bounded per-device    │  │
//! │  │  addressed traffic) │        │  streams, reaper)      │  │
//! │  └──────────┬──────────┘        └───────────┬────────────┘  │
//! │             │         ack::wait             │               │
//! │             └───────────────┬───────────────┘               │
//! │                    ┌────────┴────────┐                      │
//! │                    │TransportAdapter │                      │
//! │                    │ (MQTT / Mock)   │                      │
//! │                    └─────────────────┘                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod ack;
pub mod config;
pub mod registry;
pub mod session;
pub mod subscription;
pub mod transport;

pub use config::{
    BrokerConfig, GatewayConfig, MockConfig, MqttConfig, ReconnectConfig, SessionConfig,
    TransportConfig,
};
pub use registry::{AttachmentState, DeviceBinding, DeviceRegistry};
pub use session::{ConnectionState, ExponentialBackoff, GatewaySession, RetryPolicy};
pub use subscription::{DeviceStream, FanoutManager};
pub use transport::{create_transport, TransportAdapter, TransportError};

// Re-export for convenience
pub use brickd_core::{
    address, Credential, CredentialIssuer, DeviceConfig, GatewayError, GatewayIdentity,
    GatewayResult, MessageClass, QoS, SigningAlgorithm,
};
