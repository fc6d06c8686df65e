//! Gateway session configuration
//!
//! This module contains configuration types for the gateway session,
//! including broker endpoint, transport selection, timing and backpressure
//! settings. Everything is constructed once and handed to the session;
//! nothing here is read from global state.

use std::time::Duration;

use brickd_core::credential::DEFAULT_TOKEN_VALIDITY;
use brickd_core::{CredentialIssuer, GatewayIdentity, SigningAlgorithm};
use serde::{Deserialize, Serialize};

/// Complete configuration of one gateway session
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Gateway coordinates in the device registry
    pub identity: GatewayIdentity,
    /// Private key (PEM contents) used to sign broker credentials
    pub private_key_pem: String,
    /// Algorithm matching the private key
    pub algorithm: SigningAlgorithm,
    /// Broker endpoint and TLS trust anchors
    pub broker: BrokerConfig,
    /// Session timing and policy
    pub session: SessionConfig,
}

impl GatewayConfig {
    pub fn new(identity: GatewayIdentity, private_key_pem: impl Into<String>) -> Self {
        Self {
            identity,
            private_key_pem: private_key_pem.into(),
            algorithm: SigningAlgorithm::default(),
            broker: BrokerConfig::default(),
            session: SessionConfig::default(),
        }
    }

    pub fn credential_issuer(&self) -> CredentialIssuer {
        CredentialIssuer::new(self.algorithm, self.session.token_validity())
    }
}

// =============================================================================
// Broker Configuration
// =============================================================================

/// Broker endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Trust anchors (PEM contents) for verifying the broker certificate
    #[serde(skip)]
    pub root_ca_pem: Option<String>,
    /// MQTT keep-alive in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// How long to wait for CONNACK
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_host() -> String {
    "mqtt.googleapis.com".to_string()
}

fn default_port() -> u16 {
    8883
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            root_ca_pem: None,
            keep_alive_secs: default_keep_alive(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

// =============================================================================
// Session Configuration
// =============================================================================

/// Timing, backpressure and attachment policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Bound on every acknowledgement wait
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,
    /// Bound on handing a request to the connection
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
    /// Messages buffered per subscription before it is dropped
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Grace period for in-flight acknowledgements on disconnect
    #[serde(default = "default_disconnect_grace")]
    pub disconnect_grace_ms: u64,
    /// Credential validity window
    #[serde(default = "default_token_validity")]
    pub token_validity_secs: u64,
    /// Fraction of the validity window after which the credential is renewed
    #[serde(default = "default_renew_fraction")]
    pub renew_fraction: f64,
    /// Refuse device traffic for devices that are not attached
    #[serde(default = "default_true")]
    pub enforce_attachment: bool,
    /// Reconnection backoff
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_ack_timeout() -> u64 {
    5000
}

fn default_write_timeout() -> u64 {
    3000
}

fn default_buffer_size() -> usize {
    16
}

fn default_disconnect_grace() -> u64 {
    250
}

fn default_token_validity() -> u64 {
    DEFAULT_TOKEN_VALIDITY.as_secs()
}

fn default_renew_fraction() -> f64 {
    0.9
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout(),
            write_timeout_ms: default_write_timeout(),
            buffer_size: default_buffer_size(),
            disconnect_grace_ms: default_disconnect_grace(),
            token_validity_secs: default_token_validity(),
            renew_fraction: default_renew_fraction(),
            enforce_attachment: default_true(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn token_validity(&self) -> Duration {
        Duration::from_secs(self.token_validity_secs)
    }
}

/// Exponential backoff between reconnection attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Give up after this many attempts (0 = never give up)
    #[serde(default)]
    pub max_attempts: u32,
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    60000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            max_attempts: 0,
        }
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// MQTT 3.1.1 over TLS
    Mqtt(MqttConfig),
    /// In-memory broker for testing
    Mock(MockConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Mqtt(MqttConfig::default())
    }
}

/// MQTT client tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Capacity of the request queue between callers and the I/O task
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
    /// Largest packet accepted or sent, in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

fn default_request_capacity() -> usize {
    64
}

fn default_max_packet_size() -> usize {
    256 * 1024
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            request_capacity: default_request_capacity(),
            max_packet_size: default_max_packet_size(),
        }
    }
}

/// Mock transport configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Simulated latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
}
