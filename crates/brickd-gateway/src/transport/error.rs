//! Transport layer errors

use brickd_core::GatewayError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection refused by broker: {0}")]
    ConnectionRefused(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Rejected by broker: {0}")]
    Rejected(String),

    #[error("Transport not supported: {0}")]
    Unsupported(String),
}

impl From<TransportError> for GatewayError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Rejected(reason) => GatewayError::BrokerRejection {
                operation: "request".to_string(),
                reason,
            },
            other => GatewayError::Connection(other.to_string()),
        }
    }
}
