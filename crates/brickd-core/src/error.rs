//! Common error types for the gateway

use thiserror::Error;

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors that can occur while operating the gateway session
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Key material did not parse, or signing failed
    #[error("Credential error: {0}")]
    Credential(String),

    /// Broker unreachable, handshake rejected, or connection lost mid-flight
    #[error("Connection error: {0}")]
    Connection(String),

    /// The broker did not acknowledge an operation within its bound
    #[error("{operation} not acknowledged within {timeout_ms} ms")]
    AckTimeout { operation: String, timeout_ms: u64 },

    /// The broker explicitly refused a publish/subscribe/unsubscribe
    #[error("Broker rejected {operation}: {reason}")]
    BrokerRejection { operation: String, reason: String },

    /// Attaching a device failed; the binding keeps its prior state
    #[error("Attach of device '{device_id}' failed: {source}")]
    Attach {
        device_id: String,
        source: Box<GatewayError>,
    },

    /// Detaching a device failed; the binding keeps its prior state
    #[error("Detach of device '{device_id}' failed: {source}")]
    Detach {
        device_id: String,
        source: Box<GatewayError>,
    },

    /// Device-addressed traffic issued before the device was attached
    #[error("Device not attached: {0}")]
    NotAttached(String),

    /// Malformed configuration payload received from the broker
    #[error("Invalid device configuration: {0}")]
    ConfigParse(String),

    /// Identity component is empty or contains topic separators/wildcards
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// The session was disconnected and accepts no further operations
    #[error("Gateway session is closed")]
    SessionClosed,
}

impl GatewayError {
    /// Whether this error (or the attach/detach failure it wraps) is an
    /// acknowledgement timeout
    pub fn is_ack_timeout(&self) -> bool {
        match self {
            GatewayError::AckTimeout { .. } => true,
            GatewayError::Attach { source, .. } | GatewayError::Detach { source, .. } => {
                source.is_ack_timeout()
            }
            _ => false,
        }
    }

    /// Returns the HTTP status code used by the ingress adapter
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Credential(_) => 500,
            GatewayError::Connection(_) => 503,
            GatewayError::AckTimeout { .. } => 504,
            GatewayError::BrokerRejection { .. } => 502,
            GatewayError::Attach { source, .. } | GatewayError::Detach { source, .. } => {
                source.status_code()
            }
            GatewayError::NotAttached(_) => 409,
            GatewayError::ConfigParse(_) => 400,
            GatewayError::InvalidIdentity(_) => 400,
            GatewayError::SessionClosed => 503,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_wrapping_preserves_timeout_classification() {
        let err = GatewayError::Attach {
            device_id: "sensor-1".to_string(),
            source: Box::new(GatewayError::AckTimeout {
                operation: "publish /devices/sensor-1/attach".to_string(),
                timeout_ms: 5000,
            }),
        };

        assert!(err.is_ack_timeout());
        assert_eq!(err.status_code(), 504);
        assert!(err.to_string().contains("sensor-1"));
    }

    #[test]
    fn test_rejection_is_not_timeout() {
        let err = GatewayError::BrokerRejection {
            operation: "subscribe".to_string(),
            reason: "not authorized".to_string(),
        };
        assert!(!err.is_ack_timeout());
        assert_eq!(err.status_code(), 502);
    }
}
