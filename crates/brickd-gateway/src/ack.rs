//! Bounded acknowledgement waiting
//!
//! Every publish, subscribe and unsubscribe the session issues is followed
//! by a wait on its [`AckToken`]. The wait has three distinct exits, and the
//! caller can always tell them apart:
//!
//! - the bound elapsed: [`GatewayError::AckTimeout`]
//! - the broker refused the request: [`GatewayError::BrokerRejection`]
//! - the connection went away first: [`GatewayError::Connection`]
//!
//! A timed-out request is never reported as success, even if the broker
//! acknowledges it afterwards.

use std::time::Duration;

use brickd_core::{GatewayError, GatewayResult};
use tracing::debug;

use crate::transport::{AckToken, TransportError};

/// Wait for `token` to resolve, for at most `bound`
pub async fn wait(token: AckToken, bound: Duration, operation: &str) -> GatewayResult<()> {
    match tokio::time::timeout(bound, token.wait()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(TransportError::Rejected(reason))) => Err(GatewayError::BrokerRejection {
            operation: operation.to_string(),
            reason,
        }),
        Ok(Err(e)) => Err(GatewayError::Connection(format!("{}: {}", operation, e))),
        Err(_) => {
            debug!(%operation, bound_ms = bound.as_millis() as u64, "Acknowledgement timed out");
            Err(GatewayError::AckTimeout {
                operation: operation.to_string(),
                timeout_ms: bound.as_millis() as u64,
            })
        }
    }
}
