//! brickd-core - Core types for the brickd gateway
//!
//! A gateway holds a single authenticated broker connection and relays
//! traffic for a set of subordinate devices. This crate contains the pieces
//! that do not touch the network:
//!
//! - [`GatewayIdentity`]: project/region/registry/gateway coordinates
//! - [`topics`]: per-device topic addressing and wildcard matching
//! - [`credential`]: signed, time-bounded broker credentials
//! - [`DeviceConfig`]: the configuration document pushed to devices
//! - [`GatewayError`]: the error taxonomy shared by every layer

pub mod credential;
pub mod error;
pub mod identity;
pub mod models;
pub mod topics;

pub use credential::{Credential, CredentialIssuer, SigningAlgorithm, TokenClaims};
pub use error::{GatewayError, GatewayResult};
pub use identity::{validate_device_id, GatewayIdentity};
pub use models::*;
pub use topics::{address, topic_matches, MessageClass, QoS};
