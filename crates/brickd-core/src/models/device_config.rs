//! Device configuration document

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Configuration the cloud pushes on a device's `config` topic
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub components: Vec<Component>,
}

/// A component the device is expected to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub version: String,
    /// Where the component artifact can be fetched from
    pub source: String,
}

impl DeviceConfig {
    /// Parse a raw config payload
    pub fn parse(payload: &[u8]) -> GatewayResult<Self> {
        serde_json::from_slice(payload).map_err(|e| GatewayError::ConfigParse(e.to_string()))
    }

    /// Look up a component by name
    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name == name)
    }
}
