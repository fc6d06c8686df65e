//! Gateway identity

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Coordinates of the gateway inside the cloud device registry
///
/// Immutable once a session has been built from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayIdentity {
    pub project: String,
    pub region: String,
    pub registry: String,
    pub gateway_id: String,
}

impl GatewayIdentity {
    pub fn new(
        project: impl Into<String>,
        region: impl Into<String>,
        registry: impl Into<String>,
        gateway_id: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            region: region.into(),
            registry: registry.into(),
            gateway_id: gateway_id.into(),
        }
    }

    /// MQTT client identifier the broker expects for this gateway
    ///
    /// ```
    /// # use brickd_core::GatewayIdentity;
    /// let id = GatewayIdentity::new("p", "europe-west1", "reg", "gw");
    /// assert_eq!(
    ///     id.client_id(),
    ///     "projects/p/locations/europe-west1/registries/reg/devices/gw"
    /// );
    /// ```
    pub fn client_id(&self) -> String {
        format!(
            "projects/{}/locations/{}/registries/{}/devices/{}",
            self.project, self.region, self.registry, self.gateway_id
        )
    }

    /// Reject empty components and components that would corrupt topics
    pub fn validate(&self) -> GatewayResult<()> {
        for (field, value) in [
            ("project", &self.project),
            ("region", &self.region),
            ("registry", &self.registry),
        ] {
            if value.is_empty() {
                return Err(GatewayError::InvalidIdentity(format!("{} is empty", field)));
            }
        }
        validate_device_id(&self.gateway_id)
    }
}

/// Device ids become a single topic level, so they may not be empty or
/// contain level separators or wildcards.
pub fn validate_device_id(device_id: &str) -> GatewayResult<()> {
    if device_id.is_empty() {
        return Err(GatewayError::InvalidIdentity(
            "device id is empty".to_string(),
        ));
    }
    if device_id.contains(['/', '+', '#']) {
        return Err(GatewayError::InvalidIdentity(format!(
            "device id '{}' contains a topic separator or wildcard",
            device_id
        )));
    }
    Ok(())
}
