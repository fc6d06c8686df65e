//! Daemon configuration file
//!
//! `brickd.toml` describes the gateway identity, where its signing key and
//! broker trust anchors live on disk, session tuning, the transport to use,
//! the HTTP ingress listener and the devices to attach at startup.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use brickd_gateway::{
    BrokerConfig, GatewayConfig, GatewayIdentity, SessionConfig, SigningAlgorithm,
    TransportConfig,
};
use serde::Deserialize;

/// Locations tried when no config path is given on the command line
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["/etc/brickd/brickd.toml", "./brickd.toml"];

/// Top-level `brickd.toml`
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    pub gateway: GatewaySection,
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub ingress: IngressConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Directory relative key and CA paths are resolved against
    #[serde(skip)]
    base_dir: PathBuf,
}

/// `[gateway]`: registry coordinates, signing key and startup devices
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_project")]
    pub project: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub registry: String,
    pub gateway_id: String,
    pub private_key_path: PathBuf,
    #[serde(default)]
    pub algorithm: SigningAlgorithm,
    /// Devices attached and watched once the session is up
    #[serde(default)]
    pub devices: Vec<String>,
}

fn default_project() -> String {
    "brickd".to_string()
}

fn default_region() -> String {
    "europe-west1".to_string()
}

/// `[broker]`: endpoint plus an optional trust anchor file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerSection {
    #[serde(flatten)]
    pub endpoint: BrokerConfig,
    #[serde(default)]
    pub root_ca_path: Option<PathBuf>,
}

/// `[ingress]`: local HTTP push endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct IngressConfig {
    #[serde(default = "default_ingress_enabled")]
    pub enabled: bool,
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_ingress_enabled() -> bool {
    true
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            enabled: default_ingress_enabled(),
            listen: default_listen(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// `[log]`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl DaemonConfig {
    /// Read and parse a config file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut config: DaemonConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(config)
    }

    /// Use the explicit path if given, otherwise the first default location
    /// that exists
    pub fn locate(explicit: Option<&str>) -> anyhow::Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(PathBuf::from(path));
        }
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.is_file())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "No config file given and none found at {}",
                    DEFAULT_CONFIG_PATHS.join(" or ")
                )
            })
    }

    /// Build the session configuration, reading the key and CA files
    pub fn gateway_config(&self) -> anyhow::Result<GatewayConfig> {
        let gateway = &self.gateway;
        let identity = GatewayIdentity::new(
            gateway.project.clone(),
            gateway.region.clone(),
            gateway.registry.clone(),
            gateway.gateway_id.clone(),
        );

        let key_path = self.resolve(&gateway.private_key_path);
        let private_key_pem = std::fs::read_to_string(&key_path)
            .with_context(|| format!("Failed to read private key {}", key_path.display()))?;

        let mut broker = self.broker.endpoint.clone();
        if let Some(ref ca) = self.broker.root_ca_path {
            let ca_path = self.resolve(ca);
            let pem = std::fs::read_to_string(&ca_path)
                .with_context(|| format!("Failed to read root CA {}", ca_path.display()))?;
            broker.root_ca_pem = Some(pem);
        }

        let mut config = GatewayConfig::new(identity, private_key_pem);
        config.algorithm = gateway.algorithm;
        config.broker = broker;
        config.session = self.session.clone();
        Ok(config)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}
