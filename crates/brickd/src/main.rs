//! brickd - gateway daemon
//!
//! Holds one authenticated broker connection and relays traffic for the
//! devices listed in the config file.
//!
//! Usage:
//!   brickd [OPTIONS] [brickd.toml]
//!
//! Without a config path, `/etc/brickd/brickd.toml` and then
//! `./brickd.toml` are tried.

mod config;
mod ingress;

use std::sync::Arc;

use brickd_core::DeviceConfig;
use brickd_gateway::{create_transport, DeviceStream, GatewaySession};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::DaemonConfig;

/// Parsed command-line arguments
struct Args {
    /// Daemon config file (TOML)
    config_path: Option<String>,
    /// Override `[log] json`
    json_logs: bool,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut result = Args {
        config_path: None,
        json_logs: false,
    };

    for arg in &args {
        match arg.as_str() {
            "--json" => result.json_logs = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            arg if !arg.starts_with('-') => {
                result.config_path = Some(arg.to_string());
            }
            _ => eprintln!("Unknown argument: {}", arg),
        }
    }

    result
}

fn print_help() {
    eprintln!(
        r#"brickd - gateway daemon

Usage: brickd [OPTIONS] [brickd.toml]

Options:
      --json   Log as JSON lines (same as [log] json = true)
  -h, --help   Print this help message

The config path defaults to /etc/brickd/brickd.toml, then ./brickd.toml.
Set RUST_LOG to override the log filter.

Examples:
  # Run with the system config
  brickd

  # Run against the in-memory broker
  brickd demo.toml   # with [transport] type = "mock"
"#
    );
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "brickd=info,brickd_gateway=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args();

    // Config is read before logging is up so `[log] json` can take effect
    let config_path = DaemonConfig::locate(args.config_path.as_deref())?;
    let config = DaemonConfig::load(&config_path)?;
    init_tracing(args.json_logs || config.log.json);

    tracing::info!(config = %config_path.display(), "Starting brickd");

    let gateway_config = config.gateway_config()?;
    let transport = create_transport(&config.transport)?;
    let session = Arc::new(GatewaySession::new(gateway_config, transport)?);
    session.connect().await?;

    let cancel = CancellationToken::new();

    match session.watch_gateway_config(&cancel).await {
        Ok(stream) => {
            tokio::spawn(log_config_updates(stream));
        }
        Err(e) => tracing::warn!(error = %e, "Could not watch gateway config"),
    }

    for device_id in &config.gateway.devices {
        if let Err(e) = start_device(&session, &cancel, device_id).await {
            // One failing device never takes the gateway down
            tracing::error!(device_id = %device_id, error = %e, "Device startup failed");
        }
    }

    let server = if config.ingress.enabled {
        let app = ingress::create_router(session.clone(), config.ingress.max_body_bytes);
        let listener = tokio::net::TcpListener::bind(config.ingress.listen).await?;
        tracing::info!("Ingress listening on http://{}", config.ingress.listen);
        let shutdown = cancel.clone();
        Some(tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "Ingress server failed");
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    cancel.cancel();
    let detached = session.registry().detach_all().await;
    tracing::info!(detached, "Devices detached");
    session.disconnect(config.session.disconnect_grace()).await;

    if let Some(server) = server {
        let _ = server.await;
    }

    Ok(())
}

/// Attach a device and relay its config and commands to the log
async fn start_device(
    session: &GatewaySession,
    cancel: &CancellationToken,
    device_id: &str,
) -> anyhow::Result<()> {
    session.attach(device_id).await?;
    let config = session.watch_config(cancel, device_id).await?;
    let commands = session.watch_commands(cancel, device_id).await?;
    tokio::spawn(log_config_updates(config));
    tokio::spawn(log_commands(commands));
    tracing::info!(device_id = %device_id, "Device ready");
    Ok(())
}

async fn log_config_updates(mut stream: DeviceStream) {
    let device_id = stream.device_id().to_string();
    while let Some(payload) = stream.next().await {
        match DeviceConfig::parse(&payload) {
            Ok(config) => {
                for component in &config.components {
                    tracing::info!(
                        device_id = %device_id,
                        component = %component.name,
                        version = %component.version,
                        source = %component.source,
                        "Config component"
                    );
                }
            }
            Err(e) => tracing::warn!(device_id = %device_id, error = %e, "Ignoring config"),
        }
    }
    tracing::debug!(device_id = %device_id, "Config stream ended");
}

async fn log_commands(mut stream: DeviceStream) {
    let device_id = stream.device_id().to_string();
    while let Some(payload) = stream.next().await {
        tracing::info!(device_id = %device_id, bytes = payload.len(), "Command received");
    }
    tracing::debug!(device_id = %device_id, "Command stream ended");
}
