//! Wiring the gateway together from a configuration file.

use anyhow::Context;
use orbit_gateway::{GatewayHandle, GatewayManager};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::OrbitdConfig;

/// Open every configured channel, register every system and start the
/// manager. The hub connection is opened last.
///
/// # Errors
///
/// Returns an error if a channel cannot be opened or a system cannot be
/// registered.
pub async fn start(config: &OrbitdConfig) -> anyhow::Result<(GatewayHandle, JoinHandle<()>)> {
    let mut manager = GatewayManager::new(config.gateway_config())?;

    for channel in &config.channels {
        manager
            .add_channel(*channel)
            .await
            .with_context(|| format!("failed to open {} channel", channel.kind()))?;
    }
    for system in &config.systems {
        manager
            .add_system(&system.name, system.channel, system.destination.as_deref())
            .with_context(|| format!("failed to add system {}", system.name))?;
    }

    manager.connect_to_hub()?;
    info!(
        host = %config.hub.host,
        channels = config.channels.len(),
        systems = config.systems.len(),
        "Gateway configured"
    );
    Ok(manager.start())
}

/// Run the gateway until Ctrl-C.
///
/// # Errors
///
/// Returns an error if startup fails or the manager task panics.
pub async fn run(config: OrbitdConfig) -> anyhow::Result<()> {
    let (handle, mut task) = start(&config).await?;

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("Shutdown requested");
            handle.shutdown()?;
            (&mut task).await.context("gateway manager panicked")?;
        }
        result = &mut task => {
            result.context("gateway manager panicked")?;
            warn!("Gateway manager exited");
        }
    }
    Ok(())
}
