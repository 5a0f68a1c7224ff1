use singularity_link::{
    ConnectionEvent, ConnectionManager, ConnectionTarget, DeviceSignature, ManagerConfig,
    TransportKind,
};
use std::env;
use tokio::io::{AsyncBufReadExt, BufReader};

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Build the manager configuration from `SINGULARITY_*` variables
fn config_from_env() -> ManagerConfig {
    let transport = match env::var("SINGULARITY_TRANSPORT").as_deref() {
        Ok("bluetooth") | Ok("bt") => TransportKind::Bluetooth,
        _ => TransportKind::Wifi,
    };

    let mut config = ManagerConfig {
        transport,
        ..Default::default()
    };

    if let Ok(host) = env::var("SINGULARITY_HOST") {
        config.wifi.host = host;
    }
    if let Some(port) = env::var("SINGULARITY_PORT").ok().and_then(|p| p.parse().ok()) {
        config.wifi.port = port;
    }
    if let Ok(addr) = env::var("SINGULARITY_SIM_ADDR") {
        config.bluetooth.tcp_address = addr;
    }
    if let Ok(mac) = env::var("SINGULARITY_MAC") {
        config.bluetooth.paired = vec![DeviceSignature::new("simulated", mac)];
    }

    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = config_from_env();
    info!("Singularity console starting: {}", config.transport);

    let manager = ConnectionManager::new(config.clone());
    let mut events = manager.subscribe();

    let target = match config.transport {
        TransportKind::Wifi => {
            info!("  WiFi peripheral: {}:{}", config.wifi.host, config.wifi.port);
            config.wifi.target()
        }
        TransportKind::Bluetooth => {
            let paired = manager.paired_devices().await?;
            for device in &paired {
                info!("  Paired: {}", device);
            }
            let wanted = env::var("SINGULARITY_MAC").ok();
            let device = paired
                .into_iter()
                .find(|d| wanted.as_deref().map_or(true, |mac| d.mac == mac))
                .ok_or_else(|| anyhow::anyhow!("No paired device to connect to"))?;
            ConnectionTarget::Bluetooth(device)
        }
    };

    manager.connect(target).await;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    // Main event loop
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ConnectionEvent::Connected { peer }) => {
                    info!("Connected to {}", peer);
                }
                Some(ConnectionEvent::MessageReceived(message)) => {
                    info!("<< {}", message);
                }
                Some(ConnectionEvent::Error(reason)) => {
                    warn!("Error: {}", reason);
                }
                None => {
                    error!("Event bus closed");
                    break;
                }
            },
            line = stdin.next_line() => match line {
                Ok(Some(line)) => {
                    manager.send(&line).await;
                }
                Ok(None) => {
                    info!("Input closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to read input: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}
