//! Fieldgate Modbus connector.
//!
//! Polls Modbus devices (TCP or RTU/serial), publishes converted
//! telemetry and attributes to Zenoh, and executes platform-initiated
//! RPC requests and attribute updates.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use fieldgate_common::LoggingConfig;
use fieldgate_modbus::config::ModbusConnectorConfig;
use fieldgate_modbus::connector::ModbusConnector;
use fieldgate_modbus::converter::ConverterRegistry;
use fieldgate_modbus::device::DeviceRegistry;
use fieldgate_modbus::platform::{ZenohGateway, run_command_listener};
use fieldgate_modbus::transport::ModbusClient;

/// Fieldgate connector for Modbus devices (TCP/RTU).
#[derive(Parser, Debug)]
#[command(name = "fieldgate-modbus")]
#[command(about = "Polls Modbus devices and bridges them to Zenoh")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "modbus.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = ModbusConnectorConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    let log_config = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        format: config.logging.format,
    };
    fieldgate_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting fieldgate-modbus");
    info!("Loaded configuration from {:?}", args.config);

    // Connect to Zenoh
    info!("Connecting to Zenoh...");
    let session = fieldgate_common::connect(&config.zenoh)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to Zenoh: {}", e))?;
    info!("Connected to Zenoh");

    let format = config.serialization;

    // Assemble the connector
    let converters = ConverterRegistry::default();
    let registry = DeviceRegistry::from_config(&config.modbus.devices, &converters)
        .map_err(|e| anyhow::anyhow!("Failed to build device registry: {}", e))?;
    let transport = ModbusClient::new(
        config.modbus.transport.clone(),
        Duration::from_millis(config.modbus.timeout_ms),
    );
    let gateway = Arc::new(ZenohGateway::new(
        session.clone(),
        config.modbus.key_prefix.clone(),
        format,
    ));

    let connector = Arc::new(ModbusConnector::new(
        &config.modbus,
        registry,
        Box::new(transport),
        gateway.clone(),
    ));

    connector
        .register_devices()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to register devices: {}", e))?;

    connector.open().await;

    // Listen for inbound commands
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = tokio::spawn(run_command_listener(
        session.clone(),
        config.modbus.key_prefix.clone(),
        connector.clone(),
        shutdown_rx,
    ));

    info!(
        "Modbus connector running with {} device(s)",
        config.modbus.devices.len()
    );

    // Publish connector status
    let status = serde_json::json!({
        "connector": config.modbus.name,
        "version": env!("CARGO_PKG_VERSION"),
        "devices": config.modbus.devices.iter().map(|d| &d.name).collect::<Vec<_>>(),
        "status": "running",
    });
    gateway.publish_status(&config.modbus.name, status).await;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    connector.close().await;

    let _ = shutdown_tx.send(true);
    match listener.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Command listener failed: {}", e),
        Err(e) => error!("Command listener ended abnormally: {}", e),
    }

    // Publish offline status
    let status = serde_json::json!({
        "connector": config.modbus.name,
        "status": "offline",
        "statistics": connector.statistics(),
    });
    gateway.publish_status(&config.modbus.name, status).await;

    session
        .close()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to close Zenoh session: {}", e))?;
    info!("Modbus connector stopped");

    Ok(())
}
