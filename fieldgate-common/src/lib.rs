//! Fieldgate Common Library
//!
//! This crate provides shared types and utilities for Fieldgate device
//! connectors:
//!
//! - [`data`] - Converted device data model (`DeviceData`, `DataEntry`, `DataValue`)
//! - [`gateway`] - The platform sink interface ([`PlatformGateway`])
//! - [`serialization`] - JSON/CBOR encoding and decoding
//! - [`config`] - Configuration loading (JSON5 format)
//! - [`session`] - Zenoh session management
//! - [`error`] - Error types

pub mod config;
pub mod data;
pub mod error;
pub mod gateway;
pub mod serialization;
pub mod session;

// Re-export commonly used types at the crate root
pub use config::{LogFormat, LoggingConfig, ZenohConfig, load_config, parse_config};
pub use data::{DataEntry, DataValue, DeviceData};
pub use error::{Error, Result};
pub use gateway::PlatformGateway;
pub use serialization::{Format, decode, encode};
pub use session::connect;

/// Initialize tracing with the given configuration.
///
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
