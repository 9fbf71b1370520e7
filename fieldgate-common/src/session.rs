//! Zenoh session management for Fieldgate connectors.

use zenoh::Session;

use crate::config::ZenohConfig;
use crate::error::{Error, Result};

const MODES: [&str; 3] = ["client", "peer", "router"];

/// Translate a [`ZenohConfig`] into a zenoh runtime configuration.
fn build_zenoh_config(config: &ZenohConfig) -> Result<zenoh::Config> {
    if !MODES.contains(&config.mode.as_str()) {
        return Err(Error::Config(format!(
            "Invalid Zenoh mode '{}' (use client, peer, or router)",
            config.mode
        )));
    }

    let mut zenoh_config = zenoh::Config::default();
    zenoh_config
        .insert_json5("mode", &format!("\"{}\"", config.mode))
        .map_err(|e| Error::Config(format!("Failed to set Zenoh mode: {}", e)))?;

    for (key, endpoints) in [
        ("connect/endpoints", &config.connect),
        ("listen/endpoints", &config.listen),
    ] {
        if endpoints.is_empty() {
            continue;
        }
        let json = serde_json::to_string(endpoints)?;
        zenoh_config
            .insert_json5(key, &json)
            .map_err(|e| Error::Config(format!("Failed to set {}: {}", key, e)))?;
    }

    Ok(zenoh_config)
}

/// Open a Zenoh session for a connector.
pub async fn connect(config: &ZenohConfig) -> Result<Session> {
    let zenoh_config = build_zenoh_config(config)?;

    tracing::info!(
        mode = %config.mode,
        connect = ?config.connect,
        listen = ?config.listen,
        "Opening Zenoh session"
    );

    let session = zenoh::open(zenoh_config).await?;
    tracing::info!(zid = %session.zid(), "Zenoh session established");

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unknown_mode() {
        let config = ZenohConfig {
            mode: "mesh".to_string(),
            ..Default::default()
        };
        let result = build_zenoh_config(&config);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_builds_config_for_each_mode() {
        for mode in MODES {
            let config = ZenohConfig {
                mode: mode.to_string(),
                ..Default::default()
            };
            assert!(build_zenoh_config(&config).is_ok());
        }
    }

    #[test]
    fn test_builds_config_with_endpoints() {
        let config = ZenohConfig {
            mode: "client".to_string(),
            connect: vec!["tcp/127.0.0.1:7447".to_string()],
            listen: Vec::new(),
        };
        assert!(build_zenoh_config(&config).is_ok());
    }
}
