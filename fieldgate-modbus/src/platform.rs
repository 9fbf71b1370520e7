//! Zenoh-backed platform integration.
//!
//! Publishes converted device data, device registrations and RPC
//! replies, and listens on the administrative key expressions for
//! inbound commands.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use fieldgate_common::data::DeviceData;
use fieldgate_common::gateway::PlatformGateway;
use fieldgate_common::serialization::{Format, encode};
use fieldgate_common::{Error, Result};

use crate::commands::{
    self, AttributeUpdate, RpcRequest, attribute_update_key, rpc_request_key,
};
use crate::connector::ModbusConnector;

/// Platform gateway publishing over a Zenoh session.
pub struct ZenohGateway {
    session: zenoh::Session,
    key_prefix: String,
    format: Format,
}

impl ZenohGateway {
    pub fn new(session: zenoh::Session, key_prefix: impl Into<String>, format: Format) -> Self {
        Self {
            session,
            key_prefix: key_prefix.into(),
            format,
        }
    }

    pub fn session(&self) -> &zenoh::Session {
        &self.session
    }

    /// Publish the running status with the device list and counters.
    pub async fn publish_status(&self, connector: &str, status: serde_json::Value) {
        let key = commands::status_key(&self.key_prefix);
        if let Err(e) = self.session.put(&key, status.to_string()).await {
            error!(connector = %connector, error = %e, "Failed to publish connector status");
        }
    }
}

#[async_trait]
impl PlatformGateway for ZenohGateway {
    async fn register_device(&self, name: &str, device_type: &str) -> Result<()> {
        let key = commands::device_registration_key(&self.key_prefix, name);
        let entry = serde_json::json!({
            "name": name,
            "type": device_type,
        });
        self.session
            .put(&key, entry.to_string())
            .await
            .map_err(Error::Zenoh)?;
        debug!(device = %name, device_type = %device_type, "Registered device");
        Ok(())
    }

    async fn send_to_storage(&self, connector: &str, data: DeviceData) -> Result<()> {
        let key = commands::device_data_key(&self.key_prefix, &data.device_name);
        let payload = encode(&data, self.format)?;
        self.session.put(&key, payload).await.map_err(Error::Zenoh)?;
        debug!(connector = %connector, device = %data.device_name,
            telemetry = data.telemetry.len(), attributes = data.attributes.len(),
            "Forwarded device data");
        Ok(())
    }

    async fn send_rpc_reply(
        &self,
        device: &str,
        request_id: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let key = commands::rpc_reply_key(&self.key_prefix, device, request_id);
        self.session
            .put(&key, payload.to_string())
            .await
            .map_err(Error::Zenoh)?;
        debug!(device = %device, request_id = %request_id, "Published RPC reply");
        Ok(())
    }
}

/// Listen for inbound RPC requests and attribute updates until the
/// shutdown signal fires.
///
/// Malformed payloads are logged and dropped; the listener never stops
/// on a bad message.
pub async fn run_command_listener(
    session: zenoh::Session,
    key_prefix: String,
    connector: Arc<ModbusConnector>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let rpc_subscriber = session
        .declare_subscriber(rpc_request_key(&key_prefix))
        .await
        .map_err(Error::Zenoh)?;
    let attribute_subscriber = session
        .declare_subscriber(attribute_update_key(&key_prefix))
        .await
        .map_err(Error::Zenoh)?;

    info!(prefix = %key_prefix, "Command listener started");

    loop {
        tokio::select! {
            sample = rpc_subscriber.recv_async() => {
                let Ok(sample) = sample else { break };
                let payload = sample.payload().to_bytes();
                match serde_json::from_slice::<RpcRequest>(&payload) {
                    Ok(request) => {
                        debug!(device = %request.device, method = %request.data.method,
                            "RPC request received");
                        connector.server_side_rpc(request).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "Ignoring malformed RPC request");
                    }
                }
            }
            sample = attribute_subscriber.recv_async() => {
                let Ok(sample) = sample else { break };
                let payload = sample.payload().to_bytes();
                match serde_json::from_slice::<AttributeUpdate>(&payload) {
                    Ok(update) => {
                        debug!(device = %update.device, "Attribute update received");
                        connector.on_attributes_update(update).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "Ignoring malformed attribute update");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Command listener stopped");
    Ok(())
}
