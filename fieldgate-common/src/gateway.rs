use async_trait::async_trait;

use crate::data::DeviceData;
use crate::error::Result;

/// Sink interface towards the management platform.
///
/// Connectors push converted device data and RPC replies through this
/// trait; the production implementation publishes to Zenoh, tests use
/// a recording mock.
#[async_trait]
pub trait PlatformGateway: Send + Sync {
    /// Announce a configured device to the platform's device directory.
    async fn register_device(&self, name: &str, device_type: &str) -> Result<()>;

    /// Forward converted telemetry/attribute data.
    async fn send_to_storage(&self, connector: &str, data: DeviceData) -> Result<()>;

    /// Send the reply for a platform-initiated RPC request.
    async fn send_rpc_reply(
        &self,
        device: &str,
        request_id: &str,
        payload: serde_json::Value,
    ) -> Result<()>;
}
