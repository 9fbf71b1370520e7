//! Inbound platform command protocol.
//!
//! RPC requests and attribute updates arrive on the connector's
//! administrative key expressions (the `@` segment marks the control
//! channel); replies and converted data go out on per-device keys.

use serde::{Deserialize, Serialize};

/// Key expression inbound RPC requests arrive on.
pub fn rpc_request_key(prefix: &str) -> String {
    format!("{}/@/rpc", prefix)
}

/// Key expression inbound attribute updates arrive on.
pub fn attribute_update_key(prefix: &str) -> String {
    format!("{}/@/attributes", prefix)
}

/// Key expression for one RPC reply.
pub fn rpc_reply_key(prefix: &str, device: &str, request_id: &str) -> String {
    format!("{}/{}/rpc/{}", prefix, device, request_id)
}

/// Key expression converted device data is published to.
pub fn device_data_key(prefix: &str, device: &str) -> String {
    format!("{}/{}/data", prefix, device)
}

/// Key expression for a device directory entry.
pub fn device_registration_key(prefix: &str, device: &str) -> String {
    format!("{}/@/devices/{}", prefix, device)
}

/// Key expression for connector status.
pub fn status_key(prefix: &str) -> String {
    format!("{}/@/status", prefix)
}

/// Platform-initiated RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Target device name.
    pub device: String,
    /// Method invocation payload.
    pub data: RpcData,
    /// Correlation id; some platforms put it here instead of inside
    /// `data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

/// Method, parameters and optional correlation id of an RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcData {
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

impl RpcRequest {
    /// Correlation id in string form, if the request carries one.
    /// Checked inside `data` first, then at the top level; platforms
    /// send both string and numeric ids.
    pub fn request_id(&self) -> Option<String> {
        match self.data.id.as_ref().or(self.id.as_ref()) {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

/// Platform notification that device attributes changed.
///
/// `data` maps attribute tags to their new values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeUpdate {
    pub device: String,
    pub data: serde_json::Map<String, serde_json::Value>,
}
