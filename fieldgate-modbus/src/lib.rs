//! Modbus connector for the fieldgate platform.
//!
//! Polls Modbus devices (TCP or RTU/serial) on per-device schedules,
//! converts register values into telemetry and attributes, and
//! publishes them to Zenoh. Inbound RPC requests and attribute updates
//! are executed against the same shared transport line.
//!
//! # Key Expressions
//!
//! ```text
//! fieldgate/modbus/<device>/data              converted device data
//! fieldgate/modbus/<device>/rpc/<requestId>   RPC replies
//! fieldgate/modbus/@/rpc                      inbound RPC requests
//! fieldgate/modbus/@/attributes               inbound attribute updates
//! fieldgate/modbus/@/devices/<device>         device registrations
//! fieldgate/modbus/@/status                   connector status
//! ```

pub mod commands;
pub mod config;
pub mod connector;
pub mod converter;
pub mod device;
pub mod dispatcher;
pub mod platform;
pub mod transport;
