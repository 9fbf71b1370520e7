//! Connector core: connection lifecycle, poll scheduling and inbound
//! command handling.
//!
//! The transport session and the device registry live behind a single
//! lock. The poll task takes it once per tick; the RPC and attribute
//! entry points take it once per request, so at most one Modbus
//! operation is ever in flight on the shared line.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use fieldgate_common::gateway::PlatformGateway;

use crate::commands::{AttributeUpdate, RpcData, RpcRequest};
use crate::config::{ByteOrder, ItemConfig, ModbusConfig};
use crate::converter::{BatchEntry, PollBatch};
use crate::device::{DataGroup, Device, DeviceRegistry};
use crate::dispatcher::{self, DispatchError, OperationInput, RegisterValues};
use crate::transport::ModbusTransport;

/// Scheduler granularity. Poll periods are rounded up to this.
const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Message counters of one connector.
///
/// `received` counts poll batches the conversion strategy accepted;
/// `sent` counts batches actually forwarded to the platform. Change
/// suppression makes the two diverge.
#[derive(Debug, Default)]
pub struct Statistics {
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
}

impl Statistics {
    fn incr_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    fn incr_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    #[serde(rename = "messagesReceived")]
    pub messages_received: u64,
    #[serde(rename = "messagesSent")]
    pub messages_sent: u64,
}

/// State shared between the poll task and the command entry points.
struct Core {
    transport: Box<dyn ModbusTransport>,
    registry: DeviceRegistry,
}

/// The Modbus connector.
///
/// [`open`](Self::open) spawns the background poll task;
/// [`server_side_rpc`](Self::server_side_rpc) and
/// [`on_attributes_update`](Self::on_attributes_update) are called by
/// the platform listener. All methods take `&self`, so the connector
/// can be shared behind an [`Arc`].
pub struct ModbusConnector {
    name: String,
    byte_order: ByteOrder,
    retry_interval: Duration,
    gateway: Arc<dyn PlatformGateway>,
    core: Arc<Mutex<Core>>,
    connected: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    stats: Arc<Statistics>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ModbusConnector {
    pub fn new(
        config: &ModbusConfig,
        registry: DeviceRegistry,
        transport: Box<dyn ModbusTransport>,
        gateway: Arc<dyn PlatformGateway>,
    ) -> Self {
        Self {
            name: config.name.clone(),
            byte_order: config.byte_order,
            retry_interval: Duration::from_millis(config.retry_interval_ms),
            gateway,
            core: Arc::new(Mutex::new(Core {
                transport,
                registry,
            })),
            connected: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Statistics::default()),
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the transport session is currently established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    /// Announce every configured device to the platform.
    pub async fn register_devices(&self) -> fieldgate_common::Result<()> {
        let core = self.core.lock().await;
        for device in core.registry.iter() {
            self.gateway
                .register_device(&device.config.name, &device.config.device_type)
                .await?;
        }
        Ok(())
    }

    /// Start the background poll task. Idempotent only after
    /// [`close`](Self::close).
    pub async fn open(&self) {
        info!(connector = %self.name, "Starting Modbus connector");
        self.stopped.store(false, Ordering::SeqCst);

        let task = PollTask {
            name: self.name.clone(),
            byte_order: self.byte_order,
            retry_interval: self.retry_interval,
            gateway: self.gateway.clone(),
            core: self.core.clone(),
            connected: self.connected.clone(),
            stopped: self.stopped.clone(),
            stats: self.stats.clone(),
        };
        *self.task.lock().await = Some(tokio::spawn(task.run()));
    }

    /// Stop the poll task and close the transport session.
    pub async fn close(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                error!(connector = %self.name, error = %e, "Poll task ended abnormally");
            }
        }
        info!(connector = %self.name, "Modbus connector stopped");
    }

    /// Handle a platform-initiated RPC request.
    ///
    /// Unknown devices are logged and dropped; unknown methods get a
    /// `METHOD NOT FOUND!` reply when the request carries an id. At
    /// most one reply is published per request id.
    pub async fn server_side_rpc(&self, request: RpcRequest) {
        let mut core = self.core.lock().await;
        let Core {
            transport,
            registry,
        } = &mut *core;

        let Some(device) = registry.get_mut(&request.device) else {
            warn!(connector = %self.name, device = %request.device,
                "RPC request for unknown device");
            return;
        };

        match device.config.rpc.resolve(&request.data.method).cloned() {
            Some(command) => {
                self.process_command(transport.as_mut(), device, &command, &request)
                    .await;
            }
            None => {
                error!(connector = %self.name, method = %request.data.method,
                    "RPC method not found in configuration");
                if let Some(id) = request.request_id() {
                    let mut reply = serde_json::Map::new();
                    reply.insert(
                        request.data.method.clone(),
                        serde_json::Value::String("METHOD NOT FOUND!".to_string()),
                    );
                    self.publish_reply(&request.device, &id, serde_json::Value::Object(reply))
                        .await;
                }
            }
        }
    }

    /// Handle a platform attribute update by writing each updated tag
    /// that has a matching command descriptor.
    pub async fn on_attributes_update(&self, update: AttributeUpdate) {
        let mut core = self.core.lock().await;
        let Core {
            transport,
            registry,
        } = &mut *core;

        let Some(device) = registry.get_mut(&update.device) else {
            warn!(connector = %self.name, device = %update.device,
                "Attribute update for unknown device");
            return;
        };

        let commands: Vec<(ItemConfig, serde_json::Value)> = device
            .config
            .attribute_updates
            .iter()
            .filter_map(|cmd| update.data.get(&cmd.tag).map(|v| (cmd.clone(), v.clone())))
            .collect();

        if commands.is_empty() {
            debug!(connector = %self.name, device = %update.device,
                "No attribute update matched a configured tag");
            return;
        }

        for (command, value) in commands {
            // Re-use the RPC path; attribute updates never get replies.
            let request = RpcRequest {
                device: update.device.clone(),
                data: RpcData {
                    method: command.tag.clone(),
                    params: value,
                    id: None,
                },
                id: None,
            };
            self.process_command(transport.as_mut(), device, &command, &request)
                .await;
        }
    }

    /// Execute one command descriptor and publish the reply if the
    /// request carries an id.
    async fn process_command(
        &self,
        transport: &mut dyn ModbusTransport,
        device: &mut Device,
        command: &ItemConfig,
        request: &RpcRequest,
    ) {
        let method = &request.data.method;
        let unit = device.config.unit_id;

        let input = if command.function_code.is_write() {
            match device
                .downlink
                .convert(command, self.byte_order, &request.data.params)
            {
                Ok(payload) => OperationInput::Payload(payload),
                Err(e) => {
                    error!(connector = %self.name, device = %device.config.name,
                        method = %method, error = %e, "Downlink conversion failed");
                    if let Some(id) = request.request_id() {
                        self.publish_reply(&device.config.name, &id, error_reply(method, &e))
                            .await;
                    }
                    return;
                }
            }
        } else {
            OperationInput::Count(command.count)
        };

        let reply = match dispatcher::execute(
            transport,
            command.function_code,
            unit,
            command.address,
            input,
        )
        .await
        {
            Ok(RegisterValues::WriteAck) => {
                debug!(connector = %self.name, device = %device.config.name,
                    method = %method, "Write command acknowledged");
                serde_json::json!({ "success": true })
            }
            Ok(values) => {
                match device
                    .uplink
                    .convert_rpc(self.byte_order, method, command, &values)
                {
                    Ok(value) => value,
                    Err(e) => {
                        error!(connector = %self.name, device = %device.config.name,
                            method = %method, error = %e, "RPC conversion failed");
                        error_reply(method, &e)
                    }
                }
            }
            Err(e) => {
                error!(connector = %self.name, device = %device.config.name,
                    method = %method, error = %e, "RPC command failed");
                error_reply(method, &e)
            }
        };

        if let Some(id) = request.request_id() {
            self.publish_reply(&device.config.name, &id, reply).await;
        }
    }

    async fn publish_reply(&self, device: &str, request_id: &str, payload: serde_json::Value) {
        if let Err(e) = self
            .gateway
            .send_rpc_reply(device, request_id, payload)
            .await
        {
            warn!(connector = %self.name, device = %device, request_id = %request_id,
                error = %e, "Failed to publish RPC reply");
        }
    }
}

/// Reply payload for a failed command, keyed by the method name.
fn error_reply(method: &str, error: &impl std::fmt::Display) -> serde_json::Value {
    let mut reply = serde_json::Map::new();
    reply.insert(
        method.to_string(),
        serde_json::Value::String(error.to_string()),
    );
    serde_json::Value::Object(reply)
}

/// The background task owning the connection lifecycle and the poll
/// schedule.
struct PollTask {
    name: String,
    byte_order: ByteOrder,
    retry_interval: Duration,
    gateway: Arc<dyn PlatformGateway>,
    core: Arc<Mutex<Core>>,
    connected: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    stats: Arc<Statistics>,
}

impl PollTask {
    async fn run(self) {
        'lifecycle: loop {
            // Connect, retrying until it sticks or the connector stops.
            loop {
                if self.stopped.load(Ordering::SeqCst) {
                    break 'lifecycle;
                }
                let attempt = { self.core.lock().await.transport.connect().await };
                match attempt {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(connector = %self.name, error = %e,
                            "Modbus connection failed, retrying");
                        tokio::time::sleep(self.retry_interval).await;
                    }
                }
            }
            self.connected.store(true, Ordering::SeqCst);
            info!(connector = %self.name, "Modbus transport connected");

            loop {
                tokio::time::sleep(TICK_INTERVAL).await;
                if self.stopped.load(Ordering::SeqCst) {
                    break 'lifecycle;
                }

                let mut core = self.core.lock().await;
                if let Err(e) = self.poll_tick(&mut core, Instant::now()).await {
                    drop(core);
                    self.connected.store(false, Ordering::SeqCst);
                    error!(connector = %self.name, error = %e,
                        "Connection lost! Reconnecting...");
                    tokio::time::sleep(self.retry_interval).await;
                    continue 'lifecycle;
                }
            }
        }

        let mut core = self.core.lock().await;
        core.transport.close().await;
        self.connected.store(false, Ordering::SeqCst);
        debug!(connector = %self.name, "Poll task finished");
    }

    /// Poll every due device group once.
    ///
    /// Device-reported exceptions are logged per item and do not stop
    /// the tick; a connection-level failure aborts it so the lifecycle
    /// loop can reconnect.
    async fn poll_tick(&self, core: &mut Core, now: Instant) -> Result<(), DispatchError> {
        let Core {
            transport,
            registry,
        } = core;

        for device in registry.iter_mut() {
            for group in DataGroup::ALL {
                let items = device.items(group);
                if items.is_empty() || !device.state.is_due(group, now) {
                    continue;
                }

                let mut entries = Vec::with_capacity(items.len());
                for item in items {
                    let result = dispatcher::execute(
                        transport.as_mut(),
                        item.function_code,
                        device.config.unit_id,
                        item.address,
                        OperationInput::Count(item.count),
                    )
                    .await;

                    match result {
                        Ok(values) => entries.push(BatchEntry {
                            item: item.clone(),
                            values,
                        }),
                        Err(e) if e.is_connection() => return Err(e),
                        Err(e) => {
                            warn!(connector = %self.name, device = %device.config.name,
                                tag = %item.tag, error = %e, "Register read failed");
                        }
                    }
                }

                let period = device.poll_period(group);
                device.state.reschedule(group, now, period);

                let mut batch = PollBatch::new(&device.config.name, &device.config.device_type);
                match group {
                    DataGroup::Telemetry => batch.telemetry = entries,
                    DataGroup::Attributes => batch.attributes = entries,
                }

                let converted = match device.uplink.convert_batch(self.byte_order, &batch) {
                    Ok(data) => data,
                    Err(e) => {
                        error!(connector = %self.name, device = %device.config.name,
                            group = group.as_str(), error = %e, "Uplink conversion failed");
                        continue;
                    }
                };
                self.stats.incr_received();

                let outgoing = if device.config.send_data_only_on_change {
                    device.state.changed_only(&converted)
                } else {
                    converted
                };
                if outgoing.is_empty() {
                    debug!(connector = %self.name, device = %device.config.name,
                        group = group.as_str(), "Data has not changed, nothing to forward");
                    continue;
                }

                match self.gateway.send_to_storage(&self.name, outgoing.clone()).await {
                    Ok(()) => {
                        if device.config.send_data_only_on_change {
                            device.state.commit(&outgoing);
                        } else {
                            device.state.overwrite(group, &outgoing);
                        }
                        self.stats.incr_sent();
                    }
                    Err(e) => {
                        warn!(connector = %self.name, device = %device.config.name,
                            error = %e, "Failed to forward device data");
                    }
                }
            }
        }

        Ok(())
    }
}
