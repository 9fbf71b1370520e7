//! Connector end-to-end tests against scripted transport and gateway
//! mocks. Time-based tests run on the paused tokio clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use fieldgate_common::data::{DataValue, DeviceData};
use fieldgate_common::gateway::PlatformGateway;
use fieldgate_modbus::commands::{AttributeUpdate, RpcRequest};
use fieldgate_modbus::config::ModbusConfig;
use fieldgate_modbus::connector::ModbusConnector;
use fieldgate_modbus::converter::ConverterRegistry;
use fieldgate_modbus::device::DeviceRegistry;
use fieldgate_modbus::dispatcher::WritePayload;
use fieldgate_modbus::transport::{ModbusTransport, TransportError};

/// Register address the mock always answers with a device exception.
const BROKEN_ADDRESS: u16 = 99;

#[derive(Default)]
struct TransportState {
    words: Mutex<Vec<u16>>,
    bits: Mutex<Vec<bool>>,
    fail: AtomicBool,
    connects: AtomicUsize,
    reads: AtomicUsize,
    writes: Mutex<Vec<(u8, u16, WritePayload)>>,
}

impl TransportState {
    fn new(words: Vec<u16>) -> Arc<Self> {
        Arc::new(Self {
            words: Mutex::new(words),
            bits: Mutex::new(vec![true]),
            ..Default::default()
        })
    }

    fn set_words(&self, words: Vec<u16>) {
        *self.words.lock().unwrap() = words;
    }

    fn writes(&self) -> Vec<(u8, u16, WritePayload)> {
        self.writes.lock().unwrap().clone()
    }
}

/// Scripted transport driven by shared [`TransportState`].
struct MockTransport {
    state: Arc<TransportState>,
    connected: bool,
}

impl MockTransport {
    fn new(state: Arc<TransportState>) -> Self {
        Self {
            state,
            connected: false,
        }
    }

    fn check(&self, address: u16) -> Result<(), TransportError> {
        if self.state.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("link down".to_string()));
        }
        if address == BROKEN_ADDRESS {
            return Err(TransportError::Protocol(
                "Exception: IllegalDataAddress".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ModbusTransport for MockTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.state.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("link down".to_string()));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn read_coils(
        &mut self,
        _unit: u8,
        address: u16,
        _count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        self.check(address)?;
        self.state.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.bits.lock().unwrap().clone())
    }

    async fn read_discrete_inputs(
        &mut self,
        _unit: u8,
        address: u16,
        _count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        self.check(address)?;
        self.state.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.bits.lock().unwrap().clone())
    }

    async fn read_holding_registers(
        &mut self,
        _unit: u8,
        address: u16,
        _count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.check(address)?;
        self.state.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.words.lock().unwrap().clone())
    }

    async fn read_input_registers(
        &mut self,
        _unit: u8,
        address: u16,
        _count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.check(address)?;
        self.state.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.words.lock().unwrap().clone())
    }

    async fn write_single_coil(
        &mut self,
        unit: u8,
        address: u16,
        value: bool,
    ) -> Result<(), TransportError> {
        self.check(address)?;
        self.state
            .writes
            .lock()
            .unwrap()
            .push((unit, address, WritePayload::Coil(value)));
        Ok(())
    }

    async fn write_single_register(
        &mut self,
        unit: u8,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError> {
        self.check(address)?;
        self.state
            .writes
            .lock()
            .unwrap()
            .push((unit, address, WritePayload::Register(value)));
        Ok(())
    }

    async fn write_multiple_coils(
        &mut self,
        unit: u8,
        address: u16,
        values: &[bool],
    ) -> Result<(), TransportError> {
        self.check(address)?;
        self.state
            .writes
            .lock()
            .unwrap()
            .push((unit, address, WritePayload::Coils(values.to_vec())));
        Ok(())
    }

    async fn write_multiple_registers(
        &mut self,
        unit: u8,
        address: u16,
        values: &[u16],
    ) -> Result<(), TransportError> {
        self.check(address)?;
        self.state
            .writes
            .lock()
            .unwrap()
            .push((unit, address, WritePayload::Registers(values.to_vec())));
        Ok(())
    }
}

/// Gateway mock recording everything the connector publishes.
#[derive(Default)]
struct MockGateway {
    registered: Mutex<Vec<(String, String)>>,
    storage: Mutex<Vec<DeviceData>>,
    replies: Mutex<Vec<(String, String, serde_json::Value)>>,
}

impl MockGateway {
    fn storage(&self) -> Vec<DeviceData> {
        self.storage.lock().unwrap().clone()
    }

    fn replies(&self) -> Vec<(String, String, serde_json::Value)> {
        self.replies.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlatformGateway for MockGateway {
    async fn register_device(&self, name: &str, device_type: &str) -> fieldgate_common::Result<()> {
        self.registered
            .lock()
            .unwrap()
            .push((name.to_string(), device_type.to_string()));
        Ok(())
    }

    async fn send_to_storage(
        &self,
        _connector: &str,
        data: DeviceData,
    ) -> fieldgate_common::Result<()> {
        self.storage.lock().unwrap().push(data);
        Ok(())
    }

    async fn send_rpc_reply(
        &self,
        device: &str,
        request_id: &str,
        payload: serde_json::Value,
    ) -> fieldgate_common::Result<()> {
        self.replies
            .lock()
            .unwrap()
            .push((device.to_string(), request_id.to_string(), payload));
        Ok(())
    }
}

fn modbus_config(json: &str) -> ModbusConfig {
    json5::from_str(json).expect("valid test config")
}

fn build_connector(
    config: &ModbusConfig,
    transport_state: Arc<TransportState>,
) -> (Arc<ModbusConnector>, Arc<MockGateway>) {
    let converters = ConverterRegistry::default();
    let registry =
        DeviceRegistry::from_config(&config.devices, &converters).expect("registry builds");
    let gateway = Arc::new(MockGateway::default());
    let connector = Arc::new(ModbusConnector::new(
        config,
        registry,
        Box::new(MockTransport::new(transport_state)),
        gateway.clone(),
    ));
    (connector, gateway)
}

fn rpc_request(json: &str) -> RpcRequest {
    serde_json::from_str(json).expect("valid RPC request")
}

#[tokio::test(start_paused = true)]
async fn test_change_only_suppresses_unchanged_polls() {
    let config = modbus_config(
        r#"{
            transport: { type: "tcp", host: "localhost" },
            retry_interval_ms: 100,
            devices: [{
                name: "plc01",
                send_data_only_on_change: true,
                telemetry: [{ tag: "temp", function_code: 3, address: 0 }],
                telemetry_poll_period_ms: 100
            }]
        }"#,
    );
    let state = TransportState::new(vec![21]);
    let (connector, gateway) = build_connector(&config, state.clone());

    connector.open().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // first poll forwards the initial value
    let stats = connector.statistics();
    assert_eq!(stats.messages_sent, 1);
    let storage = gateway.storage();
    assert_eq!(storage.len(), 1);
    assert_eq!(storage[0].device_name, "plc01");
    assert_eq!(storage[0].telemetry[0].key, "temp");
    assert_eq!(storage[0].telemetry[0].value, DataValue::Integer(21));

    // several more polls with the same value: nothing forwarded
    tokio::time::sleep(Duration::from_millis(300)).await;
    let stats = connector.statistics();
    assert_eq!(stats.messages_sent, 1);
    assert!(stats.messages_received > 1);

    // value changes: forwarded exactly once more
    state.set_words(vec![22]);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = connector.statistics();
    assert_eq!(stats.messages_sent, 2);
    let storage = gateway.storage();
    assert_eq!(storage.len(), 2);
    assert_eq!(storage[1].telemetry[0].value, DataValue::Integer(22));

    connector.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_every_poll_forwarded_without_change_detection() {
    let config = modbus_config(
        r#"{
            transport: { type: "tcp", host: "localhost" },
            devices: [{
                name: "plc01",
                telemetry: [{ tag: "temp", function_code: 4, address: 0 }],
                telemetry_poll_period_ms: 100
            }]
        }"#,
    );
    let state = TransportState::new(vec![7]);
    let (connector, gateway) = build_connector(&config, state);

    connector.open().await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    connector.close().await;

    // polls at ~0ms, ~100ms, ~200ms, each forwarded
    let stats = connector.statistics();
    assert_eq!(stats.messages_sent, 3);
    assert_eq!(stats.messages_received, stats.messages_sent);
    assert_eq!(gateway.storage().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_telemetry_and_attribute_schedules_are_independent() {
    let config = modbus_config(
        r#"{
            transport: { type: "tcp", host: "localhost" },
            devices: [{
                name: "plc01",
                telemetry: [{ tag: "temp", function_code: 3, address: 0 }],
                telemetry_poll_period_ms: 100,
                attributes: [{ tag: "serial", function_code: 3, address: 1 }],
                attributes_poll_period_ms: 300
            }]
        }"#,
    );
    let state = TransportState::new(vec![1]);
    let (connector, gateway) = build_connector(&config, state);

    connector.open().await;
    tokio::time::sleep(Duration::from_millis(350)).await;
    connector.close().await;

    let storage = gateway.storage();
    let telemetry_batches = storage.iter().filter(|d| !d.telemetry.is_empty()).count();
    let attribute_batches = storage.iter().filter(|d| !d.attributes.is_empty()).count();
    // telemetry at ~0/100/200/300, attributes at ~0/300
    assert_eq!(telemetry_batches, 4);
    assert_eq!(attribute_batches, 2);
}

#[tokio::test(start_paused = true)]
async fn test_conversion_failure_yields_no_data_and_polling_continues() {
    // the F32 item needs two registers; the mock answers with one,
    // so every conversion fails with a short read
    let config = modbus_config(
        r#"{
            transport: { type: "tcp", host: "localhost" },
            devices: [{
                name: "plc01",
                telemetry: [
                    { tag: "flow", function_code: 3, address: 0, count: 2, data_type: "f32" }
                ],
                telemetry_poll_period_ms: 100
            }]
        }"#,
    );
    let state = TransportState::new(vec![0x42F6]);
    let (connector, gateway) = build_connector(&config, state.clone());

    connector.open().await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    connector.close().await;

    // nothing forwarded, neither counter moved
    assert!(gateway.storage().is_empty());
    let stats = connector.statistics();
    assert_eq!(stats.messages_received, 0);
    assert_eq!(stats.messages_sent, 0);

    // the schedule kept advancing: polls at ~0ms, ~100ms, ~200ms
    assert_eq!(state.reads.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_device_exception_skips_item_not_batch() {
    let config = modbus_config(
        r#"{
            transport: { type: "tcp", host: "localhost" },
            devices: [{
                name: "plc01",
                telemetry: [
                    { tag: "good", function_code: 3, address: 0 },
                    { tag: "bad", function_code: 3, address: 99 }
                ],
                telemetry_poll_period_ms: 1000
            }]
        }"#,
    );
    let state = TransportState::new(vec![5]);
    let (connector, gateway) = build_connector(&config, state);

    connector.open().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    connector.close().await;

    let storage = gateway.storage();
    assert_eq!(storage.len(), 1);
    assert_eq!(storage[0].telemetry.len(), 1);
    assert_eq!(storage[0].telemetry[0].key, "good");
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_connection_loss() {
    let config = modbus_config(
        r#"{
            transport: { type: "tcp", host: "localhost" },
            retry_interval_ms: 100,
            devices: [{
                name: "plc01",
                telemetry: [{ tag: "temp", function_code: 3, address: 0 }],
                telemetry_poll_period_ms: 50
            }]
        }"#,
    );
    let state = TransportState::new(vec![9]);
    let (connector, gateway) = build_connector(&config, state.clone());

    connector.open().await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(connector.is_connected());
    let sent_before_outage = connector.statistics().messages_sent;
    assert!(sent_before_outage >= 1);

    // take the link down; the next poll fails and triggers reconnects
    state.fail.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!connector.is_connected());

    // link back up: connector reconnects and polling resumes
    state.fail.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(connector.is_connected());
    assert!(state.connects.load(Ordering::SeqCst) >= 2);
    assert!(connector.statistics().messages_sent > sent_before_outage);
    assert!(gateway.storage().len() as u64 == connector.statistics().messages_sent);

    connector.close().await;
    assert!(!connector.is_connected());
}

#[tokio::test]
async fn test_rpc_read_with_map_table() {
    let config = modbus_config(
        r#"{
            transport: { type: "tcp", host: "localhost" },
            devices: [{
                name: "plc01",
                rpc: { getValue: { function_code: 3, address: 10 } }
            }]
        }"#,
    );
    let state = TransportState::new(vec![21]);
    let (connector, gateway) = build_connector(&config, state);

    connector
        .server_side_rpc(rpc_request(
            r#"{"device": "plc01", "data": {"method": "getValue", "id": "7"}}"#,
        ))
        .await;

    let replies = gateway.replies();
    assert_eq!(replies.len(), 1);
    let (device, id, payload) = &replies[0];
    assert_eq!(device, "plc01");
    assert_eq!(id, "7");
    assert_eq!(payload, &serde_json::json!({ "getValue": 21 }));
}

#[tokio::test]
async fn test_rpc_write_with_list_table() {
    let config = modbus_config(
        r#"{
            transport: { type: "tcp", host: "localhost" },
            devices: [{
                name: "plc01",
                unit_id: 3,
                rpc: [{ tag: "setValue", function_code: 6, address: 10 }]
            }]
        }"#,
    );
    let state = TransportState::new(vec![]);
    let (connector, gateway) = build_connector(&config, state.clone());

    connector
        .server_side_rpc(rpc_request(
            r#"{"device": "plc01", "data": {"method": "setValue", "params": 42, "id": 5}}"#,
        ))
        .await;

    assert_eq!(state.writes(), vec![(3, 10, WritePayload::Register(42))]);
    let replies = gateway.replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].1, "5");
    assert_eq!(replies[0].2, serde_json::json!({ "success": true }));
}

#[tokio::test]
async fn test_rpc_unknown_method_replies_not_found() {
    let config = modbus_config(
        r#"{
            transport: { type: "tcp", host: "localhost" },
            devices: [{ name: "plc01" }]
        }"#,
    );
    let state = TransportState::new(vec![]);
    let (connector, gateway) = build_connector(&config, state);

    connector
        .server_side_rpc(rpc_request(
            r#"{"device": "plc01", "data": {"method": "doesNotExist", "id": "9"}}"#,
        ))
        .await;

    let replies = gateway.replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].1, "9");
    assert_eq!(
        replies[0].2,
        serde_json::json!({ "doesNotExist": "METHOD NOT FOUND!" })
    );
}

#[tokio::test]
async fn test_rpc_without_id_never_replies() {
    let config = modbus_config(
        r#"{
            transport: { type: "tcp", host: "localhost" },
            devices: [{
                name: "plc01",
                rpc: { getValue: { function_code: 3, address: 10 } }
            }]
        }"#,
    );
    let state = TransportState::new(vec![21]);
    let (connector, gateway) = build_connector(&config, state);

    // known and unknown method, both without an id
    connector
        .server_side_rpc(rpc_request(
            r#"{"device": "plc01", "data": {"method": "getValue"}}"#,
        ))
        .await;
    connector
        .server_side_rpc(rpc_request(
            r#"{"device": "plc01", "data": {"method": "doesNotExist"}}"#,
        ))
        .await;

    assert!(gateway.replies().is_empty());
}

#[tokio::test]
async fn test_rpc_device_exception_reply_keyed_by_method() {
    let config = modbus_config(
        r#"{
            transport: { type: "tcp", host: "localhost" },
            devices: [{
                name: "plc01",
                rpc: { getBroken: { function_code: 3, address: 99 } }
            }]
        }"#,
    );
    let state = TransportState::new(vec![]);
    let (connector, gateway) = build_connector(&config, state);

    connector
        .server_side_rpc(rpc_request(
            r#"{"device": "plc01", "data": {"method": "getBroken", "id": "1"}}"#,
        ))
        .await;

    let replies = gateway.replies();
    assert_eq!(replies.len(), 1);
    let payload = replies[0].2.as_object().expect("object reply");
    let message = payload["getBroken"].as_str().expect("error string");
    assert!(message.contains("IllegalDataAddress"));
}

#[tokio::test]
async fn test_rpc_unknown_device_is_dropped() {
    let config = modbus_config(
        r#"{
            transport: { type: "tcp", host: "localhost" },
            devices: [{ name: "plc01" }]
        }"#,
    );
    let state = TransportState::new(vec![]);
    let (connector, gateway) = build_connector(&config, state.clone());

    connector
        .server_side_rpc(rpc_request(
            r#"{"device": "ghost", "data": {"method": "getValue", "id": "1"}}"#,
        ))
        .await;

    assert!(gateway.replies().is_empty());
    assert!(state.writes().is_empty());
}

#[tokio::test]
async fn test_attribute_update_writes_matching_tags() {
    let config = modbus_config(
        r#"{
            transport: { type: "tcp", host: "localhost" },
            devices: [{
                name: "plc01",
                attribute_updates: [
                    { tag: "targetTemp", function_code: 6, address: 5 },
                    { tag: "pump", function_code: 5, address: 2 }
                ]
            }]
        }"#,
    );
    let state = TransportState::new(vec![]);
    let (connector, gateway) = build_connector(&config, state.clone());

    let update: AttributeUpdate = serde_json::from_str(
        r#"{"device": "plc01", "data": {"targetTemp": 30, "unrelated": 1}}"#,
    )
    .expect("valid update");
    connector.on_attributes_update(update).await;

    // only the matching tag is written, and no reply is published
    assert_eq!(state.writes(), vec![(1, 5, WritePayload::Register(30))]);
    assert!(gateway.replies().is_empty());
}

#[tokio::test]
async fn test_register_devices_announces_all() {
    let config = modbus_config(
        r#"{
            transport: { type: "tcp", host: "localhost" },
            devices: [
                { name: "plc01", device_type: "plc" },
                { name: "sensor02" }
            ]
        }"#,
    );
    let state = TransportState::new(vec![]);
    let (connector, gateway) = build_connector(&config, state);

    connector.register_devices().await.expect("registration");

    let registered = gateway.registered.lock().unwrap().clone();
    assert_eq!(
        registered,
        vec![
            ("plc01".to_string(), "plc".to_string()),
            ("sensor02".to_string(), "default".to_string())
        ]
    );
}
