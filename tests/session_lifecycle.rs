//! Connection lifecycle through the device manager.

mod common;

use common::{
    generic_access_service, init_tracing, read_only_services, uart_services, Call, FakeTransport,
};
use futures::StreamExt;
use gatt_session::ble::transport::{GattEvent, GattStatus, LinkState};
use gatt_session::ble::uuids::{
    CLIENT_CHARACTERISTIC_CONFIG_UUID, NUS_RX_UUID, NUS_SERVICE_UUID, NUS_TX_UUID,
};
use gatt_session::{
    ConnectionState, DeviceManager, Error, GattLogRecord, GattLogSink, ManagerConfig,
    RemoteAddress, ScanEnd,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn address() -> RemoteAddress {
    RemoteAddress::from("C0:FF:EE:00:00:01")
}

fn manager(transport: &Arc<FakeTransport>) -> DeviceManager {
    init_tracing();
    DeviceManager::new(transport.clone(), ManagerConfig::default()).unwrap()
}

#[tokio::test]
async fn connect_discovers_and_arms_notifications() {
    let transport = FakeTransport::new();
    let manager = manager(&transport);
    let address = address();

    let session = manager.connect(&address).unwrap();
    assert_eq!(session.state(), ConnectionState::Connecting);

    transport.link_up(&address, uart_services());

    assert_eq!(manager.connection_state(&address), Some(ConnectionState::Ready));
    let capabilities = manager.capabilities(&address).unwrap();
    assert_eq!(capabilities.writable().count(), 1);
    assert_eq!(capabilities.notifiable().count(), 1);

    assert_eq!(
        transport.calls(),
        vec![
            Call::Connect(address.clone()),
            Call::DiscoverServices(address.clone()),
            Call::SetNotification {
                characteristic: NUS_TX_UUID,
                enabled: true,
            },
            Call::WriteDescriptor {
                descriptor: CLIENT_CHARACTERISTIC_CONFIG_UUID,
                value: vec![0x01, 0x00],
            },
        ]
    );
}

#[tokio::test]
async fn connection_events_follow_the_lifecycle() {
    let transport = FakeTransport::new();
    let manager = manager(&transport);
    let address = address();
    let mut events = manager.subscribe_connection_events();

    manager.connect(&address).unwrap();
    transport.link_up(&address, uart_services());
    manager.disconnect(&address).unwrap();

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.address, address);
        states.push(event.state);
    }
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Discovering,
            ConnectionState::Ready,
            ConnectionState::Disconnecting,
        ]
    );
}

#[tokio::test]
async fn double_connect_keeps_one_handle() {
    let transport = FakeTransport::new();
    let manager = manager(&transport);
    let address = address();

    let first = manager.connect(&address).unwrap();
    let second = manager.connect(&address).unwrap();
    transport.link_up(&address, uart_services());
    let third = manager.connect(&address).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &third));
    assert_eq!(transport.count(|c| matches!(c, Call::Connect(_))), 1);
    assert_eq!(transport.count(|c| matches!(c, Call::Reconnect(_))), 0);
    assert_eq!(manager.addresses(), vec![address]);
}

#[tokio::test]
async fn reconnect_reuses_the_handle() {
    let transport = FakeTransport::new();
    let manager = manager(&transport);
    let address = address();

    manager.connect(&address).unwrap();
    transport.link_up(&address, uart_services());
    manager.disconnect(&address).unwrap();
    transport.link(&address, LinkState::Disconnected);

    manager.connect(&address).unwrap();
    transport.link_up(&address, uart_services());

    assert_eq!(transport.count(|c| matches!(c, Call::Connect(_))), 1);
    assert_eq!(transport.count(|c| matches!(c, Call::Reconnect(_))), 1);
    assert_eq!(manager.connection_state(&address), Some(ConnectionState::Ready));
}

#[tokio::test]
async fn connect_stops_running_scan() {
    let transport = FakeTransport::new();
    let manager = manager(&transport);

    let mut scan = manager.scan(Some(Duration::from_secs(10)), true).unwrap();
    manager.connect(&address()).unwrap();

    assert!(!manager.is_scanning());
    assert!(scan.next().await.is_none());
    assert_eq!(scan.end_reason(), Some(ScanEnd::Stopped));
    assert_eq!(
        transport.calls()[..3],
        [Call::StartScan, Call::StopScan, Call::Connect(address())]
    );
}

#[tokio::test]
async fn write_without_writable_endpoint_never_reaches_transport() {
    let transport = FakeTransport::new();
    let manager = manager(&transport);
    let address = address();

    manager.connect(&address).unwrap();
    transport.link_up(&address, read_only_services());

    let err = manager.write(&address, &[0x01]).unwrap_err();
    assert!(matches!(
        err,
        Error::NotWritable {
            state: ConnectionState::Ready,
            ..
        }
    ));
    assert!(manager
        .write_await(&address, &[0x01], None)
        .unwrap_err()
        .to_string()
        .contains("not writable"));
    assert_eq!(transport.writes(), 0);
}

#[tokio::test]
async fn write_before_link_is_not_connected() {
    let transport = FakeTransport::new();
    let manager = manager(&transport);
    let address = address();

    manager.connect(&address).unwrap();

    assert!(matches!(
        manager.write(&address, &[0x01]),
        Err(Error::NotConnected {
            state: ConnectionState::Connecting,
            ..
        })
    ));
    assert_eq!(transport.writes(), 0);
}

#[tokio::test]
async fn write_broadcasts_to_writable_endpoints() {
    let transport = FakeTransport::new();
    let manager = manager(&transport);
    let address = address();

    manager.connect(&address).unwrap();
    transport.link_up(&address, uart_services());
    manager.write(&address, &[0xCA, 0xFE]).unwrap();

    assert_eq!(
        transport.calls().last(),
        Some(&Call::Write {
            characteristic: NUS_RX_UUID,
            value: vec![0xCA, 0xFE],
        })
    );
}

#[tokio::test]
async fn writes_stay_inside_configured_services() {
    init_tracing();
    let transport = FakeTransport::new();
    let manager = DeviceManager::new(
        transport.clone(),
        ManagerConfig::default().with_services(vec![NUS_SERVICE_UUID]),
    )
    .unwrap();
    let address = address();

    manager.connect(&address).unwrap();
    let mut services = uart_services();
    services.insert(0, generic_access_service());
    transport.link_up(&address, services);
    manager.write(&address, &[0x42]).unwrap();

    let written: Vec<Call> = transport
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::Write { .. }))
        .collect();
    assert_eq!(
        written,
        vec![Call::Write {
            characteristic: NUS_RX_UUID,
            value: vec![0x42],
        }]
    );
    let capabilities = manager.capabilities(&address).unwrap();
    assert_eq!(capabilities.service_ids().collect::<Vec<_>>(), vec![&NUS_SERVICE_UUID]);
}

#[tokio::test]
async fn link_loss_clears_capabilities() {
    let transport = FakeTransport::new();
    let manager = manager(&transport);
    let address = address();

    manager.connect(&address).unwrap();
    transport.link_up(&address, uart_services());
    transport.link(&address, LinkState::Disconnected);

    assert!(manager.capabilities(&address).unwrap().is_empty());
    assert!(matches!(
        manager.write(&address, &[0x01]),
        Err(Error::NotConnected {
            state: ConnectionState::Disconnected,
            ..
        })
    ));
}

#[tokio::test]
async fn failed_discovery_leaves_session_connected() {
    let transport = FakeTransport::new();
    let manager = manager(&transport);
    let address = address();

    manager.connect(&address).unwrap();
    transport.link(&address, LinkState::Connected);
    transport.gatt_event(
        &address,
        GattEvent::ServicesDiscovered {
            status: GattStatus::FAILURE,
            services: vec![],
        },
    );

    assert_eq!(
        manager.connection_state(&address),
        Some(ConnectionState::Connected)
    );
    assert!(manager.capabilities(&address).unwrap().is_writable_empty());
}

#[tokio::test(start_paused = true)]
async fn close_disconnects_before_releasing() {
    let transport = FakeTransport::new();
    let manager = manager(&transport);
    let address = address();

    manager.connect(&address).unwrap();
    transport.link_up(&address, uart_services());

    let closing = manager.close(&address).unwrap();
    assert_eq!(transport.count(|c| matches!(c, Call::Close(_))), 0);
    closing.await.unwrap();

    let calls = transport.calls();
    let disconnect = calls
        .iter()
        .position(|c| matches!(c, Call::Disconnect(_)))
        .unwrap();
    let close = calls.iter().position(|c| matches!(c, Call::Close(_))).unwrap();
    assert!(disconnect < close);

    assert!(manager.session(&address).is_none());
    assert!(matches!(
        manager.write(&address, &[0x01]),
        Err(Error::Undefined { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn connect_after_close_starts_a_new_session() {
    let transport = FakeTransport::new();
    let manager = manager(&transport);
    let address = address();

    let old = manager.connect(&address).unwrap();
    manager.close(&address).unwrap().await.unwrap();
    let new = manager.connect(&address).unwrap();

    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(transport.count(|c| matches!(c, Call::Connect(_))), 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_every_session() {
    let transport = FakeTransport::new();
    let manager = manager(&transport);
    let a = RemoteAddress::from("A");
    let b = RemoteAddress::from("B");

    manager.connect(&a).unwrap();
    manager.connect(&b).unwrap();
    manager.shutdown().await.unwrap();

    assert!(manager.addresses().is_empty());
    assert_eq!(transport.count(|c| matches!(c, Call::Close(_))), 2);
}

#[derive(Default)]
struct Collect(Mutex<Vec<GattLogRecord>>);

impl GattLogSink for Collect {
    fn record(&self, record: &GattLogRecord) {
        self.0.lock().push(record.clone());
    }
}

#[tokio::test]
async fn driver_events_reach_the_log_sink() {
    let transport = FakeTransport::new();
    let sink = Arc::new(Collect::default());
    let manager = manager(&transport).with_log_sink(sink.clone());
    let address = address();

    manager.connect(&address).unwrap();
    transport.link_up(&address, uart_services());
    transport.notify(&address, &[0x05, 0xA0]);

    let records = sink.0.lock();
    let tags: Vec<&str> = records.iter().map(|r| r.tag).collect();
    assert_eq!(
        tags,
        vec![
            "onConnectionStateChange",
            "onServicesDiscovered",
            "onCharacteristicChanged",
        ]
    );
    assert!(records[2].to_string().ends_with("value=05 A0"));
}

#[tokio::test]
async fn disabled_logging_skips_the_sink() {
    let transport = FakeTransport::new();
    let sink = Arc::new(Collect::default());
    let manager = DeviceManager::new(
        transport.clone(),
        ManagerConfig::default().with_gatt_logging(false),
    )
    .unwrap()
    .with_log_sink(sink.clone());
    let address = address();

    manager.connect(&address).unwrap();
    transport.link_up(&address, uart_services());

    assert!(sink.0.lock().is_empty());
}
