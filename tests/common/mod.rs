//! Fake driver shared by the integration tests.

#![allow(dead_code)]

use btleplug::api::{CharPropFlags, ScanFilter, WriteType};
use bytes::Bytes;
use gatt_session::ble::transport::{
    Endpoint, GattCharacteristic, GattEvent, GattEventHandler, GattHandle, GattService,
    GattStatus, LinkState, ScanEvent, ScanEventHandler, Transport,
};
use gatt_session::ble::uuids::{
    uuid_from_u16, CLIENT_CHARACTERISTIC_CONFIG_UUID, NUS_RX_UUID, NUS_SERVICE_UUID, NUS_TX_UUID,
};
use gatt_session::{RemoteAddress, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// A request the fake driver received.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    StartScan,
    StopScan,
    Connect(RemoteAddress),
    Reconnect(RemoteAddress),
    Disconnect(RemoteAddress),
    Close(RemoteAddress),
    DiscoverServices(RemoteAddress),
    Write { characteristic: Uuid, value: Vec<u8> },
    SetNotification { characteristic: Uuid, enabled: bool },
    WriteDescriptor { descriptor: Uuid, value: Vec<u8> },
    ReadRssi(RemoteAddress),
}

type CallLog = Arc<Mutex<Vec<Call>>>;

/// Driver that records every request and lets tests inject events.
#[derive(Default)]
pub struct FakeTransport {
    calls: CallLog,
    scan_handler: Mutex<Option<Arc<dyn ScanEventHandler>>>,
    gatt_handlers: Mutex<HashMap<RemoteAddress, Arc<dyn GattEventHandler>>>,
    reject_writes: Arc<AtomicBool>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| matches(c)).count()
    }

    pub fn writes(&self) -> usize {
        self.count(|c| matches!(c, Call::Write { .. }))
    }

    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    pub fn scan_event(&self, event: ScanEvent) {
        let handler = self.scan_handler.lock().clone();
        if let Some(handler) = handler {
            handler.on_scan_event(event);
        }
    }

    pub fn gatt_event(&self, address: &RemoteAddress, event: GattEvent) {
        let handler = self.gatt_handlers.lock().get(address).cloned();
        if let Some(handler) = handler {
            handler.on_gatt_event(event);
        }
    }

    pub fn link(&self, address: &RemoteAddress, state: LinkState) {
        self.gatt_event(
            address,
            GattEvent::ConnectionStateChanged {
                status: GattStatus::SUCCESS,
                state,
            },
        );
    }

    /// Bring the link up and report `services` as discovered.
    pub fn link_up(&self, address: &RemoteAddress, services: Vec<GattService>) {
        self.link(address, LinkState::Connected);
        self.gatt_event(
            address,
            GattEvent::ServicesDiscovered {
                status: GattStatus::SUCCESS,
                services,
            },
        );
    }

    pub fn notify(&self, address: &RemoteAddress, value: &[u8]) {
        self.gatt_event(
            address,
            GattEvent::CharacteristicChanged {
                characteristic: NUS_TX_UUID,
                value: Bytes::copy_from_slice(value),
            },
        );
    }
}

impl Transport for FakeTransport {
    fn start_scan(&self, _filter: ScanFilter, handler: Arc<dyn ScanEventHandler>) -> Result<()> {
        self.calls.lock().push(Call::StartScan);
        *self.scan_handler.lock() = Some(handler);
        Ok(())
    }

    fn stop_scan(&self) {
        self.calls.lock().push(Call::StopScan);
    }

    fn connect(
        &self,
        address: &RemoteAddress,
        _auto_reconnect: bool,
        handler: Arc<dyn GattEventHandler>,
    ) -> Result<Arc<dyn GattHandle>> {
        self.calls.lock().push(Call::Connect(address.clone()));
        self.gatt_handlers.lock().insert(address.clone(), handler);
        Ok(Arc::new(FakeHandle {
            address: address.clone(),
            calls: self.calls.clone(),
            reject_writes: self.reject_writes.clone(),
        }))
    }
}

struct FakeHandle {
    address: RemoteAddress,
    calls: CallLog,
    reject_writes: Arc<AtomicBool>,
}

impl FakeHandle {
    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

impl GattHandle for FakeHandle {
    fn reconnect(&self) -> bool {
        self.record(Call::Reconnect(self.address.clone()));
        true
    }

    fn disconnect(&self) {
        self.record(Call::Disconnect(self.address.clone()));
    }

    fn close(&self) {
        self.record(Call::Close(self.address.clone()));
    }

    fn discover_services(&self) -> bool {
        self.record(Call::DiscoverServices(self.address.clone()));
        true
    }

    fn write_characteristic(&self, endpoint: &Endpoint, value: &[u8], _write_type: WriteType) -> bool {
        self.record(Call::Write {
            characteristic: endpoint.characteristic,
            value: value.to_vec(),
        });
        !self.reject_writes.load(Ordering::SeqCst)
    }

    fn set_characteristic_notification(&self, endpoint: &Endpoint, enabled: bool) -> Result<()> {
        self.record(Call::SetNotification {
            characteristic: endpoint.characteristic,
            enabled,
        });
        Ok(())
    }

    fn write_descriptor(&self, _endpoint: &Endpoint, descriptor: Uuid, value: &[u8]) -> Result<()> {
        self.record(Call::WriteDescriptor {
            descriptor,
            value: value.to_vec(),
        });
        Ok(())
    }

    fn read_remote_rssi(&self) -> bool {
        self.record(Call::ReadRssi(self.address.clone()));
        true
    }
}

/// Nordic UART service: writable RX, notifiable TX.
pub fn uart_services() -> Vec<GattService> {
    vec![GattService {
        uuid: NUS_SERVICE_UUID,
        characteristics: vec![
            GattCharacteristic {
                uuid: NUS_RX_UUID,
                properties: CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE,
                descriptors: vec![],
            },
            GattCharacteristic {
                uuid: NUS_TX_UUID,
                properties: CharPropFlags::NOTIFY,
                descriptors: vec![CLIENT_CHARACTERISTIC_CONFIG_UUID],
            },
        ],
    }]
}

/// Generic Access with a writable Device Name (0x2A00).
pub fn generic_access_service() -> GattService {
    GattService {
        uuid: uuid_from_u16(0x1800),
        characteristics: vec![GattCharacteristic {
            uuid: uuid_from_u16(0x2A00),
            properties: CharPropFlags::READ | CharPropFlags::WRITE,
            descriptors: vec![],
        }],
    }
}

/// A service with nothing to write to.
pub fn read_only_services() -> Vec<GattService> {
    vec![GattService {
        uuid: NUS_SERVICE_UUID,
        characteristics: vec![GattCharacteristic {
            uuid: NUS_TX_UUID,
            properties: CharPropFlags::READ | CharPropFlags::NOTIFY,
            descriptors: vec![],
        }],
    }]
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
