//! [`Transport`] implementation on top of btleplug.
//!
//! btleplug is async while the transport interface is fire-and-forget, so
//! every request spawns a task on the runtime and reports its outcome as a
//! [`GattEvent`] or [`ScanEvent`].

use btleplug::api::{
    Central, CentralEvent, Characteristic, Descriptor, Manager as _, Peripheral as _, ScanFilter,
    Service, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{
    DiscoveryEvent, Endpoint, GattCharacteristic, GattEvent, GattEventHandler, GattHandle,
    GattService, GattStatus, LinkState, RemoteAddress, ScanEvent, ScanEventHandler, Transport,
};
use crate::error::{Error, Result};

/// Failure code reported when btleplug cannot start or run a scan.
pub const SCAN_FAILED_INTERNAL_ERROR: i32 = 3;

type KnownPeripherals = Arc<RwLock<HashMap<RemoteAddress, Peripheral>>>;

/// Transport driving a btleplug adapter.
pub struct BtleplugTransport {
    adapter: Adapter,
    runtime: Handle,
    /// Peripherals seen while scanning, by address.
    known: KnownPeripherals,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugTransport {
    /// Create a transport on the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        Ok(Self::with_adapter(adapter, runtime))
    }

    /// Create a transport on a specific adapter.
    pub fn with_adapter(adapter: Adapter, runtime: Handle) -> Self {
        Self {
            adapter,
            runtime,
            known: Arc::new(RwLock::new(HashMap::new())),
            scan_task: Mutex::new(None),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Handle a BLE central event during a scan.
    async fn handle_event(
        event: CentralEvent,
        adapter: &Adapter,
        known: &KnownPeripherals,
        handler: &Arc<dyn ScanEventHandler>,
    ) {
        let id = match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. }
            | CentralEvent::ServicesAdvertisement { id, .. } => id,
            _ => return,
        };

        if let Some(discovery) = Self::process_peripheral(adapter, &id, known).await {
            handler.on_scan_event(ScanEvent::Result(discovery));
        }
    }

    async fn process_peripheral(
        adapter: &Adapter,
        id: &PeripheralId,
        known: &KnownPeripherals,
    ) -> Option<DiscoveryEvent> {
        let peripheral = match adapter.peripheral(id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return None,
        };

        let address = RemoteAddress::new(id.to_string());
        known.write().insert(address.clone(), peripheral);

        Some(DiscoveryEvent {
            address,
            local_name: properties.local_name,
            rssi: properties.rssi,
            manufacturer_data: properties.manufacturer_data,
            services: properties.services,
        })
    }
}

impl Transport for BtleplugTransport {
    fn start_scan(&self, filter: ScanFilter, handler: Arc<dyn ScanEventHandler>) -> Result<()> {
        if let Some(previous) = self.scan_task.lock().take() {
            previous.abort();
        }

        let adapter = self.adapter.clone();
        let known = self.known.clone();

        let task = self.runtime.spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get adapter events: {}", e);
                    handler.on_scan_event(ScanEvent::Failed {
                        code: SCAN_FAILED_INTERNAL_ERROR,
                    });
                    return;
                }
            };

            if let Err(e) = adapter.start_scan(filter).await {
                error!("Failed to start scan: {}", e);
                handler.on_scan_event(ScanEvent::Failed {
                    code: SCAN_FAILED_INTERNAL_ERROR,
                });
                return;
            }

            while let Some(event) = events.next().await {
                Self::handle_event(event, &adapter, &known, &handler).await;
            }

            debug!("Scan event loop ended");
        });

        *self.scan_task.lock() = Some(task);
        Ok(())
    }

    fn stop_scan(&self) {
        if let Some(task) = self.scan_task.lock().take() {
            task.abort();
        }

        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        });
    }

    fn connect(
        &self,
        address: &RemoteAddress,
        auto_reconnect: bool,
        handler: Arc<dyn GattEventHandler>,
    ) -> Result<Arc<dyn GattHandle>> {
        let peripheral = self
            .known
            .read()
            .get(address)
            .cloned()
            .ok_or_else(|| Error::ConnectionFailed {
                address: address.clone(),
                reason: "peripheral has not been seen in a scan".to_string(),
            })?;

        let handle = Arc::new(PeripheralHandle {
            link: Link {
                address: address.clone(),
                peripheral,
                handler,
            },
            runtime: self.runtime.clone(),
            tasks: Mutex::new(Vec::new()),
        });

        handle.watch_disconnects(self.adapter.clone(), auto_reconnect);
        handle.start_link();
        Ok(handle)
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        if let Some(task) = self.scan_task.lock().take() {
            task.abort();
        }
    }
}

/// The parts of a handle its spawned tasks need.
#[derive(Clone)]
struct Link {
    address: RemoteAddress,
    peripheral: Peripheral,
    handler: Arc<dyn GattEventHandler>,
}

impl Link {
    fn emit(&self, event: GattEvent) {
        self.handler.on_gatt_event(event);
    }

    fn emit_state(&self, status: GattStatus, state: LinkState) {
        self.emit(GattEvent::ConnectionStateChanged { status, state });
    }

    async fn connect(&self) {
        self.emit_state(GattStatus::SUCCESS, LinkState::Connecting);

        match self.peripheral.connect().await {
            Ok(()) => {
                info!("Connected to {}", self.address);
                self.emit_state(GattStatus::SUCCESS, LinkState::Connected);
                self.pump_notifications().await;
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", self.address, e);
                self.emit_state(GattStatus::FAILURE, LinkState::Disconnected);
            }
        }
    }

    /// Forward notifications until the stream ends.
    async fn pump_notifications(&self) {
        let mut notifications = match self.peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("No notification stream for {}: {}", self.address, e);
                return;
            }
        };

        while let Some(notification) = notifications.next().await {
            self.emit(GattEvent::CharacteristicChanged {
                characteristic: notification.uuid,
                value: Bytes::from(notification.value),
            });
        }
        trace!("Notification stream of {} ended", self.address);
    }

    fn characteristic(&self, endpoint: &Endpoint) -> Option<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == endpoint.characteristic && c.service_uuid == endpoint.service)
    }
}

/// Handle to one btleplug peripheral.
struct PeripheralHandle {
    link: Link,
    runtime: Handle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeripheralHandle {
    fn spawn<F, Fut>(&self, job: F)
    where
        F: FnOnce(Link) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let task = self.runtime.spawn(job(self.link.clone()));
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn start_link(&self) {
        self.spawn(|link| async move { link.connect().await });
    }

    fn watch_disconnects(&self, adapter: Adapter, auto_reconnect: bool) {
        self.spawn(move |link| async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get adapter events: {}", e);
                    return;
                }
            };

            let id = link.peripheral.id();
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(lost) = event {
                    if lost != id {
                        continue;
                    }
                    debug!("{} dropped the link", link.address);
                    link.emit_state(GattStatus::SUCCESS, LinkState::Disconnected);

                    if auto_reconnect {
                        let link = link.clone();
                        tokio::spawn(async move { link.connect().await });
                    }
                }
            }
        });
    }
}

impl GattHandle for PeripheralHandle {
    fn reconnect(&self) -> bool {
        self.start_link();
        true
    }

    fn disconnect(&self) {
        self.spawn(|link| async move {
            link.emit_state(GattStatus::SUCCESS, LinkState::Disconnecting);
            match link.peripheral.disconnect().await {
                Ok(()) => link.emit_state(GattStatus::SUCCESS, LinkState::Disconnected),
                Err(e) => {
                    warn!("Failed to disconnect {}: {}", link.address, e);
                    link.emit_state(GattStatus::FAILURE, LinkState::Disconnected);
                }
            }
        });
    }

    fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let peripheral = self.link.peripheral.clone();
        self.runtime.spawn(async move {
            if peripheral.is_connected().await.unwrap_or(false) {
                let _ = peripheral.disconnect().await;
            }
        });
    }

    fn discover_services(&self) -> bool {
        self.spawn(|link| async move {
            let event = match link.peripheral.discover_services().await {
                Ok(()) => GattEvent::ServicesDiscovered {
                    status: GattStatus::SUCCESS,
                    services: link.peripheral.services().iter().map(to_gatt_service).collect(),
                },
                Err(e) => {
                    warn!("Service discovery on {} failed: {}", link.address, e);
                    GattEvent::ServicesDiscovered {
                        status: GattStatus::FAILURE,
                        services: Vec::new(),
                    }
                }
            };
            link.emit(event);
        });
        true
    }

    fn write_characteristic(&self, endpoint: &Endpoint, value: &[u8], write_type: WriteType) -> bool {
        let Some(characteristic) = self.link.characteristic(endpoint) else {
            return false;
        };

        let value = Bytes::copy_from_slice(value);
        self.spawn(move |link| async move {
            let status = match link.peripheral.write(&characteristic, &value, write_type).await {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => {
                    warn!("Write to {} failed: {}", characteristic.uuid, e);
                    GattStatus::FAILURE
                }
            };
            link.emit(GattEvent::CharacteristicWrite {
                status,
                characteristic: characteristic.uuid,
                value,
            });
        });
        true
    }

    fn set_characteristic_notification(&self, endpoint: &Endpoint, enabled: bool) -> Result<()> {
        let characteristic = self
            .link
            .characteristic(endpoint)
            .ok_or(Error::Bluetooth(btleplug::Error::NoSuchCharacteristic))?;

        self.spawn(move |link| async move {
            let result = if enabled {
                link.peripheral.subscribe(&characteristic).await
            } else {
                link.peripheral.unsubscribe(&characteristic).await
            };
            if let Err(e) = result {
                warn!(
                    "Failed to change notifications of {}: {}",
                    characteristic.uuid, e
                );
            }
        });
        Ok(())
    }

    fn write_descriptor(&self, endpoint: &Endpoint, descriptor: Uuid, value: &[u8]) -> Result<()> {
        let target = Descriptor {
            uuid: descriptor,
            service_uuid: endpoint.service,
            characteristic_uuid: endpoint.characteristic,
        };

        let value = Bytes::copy_from_slice(value);
        self.spawn(move |link| async move {
            let status = match link.peripheral.write_descriptor(&target, &value).await {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => {
                    warn!("Descriptor write to {} failed: {}", target.uuid, e);
                    GattStatus::FAILURE
                }
            };
            link.emit(GattEvent::DescriptorWrite {
                status,
                descriptor: target.uuid,
                value,
            });
        });
        Ok(())
    }

    fn read_remote_rssi(&self) -> bool {
        self.spawn(|link| async move {
            let rssi = match link.peripheral.properties().await {
                Ok(Some(properties)) => properties.rssi,
                _ => None,
            };
            let event = match rssi {
                Some(rssi) => GattEvent::ReadRemoteRssi {
                    status: GattStatus::SUCCESS,
                    rssi,
                },
                None => GattEvent::ReadRemoteRssi {
                    status: GattStatus::FAILURE,
                    rssi: 0,
                },
            };
            link.emit(event);
        });
        true
    }
}

fn to_gatt_service(service: &Service) -> GattService {
    GattService {
        uuid: service.uuid,
        characteristics: service
            .characteristics
            .iter()
            .map(|c| GattCharacteristic {
                uuid: c.uuid,
                properties: c.properties,
                descriptors: c.descriptors.iter().map(|d| d.uuid).collect(),
            })
            .collect(),
    }
}
