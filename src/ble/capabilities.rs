//! Classification of a peripheral's discovered characteristics.
//!
//! Discovery produces a [`CapabilitySnapshot`]: an immutable map from service
//! UUID to the readable, notifiable and writable endpoints of that service.
//! The registry swaps whole snapshots, so readers never observe a partially
//! rebuilt view.

use btleplug::api::WriteType;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{Endpoint, GattHandle, GattService};
use crate::ble::uuids::{is_cccd, ENABLE_NOTIFICATION_VALUE};

/// Endpoints of one service grouped by capability.
///
/// The groups overlap: a characteristic that is both readable and writable
/// appears in both lists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceCapabilities {
    /// Characteristics with the READ property.
    pub readable: Vec<Endpoint>,
    /// Characteristics with the NOTIFY property.
    pub notifiable: Vec<Endpoint>,
    /// Characteristics with the WRITE property.
    pub writable: Vec<Endpoint>,
}

impl ServiceCapabilities {
    /// Check if the service exposes nothing usable.
    pub fn is_empty(&self) -> bool {
        self.readable.is_empty() && self.notifiable.is_empty() && self.writable.is_empty()
    }
}

/// Immutable view of a session's capabilities.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilitySnapshot {
    services: BTreeMap<Uuid, ServiceCapabilities>,
}

impl CapabilitySnapshot {
    /// The empty snapshot.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Capabilities of one service.
    pub fn service(&self, uuid: &Uuid) -> Option<&ServiceCapabilities> {
        self.services.get(uuid)
    }

    /// UUIDs of all classified services.
    pub fn service_ids(&self) -> impl Iterator<Item = &Uuid> {
        self.services.keys()
    }

    /// All readable endpoints across services.
    pub fn readable(&self) -> impl Iterator<Item = &Endpoint> {
        self.services.values().flat_map(|s| s.readable.iter())
    }

    /// All notifiable endpoints across services.
    pub fn notifiable(&self) -> impl Iterator<Item = &Endpoint> {
        self.services.values().flat_map(|s| s.notifiable.iter())
    }

    /// All writable endpoints across services.
    pub fn writable(&self) -> impl Iterator<Item = &Endpoint> {
        self.services.values().flat_map(|s| s.writable.iter())
    }

    /// Check if there is no writable endpoint at all.
    pub fn is_writable_empty(&self) -> bool {
        self.writable().next().is_none()
    }

    /// Check if no service has been classified.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Copy of this snapshot without `service`.
    fn without(&self, service: &Uuid) -> Self {
        let mut services = self.services.clone();
        services.remove(service);
        Self { services }
    }
}

/// Holds the current [`CapabilitySnapshot`] of one session.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    current: RwLock<Arc<CapabilitySnapshot>>,
    /// Services to classify. Empty means all of them.
    services: Vec<Uuid>,
}

impl CapabilityRegistry {
    /// Create an empty registry that classifies every service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry that only classifies `services`.
    ///
    /// Characteristics of other services are neither armed nor written to.
    pub fn with_services(services: Vec<Uuid>) -> Self {
        Self {
            current: RwLock::default(),
            services,
        }
    }

    fn wants(&self, service: &Uuid) -> bool {
        self.services.is_empty() || self.services.contains(service)
    }

    /// Get the current snapshot.
    pub fn snapshot(&self) -> Arc<CapabilitySnapshot> {
        self.current.read().clone()
    }

    /// Classify freshly discovered services and replace the current snapshot.
    ///
    /// Notifiable characteristics get notifications armed on `handle`, both
    /// locally and through their configuration descriptor. Writable ones are
    /// switched to acknowledged writes. Arming failures are logged and
    /// otherwise ignored.
    pub fn apply(&self, services: &[GattService], handle: &dyn GattHandle) -> Arc<CapabilitySnapshot> {
        let mut classified = BTreeMap::new();

        for service in services {
            if !self.wants(&service.uuid) {
                trace!("skipping service {}", service.uuid);
                continue;
            }
            trace!("service {}", service.uuid);
            let mut caps = ServiceCapabilities::default();

            for characteristic in &service.characteristics {
                let mut endpoint = Endpoint::new(service.uuid, characteristic);

                if endpoint.is_readable() {
                    trace!("characteristic {} readable", characteristic.uuid);
                    caps.readable.push(endpoint);
                }

                if endpoint.is_notifiable() {
                    trace!("characteristic {} notifiable", characteristic.uuid);
                    if let Err(e) = handle.set_characteristic_notification(&endpoint, true) {
                        warn!(
                            "Failed to enable notifications on {}: {}",
                            characteristic.uuid, e
                        );
                    }
                    for descriptor in characteristic.descriptors.iter().filter(|d| is_cccd(d)) {
                        if let Err(e) =
                            handle.write_descriptor(&endpoint, *descriptor, &ENABLE_NOTIFICATION_VALUE)
                        {
                            warn!(
                                "Failed to write descriptor {} of {}: {}",
                                descriptor, characteristic.uuid, e
                            );
                        }
                    }
                    caps.notifiable.push(endpoint);
                }

                if endpoint.is_writable() {
                    trace!(
                        "characteristic {} writable, using acknowledged writes",
                        characteristic.uuid
                    );
                    endpoint.write_type = WriteType::WithResponse;
                    caps.writable.push(endpoint);
                }
            }

            classified.insert(service.uuid, caps);
        }

        let snapshot = Arc::new(CapabilitySnapshot {
            services: classified,
        });

        debug!(
            "Classified {} services ({} writable endpoints)",
            snapshot.services.len(),
            snapshot.writable().count()
        );

        *self.current.write() = snapshot.clone();
        snapshot
    }

    /// Drop one service, or everything when `service` is `None`.
    pub fn clear(&self, service: Option<&Uuid>) {
        let mut current = self.current.write();
        *current = match service {
            Some(uuid) => Arc::new(current.without(uuid)),
            None => Arc::new(CapabilitySnapshot::empty()),
        };
    }
}
