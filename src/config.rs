//! Configuration for [`DeviceManager`](crate::DeviceManager).

use btleplug::api::ScanFilter;
use std::time::Duration;
use uuid::Uuid;

/// Default scan deadline.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for a correlated reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between requesting a disconnect and releasing the handle on close.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(200);

/// Settings shared by every session of a manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Scan deadline used when a scan is started without one.
    pub scan_timeout: Duration,
    /// Reply deadline used when a write is issued without one.
    pub reply_timeout: Duration,
    /// Time the link gets to go down before the handle is released.
    pub close_grace: Duration,
    /// Ask the driver to re-establish dropped links by itself.
    pub auto_reconnect: bool,
    /// Forward every driver event to the log sink.
    pub log_gatt_events: bool,
    /// Filter handed to the driver when scanning.
    pub scan_filter: ScanFilter,
    /// Services whose characteristics are classified after discovery.
    /// Empty means every service, so writes reach every writable endpoint.
    pub services: Vec<Uuid>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            close_grace: DEFAULT_CLOSE_GRACE,
            auto_reconnect: false,
            log_gatt_events: true,
            scan_filter: ScanFilter::default(),
            services: Vec::new(),
        }
    }
}

impl ManagerConfig {
    /// Set the default scan deadline.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set the default reply deadline.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Set the close grace period.
    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    /// Enable or disable driver-side reconnection.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Enable or disable event logging.
    pub fn with_gatt_logging(mut self, enabled: bool) -> Self {
        self.log_gatt_events = enabled;
        self
    }

    /// Only report advertisers of these services while scanning.
    pub fn with_scan_services(mut self, services: Vec<Uuid>) -> Self {
        self.scan_filter = ScanFilter { services };
        self
    }

    /// Only classify, arm and write to characteristics of these services.
    pub fn with_services(mut self, services: Vec<Uuid>) -> Self {
        self.services = services;
        self
    }
}
