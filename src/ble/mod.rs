//! BLE communication module.
//!
//! This module turns a fire-and-forget GATT driver into connection sessions
//! with request/response semantics.

pub mod capabilities;
pub mod connection;
pub mod correlation;
pub mod gatt_log;
pub mod platform;
pub mod scanner;
pub mod transport;
pub mod uuids;

pub use capabilities::{CapabilityRegistry, CapabilitySnapshot, ServiceCapabilities};
pub use connection::{ConnectionEvent, ConnectionSession, ConnectionState};
pub use correlation::{Correlator, Dispatch, PendingReply, ReplyPredicate, ReplyStream};
pub use gatt_log::{GattLogRecord, GattLogSink, NullLogSink, TracingLogSink};
pub use platform::BtleplugTransport;
pub use scanner::{ScanEnd, ScanStream, Scanner};
pub use transport::{
    DiscoveryEvent, Endpoint, GattCharacteristic, GattEvent, GattEventHandler, GattHandle,
    GattService, GattStatus, LinkState, RemoteAddress, ScanEvent, ScanEventHandler, Transport,
};
pub use uuids::*;
