//! Structured logging of driver events.
//!
//! Every [`GattEvent`] a session receives is turned into a [`GattLogRecord`]
//! and handed to a [`GattLogSink`]. Sinks are called on the driver's thread
//! and must return quickly; what they do with the record is up to them.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::ble::transport::{GattEvent, GattStatus, RemoteAddress};
use crate::utils::hex_string;

/// One logged driver event.
#[derive(Debug, Clone, PartialEq)]
pub struct GattLogRecord {
    /// When the event was handled.
    pub timestamp: DateTime<Utc>,
    /// Session address.
    pub address: RemoteAddress,
    /// Driver callback name, e.g. `onCharacteristicChanged`.
    pub tag: &'static str,
    /// Completion status, if any.
    pub status: Option<GattStatus>,
    /// Free-form details.
    pub text: Option<String>,
}

impl GattLogRecord {
    /// Build the record for an event.
    pub fn from_event(address: &RemoteAddress, event: &GattEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            address: address.clone(),
            tag: event.tag(),
            status: event.status(),
            text: describe(event),
        }
    }
}

impl std::fmt::Display for GattLogRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.address, self.tag)?;
        if let Some(status) = self.status {
            write!(f, " status {}", status)?;
        }
        if let Some(ref text) = self.text {
            write!(f, " {}", text)?;
        }
        Ok(())
    }
}

fn describe(event: &GattEvent) -> Option<String> {
    match event {
        GattEvent::ConnectionStateChanged { state, .. } => Some(format!("newState={}", state)),
        GattEvent::ServicesDiscovered { services, .. } => {
            Some(format!("services={}", services.len()))
        }
        GattEvent::CharacteristicRead {
            characteristic,
            value,
            ..
        }
        | GattEvent::CharacteristicChanged {
            characteristic,
            value,
        }
        | GattEvent::CharacteristicWrite {
            characteristic,
            value,
            ..
        } => Some(format!("c {} value={}", characteristic, hex_string(value))),
        GattEvent::DescriptorRead {
            descriptor, value, ..
        }
        | GattEvent::DescriptorWrite {
            descriptor, value, ..
        } => Some(format!("d {} value={}", descriptor, hex_string(value))),
        GattEvent::ReadRemoteRssi { rssi, .. } => Some(format!("rssi={}", rssi)),
        GattEvent::MtuChanged { mtu, .. } => Some(format!("mtu={}", mtu)),
        GattEvent::PhyRead { tx_phy, rx_phy, .. } | GattEvent::PhyUpdate { tx_phy, rx_phy, .. } => {
            Some(format!("txPhy={} rxPhy={}", tx_phy, rx_phy))
        }
        GattEvent::ReliableWriteCompleted { .. } => None,
    }
}

/// Receives a record for every driver event.
pub trait GattLogSink: Send + Sync {
    /// Consume one record. Must not block.
    fn record(&self, record: &GattLogRecord);
}

/// Sink that emits records through `tracing` under the `gatt` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl GattLogSink for TracingLogSink {
    fn record(&self, record: &GattLogRecord) {
        info!(
            target: "gatt",
            address = %record.address,
            tag = record.tag,
            status = record.status.map(|s| s.0),
            "{}",
            record.text.as_deref().unwrap_or("")
        );
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLogSink;

impl GattLogSink for NullLogSink {
    fn record(&self, _record: &GattLogRecord) {}
}

/// Forwards events of one session to a sink, honoring the enable flag.
#[derive(Clone)]
pub(crate) struct GattEventLogger {
    sink: Arc<dyn GattLogSink>,
    enabled: bool,
}

impl GattEventLogger {
    pub(crate) fn new(sink: Arc<dyn GattLogSink>, enabled: bool) -> Self {
        Self { sink, enabled }
    }

    pub(crate) fn log(&self, address: &RemoteAddress, event: &GattEvent) {
        if self.enabled {
            self.sink.record(&GattLogRecord::from_event(address, event));
        }
    }
}
