// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # gatt-session
//!
//! Request/response sessions over Bluetooth Low Energy GATT.
//!
//! GATT drivers are fire-and-forget: a write only says the request was
//! accepted, and whatever the peripheral answers arrives later as a read or
//! notification that carries no reference to the request. This crate keeps
//! one session per peripheral and correlates those answers back to the
//! writes that caused them.
//!
//! ## Features
//!
//! - **Scanning**: Time-limited scans with optional per-address dedup
//! - **Capabilities**: Discovered characteristics grouped into readable,
//!   notifiable and writable endpoints, with notifications armed
//! - **FIFO replies**: `write_await` resolves with the next incoming payload
//! - **Opcode replies**: `write_await_opcode` streams payloads with a given
//!   first byte until a predicate accepts one
//! - **Deterministic teardown**: disconnect and close cancel every pending
//!   request, so no reply is delivered after the caller gave up
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use gatt_session::{DeviceManager, ManagerConfig, Result};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<()> {
//!     let manager = DeviceManager::with_platform(ManagerConfig::default()).await?;
//!
//!     let mut scan = manager.scan(None, true)?;
//!     let Some(found) = scan.next().await else {
//!         return Ok(());
//!     };
//!     let address = found?.address;
//!
//!     let session = manager.connect(&address)?;
//!     let mut events = manager.subscribe_connection_events();
//!     while !session.state().is_ready() {
//!         let _ = events.recv().await;
//!     }
//!
//!     let reply = manager.write_await(&address, &[0x01, 0x00], None)?.await?;
//!     println!("reply: {}", gatt_session::hex_string(&reply));
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Threading
//!
//! `connect`, `disconnect`, `close` and the write calls must run on the
//! thread that created the [`DeviceManager`]; elsewhere they fail with
//! [`Error::NotOnMainThread`]. Driver events may arrive on any thread.
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod config;
pub mod device_manager;
pub mod error;
pub mod main_thread;
pub mod utils;

// Re-exports for convenience
pub use config::ManagerConfig;
pub use device_manager::DeviceManager;
pub use error::{CancelReason, Error, ErrorKind, RequestId, Result};
pub use utils::{hex_string, parse_hex};

// Re-export commonly used types from submodules
pub use ble::capabilities::CapabilitySnapshot;
pub use ble::connection::{ConnectionEvent, ConnectionSession, ConnectionState};
pub use ble::correlation::{PendingReply, ReplyStream};
pub use ble::gatt_log::{GattLogRecord, GattLogSink};
pub use ble::scanner::{ScanEnd, ScanStream};
pub use ble::transport::{DiscoveryEvent, RemoteAddress};
