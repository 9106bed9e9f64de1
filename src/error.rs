//! Error types for the gatt-session crate.

use thiserror::Error;

use crate::ble::connection::ConnectionState;
use crate::ble::transport::RemoteAddress;

/// Identifies the request an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestId {
    /// A FIFO slot request, identified by its local tag.
    Slot(u64),
    /// An opcode subscription, identified by its leading byte.
    Opcode(u8),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Slot(tag) => write!(f, "slot #{}", tag),
            Self::Opcode(opcode) => write!(f, "opcode {:#04x}", opcode),
        }
    }
}

/// Why a pending request was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// The link went down or a disconnect was requested.
    Disconnected,
    /// The session was closed and its handle released.
    Closed,
    /// A newer subscription registered the same opcode.
    Superseded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Closed => write!(f, "closed"),
            Self::Superseded => write!(f, "superseded"),
        }
    }
}

/// Coarse classification of [`Error`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Wrong execution context or no session bound to the address.
    Precondition,
    /// The action is invalid for the current lifecycle state.
    State,
    /// No satisfying reply arrived before the deadline.
    Timeout,
    /// The driver or platform reported a failure.
    Transport,
    /// The request was invalidated by a disconnect, close or stop.
    Cancellation,
}

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// A lifecycle or write entry point was called off the main thread.
    #[error("BLE operations must be executed on the main thread (current thread: {thread})")]
    NotOnMainThread {
        /// Name or id of the offending thread.
        thread: String,
    },

    /// No tokio runtime was available when the manager was built.
    #[error("No tokio runtime available")]
    NoRuntime,

    /// No session (or no live transport handle) is bound to the address.
    #[error("Session is undefined for {address}")]
    Undefined {
        /// The address that was looked up.
        address: RemoteAddress,
    },

    /// The link is not connected.
    #[error("{address} not connected (state: {state})")]
    NotConnected {
        /// The session address.
        address: RemoteAddress,
        /// The state at call time.
        state: ConnectionState,
    },

    /// The session has no writable characteristic.
    #[error("{address} not writable (state: {state})")]
    NotWritable {
        /// The session address.
        address: RemoteAddress,
        /// The state at call time.
        state: ConnectionState,
    },

    /// No matching reply arrived in time.
    #[error("{request} on {address} timed out")]
    Timeout {
        /// The session address.
        address: RemoteAddress,
        /// The request that expired.
        request: RequestId,
    },

    /// The request was cancelled before a reply arrived.
    #[error("{request} on {address} cancelled ({reason})")]
    Cancelled {
        /// The session address.
        address: RemoteAddress,
        /// The cancelled request.
        request: RequestId,
        /// Why it was cancelled.
        reason: CancelReason,
    },

    /// The transport refused every characteristic write.
    #[error("Transport rejected write to {address}")]
    WriteRejected {
        /// The session address.
        address: RemoteAddress,
    },

    /// The platform reported a scan failure.
    #[error("Scan failed with error code {code}")]
    ScanFailed {
        /// Platform error code.
        code: i32,
    },

    /// Failed to establish a connection to the peripheral.
    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed {
        /// The session address.
        address: RemoteAddress,
        /// Description of why the connection failed.
        reason: String,
    },
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotOnMainThread { .. } | Self::NoRuntime | Self::Undefined { .. } => {
                ErrorKind::Precondition
            }
            Self::NotConnected { .. } | Self::NotWritable { .. } => ErrorKind::State,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancellation,
            Self::Bluetooth(_)
            | Self::BluetoothUnavailable
            | Self::WriteRejected { .. }
            | Self::ScanFailed { .. }
            | Self::ConnectionFailed { .. } => ErrorKind::Transport,
        }
    }

    /// Check if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// Check if this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancellation
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
