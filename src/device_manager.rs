//! Device manager owning every connection session.
//!
//! The manager is the entry point of the crate: it runs scans, keeps at most
//! one [`ConnectionSession`] per address, and forwards writes to the right
//! session. Lifecycle and write calls must be made from the thread that
//! built the manager.

use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ble::capabilities::{CapabilityRegistry, CapabilitySnapshot};
use crate::ble::connection::{ConnectionEvent, ConnectionSession, ConnectionState};
use crate::ble::correlation::{PendingReply, ReplyStream};
use crate::ble::gatt_log::{GattEventLogger, GattLogSink, TracingLogSink};
use crate::ble::platform::BtleplugTransport;
use crate::ble::scanner::{ScanStream, Scanner};
use crate::ble::transport::{RemoteAddress, Transport};
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::main_thread::MainThread;

/// Central manager for scanning and for the sessions of every peripheral.
pub struct DeviceManager {
    transport: Arc<dyn Transport>,
    config: ManagerConfig,
    main: MainThread,
    runtime: Handle,
    scanner: Scanner,
    /// Sessions by address.
    sessions: Arc<RwLock<HashMap<RemoteAddress, Arc<ConnectionSession>>>>,
    log_sink: Arc<dyn GattLogSink>,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl DeviceManager {
    /// Create a manager on top of `transport`.
    ///
    /// Binds the calling thread as the main thread and the current tokio
    /// runtime as the one running timers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoRuntime`] when called outside a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, config: ManagerConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let scanner = Scanner::new(
            transport.clone(),
            runtime.clone(),
            config.scan_filter.clone(),
        );
        let (event_tx, _) = broadcast::channel(32);

        Ok(Self {
            transport,
            config,
            main: MainThread::capture(),
            runtime,
            scanner,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            log_sink: Arc::new(TracingLogSink),
            event_tx,
        })
    }

    /// Create a manager on the system's first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn with_platform(config: ManagerConfig) -> Result<Self> {
        let transport = BtleplugTransport::new().await?;
        Self::new(Arc::new(transport), config)
    }

    /// Route driver event records to `sink` for sessions created from now on.
    pub fn with_log_sink(mut self, sink: Arc<dyn GattLogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Connect to `address`, creating its session on first use.
    ///
    /// Stops any running scan. Connecting an address whose link is already
    /// up or coming up returns the existing session untouched.
    ///
    /// # Errors
    ///
    /// Fails off the main thread, or when the driver refuses the connection.
    pub fn connect(&self, address: &RemoteAddress) -> Result<Arc<ConnectionSession>> {
        self.main.check()?;

        if self.scanner.stop_scan() {
            debug!("Stopped scan before connecting to {}", address);
        }

        let session = self.session_or_create(address);
        if let Err(e) = session.connect(self.transport.as_ref(), self.config.auto_reconnect) {
            if !session.has_handle() {
                self.forget(&session);
            }
            return Err(e);
        }
        Ok(session)
    }

    /// Disconnect `address`, keeping its session for a later reconnect.
    pub fn disconnect(&self, address: &RemoteAddress) -> Result<()> {
        self.main.check()?;
        self.require(address)?.disconnect()
    }

    /// Disconnect `address`, then release its handle and forget the session
    /// once the close grace period has passed.
    ///
    /// The session is unusable as soon as this returns. The returned task
    /// finishes when the handle has been released.
    pub fn close(&self, address: &RemoteAddress) -> Result<JoinHandle<()>> {
        self.main.check()?;
        let session = self.require(address)?;

        session.mark_closing();
        if let Err(e) = session.disconnect() {
            debug!("Closing {} without a link: {}", address, e);
        }

        let sessions = self.sessions.clone();
        let grace = self.config.close_grace;
        Ok(self.runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            session.release();

            let mut sessions = sessions.write();
            if sessions
                .get(session.address())
                .map_or(false, |current| Arc::ptr_eq(current, &session))
            {
                sessions.remove(session.address());
            }
            info!("Closed session for {}", session.address());
        }))
    }

    /// Write `value` to every writable endpoint of `address`.
    pub fn write(&self, address: &RemoteAddress, value: &[u8]) -> Result<()> {
        self.main.check()?;
        self.require(address)?.write(value)
    }

    /// Write `value` and wait for the next reply of `address`.
    ///
    /// `None` uses the configured reply timeout.
    pub fn write_await(
        &self,
        address: &RemoteAddress,
        value: &[u8],
        timeout: Option<Duration>,
    ) -> Result<PendingReply> {
        self.main.check()?;
        self.require(address)?
            .write_await(value, timeout.unwrap_or(self.config.reply_timeout))
    }

    /// Write `value` and stream the replies starting with `opcode` until one
    /// satisfies `predicate`.
    ///
    /// `None` uses the configured reply timeout.
    pub fn write_await_opcode<F>(
        &self,
        address: &RemoteAddress,
        value: &[u8],
        opcode: u8,
        timeout: Option<Duration>,
        predicate: F,
    ) -> Result<ReplyStream>
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.main.check()?;
        self.require(address)?.write_await_opcode(
            value,
            opcode,
            timeout.unwrap_or(self.config.reply_timeout),
            Box::new(predicate),
        )
    }

    /// Start a scan, stopping any running one.
    ///
    /// `None` uses the configured scan timeout.
    pub fn scan(&self, timeout: Option<Duration>, unique_only: bool) -> Result<ScanStream> {
        self.scanner
            .start_scan(timeout.unwrap_or(self.config.scan_timeout), unique_only)
    }

    /// Stop the running scan. Returns whether one was running.
    pub fn stop_scan(&self) -> bool {
        self.scanner.stop_scan()
    }

    /// Check if scanning is active.
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Get the session of `address`.
    pub fn session(&self, address: &RemoteAddress) -> Option<Arc<ConnectionSession>> {
        self.sessions.read().get(address).cloned()
    }

    /// Get the connection state of `address`.
    pub fn connection_state(&self, address: &RemoteAddress) -> Option<ConnectionState> {
        self.session(address).map(|s| s.state())
    }

    /// Get the capabilities of `address`.
    pub fn capabilities(&self, address: &RemoteAddress) -> Option<Arc<CapabilitySnapshot>> {
        self.session(address).map(|s| s.capabilities())
    }

    /// Addresses with a session, sorted.
    pub fn addresses(&self) -> Vec<RemoteAddress> {
        let mut addresses: Vec<_> = self.sessions.read().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Subscribe to connection state changes of every session.
    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Stop scanning and close every session.
    pub async fn shutdown(&self) -> Result<()> {
        self.main.check()?;
        info!("Shutting down device manager");

        self.scanner.stop_scan();

        let mut closing = Vec::new();
        for address in self.addresses() {
            match self.close(&address) {
                Ok(task) => closing.push(task),
                Err(e) => warn!("Error closing {}: {}", address, e),
            }
        }

        for result in join_all(closing).await {
            if let Err(e) = result {
                warn!("Close task failed: {}", e);
            }
        }

        Ok(())
    }

    fn require(&self, address: &RemoteAddress) -> Result<Arc<ConnectionSession>> {
        self.sessions
            .read()
            .get(address)
            .filter(|session| !session.is_closing())
            .cloned()
            .ok_or_else(|| Error::Undefined {
                address: address.clone(),
            })
    }

    fn session_or_create(&self, address: &RemoteAddress) -> Arc<ConnectionSession> {
        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get(address).filter(|s| !s.is_closing()) {
            return session.clone();
        }

        debug!("Creating session for {}", address);
        let session = ConnectionSession::new(
            address.clone(),
            self.main,
            self.runtime.clone(),
            CapabilityRegistry::with_services(self.config.services.clone()),
            GattEventLogger::new(self.log_sink.clone(), self.config.log_gatt_events),
            self.event_tx.clone(),
        );
        sessions.insert(address.clone(), session.clone());
        session
    }

    fn forget(&self, session: &Arc<ConnectionSession>) {
        let mut sessions = self.sessions.write();
        if sessions
            .get(session.address())
            .map_or(false, |current| Arc::ptr_eq(current, session))
        {
            sessions.remove(session.address());
        }
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("config", &self.config)
            .field("sessions", &self.addresses())
            .field("is_scanning", &self.is_scanning())
            .finish()
    }
}
