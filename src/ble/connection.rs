//! Connection lifecycle of one peripheral.
//!
//! A [`ConnectionSession`] owns the driver handle for one address and drives
//! it through discovery into [`ConnectionState::Ready`]. Driver events are
//! fed in through [`GattEventHandler`]; writes go out to every writable
//! endpoint and replies are correlated by the session's [`Correlator`].

use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::ble::capabilities::{CapabilityRegistry, CapabilitySnapshot};
use crate::ble::correlation::{Correlator, PendingReply, ReplyPredicate, ReplyStream};
use crate::ble::gatt_log::GattEventLogger;
use crate::ble::transport::{
    GattEvent, GattEventHandler, GattHandle, GattService, GattStatus, LinkState, RemoteAddress,
    Transport,
};
use crate::error::{CancelReason, Error, Result};
use crate::main_thread::MainThread;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No link.
    #[default]
    Disconnected,
    /// Waiting for the link to come up.
    Connecting,
    /// Link up, services not known yet.
    Connected,
    /// Service discovery in progress.
    Discovering,
    /// Link up and capabilities classified.
    Ready,
    /// Waiting for the link to go down.
    Disconnecting,
}

impl ConnectionState {
    /// Check if the link is up.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Discovering | Self::Ready)
    }

    /// Check if capabilities are available.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Discovering | Self::Disconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Discovering => write!(f, "Discovering"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// The session address.
    pub address: RemoteAddress,
    /// The new connection state.
    pub state: ConnectionState,
}

/// One peripheral's connection, capabilities and pending requests.
pub struct ConnectionSession {
    address: RemoteAddress,
    main: MainThread,
    state: RwLock<ConnectionState>,
    /// Driver handle, present from first connect until close.
    handle: RwLock<Option<Arc<dyn GattHandle>>>,
    registry: CapabilityRegistry,
    correlator: Arc<Correlator>,
    logger: GattEventLogger,
    event_tx: broadcast::Sender<ConnectionEvent>,
    closing: AtomicBool,
}

impl ConnectionSession {
    pub(crate) fn new(
        address: RemoteAddress,
        main: MainThread,
        runtime: Handle,
        registry: CapabilityRegistry,
        logger: GattEventLogger,
        event_tx: broadcast::Sender<ConnectionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            correlator: Correlator::new(address.clone(), runtime),
            address,
            main,
            state: RwLock::new(ConnectionState::Disconnected),
            handle: RwLock::new(None),
            registry,
            logger,
            event_tx,
            closing: AtomicBool::new(false),
        })
    }

    /// Get the session address.
    pub fn address(&self) -> &RemoteAddress {
        &self.address
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Get the current capability snapshot.
    pub fn capabilities(&self) -> Arc<CapabilitySnapshot> {
        self.registry.snapshot()
    }

    /// Check if the session still holds a driver handle.
    pub fn has_handle(&self) -> bool {
        self.handle.read().is_some()
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_slots() + self.correlator.active_subscriptions()
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Start connecting, creating the driver handle on first use.
    ///
    /// A session whose link is already up or coming up is left alone, so
    /// repeated connects never create a second handle.
    pub(crate) fn connect(
        self: &Arc<Self>,
        transport: &dyn Transport,
        auto_reconnect: bool,
    ) -> Result<()> {
        self.main.check()?;

        let state = self.state();
        if state.is_connected() || state == ConnectionState::Connecting {
            debug!("{} already {}", self.address, state);
            return Ok(());
        }

        let existing = self.handle.read().clone();
        self.set_state(ConnectionState::Connecting);

        match existing {
            Some(handle) => {
                info!("Reconnecting to {}", self.address);
                if !handle.reconnect() {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(Error::ConnectionFailed {
                        address: self.address.clone(),
                        reason: "driver refused to reconnect".to_string(),
                    });
                }
            }
            None => {
                info!("Connecting to {}", self.address);
                let callback = Arc::new(SessionCallback(Arc::downgrade(self)));
                match transport.connect(&self.address, auto_reconnect, callback) {
                    Ok(handle) => {
                        *self.handle.write() = Some(handle);
                        // The link may have come up before the handle was stored.
                        self.start_discovery();
                    }
                    Err(e) => {
                        self.set_state(ConnectionState::Disconnected);
                        return Err(e);
                    }
                }
            }
        }

        Ok(())
    }

    /// Tear the link down, keeping the handle for a later reconnect.
    ///
    /// Capabilities are cleared and pending requests cancelled right away,
    /// without waiting for the driver to confirm.
    pub fn disconnect(&self) -> Result<()> {
        self.main.check()?;
        let handle = self.current_handle()?;

        self.set_state(ConnectionState::Disconnecting);
        self.invalidate(CancelReason::Disconnected);
        handle.disconnect();
        Ok(())
    }

    /// Release the driver handle. Further operations fail with `Undefined`.
    pub(crate) fn release(&self) {
        let handle = self.handle.write().take();
        if let Some(handle) = handle {
            debug!("Releasing handle of {}", self.address);
            handle.close();
        }
        self.invalidate(CancelReason::Closed);
        self.set_state(ConnectionState::Disconnected);
    }

    pub(crate) fn mark_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Write `value` to every writable endpoint without expecting a reply.
    pub fn write(&self, value: &[u8]) -> Result<()> {
        let (handle, snapshot) = self.writable_target()?;
        if self.broadcast(handle.as_ref(), &snapshot, value) == 0 {
            return Err(Error::WriteRejected {
                address: self.address.clone(),
            });
        }
        Ok(())
    }

    /// Write `value` and wait for the next read or notification.
    pub fn write_await(&self, value: &[u8], timeout: Duration) -> Result<PendingReply> {
        let (handle, snapshot) = self.writable_target()?;

        let reply = self.correlator.submit_slot(timeout);
        if self.broadcast(handle.as_ref(), &snapshot, value) == 0 {
            self.correlator.discard_slot(reply.tag());
            return Err(Error::WriteRejected {
                address: self.address.clone(),
            });
        }
        Ok(reply)
    }

    /// Write `value` and collect replies starting with `opcode` until
    /// `predicate` accepts one.
    pub fn write_await_opcode(
        &self,
        value: &[u8],
        opcode: u8,
        timeout: Duration,
        predicate: ReplyPredicate,
    ) -> Result<ReplyStream> {
        let (handle, snapshot) = self.writable_target()?;

        let replies = self.correlator.submit_opcode(opcode, timeout, predicate);
        if self.broadcast(handle.as_ref(), &snapshot, value) == 0 {
            self.correlator
                .discard_subscription(opcode, replies.subscription());
            return Err(Error::WriteRejected {
                address: self.address.clone(),
            });
        }
        Ok(replies)
    }

    /// Ask the driver for the link's signal strength.
    ///
    /// The value arrives later as a `ReadRemoteRssi` event.
    pub fn read_rssi(&self) -> Result<bool> {
        self.main.check()?;
        Ok(self.current_handle()?.read_remote_rssi())
    }

    fn current_handle(&self) -> Result<Arc<dyn GattHandle>> {
        self.handle.read().clone().ok_or_else(|| Error::Undefined {
            address: self.address.clone(),
        })
    }

    fn writable_target(&self) -> Result<(Arc<dyn GattHandle>, Arc<CapabilitySnapshot>)> {
        self.main.check()?;
        let handle = self.current_handle()?;

        let state = self.state();
        if !state.is_connected() {
            return Err(Error::NotConnected {
                address: self.address.clone(),
                state,
            });
        }

        let snapshot = self.registry.snapshot();
        if snapshot.is_writable_empty() {
            return Err(Error::NotWritable {
                address: self.address.clone(),
                state,
            });
        }

        Ok((handle, snapshot))
    }

    /// Returns how many endpoints accepted the write.
    fn broadcast(&self, handle: &dyn GattHandle, snapshot: &CapabilitySnapshot, value: &[u8]) -> usize {
        let mut accepted = 0;
        for endpoint in snapshot.writable() {
            if handle.write_characteristic(endpoint, value, endpoint.write_type) {
                accepted += 1;
            } else {
                warn!(
                    "{}: write to {} was not accepted",
                    self.address, endpoint.characteristic
                );
            }
        }
        trace!("{}: wrote {} bytes to {} endpoints", self.address, value.len(), accepted);
        accepted
    }

    fn route(&self, value: Bytes) {
        let routed = self.correlator.dispatch(value);
        trace!("{}: reply routed to {:?}", self.address, routed);
    }

    fn invalidate(&self, reason: CancelReason) {
        self.registry.clear(None);
        self.correlator.cancel_all(reason);
    }

    fn on_link_state(&self, status: GattStatus, link: LinkState) {
        match link {
            LinkState::Connecting => self.set_state(ConnectionState::Connecting),
            LinkState::Connected => {
                if !status.is_success() {
                    warn!("{} connected with status {}", self.address, status);
                }
                self.set_state(ConnectionState::Connected);
                self.start_discovery();
            }
            LinkState::Disconnecting => {
                self.invalidate(CancelReason::Disconnected);
                self.set_state(ConnectionState::Disconnecting);
            }
            LinkState::Disconnected => {
                self.invalidate(CancelReason::Disconnected);
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    fn on_services_discovered(&self, status: GattStatus, services: &[GattService]) {
        let state = self.state();
        if !state.is_connected() {
            debug!("{}: ignoring discovery result while {}", self.address, state);
            return;
        }

        if !status.is_success() {
            warn!("{}: service discovery failed with status {}", self.address, status);
            self.registry.clear(None);
            self.set_state(ConnectionState::Connected);
            return;
        }

        let handle = self.handle.read().clone();
        let Some(handle) = handle else {
            return;
        };

        let snapshot = self.registry.apply(services, handle.as_ref());
        info!(
            "{} ready with {} services",
            self.address,
            snapshot.service_ids().count()
        );
        self.set_state(ConnectionState::Ready);
    }

    /// Discover services once both the link and the handle are up.
    ///
    /// Runs from the link event and from `connect`, whichever sees both
    /// last. Only the caller that moves the state out of `Connected` asks the
    /// driver, so discovery starts once per link.
    fn start_discovery(&self) {
        let handle = self.handle.read().clone();
        let Some(handle) = handle else {
            debug!("{}: link up without a handle", self.address);
            return;
        };

        if !self.advance(ConnectionState::Connected, ConnectionState::Discovering) {
            return;
        }
        if !handle.discover_services() {
            warn!("{}: service discovery was not started", self.address);
            self.advance(ConnectionState::Discovering, ConnectionState::Connected);
        }
    }

    /// Move from `from` to `to`. Returns false if the state was not `from`.
    fn advance(&self, from: ConnectionState, to: ConnectionState) -> bool {
        {
            let mut state = self.state.write();
            if *state != from {
                return false;
            }
            *state = to;
        }
        self.announce(from, to);
        true
    }

    /// Update the connection state and emit an event.
    fn set_state(&self, new_state: ConnectionState) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };
        self.announce(old_state, new_state);
    }

    fn announce(&self, old_state: ConnectionState, new_state: ConnectionState) {
        if old_state != new_state {
            debug!(
                "{}: connection state changed: {} -> {}",
                self.address, old_state, new_state
            );

            let _ = self.event_tx.send(ConnectionEvent {
                address: self.address.clone(),
                state: new_state,
            });
        }
    }
}

impl GattEventHandler for ConnectionSession {
    fn on_gatt_event(&self, event: GattEvent) {
        self.logger.log(&self.address, &event);

        match event {
            GattEvent::ConnectionStateChanged { status, state } => self.on_link_state(status, state),
            GattEvent::ServicesDiscovered { status, services } => {
                self.on_services_discovered(status, &services)
            }
            GattEvent::CharacteristicRead { status, value, .. } if status.is_success() => {
                self.route(value)
            }
            GattEvent::CharacteristicChanged { value, .. } => self.route(value),
            _ => {}
        }
    }
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("has_handle", &self.has_handle())
            .field("correlator", &self.correlator)
            .finish()
    }
}

/// Handler given to the driver. Holds the session weakly so a session that
/// was closed and dropped does not stay alive through the driver.
struct SessionCallback(Weak<ConnectionSession>);

impl GattEventHandler for SessionCallback {
    fn on_gatt_event(&self, event: GattEvent) {
        match self.0.upgrade() {
            Some(session) => session.on_gatt_event(event),
            None => trace!("dropping {} for a released session", event.tag()),
        }
    }
}
