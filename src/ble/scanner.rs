//! Scan sessions.
//!
//! At most one scan runs at a time. Starting a scan stops the previous one,
//! and every scan ends on its own after a deadline.

use btleplug::api::ScanFilter;
use futures::{ready, Stream};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::ble::transport::{DiscoveryEvent, RemoteAddress, ScanEvent, ScanEventHandler, Transport};
use crate::error::{Error, Result};

/// Why a scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanEnd {
    /// The deadline passed.
    TimedOut,
    /// Stopped explicitly or by a newer scan.
    Stopped,
    /// The platform reported a failure code.
    Failed(i32),
}

impl std::fmt::Display for ScanEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimedOut => write!(f, "timed out"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed(code) => write!(f, "failed with code {}", code),
        }
    }
}

enum ScanMessage {
    Discovered(DiscoveryEvent),
    Finished(ScanEnd),
}

type ActiveSlot = Mutex<Option<ActiveScan>>;

/// Shared state of one scan, also the handler given to the driver.
struct ScanState {
    tx: Mutex<Option<mpsc::UnboundedSender<ScanMessage>>>,
    seen: Mutex<HashSet<RemoteAddress>>,
    unique: bool,
    transport: Weak<dyn Transport>,
    active: Weak<ActiveSlot>,
}

impl ScanState {
    fn new(
        tx: mpsc::UnboundedSender<ScanMessage>,
        unique: bool,
        transport: &Arc<dyn Transport>,
        active: &Arc<ActiveSlot>,
    ) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            seen: Mutex::new(HashSet::new()),
            unique,
            transport: Arc::downgrade(transport),
            active: Arc::downgrade(active),
        }
    }

    fn is_active(&self) -> bool {
        self.tx.lock().is_some()
    }

    fn emit(&self, event: DiscoveryEvent) {
        if self.unique && !self.seen.lock().insert(event.address.clone()) {
            return;
        }
        if let Some(tx) = self.tx.lock().as_ref() {
            trace!("Discovered {}", event.address);
            let _ = tx.send(ScanMessage::Discovered(event));
        }
    }

    /// Close the stream. Returns false when it was already closed.
    fn finish(&self, reason: ScanEnd) -> bool {
        match self.tx.lock().take() {
            Some(tx) => {
                let _ = tx.send(ScanMessage::Finished(reason));
                true
            }
            None => false,
        }
    }

    /// Give up the scanner slot after a failure and stop the platform scan.
    fn release(&self) {
        let Some(active) = self.active.upgrade() else {
            return;
        };
        let current = {
            let mut active = active.lock();
            match active.as_ref() {
                Some(current) if std::ptr::eq(Arc::as_ptr(&current.state), self) => active.take(),
                _ => None,
            }
        };
        if let Some(current) = current {
            current.deadline.abort();
            if let Some(transport) = self.transport.upgrade() {
                transport.stop_scan();
            }
        }
    }
}

impl ScanEventHandler for ScanState {
    fn on_scan_event(&self, event: ScanEvent) {
        match event {
            ScanEvent::Result(event) => self.emit(event),
            ScanEvent::Batch(events) => events.into_iter().for_each(|e| self.emit(e)),
            ScanEvent::Failed { code } => {
                if self.finish(ScanEnd::Failed(code)) {
                    warn!("Scan failed with error code {}", code);
                    self.release();
                }
            }
        }
    }
}

struct ActiveScan {
    state: Arc<ScanState>,
    deadline: AbortHandle,
}

/// Runs scans on a [`Transport`].
pub struct Scanner {
    transport: Arc<dyn Transport>,
    runtime: Handle,
    filter: ScanFilter,
    active: Arc<ActiveSlot>,
}

impl Scanner {
    /// Create a scanner. Deadlines run on `runtime`.
    pub fn new(transport: Arc<dyn Transport>, runtime: Handle, filter: ScanFilter) -> Self {
        Self {
            transport,
            runtime,
            filter,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Start a scan that ends after `timeout`.
    ///
    /// A running scan is stopped first. With `unique_only`, each address is
    /// reported at most once.
    ///
    /// # Errors
    ///
    /// Returns the driver's error if the scan cannot be started.
    pub fn start_scan(&self, timeout: Duration, unique_only: bool) -> Result<ScanStream> {
        self.stop_scan();

        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(ScanState::new(tx, unique_only, &self.transport, &self.active));

        info!("Starting scan for {:?} (unique: {})", timeout, unique_only);
        self.transport
            .start_scan(self.filter.clone(), state.clone())?;

        // Held until the scan is registered so the deadline cannot run first.
        let mut slot = self.active.lock();
        if !state.is_active() {
            // Failed while starting.
            drop(slot);
            self.transport.stop_scan();
            return Ok(ScanStream { rx, end: None });
        }

        let deadline = {
            let transport = self.transport.clone();
            let active = self.active.clone();
            let state = state.clone();
            self.runtime
                .spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let expired = {
                        let mut active = active.lock();
                        match active.as_ref() {
                            Some(current) if Arc::ptr_eq(&current.state, &state) => active.take(),
                            _ => None,
                        }
                    };
                    if expired.is_some() {
                        debug!("Scan deadline reached");
                        transport.stop_scan();
                        state.finish(ScanEnd::TimedOut);
                    }
                })
                .abort_handle()
        };

        *slot = Some(ActiveScan { state, deadline });

        Ok(ScanStream { rx, end: None })
    }

    /// Stop the running scan, if any. Returns whether one was running.
    pub fn stop_scan(&self) -> bool {
        let Some(active) = self.active.lock().take() else {
            return false;
        };

        active.deadline.abort();
        self.transport.stop_scan();
        if active.state.finish(ScanEnd::Stopped) {
            info!("Scan stopped");
        }
        true
    }

    /// Check if a scan is delivering results.
    pub fn is_scanning(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .map_or(false, |active| active.state.is_active())
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.stop_scan();
    }
}

/// Results of one scan.
///
/// Ends when the scan times out, is stopped, or fails; a failure is reported
/// as a final `Err(Error::ScanFailed)` item.
#[derive(Debug)]
pub struct ScanStream {
    rx: mpsc::UnboundedReceiver<ScanMessage>,
    end: Option<ScanEnd>,
}

impl ScanStream {
    /// Why the scan ended, once the stream is exhausted.
    pub fn end_reason(&self) -> Option<ScanEnd> {
        self.end
    }
}

impl std::fmt::Debug for ScanMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discovered(event) => write!(f, "Discovered({})", event.address),
            Self::Finished(reason) => write!(f, "Finished({})", reason),
        }
    }
}

impl Stream for ScanStream {
    type Item = Result<DiscoveryEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match ready!(self.rx.poll_recv(cx)) {
            Some(ScanMessage::Discovered(event)) => Poll::Ready(Some(Ok(event))),
            Some(ScanMessage::Finished(reason)) => {
                self.end = Some(reason);
                match reason {
                    ScanEnd::Failed(code) => Poll::Ready(Some(Err(Error::ScanFailed { code }))),
                    _ => Poll::Ready(None),
                }
            }
            None => {
                if self.end.is_none() {
                    self.end = Some(ScanEnd::Stopped);
                }
                Poll::Ready(None)
            }
        }
    }
}
