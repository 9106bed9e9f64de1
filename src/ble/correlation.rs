//! Request/response correlation over a transport without request identity.
//!
//! Writes go out fire-and-forget and replies come back as plain read or
//! notification events. Two tables turn them back into request/response:
//!
//! - **Slots**: FIFO. Each request gets a local tag; the next incoming event
//!   resolves the oldest live slot, whatever its content.
//! - **Subscriptions**: keyed by the first payload byte (the opcode). Every
//!   event starting with that byte is delivered to the subscriber's stream
//!   until the subscriber's predicate accepts one.
//!
//! [`Correlator::dispatch`] consults subscriptions first and slots second.
//! Each entry owns a timer armed once at registration. An entry is resolved
//! by whoever removes it from its table, so it resolves exactly once.

use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::ble::transport::RemoteAddress;
use crate::error::{CancelReason, Error, RequestId, Result};

/// Decides whether a reply completes an opcode conversation.
pub type ReplyPredicate = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Where [`Correlator::dispatch`] routed an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Delivered to the subscription for this opcode.
    Opcode(u8),
    /// Resolved the slot with this tag.
    Slot(u64),
    /// Nobody was waiting.
    Dropped,
}

struct SlotEntry {
    reply: oneshot::Sender<Result<Bytes>>,
    timer: AbortHandle,
}

struct Subscription {
    id: u64,
    replies: mpsc::UnboundedSender<Result<Bytes>>,
    predicate: Arc<dyn Fn(&[u8]) -> bool + Send + Sync>,
    timer: AbortHandle,
}

/// Correlation tables of one session.
pub struct Correlator {
    address: RemoteAddress,
    runtime: Handle,
    slots: Mutex<BTreeMap<u64, SlotEntry>>,
    subscriptions: Mutex<HashMap<u8, Subscription>>,
    next_tag: AtomicU64,
    next_subscription: AtomicU64,
}

impl Correlator {
    /// Create empty tables. Timers run on `runtime`.
    pub fn new(address: RemoteAddress, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            address,
            runtime,
            slots: Mutex::new(BTreeMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
        })
    }

    /// Register a slot that fails with [`Error::Timeout`] after `timeout`.
    pub fn submit_slot(self: &Arc<Self>, timeout: Duration) -> PendingReply {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let (reply, rx) = oneshot::channel();

        let mut slots = self.slots.lock();
        let timer = self.arm(timeout, move |correlator| correlator.expire_slot(tag));
        slots.insert(tag, SlotEntry { reply, timer });
        drop(slots);

        trace!("{}: registered slot #{}", self.address, tag);

        PendingReply {
            address: self.address.clone(),
            tag,
            rx,
        }
    }

    /// Register a subscription for replies starting with `opcode`.
    ///
    /// The timer is not extended by replies the predicate rejects. A previous
    /// subscription on the same opcode is cancelled as superseded.
    pub fn submit_opcode(
        self: &Arc<Self>,
        opcode: u8,
        timeout: Duration,
        predicate: ReplyPredicate,
    ) -> ReplyStream {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let (replies, rx) = mpsc::unbounded_channel();

        let mut subscriptions = self.subscriptions.lock();
        let timer = self.arm(timeout, move |correlator| {
            correlator.expire_subscription(opcode, id)
        });
        let previous = subscriptions.insert(
            opcode,
            Subscription {
                id,
                replies,
                predicate: Arc::from(predicate),
                timer,
            },
        );
        drop(subscriptions);

        if let Some(previous) = previous {
            debug!(
                "{}: opcode {:#04x} subscription superseded",
                self.address, opcode
            );
            previous.timer.abort();
            let _ = previous.replies.send(Err(self.cancelled(
                RequestId::Opcode(opcode),
                CancelReason::Superseded,
            )));
        }

        trace!("{}: registered opcode {:#04x}", self.address, opcode);

        ReplyStream {
            opcode,
            subscription: id,
            rx,
        }
    }

    /// Route one incoming read or notification payload.
    pub fn dispatch(&self, data: Bytes) -> Dispatch {
        let Some(&opcode) = data.first() else {
            return Dispatch::Dropped;
        };

        let subscriber = self
            .subscriptions
            .lock()
            .get(&opcode)
            .map(|s| (s.id, s.replies.clone(), s.predicate.clone()));

        // The predicate runs unlocked and may call back into the correlator.
        if let Some((id, replies, predicate)) = subscriber {
            if replies.send(Ok(data.clone())).is_ok() {
                if predicate(&data) {
                    self.discard_subscription(opcode, id);
                    trace!("{}: opcode {:#04x} completed", self.address, opcode);
                }
                return Dispatch::Opcode(opcode);
            }
            // The stream was dropped, so nobody is listening any more.
            self.discard_subscription(opcode, id);
        }

        let mut slots = self.slots.lock();
        while let Some((tag, entry)) = slots.pop_first() {
            entry.timer.abort();
            if entry.reply.send(Ok(data.clone())).is_ok() {
                trace!("{}: slot #{} resolved", self.address, tag);
                return Dispatch::Slot(tag);
            }
            trace!("{}: slot #{} was abandoned", self.address, tag);
        }

        Dispatch::Dropped
    }

    /// Resolve every outstanding request with a cancellation error.
    ///
    /// Returns the number of requests cancelled.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let slots = std::mem::take(&mut *self.slots.lock());
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        let count = slots.len() + subscriptions.len();

        for (tag, entry) in slots {
            entry.timer.abort();
            let _ = entry
                .reply
                .send(Err(self.cancelled(RequestId::Slot(tag), reason)));
        }
        for (opcode, subscription) in subscriptions {
            subscription.timer.abort();
            let _ = subscription
                .replies
                .send(Err(self.cancelled(RequestId::Opcode(opcode), reason)));
        }

        if count > 0 {
            debug!(
                "{}: cancelled {} pending requests ({})",
                self.address, count, reason
            );
        }
        count
    }

    /// Remove a slot without resolving it.
    pub(crate) fn discard_slot(&self, tag: u64) {
        if let Some(entry) = self.slots.lock().remove(&tag) {
            entry.timer.abort();
        }
    }

    /// Remove a subscription without resolving it, if it is still `id`.
    pub(crate) fn discard_subscription(&self, opcode: u8, id: u64) {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.get(&opcode).map(|s| s.id) == Some(id) {
            if let Some(subscription) = subscriptions.remove(&opcode) {
                subscription.timer.abort();
            }
        }
    }

    /// Number of outstanding slots.
    pub fn pending_slots(&self) -> usize {
        self.slots.lock().len()
    }

    /// Number of live opcode subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Check if an opcode has a live subscription.
    pub fn is_subscribed(&self, opcode: u8) -> bool {
        self.subscriptions.lock().contains_key(&opcode)
    }

    fn arm<F>(self: &Arc<Self>, timeout: Duration, on_expiry: F) -> AbortHandle
    where
        F: FnOnce(&Correlator) + Send + 'static,
    {
        let correlator: Weak<Correlator> = Arc::downgrade(self);
        self.runtime
            .spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(correlator) = correlator.upgrade() {
                    on_expiry(&correlator);
                }
            })
            .abort_handle()
    }

    fn expire_slot(&self, tag: u64) {
        let entry = self.slots.lock().remove(&tag);
        if let Some(entry) = entry {
            debug!("{}: slot #{} timed out", self.address, tag);
            let _ = entry.reply.send(Err(Error::Timeout {
                address: self.address.clone(),
                request: RequestId::Slot(tag),
            }));
        }
    }

    fn expire_subscription(&self, opcode: u8, id: u64) {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.get(&opcode).map(|s| s.id) != Some(id) {
            return;
        }
        if let Some(subscription) = subscriptions.remove(&opcode) {
            drop(subscriptions);
            debug!("{}: opcode {:#04x} timed out", self.address, opcode);
            let _ = subscription.replies.send(Err(Error::Timeout {
                address: self.address.clone(),
                request: RequestId::Opcode(opcode),
            }));
        }
    }

    fn cancelled(&self, request: RequestId, reason: CancelReason) -> Error {
        Error::Cancelled {
            address: self.address.clone(),
            request,
            reason,
        }
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.cancel_all(CancelReason::Closed);
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("address", &self.address)
            .field("pending_slots", &self.pending_slots())
            .field("active_subscriptions", &self.active_subscriptions())
            .finish()
    }
}

/// Reply to a slot request.
///
/// Resolves with the next payload routed to this slot, or with a timeout or
/// cancellation error. Dropping it abandons the request.
#[derive(Debug)]
pub struct PendingReply {
    address: RemoteAddress,
    tag: u64,
    rx: oneshot::Receiver<Result<Bytes>>,
}

impl PendingReply {
    /// Local tag of this request.
    pub fn tag(&self) -> u64 {
        self.tag
    }
}

impl Future for PendingReply {
    type Output = Result<Bytes>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled {
                address: self.address.clone(),
                request: RequestId::Slot(self.tag),
                reason: CancelReason::Closed,
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Replies to an opcode subscription.
///
/// Yields every payload starting with the opcode, ends after the payload
/// the predicate accepts, or after a single timeout or cancellation error.
#[derive(Debug)]
pub struct ReplyStream {
    opcode: u8,
    subscription: u64,
    rx: mpsc::UnboundedReceiver<Result<Bytes>>,
}

impl ReplyStream {
    /// The opcode this stream listens to.
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub(crate) fn subscription(&self) -> u64 {
        self.subscription
    }
}

impl Stream for ReplyStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::time::Instant;

    fn correlator() -> Arc<Correlator> {
        Correlator::new(RemoteAddress::from("AA:BB:CC:DD:EE:FF"), Handle::current())
    }

    fn payload(bytes: &[u8]) -> Bytes {
        Bytes::copy_from_slice(bytes)
    }

    #[tokio::test(start_paused = true)]
    async fn test_slots_resolve_in_submission_order() {
        let c = correlator();
        let first = c.submit_slot(Duration::from_secs(5));
        let second = c.submit_slot(Duration::from_secs(5));
        let third = c.submit_slot(Duration::from_secs(5));
        assert!(first.tag() < second.tag() && second.tag() < third.tag());

        assert_eq!(c.dispatch(payload(&[0x10])), Dispatch::Slot(first.tag()));
        assert_eq!(c.dispatch(payload(&[0x20])), Dispatch::Slot(second.tag()));
        assert_eq!(c.dispatch(payload(&[0x30])), Dispatch::Slot(third.tag()));

        assert_eq!(&first.await.unwrap()[..], &[0x10]);
        assert_eq!(&second.await.unwrap()[..], &[0x20]);
        assert_eq!(&third.await.unwrap()[..], &[0x30]);
        assert_eq!(c.pending_slots(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opcode_stream_ends_on_predicate() {
        let c = correlator();
        let stream = c.submit_opcode(0x05, Duration::from_secs(5), Box::new(|d| d.get(1) == Some(&0xFF)));

        assert_eq!(c.dispatch(payload(&[0x05, 0x01])), Dispatch::Opcode(0x05));
        assert_eq!(c.dispatch(payload(&[0x05, 0x02])), Dispatch::Opcode(0x05));
        assert_eq!(c.dispatch(payload(&[0x05, 0xFF])), Dispatch::Opcode(0x05));
        assert!(!c.is_subscribed(0x05));
        // Late reply after completion goes nowhere.
        assert_eq!(c.dispatch(payload(&[0x05, 0x03])), Dispatch::Dropped);

        let replies: Vec<Vec<u8>> = stream.map(|r| r.unwrap().to_vec()).collect().await;
        assert_eq!(replies, vec![vec![0x05, 0x01], vec![0x05, 0x02], vec![0x05, 0xFF]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opcode_takes_precedence_over_slot() {
        let c = correlator();
        let slot = c.submit_slot(Duration::from_secs(5));
        let mut stream = c.submit_opcode(0x07, Duration::from_secs(5), Box::new(|_| true));

        assert_eq!(c.dispatch(payload(&[0x07, 0xAA])), Dispatch::Opcode(0x07));
        assert_eq!(c.dispatch(payload(&[0x01])), Dispatch::Slot(slot.tag()));

        assert_eq!(&stream.next().await.unwrap().unwrap()[..], &[0x07, 0xAA]);
        assert!(stream.next().await.is_none());
        assert_eq!(&slot.await.unwrap()[..], &[0x01]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_timeout_resolves_once() {
        let c = correlator();
        let reply = c.submit_slot(Duration::from_millis(100));
        let tag = reply.tag();

        let err = reply.await.unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout { request: RequestId::Slot(t), .. } if t == tag
        ));
        assert_eq!(c.pending_slots(), 0);
        assert_eq!(c.dispatch(payload(&[0x01])), Dispatch::Dropped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opcode_timer_is_not_extended_by_partial_replies() {
        let c = correlator();
        let start = Instant::now();
        let stream = c.submit_opcode(0x09, Duration::from_millis(100), Box::new(|_| false));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(c.dispatch(payload(&[0x09, 0x01])), Dispatch::Opcode(0x09));

        let items: Vec<Result<Bytes>> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(&items[0].as_ref().unwrap()[..], &[0x09, 0x01]);
        assert!(items[1].as_ref().unwrap_err().is_timeout());
        assert!(start.elapsed() < Duration::from_millis(150));
        assert!(!c.is_subscribed(0x09));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let c = correlator();
        let a = c.submit_slot(Duration::from_secs(5));
        let b = c.submit_slot(Duration::from_secs(5));
        let mut s = c.submit_opcode(0x02, Duration::from_secs(5), Box::new(|_| true));

        assert_eq!(c.cancel_all(CancelReason::Disconnected), 3);

        for err in [a.await.unwrap_err(), b.await.unwrap_err()] {
            assert!(matches!(
                err,
                Error::Cancelled {
                    reason: CancelReason::Disconnected,
                    ..
                }
            ));
        }
        assert!(s.next().await.unwrap().unwrap_err().is_cancelled());
        assert!(s.next().await.is_none());
        assert_eq!(c.cancel_all(CancelReason::Disconnected), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_slot_is_skipped() {
        let c = correlator();
        let abandoned = c.submit_slot(Duration::from_secs(5));
        let live = c.submit_slot(Duration::from_secs(5));
        drop(abandoned);

        assert_eq!(c.dispatch(payload(&[0x42])), Dispatch::Slot(live.tag()));
        assert_eq!(&live.await.unwrap()[..], &[0x42]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_subscription_falls_through() {
        let c = correlator();
        let stream = c.submit_opcode(0x03, Duration::from_secs(5), Box::new(|_| false));
        let slot = c.submit_slot(Duration::from_secs(5));
        drop(stream);

        assert_eq!(c.dispatch(payload(&[0x03])), Dispatch::Slot(slot.tag()));
        assert!(!c.is_subscribed(0x03));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_supersedes() {
        let c = correlator();
        let mut old = c.submit_opcode(0x04, Duration::from_secs(5), Box::new(|_| true));
        let mut new = c.submit_opcode(0x04, Duration::from_secs(5), Box::new(|_| true));

        assert!(matches!(
            old.next().await.unwrap().unwrap_err(),
            Error::Cancelled {
                reason: CancelReason::Superseded,
                ..
            }
        ));
        assert!(old.next().await.is_none());

        c.dispatch(payload(&[0x04, 0x00]));
        assert!(new.next().await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_may_query_the_correlator() {
        let c = correlator();
        let weak = Arc::downgrade(&c);
        let stream = c.submit_opcode(
            0x07,
            Duration::from_secs(5),
            Box::new(move |_| {
                weak.upgrade()
                    .map_or(true, |c| c.is_subscribed(0x07) && c.pending_slots() == 0)
            }),
        );

        assert_eq!(c.dispatch(payload(&[0x07, 0x01])), Dispatch::Opcode(0x07));
        assert!(!c.is_subscribed(0x07));
        assert_eq!(stream.collect::<Vec<_>>().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_payload_is_dropped() {
        let c = correlator();
        let _slot = c.submit_slot(Duration::from_secs(5));
        assert_eq!(c.dispatch(Bytes::new()), Dispatch::Dropped);
        assert_eq!(c.pending_slots(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_outstanding() {
        let c = correlator();
        let reply = c.submit_slot(Duration::from_secs(5));
        drop(c);
        assert!(reply.await.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard() {
        let c = correlator();
        let reply = c.submit_slot(Duration::from_secs(5));
        let stream = c.submit_opcode(0x01, Duration::from_secs(5), Box::new(|_| true));

        c.discard_subscription(0x01, stream.subscription() + 1);
        assert!(c.is_subscribed(0x01));
        c.discard_subscription(0x01, stream.subscription());
        c.discard_slot(reply.tag());

        assert_eq!(c.pending_slots(), 0);
        assert_eq!(c.active_subscriptions(), 0);
    }
}
