//! # Pending Calls
//!
//! The registry of in-flight calls for one connection, keyed by sequence id.
//!
//! A call is registered before its frame is sent and leaves the table exactly
//! once: when a matching response arrives, when its deadline elapses, or when
//! the connection closes. Leaving the table is a `DashMap::remove`, so when a
//! late reply races the timeout only the first remover acts and every other
//! attempt finds nothing and does nothing.
//!
//! ## Invariants
//!
//! - A sequence id is never handed out while a call holding it is pending.
//! - Every registration arms a timer; a call never outlives its deadline.
//! - Timers carry the ticket of the registration that armed them, so a stale timer
//!   cannot evict a newer call that reused the same sequence id.
//! - Responses are matched on `(seq, method)`; a method mismatch resolves the call
//!   with `ProtocolMismatch` instead of the decoded value.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use meshframe::FrameKind;
use meshframe::SeqId;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Error;
use crate::error::Result;
use crate::service;
use crate::transport::Address;

/// A response that passed the method echo check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response<P> {
    Reply(P),
    Exception(P),
}

impl<P> Response<P> {
    pub fn map<Q>(self, f: impl FnOnce(P) -> Q) -> Response<Q> {
        match self {
            Self::Reply(payload) => Response::Reply(f(payload)),
            Self::Exception(payload) => Response::Exception(f(payload)),
        }
    }
}

/// Turns a response into the caller's result.
pub type Decoder<T> = Box<dyn FnOnce(Response<&[u8]>) -> Result<T> + Send + Sync>;

/// One response gathered for a fan-out call.
#[derive(Debug)]
pub struct Gathered {
    pub from: Address,
    /// The response, or the protocol error it amounted to.
    pub outcome: Result<Response<Vec<u8>>>,
}

type Completion = Box<dyn FnOnce(Result<Response<&[u8]>>) + Send + Sync>;

/// A reserved place under the in-flight limit, released when dropped.
struct Slot(Arc<AtomicUsize>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

enum Waiter {
    /// Resolved by the first response; leaves the table with it.
    Single(Completion),
    /// Collects one response per node until completed, timed out or closed.
    Gather(mpsc::UnboundedSender<Gathered>),
}

struct PendingCall {
    ticket: u64,
    method: String,
    timeout: Duration,
    deadline: Instant,
    waiter: Waiter,
    timer: Option<AbortHandle>,
    slot: Option<Slot>,
}

impl PendingCall {
    fn is_single(&self) -> bool {
        matches!(self.waiter, Waiter::Single(_))
    }

    /// Ends the call with `outcome`. Gather calls just close their channel.
    ///
    /// The in-flight slot is released before the waiter wakes.
    fn finish(self, outcome: Result<Response<&[u8]>>) {
        let waiter = self.release();
        match waiter {
            Waiter::Single(complete) => complete(outcome),
            Waiter::Gather(tx) => drop(tx),
        }
    }

    /// Leaves the table without an outcome. A single waiter sees its channel close.
    fn discard(self) {
        drop(self.release());
    }

    fn release(self) -> Waiter {
        let PendingCall { waiter, timer, slot, .. } = self;
        if let Some(timer) = timer {
            timer.abort();
        }
        drop(slot);
        waiter
    }
}

struct Inner {
    calls: DashMap<SeqId, PendingCall>,
    next_seq: AtomicI32,
    next_ticket: AtomicU64,
    limit: Option<usize>,
    inflight: Arc<AtomicUsize>,
}

impl Inner {
    fn evict_expired(&self, seq: SeqId, ticket: u64) {
        let Some((_, call)) = self.calls.remove_if(&seq, |_, call| call.ticket == ticket) else {
            return;
        };
        debug!(%seq, method = %call.method, "pending call timed out");
        let error = Error::TimedOut { method: call.method.clone(), after: call.timeout };
        call.finish(Err(error));
    }
}

/// Thread-safe table of in-flight calls for one connection.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct PendingCalls {
    inner: Arc<Inner>,
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::build(SeqId(1), None)
    }

    /// Creates a registry whose first sequence id is `first`.
    pub fn starting_at(first: SeqId) -> Self {
        Self::build(first, None)
    }

    /// Creates a registry that refuses registrations beyond `limit` in-flight calls.
    ///
    /// The limit is exact under concurrent registration: each call reserves its
    /// place before entering the table and releases it on leaving.
    pub fn with_limit(limit: usize) -> Self {
        Self::build(SeqId(1), Some(limit))
    }

    fn build(first: SeqId, limit: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                calls: DashMap::new(),
                next_seq: AtomicI32::new(first.0.max(0)),
                next_ticket: AtomicU64::new(1),
                limit,
                inflight: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Number of calls currently in flight.
    pub fn len(&self) -> usize {
        self.inner.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.calls.is_empty()
    }

    pub fn contains(&self, seq: SeqId) -> bool {
        self.inner.calls.contains_key(&seq)
    }

    /// Deadline of a pending call.
    pub fn deadline(&self, seq: SeqId) -> Option<Instant> {
        self.inner.calls.get(&seq).map(|call| call.deadline)
    }

    /// Allocates the next sequence id.
    ///
    /// Ids increase monotonically from the starting id and wrap from `i32::MAX`
    /// back to 0. Fails with `SeqIdExhausted` if the id is still in use.
    pub fn next_seq_id(&self) -> Result<SeqId> {
        let advance = |cur: i32| Some(if cur == i32::MAX { 0 } else { cur + 1 });
        let seq = match self.inner.next_seq.fetch_update(Ordering::Relaxed, Ordering::Relaxed, advance) {
            Ok(prev) | Err(prev) => SeqId(prev),
        };

        if self.inner.calls.contains_key(&seq) {
            return Err(Error::SeqIdExhausted(seq));
        }
        Ok(seq)
    }

    /// Registers a call answered by a single response and arms its timer.
    ///
    /// Must be called before the call frame is sent.
    pub fn register<T: Send + 'static>(
        &self,
        seq: SeqId,
        method: &str,
        decoder: Decoder<T>,
        timeout: Duration,
    ) -> Result<PendingReply<T>> {
        let (tx, rx) = oneshot::channel();
        let complete: Completion = Box::new(move |outcome: Result<Response<&[u8]>>| {
            let result = outcome.and_then(decoder);
            // the caller may have stopped waiting
            let _ = tx.send(result);
        });

        self.insert(seq, method, Waiter::Single(complete), timeout)?;
        Ok(PendingReply { seq, rx })
    }

    /// Registers a fan-out call. Every response for `seq` is forwarded on the
    /// returned channel, which closes when the call completes, times out, or
    /// the connection closes.
    pub fn register_gather(
        &self,
        seq: SeqId,
        method: &str,
        timeout: Duration,
    ) -> Result<mpsc::UnboundedReceiver<Gathered>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.insert(seq, method, Waiter::Gather(tx), timeout)?;
        Ok(rx)
    }

    fn insert(&self, seq: SeqId, method: &str, waiter: Waiter, timeout: Duration) -> Result<()> {
        let slot = self.reserve()?;

        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;

        match self.inner.calls.entry(seq) {
            Entry::Occupied(_) => return Err(Error::SeqIdExhausted(seq)),
            Entry::Vacant(vacant) => {
                vacant.insert(PendingCall {
                    ticket,
                    method: method.to_string(),
                    timeout,
                    deadline,
                    waiter,
                    timer: None,
                    slot,
                });
            }
        }

        // Armed after insertion so that even a zero timeout finds the entry.
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.evict_expired(seq, ticket);
            }
        });

        if let Some(mut call) = self.inner.calls.get_mut(&seq) {
            if call.ticket == ticket {
                call.timer = Some(timer.abort_handle());
            }
        }

        debug!(%seq, method, ?timeout, "registered pending call");
        Ok(())
    }

    fn reserve(&self) -> Result<Option<Slot>> {
        let Some(limit) = self.inner.limit else {
            return Ok(None);
        };
        self.inner
            .inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .map_err(|_| Error::Overloaded { limit })?;
        Ok(Some(Slot(self.inner.inflight.clone())))
    }

    /// Routes a response to its pending call.
    ///
    /// Returns `false` when no call is waiting on `seq`; the frame is dropped.
    /// That is normal for replies arriving after a timeout.
    pub fn resolve(&self, seq: SeqId, method: &str, from: &Address, kind: FrameKind, payload: &[u8]) -> bool {
        if let Some((_, call)) = self.inner.calls.remove_if(&seq, |_, call| call.is_single()) {
            debug!(%seq, method, %from, %kind, "resolving pending call");
            let outcome = classify(seq, &call.method, method, kind, payload);
            call.finish(outcome);
            return true;
        }

        if let Some(call) = self.inner.calls.get(&seq) {
            if let Waiter::Gather(tx) = &call.waiter {
                let outcome = classify(seq, &call.method, method, kind, payload)
                    .map(|response| response.map(<[u8]>::to_vec));
                let _ = tx.send(Gathered { from: from.clone(), outcome });
                return true;
            }
        }

        debug!(%seq, method, %from, "unregistered reply, dropping");
        false
    }

    /// Completes a fan-out call, closing its channel. Returns whether it was pending.
    pub fn complete(&self, seq: SeqId) -> bool {
        let Some((_, call)) = self.inner.calls.remove_if(&seq, |_, call| !call.is_single()) else {
            return false;
        };
        debug!(%seq, method = %call.method, "completed fan-out call");
        call.discard();
        true
    }

    /// Withdraws a call whose frame never left, without resolving it.
    pub fn cancel(&self, seq: SeqId) -> bool {
        let Some((_, call)) = self.inner.calls.remove(&seq) else {
            return false;
        };
        debug!(%seq, method = %call.method, "cancelled pending call");
        call.discard();
        true
    }

    /// Times out a call now, whatever its deadline.
    ///
    /// A no-op if the call was already resolved.
    pub fn evict_on_timeout(&self, seq: SeqId) -> bool {
        let Some((_, call)) = self.inner.calls.remove(&seq) else {
            return false;
        };
        debug!(%seq, method = %call.method, "evicting pending call on timeout");
        let error = Error::TimedOut { method: call.method.clone(), after: call.timeout };
        call.finish(Err(error));
        true
    }

    /// Fails every pending call with `ConnectionClosed`. Returns how many were evicted.
    pub fn evict_all(&self, reason: &str) -> usize {
        let keys: Vec<SeqId> = self.inner.calls.iter().map(|e| *e.key()).collect();
        let mut evicted = 0;
        for key in keys {
            if let Some((_, call)) = self.inner.calls.remove(&key) {
                call.finish(Err(Error::ConnectionClosed(reason.to_string())));
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, reason, "evicted all pending calls");
        }
        evicted
    }
}

/// Checks a response against the call it claims to answer.
fn classify<'p>(
    seq: SeqId,
    expected: &str,
    received: &str,
    kind: FrameKind,
    payload: &'p [u8],
) -> Result<Response<&'p [u8]>> {
    if expected != received {
        return Err(Error::ProtocolMismatch {
            seq,
            expected: expected.to_string(),
            received: received.to_string(),
        });
    }
    match kind {
        FrameKind::Call => Err(Error::ProtocolMismatch {
            seq,
            expected: expected.to_string(),
            received: format!("{} frame", kind),
        }),
        FrameKind::Reply => Ok(Response::Reply(payload)),
        FrameKind::Exception if service::is_unknown_method(payload) => {
            Err(Error::MethodNotServed { method: expected.to_string() })
        }
        FrameKind::Exception => Ok(Response::Exception(payload)),
    }
}

/// The caller's handle on a registered call. Resolves exactly once.
#[derive(Debug)]
pub struct PendingReply<T> {
    seq: SeqId,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> PendingReply<T> {
    pub fn seq(&self) -> SeqId {
        self.seq
    }
}

impl<T> Future for PendingReply<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::ConnectionClosed("registry dropped".into()))),
            Poll::Pending => Poll::Pending,
        }
    }
}
