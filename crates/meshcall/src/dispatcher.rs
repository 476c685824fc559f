//! # Call Dispatcher
//!
//! Builds call frames, hands them to the transport, and routes inbound frames:
//! responses to the pending-call table, calls to local handlers.
//!
//! ## Call shapes
//!
//! - **Fan-out** (`call`): one sequence id, one frame, many responders. Responses are
//!   gathered into a per-node map until every expected node has answered, the
//!   transport delivers a batch, or the deadline passes. What arrived by then is the
//!   result; a node that stayed silent is simply absent.
//! - **Failover** (`call_one`): candidates from the node registry, tried strictly one
//!   after another with a fresh sequence id per attempt. Failures quarantine the node
//!   and move on; the first success or remote application error ends the call.
//!
//! ## Invariants
//!
//! - A call is registered before its frame is sent.
//! - Inbound frames never crash the dispatcher. Malformed frames are logged and dropped.
//! - A reply echoes the method name and sequence id of the call it answers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use meshframe::FrameHeader;
use meshframe::FrameKind;
use meshframe::SeqId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::builder::DispatcherBuilder;
use crate::builder::DispatcherConfig;
use crate::codec::Codec;
use crate::error::Error;
use crate::error::Result;
use crate::membership::Membership;
use crate::nodes::NodeRegistry;
use crate::pending::Decoder;
use crate::pending::Gathered;
use crate::pending::PendingCalls;
use crate::pending::Response;
use crate::service;
use crate::service::Handler;
use crate::transport::Address;
use crate::transport::CallOptions;
use crate::transport::Inbound;
use crate::transport::Recipients;
use crate::transport::ResponseMode;
use crate::transport::SendHints;
use crate::transport::Transport;

/// Per-node results of a fan-out call. Nodes that did not answer in time are absent.
pub type FanOut<T> = HashMap<Address, Result<T>>;

struct Inner {
    local: Address,
    transport: Arc<dyn Transport>,
    pending: PendingCalls,
    nodes: Arc<NodeRegistry>,
    handlers: DashMap<String, Arc<dyn Handler>>,
    config: DispatcherConfig,
}

/// RPC dispatcher for one connection. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    pub(crate) fn from_parts(
        local: Address,
        transport: Arc<dyn Transport>,
        pending: PendingCalls,
        nodes: Arc<NodeRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                local,
                transport,
                pending,
                nodes,
                handlers: DashMap::new(),
                config,
            }),
        }
    }

    pub fn local_address(&self) -> &Address {
        &self.inner.local
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.inner.nodes
    }

    pub fn pending(&self) -> &PendingCalls {
        &self.inner.pending
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    //  Callee side
    // ------------------------------------------------------------------

    /// Serves `method` locally with `handler`, replacing any previous handler.
    pub fn serve(&self, method: impl Into<String>, handler: impl Handler) {
        self.inner.handlers.insert(method.into(), Arc::new(handler));
    }

    pub fn withdraw(&self, method: &str) -> bool {
        self.inner.handlers.remove(method).is_some()
    }

    /// Methods served locally, sorted. This is what a node announces.
    pub fn served_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.inner.handlers.iter().map(|e| e.key().clone()).collect();
        methods.sort();
        methods
    }

    async fn answer(&self, from: Address, method: String, seq: SeqId, payload: Vec<u8>) {
        let handler = self.inner.handlers.get(&method).map(|h| h.value().clone());

        let frame = match handler {
            Some(handler) => match handler.handle(&from, &payload).await {
                Ok(result) => meshframe::encode_reply(&method, seq, &result),
                Err(e) => {
                    debug!(%seq, method = %method, caller = %from, error = %e, "handler raised");
                    meshframe::encode_exception(&method, seq, &e.to_payload())
                }
            },
            None => {
                warn!(%seq, method = %method, caller = %from, "call for a method this node does not serve");
                meshframe::encode_exception(&method, seq, service::UNKNOWN_METHOD)
            }
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%seq, method = %method, error = %e, "failed to encode response");
                return;
            }
        };

        let hints = SendHints {
            mode: ResponseMode::WaitForAll,
            loopback: true,
            timeout: self.inner.config.default_timeout,
        };
        if let Err(e) = self.inner.transport.send(&Recipients::one(from.clone()), &frame, &hints).await {
            warn!(%seq, method = %method, caller = %from, error = %e, "failed to send response");
        }
    }

    // ------------------------------------------------------------------
    //  Inbound
    // ------------------------------------------------------------------

    /// Entry point for every frame a transport receives.
    pub fn on_frame_received(&self, bytes: &[u8], from: &Address) {
        let header = match FrameHeader::decode(bytes) {
            Ok(header) => header,
            Err(e) => {
                warn!(%from, error = %e, len = bytes.len(), "dropping malformed frame");
                return;
            }
        };

        match header.kind {
            FrameKind::Call => {
                let this = self.clone();
                let from = from.clone();
                let method = header.method.to_string();
                let payload = header.payload.to_vec();
                let seq = header.seq;
                tokio::spawn(async move { this.answer(from, method, seq, payload).await });
            }
            FrameKind::Reply | FrameKind::Exception => {
                self.inner
                    .pending
                    .resolve(header.seq, header.method, from, header.kind, header.payload);
            }
        }
    }

    /// Entry point for transports that gather all responses to a multicast themselves.
    ///
    /// Each response is routed as if received alone; then every fan-out call the
    /// batch answered is completed.
    pub fn on_batch_received(&self, replies: Vec<(Address, Vec<u8>)>) {
        let mut answered: Vec<SeqId> = Vec::new();

        for (from, bytes) in &replies {
            let header = match FrameHeader::decode(bytes) {
                Ok(header) if header.kind.is_response() => header,
                Ok(header) => {
                    warn!(%from, kind = %header.kind, "dropping non-response frame in batch");
                    continue;
                }
                Err(e) => {
                    warn!(%from, error = %e, "dropping malformed frame in batch");
                    continue;
                }
            };
            self.inner
                .pending
                .resolve(header.seq, header.method, from, header.kind, header.payload);
            if !answered.contains(&header.seq) {
                answered.push(header.seq);
            }
        }

        for seq in answered {
            self.inner.pending.complete(seq);
        }
    }

    /// Fails everything in flight on this connection. Returns how many calls were evicted.
    pub fn on_connection_closed(&self, reason: &str) -> usize {
        let evicted = self.inner.pending.evict_all(reason);
        info!(reason, evicted, "connection closed");
        evicted
    }

    pub fn handle_inbound(&self, event: Inbound) {
        match event {
            Inbound::Frame { from, bytes } => self.on_frame_received(&bytes, &from),
            Inbound::Batch { replies } => self.on_batch_received(replies),
            Inbound::Closed { reason } => {
                self.on_connection_closed(&reason);
            }
        }
    }

    /// Spawns a task draining `rx` into the dispatcher.
    ///
    /// When the stream ends, every pending call is failed with `ConnectionClosed`.
    pub fn spawn_pump(&self, mut rx: mpsc::UnboundedReceiver<Inbound>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                this.handle_inbound(event);
            }
            this.on_connection_closed("inbound stream closed");
        })
    }

    /// Spawns a task pruning the node registry on every membership change.
    pub fn track_membership(&self, source: &dyn Membership) -> JoinHandle<()> {
        let nodes = self.inner.nodes.clone();
        let mut view = source.subscribe();
        tokio::spawn(async move {
            loop {
                let members = view.borrow_and_update().clone();
                nodes.retain(&members);
                if view.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// Announces the locally served methods to this dispatcher's own registry.
    pub fn announce_self(&self) {
        self.inner.nodes.announce(&self.inner.local, self.served_methods());
    }

    // ------------------------------------------------------------------
    //  Caller side
    // ------------------------------------------------------------------

    fn effective_timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.inner.config.default_timeout)
    }

    /// Fan-out call.
    ///
    /// Resolves with the responses that arrived before the deadline (possibly none).
    /// Fails outright only when the frame cannot be built or handed to the transport.
    pub async fn call<A, C>(
        &self,
        recipients: Recipients,
        method: &str,
        args: &A,
        codec: &C,
        timeout: Option<Duration>,
        opts: CallOptions,
    ) -> Result<FanOut<C::Output>>
    where
        A: ?Sized,
        C: Codec<A>,
    {
        meshframe::check_method(method).map_err(Error::InvalidCall)?;
        let timeout = opts.timeout.unwrap_or_else(|| self.effective_timeout(timeout));
        let payload = codec.encode(args)?;

        let expected = recipients.expected(&self.inner.local, opts.loopback);
        if expected.as_ref().is_some_and(|expected| expected.is_empty()) {
            return Ok(HashMap::new());
        }

        let seq = self.inner.pending.next_seq_id()?;
        let frame = meshframe::encode_call(method, seq, &payload).map_err(Error::InvalidCall)?;
        let mut responses = self.inner.pending.register_gather(seq, method, timeout)?;

        let hints = SendHints { mode: opts.mode, loopback: opts.loopback, timeout };
        if let Err(e) = self.inner.transport.send(&recipients, &frame, &hints).await {
            self.inner.pending.cancel(seq);
            warn!(%seq, method, error = %e, "fan-out send failed");
            return Err(e.into());
        }

        let mut results: FanOut<C::Output> = HashMap::new();
        while let Some(Gathered { from, outcome }) = responses.recv().await {
            if recipients.is_excluded(&from) {
                warn!(%seq, method, node = %from, "ignoring response from excluded node");
                continue;
            }

            let result = match outcome {
                Ok(Response::Reply(body)) => match codec.decode(&body) {
                    Ok(value) => Ok(value),
                    Err(e) => {
                        warn!(%seq, method, node = %from, error = %e, "dropping undecodable response");
                        continue;
                    }
                },
                Ok(Response::Exception(body)) => Err(Error::Application(codec.decode_exception(&body))),
                Err(e) => Err(e),
            };

            if result.is_ok() || result.as_ref().is_err_and(Error::is_application) {
                self.inner.nodes.mark_success(&from);
            }
            results.entry(from).or_insert(result);

            if opts.mode == ResponseMode::WaitForFirst {
                break;
            }
            if let Some(expected) = &expected {
                if expected.iter().all(|node| results.contains_key(node)) {
                    break;
                }
            }
        }

        self.inner.pending.complete(seq);
        debug!(%seq, method, responders = results.len(), "fan-out call finished");
        Ok(results)
    }

    /// Fan-out to every healthy node that advertises `method`.
    pub async fn call_serving<A, C>(
        &self,
        method: &str,
        args: &A,
        codec: &C,
        timeout: Option<Duration>,
        opts: CallOptions,
    ) -> Result<FanOut<C::Output>>
    where
        A: ?Sized,
        C: Codec<A>,
    {
        let candidates = self.inner.nodes.candidates_for(method);
        if candidates.is_empty() {
            return Ok(HashMap::new());
        }
        self.call(Recipients::to(candidates), method, args, codec, timeout, opts).await
    }

    /// Single-target call to `target`, without failover.
    pub async fn call_node<A, C>(
        &self,
        target: &Address,
        method: &str,
        args: &A,
        codec: &C,
        timeout: Option<Duration>,
    ) -> Result<C::Output>
    where
        A: ?Sized,
        C: Codec<A>,
    {
        meshframe::check_method(method).map_err(Error::InvalidCall)?;
        let payload = codec.encode(args)?;
        let timeout = self.effective_timeout(timeout);
        self.attempt(target, method, &payload, decoder_for::<A, C>(codec), timeout).await
    }

    /// Failover call: tries healthy candidates for `method` one at a time.
    ///
    /// Returns the first success, or the first remote application error (which is
    /// not retried), or `AllNodesFailed` once every candidate has failed.
    /// A call that cannot be built or encoded fails before any node is chosen,
    /// leaving node health untouched.
    pub async fn call_one<A, C>(
        &self,
        method: &str,
        args: &A,
        codec: &C,
        timeout: Option<Duration>,
    ) -> Result<C::Output>
    where
        A: ?Sized,
        C: Codec<A>,
    {
        meshframe::check_method(method).map_err(Error::InvalidCall)?;
        let payload = codec.encode(args)?;

        let candidates = self.inner.nodes.candidates_for(method);
        if candidates.is_empty() {
            return Err(Error::NoNodesAvailable { method: method.to_string() });
        }

        let timeout = self.effective_timeout(timeout);
        let mut failures: Vec<(Address, Error)> = Vec::new();

        for candidate in candidates {
            match self.attempt(&candidate, method, &payload, decoder_for::<A, C>(codec), timeout).await {
                Ok(value) => {
                    self.inner.nodes.mark_success(&candidate);
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    if matches!(e, Error::MethodNotServed { .. }) {
                        warn!(method, node = %candidate, "stale capability advertisement, node does not serve method");
                    } else {
                        warn!(method, node = %candidate, error = %e, "attempt failed, trying next candidate");
                    }
                    self.inner.nodes.mark_failed(&candidate);
                    failures.push((candidate, e));
                }
                Err(e) => {
                    if e.is_application() {
                        self.inner.nodes.mark_success(&candidate);
                    }
                    return Err(e);
                }
            }
        }

        Err(Error::AllNodesFailed { method: method.to_string(), failures })
    }

    async fn attempt<T: Send + 'static>(
        &self,
        target: &Address,
        method: &str,
        payload: &[u8],
        decoder: Decoder<T>,
        timeout: Duration,
    ) -> Result<T> {
        let seq = self.inner.pending.next_seq_id()?;
        let frame = meshframe::encode_call(method, seq, payload).map_err(Error::InvalidCall)?;
        let reply = self.inner.pending.register(seq, method, decoder, timeout)?;

        let hints = SendHints { mode: ResponseMode::WaitForFirst, loopback: true, timeout };
        if let Err(e) = self.inner.transport.send(&Recipients::one(target.clone()), &frame, &hints).await {
            self.inner.pending.cancel(seq);
            return Err(e.into());
        }

        reply.await
    }
}

/// Builds the per-call decoder from a codec.
fn decoder_for<A, C>(codec: &C) -> Decoder<C::Output>
where
    A: ?Sized,
    C: Codec<A>,
{
    let codec = codec.clone();
    Box::new(move |response: Response<&[u8]>| match response {
        Response::Reply(payload) => codec.decode(payload).map_err(Error::from),
        Response::Exception(payload) => Err(Error::Application(codec.decode_exception(payload))),
    })
}
