//! # In-Memory Mesh
//!
//! In-process mesh transport.
//!
//! Every joined node gets an [`Inbound`] channel and a [`MeshTransport`] that
//! delivers frames onto the other nodes' channels. Nodes can be isolated to
//! simulate a partition: frames to or from them are dropped silently, the way a
//! real network loses them.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::DashSet;
use tokio::sync::mpsc;
use tracing::trace;

use crate::membership::StaticMembership;
use crate::transport;
use crate::transport::Address;
use crate::transport::Inbound;
use crate::transport::Recipients;
use crate::transport::SendHints;
use crate::transport::Transport;
use crate::transport::TransportError;

struct Inner {
    members: DashMap<Address, mpsc::UnboundedSender<Inbound>>,
    isolated: DashSet<Address>,
    membership: Arc<StaticMembership>,
}

/// A set of nodes connected by in-memory channels. Clones share the mesh.
#[derive(Clone)]
pub struct MemoryMesh {
    inner: Arc<Inner>,
}

impl Default for MemoryMesh {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                members: DashMap::new(),
                isolated: DashSet::new(),
                membership: Arc::new(StaticMembership::default()),
            }),
        }
    }

    /// Joins `addr` to the mesh. Rejoining replaces the previous channel.
    pub fn join(&self, addr: impl Into<Address>) -> (MeshTransport, mpsc::UnboundedReceiver<Inbound>) {
        let addr = addr.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.members.insert(addr.clone(), tx);
        self.inner.membership.join(addr.clone());
        let transport = MeshTransport { local: addr, mesh: self.clone() };
        (transport, rx)
    }

    /// Removes `addr`. Its inbound channel closes once in-flight frames drain.
    pub fn leave(&self, addr: &Address) {
        self.inner.members.remove(addr);
        self.inner.isolated.remove(addr);
        self.inner.membership.leave(addr);
    }

    /// Cuts `addr` off: frames to and from it are lost. Membership is unchanged.
    pub fn isolate(&self, addr: &Address) {
        self.inner.isolated.insert(addr.clone());
    }

    pub fn heal(&self, addr: &Address) {
        self.inner.isolated.remove(addr);
    }

    pub fn members(&self) -> Vec<Address> {
        let mut members: Vec<Address> = self.inner.members.iter().map(|e| e.key().clone()).collect();
        members.sort();
        members
    }

    /// The mesh's membership view, updated on join and leave.
    pub fn membership(&self) -> Arc<StaticMembership> {
        self.inner.membership.clone()
    }

    fn deliver(&self, from: &Address, to: &Address, frame: &[u8]) -> bool {
        let Some(tx) = self.inner.members.get(to).map(|e| e.value().clone()) else {
            return false;
        };
        if self.inner.isolated.contains(from) || self.inner.isolated.contains(to) {
            trace!(%from, %to, "partitioned, frame lost");
            return true;
        }
        tx.send(Inbound::Frame { from: from.clone(), bytes: frame.to_vec() }).is_ok()
    }
}

/// One node's handle for sending onto a [`MemoryMesh`].
#[derive(Clone)]
pub struct MeshTransport {
    local: Address,
    mesh: MemoryMesh,
}

impl MeshTransport {
    pub fn local_address(&self) -> &Address {
        &self.local
    }
}

#[async_trait::async_trait]
impl Transport for MeshTransport {
    async fn send(&self, recipients: &Recipients, frame: &[u8], hints: &SendHints) -> transport::Result<()> {
        let candidates: Vec<Address> = match &recipients.targets {
            Some(targets) => targets.iter().cloned().collect(),
            None => self.mesh.members(),
        };

        let mut delivered = 0;
        let mut missing: Option<Address> = None;
        for addr in candidates {
            if !recipients.includes(&addr, &self.local, hints.loopback) {
                continue;
            }
            if self.mesh.deliver(&self.local, &addr, frame) {
                delivered += 1;
            } else if missing.is_none() {
                missing = Some(addr);
            }
        }

        match (recipients.targets.is_some(), delivered, missing) {
            (true, 0, Some(addr)) => Err(TransportError::Unreachable(addr)),
            _ => Ok(()),
        }
    }
}
