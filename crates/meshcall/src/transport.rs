//! # Transport Abstraction
//!
//! The narrow contract between the dispatcher and whatever physically moves
//! bytes between nodes (group multicast, WebSocket, raw stream, message queue).
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about frames, codecs or sequence ids.
//!   It moves opaque buffers to a set of recipients.
//! - **Push Inbound**: Delivery goes the other way through the dispatcher's
//!   `on_frame_received` / `on_batch_received`, or through an [`Inbound`] channel
//!   drained by a pump task.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Opaque identity of a node on the mesh.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Address(Arc<str>);

impl Address {
    pub fn new(addr: impl AsRef<str>) -> Self {
        Self(Arc::from(addr.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(addr: &str) -> Self {
        Self::new(addr)
    }
}

impl From<String> for Address {
    fn from(addr: String) -> Self {
        Self(Arc::from(addr))
    }
}

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection was dropped.
    ConnectionLost(String),
    /// None of the requested recipients can be reached.
    Unreachable(Address),
    /// The transport rejected the payload size.
    PayloadTooLarge(usize),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Unreachable(addr) => write!(f, "Node unreachable: {}", addr),
            Self::PayloadTooLarge(len) => write!(f, "Payload of {} bytes too large for transport", len),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Who a frame goes to.
///
/// `targets: None` leaves the choice to the transport's own multicast semantics.
/// Excluded nodes never receive the frame, whatever the targets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Recipients {
    pub targets: Option<BTreeSet<Address>>,
    pub exclusions: BTreeSet<Address>,
}

impl Recipients {
    /// Everyone the transport reaches by multicast.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn to(targets: impl IntoIterator<Item = Address>) -> Self {
        Self {
            targets: Some(targets.into_iter().collect()),
            exclusions: BTreeSet::new(),
        }
    }

    pub fn one(target: Address) -> Self {
        Self::to([target])
    }

    pub fn excluding(mut self, nodes: impl IntoIterator<Item = Address>) -> Self {
        self.exclusions.extend(nodes);
        self
    }

    pub fn is_excluded(&self, addr: &Address) -> bool {
        self.exclusions.contains(addr)
    }

    /// Whether `addr` should receive the frame, given the sender and loopback flag.
    pub fn includes(&self, addr: &Address, local: &Address, loopback: bool) -> bool {
        if self.is_excluded(addr) {
            return false;
        }
        match &self.targets {
            Some(targets) => targets.contains(addr) && (loopback || addr != local),
            None => loopback || addr != local,
        }
    }

    /// The exact set of nodes expected to answer, when the targets are explicit.
    pub fn expected(&self, local: &Address, loopback: bool) -> Option<BTreeSet<Address>> {
        self.targets.as_ref().map(|targets| {
            targets
                .iter()
                .filter(|addr| self.includes(addr, local, loopback))
                .cloned()
                .collect()
        })
    }
}

/// How many responses a fan-out call waits for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResponseMode {
    #[default]
    WaitForAll,
    WaitForFirst,
}

/// Per-call options supplied by the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallOptions {
    pub mode: ResponseMode,
    /// Deliver the frame to the sending node too.
    pub loopback: bool,
    /// Overrides the timeout passed to the call.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn wait_for_first(mut self) -> Self {
        self.mode = ResponseMode::WaitForFirst;
        self
    }

    pub fn loopback(mut self, loopback: bool) -> Self {
        self.loopback = loopback;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Hints forwarded opaquely to the transport with every send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendHints {
    pub mode: ResponseMode,
    pub loopback: bool,
    pub timeout: Duration,
}

/// An event delivered by a transport to the dispatcher's pump.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// A single frame from one node.
    Frame { from: Address, bytes: Vec<u8> },
    /// All responses to one multicast, gathered by the transport.
    Batch { replies: Vec<(Address, Vec<u8>)> },
    /// The connection is gone; nothing more will arrive.
    Closed { reason: String },
}

/// A mechanism to send a frame to a set of nodes.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends `frame` to `recipients`.
    ///
    /// # invariants
    /// - Must return `Err` only if the frame could not be handed to the network.
    /// - Must never deliver to an excluded node.
    /// - Should not interpret the frame content.
    async fn send(&self, recipients: &Recipients, frame: &[u8], hints: &SendHints) -> Result<()>;
}
