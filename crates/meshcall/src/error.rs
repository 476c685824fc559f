//! # Error Definitions
//!
//! Every way a call can end other than success.
//!
//! Protocol and transport failures ("the call could not be completed") are kept
//! apart from [`ApplicationError`] ("the remote method ran and raised"), so callers
//! can branch on the two and failover only retries the former.

use std::time::Duration;

use meshframe::SeqId;

use crate::codec::CodecError;
use crate::transport::Address;
use crate::transport::TransportError;

/// A business error raised by the remote handler and carried in an EXCEPTION frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationError {
    pub message: String,
}

impl ApplicationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    /// Decodes the conventional exception payload: a UTF-8 message.
    pub fn from_payload(bytes: &[u8]) -> Self {
        Self::new(String::from_utf8_lossy(bytes))
    }

    pub fn to_payload(&self) -> Vec<u8> {
        self.message.as_bytes().to_vec()
    }
}

impl std::fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApplicationError {}

#[derive(Debug, Clone)]
pub enum Error {
    /// A received frame's header could not be read.
    MalformedFrame(meshframe::Error),
    /// The call frame could not be built locally, e.g. the method name is too long.
    /// Nothing was sent.
    InvalidCall(meshframe::Error),
    /// A response did not echo the method of the call it claims to answer.
    ProtocolMismatch { seq: SeqId, expected: String, received: String },
    /// The deadline elapsed before a response arrived.
    TimedOut { method: String, after: Duration },
    /// The owning connection closed while the call was in flight.
    ConnectionClosed(String),
    /// The remote method raised.
    Application(ApplicationError),
    /// The callee has no handler for the method.
    MethodNotServed { method: String },
    /// No healthy node advertises the method.
    NoNodesAvailable { method: String },
    /// Every candidate was tried and failed.
    AllNodesFailed { method: String, failures: Vec<(Address, Error)> },
    /// Sequence id wraparound reached an id that is still pending.
    SeqIdExhausted(SeqId),
    /// The pending table is at its configured limit.
    Overloaded { limit: usize },
    Transport(TransportError),
    Codec(CodecError),
}

impl Error {
    /// Whether a failover call should move on to the next candidate.
    ///
    /// Only failures attributable to the contacted node qualify. Local failures
    /// and remote application errors end the call.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TimedOut { .. }
            | Self::ConnectionClosed(_)
            | Self::Transport(_)
            | Self::MethodNotServed { .. }
            | Self::ProtocolMismatch { .. }
            | Self::MalformedFrame(_) => true,
            Self::Application(_)
            | Self::InvalidCall(_)
            | Self::Codec(_)
            | Self::NoNodesAvailable { .. }
            | Self::AllNodesFailed { .. }
            | Self::SeqIdExhausted(_)
            | Self::Overloaded { .. } => false,
        }
    }

    pub fn is_application(&self) -> bool {
        matches!(self, Self::Application(_))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedFrame(e) => write!(f, "Malformed frame: {}", e),
            Self::InvalidCall(e) => write!(f, "Invalid call: {}", e),
            Self::ProtocolMismatch { seq, expected, received } => write!(
                f,
                "Protocol mismatch on {}: expected reply to '{}', received '{}'",
                seq, expected, received
            ),
            Self::TimedOut { method, after } => {
                write!(f, "Call to '{}' timed out after {:?}", method, after)
            }
            Self::ConnectionClosed(reason) => write!(f, "Connection closed: {}", reason),
            Self::Application(e) => write!(f, "Remote method raised: {}", e),
            Self::MethodNotServed { method } => write!(f, "Method '{}' not served by callee", method),
            Self::NoNodesAvailable { method } => write!(f, "No nodes available for '{}'", method),
            Self::AllNodesFailed { method, failures } => {
                write!(f, "All {} candidates failed for '{}'", failures.len(), method)?;
                for (node, e) in failures {
                    write!(f, "; {}: {}", node, e)?;
                }
                Ok(())
            }
            Self::SeqIdExhausted(seq) => write!(f, "Sequence id {} is still pending", seq),
            Self::Overloaded { limit } => write!(f, "Too many calls in flight (limit {})", limit),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Codec(e) => write!(f, "Codec error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::MalformedFrame(e) | Self::InvalidCall(e) => Some(e),
            Self::Application(e) => Some(e),
            Self::Transport(e) => Some(e),
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl From<ApplicationError> for Error {
    fn from(e: ApplicationError) -> Self {
        Self::Application(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
