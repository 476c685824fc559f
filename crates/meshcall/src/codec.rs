//! # Codecs
//!
//! Pluggable argument and result encoding.
//!
//! The dispatcher never looks inside a payload. Callers hand it a [`Codec`] that
//! turns arguments into bytes and reply bytes back into a result, and it builds
//! the per-call decoder from that. [`RawCodec`] passes bytes through untouched;
//! [`JsonCodec`] uses serde_json.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ApplicationError;

/// Error type for codec operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Failed to encode call arguments.
    Encode(String),
    /// Failed to decode a reply payload.
    Decode(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for CodecError {}

/// Encodes arguments of type `A` and decodes replies into `Self::Output`.
///
/// Codecs are cloned into every in-flight call, so they should be cheap to clone.
pub trait Codec<A: ?Sized>: Clone + Send + Sync + 'static {
    type Output: Send + 'static;

    fn encode(&self, args: &A) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Output, CodecError>;

    /// Decodes the payload of an EXCEPTION frame.
    fn decode_exception(&self, bytes: &[u8]) -> ApplicationError {
        ApplicationError::from_payload(bytes)
    }
}

/// Passes payloads through as raw bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawCodec;

impl Codec<[u8]> for RawCodec {
    type Output = Vec<u8>;

    fn encode(&self, args: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(args.to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(bytes.to_vec())
    }
}

/// JSON codec using serde_json, decoding replies into `R`.
pub struct JsonCodec<R> {
    _result: PhantomData<fn() -> R>,
}

impl<R> JsonCodec<R> {
    pub fn new() -> Self {
        Self { _result: PhantomData }
    }
}

impl<R> Default for JsonCodec<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Clone for JsonCodec<R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for JsonCodec<R> {}

impl<R> std::fmt::Debug for JsonCodec<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<A, R> Codec<A> for JsonCodec<R>
where
    A: Serialize + ?Sized,
    R: DeserializeOwned + Send + 'static,
{
    type Output = R;

    fn encode(&self, args: &A) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(args).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<R, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
