//! # Meshframe
//!
//! The small header that prefixes every message exchanged by `meshcall`
//! dispatchers: frame kind, method name, and sequence id, followed by an
//! opaque payload produced by a caller-supplied codec.
//!
//! ## Philosophy
//!
//! - **Header Only**: The frame never interprets the payload. Argument and result
//!   encoding belong to the codec, not to the wire.
//! - **Bit-Exact**: The header layout is the only compatibility contract between
//!   versions, so it is fixed and documented in [`frame`].
//! - **Zero Copy**: Decoding borrows the method name and payload from the input.

mod error;
pub mod frame;

pub use error::Error;
pub use error::Result;
pub use frame::CallFrame;
pub use frame::FrameEncoder;
pub use frame::FrameHeader;
pub use frame::FrameKind;
pub use frame::SeqId;
pub use frame::MAX_METHOD_LEN;
pub use frame::check_method;
pub use frame::decode_header;
pub use frame::encode_call;
pub use frame::encode_exception;
pub use frame::encode_reply;
pub use frame::peek_seq;

#[cfg(test)]
mod tests;
