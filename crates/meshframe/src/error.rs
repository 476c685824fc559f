//! # Error Definitions
//!
//! Every way a frame can fail to encode or decode. On the receiving side all of
//! these mean the same thing to a dispatcher: the frame is malformed and is dropped.

/// Frame encoding and decoding failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The buffer ended before a header field could be read.
    UnexpectedEnd { needed: usize, remaining: usize },
    /// The version bits of the first word are not a known protocol version.
    BadVersion(u32),
    /// The frame kind code is not CALL, REPLY or EXCEPTION.
    UnknownKind(u8),
    /// The encoded method name length is negative or larger than `MAX_METHOD_LEN`.
    InvalidMethodLength(i32),
    /// A method name given to the encoder is longer than `MAX_METHOD_LEN`.
    MethodTooLong(usize),
    /// The method name is not valid UTF-8.
    InvalidUtf8,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedEnd { needed, remaining } => {
                write!(f, "Frame truncated: needed {} bytes, {} remaining", needed, remaining)
            }
            Self::BadVersion(word) => write!(f, "Bad frame version word: {:#010x}", word),
            Self::UnknownKind(code) => write!(f, "Unknown frame kind: {}", code),
            Self::InvalidMethodLength(len) => write!(f, "Invalid method name length: {}", len),
            Self::MethodTooLong(len) => write!(f, "Method name too long: {} bytes", len),
            Self::InvalidUtf8 => write!(f, "Method name is not valid UTF-8"),
        }
    }
}

impl std::error::Error for Error {}

/// A specialized Result type for frame operations.
pub type Result<T> = std::result::Result<T, Error>;
