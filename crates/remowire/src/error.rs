//! # Error Definitions

use remopack::Error as PackError;

/// A payload could not be encoded or decoded as a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The underlying remopack encoding failed.
    Serialization(PackError),
    /// The `type` field carries a code outside the message set.
    UnknownType(u32),
    /// A field required by the message type was absent.
    MissingField(&'static str),
    /// The envelope is structurally wrong (e.g. the variant name disagrees with `type`).
    ProtocolViolation(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization error: {}", e),
            Self::UnknownType(code) => write!(f, "unknown message type {:#06x}", code),
            Self::MissingField(name) => write!(f, "missing field '{}'", name),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<PackError> for Error {
    fn from(e: PackError) -> Self { Self::Serialization(e) }
}

/// A specialized Result type for message codec operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The byte stream can no longer be trusted. The connection must be reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The frame did not start with the protocol magic.
    BadMagic([u8; 2]),
    /// A frame declared a payload larger than `max_frame_len`.
    FrameTooLarge { len: usize, max: usize },
    /// More than `max_buffered` bytes are waiting for reassembly.
    BufferOverflow { buffered: usize, max: usize },
    /// A complete frame's payload failed to decode.
    Corrupt(Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadMagic(found) => write!(f, "bad frame magic {:02x?}", found),
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame of {} bytes exceeds limit of {}", len, max)
            }
            Self::BufferOverflow { buffered, max } => {
                write!(f, "{} bytes buffered exceeds limit of {}", buffered, max)
            }
            Self::Corrupt(e) => write!(f, "corrupt frame: {}", e),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Corrupt(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Error> for FrameError {
    fn from(e: Error) -> Self { Self::Corrupt(e) }
}
