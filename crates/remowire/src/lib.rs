//! # Remowire
//!
//! The remote object protocol: a closed set of request/response messages, their
//! binary encoding, and the framing that carries them over a byte stream.
//!
//! ## Layers
//!
//! 1. **Message**: `Message { id, body, context }`. The `id` is chosen by the
//!    sender of a request and echoed by the response.
//! 2. **Codec**: a message is encoded as a remopack `Variant` named after its
//!    type, holding a map of fields.
//! 3. **Frame**: `[magic "RO"][u32 LE len][payload]`. `FrameBuffer` reassembles
//!    frames from arbitrary socket chunks.
//!
//! ## Invariants
//! - **Panic Safety**: decoding never panics on hostile input.
//! - **Bounded Memory**: frames and buffered bytes are capped by `FrameLimits`.

mod codec;
mod error;
mod frame;
mod message;

#[cfg(test)]
mod tests;

pub use codec::decode_payload;
pub use codec::encode_payload;
pub use error::Error;
pub use error::FrameError;
pub use error::Result;
pub use frame::Decoded;
pub use frame::FrameBuffer;
pub use frame::FrameLimits;
pub use frame::HEADER_LEN;
pub use frame::MAGIC;
pub use frame::decode;
pub use frame::encode;
pub use message::Body;
pub use message::Context;
pub use message::Direction;
pub use message::Message;
pub use message::MessageType;
pub use message::NO_OBJECT;
pub use message::Role;
pub use remopack::Value;
