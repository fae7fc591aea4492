//! Route-tagged message framing for pipemux.
//!
//! Every frame carries a fixed little-endian header:
//! - 4-byte total length (header + payload)
//! - 4-byte frame type (`DATA` or `INTERNAL`)
//! - 8-byte route id
//! - 4-byte attached-handle count
//!
//! followed by the payload. OS handles never appear in the byte stream; they
//! ride as `SCM_RIGHTS` ancillary data on the send that carries the frame,
//! and the reader pairs them back up with the frame that declared them.

pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, encode_frame, Frame, FrameConfig, FrameKind, DEFAULT_MAX_HANDLES,
    DEFAULT_MAX_PAYLOAD, HEADER_LEN,
};
pub use error::{FrameError, Result};
pub use reader::{ByteSource, FrameReader, RecvChunk};
pub use writer::{ByteSink, FrameWriter, SendChunk};
