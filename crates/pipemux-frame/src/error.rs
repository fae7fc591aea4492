/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The header declares a total length smaller than the header itself.
    #[error("frame length {len} below minimum of {min}")]
    BadLength { len: usize, min: usize },

    /// The header declares a frame type this protocol does not define.
    #[error("unknown frame type {0}")]
    UnknownType(u32),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The frame declares more attached handles than allowed.
    #[error("too many attached handles ({count}, max {max})")]
    TooManyHandles { count: usize, max: usize },

    /// A complete frame arrived without the handles it declared.
    ///
    /// Handles always ride with the bytes of their own frame, so this means
    /// the peer is not speaking the protocol.
    #[error("frame declares {expected} handles but only {available} arrived")]
    MissingHandles { expected: usize, available: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection closed before a complete frame was transferred.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
