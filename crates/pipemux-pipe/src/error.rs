/// Status codes surfaced by the local pipe API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PipeError {
    /// No message is queued on the port.
    #[error("no message queued")]
    NotFound,

    /// The caller's buffer is smaller than the next message.
    ///
    /// Carries the sizes the caller needs; with
    /// [`ReadFlags::MAY_DISCARD`](crate::ReadFlags) the message was dropped,
    /// otherwise it stays queued.
    #[error("buffer too small (next message: {bytes} bytes, {handles} handles)")]
    BufferTooSmall { bytes: usize, handles: usize },

    /// The message exceeds the pipe's size limit.
    #[error("message too large ({size} bytes, max {max})")]
    TooLarge { size: usize, max: usize },

    /// The message carries more handles than the pipe accepts.
    #[error("too many attached handles ({count}, max {max})")]
    TooManyHandles { count: usize, max: usize },

    /// The peer port is closed; the operation can never succeed.
    #[error("peer port closed")]
    PeerClosed,

    /// The port itself has already been closed.
    #[error("port already closed")]
    AlreadyClosed,

    /// The awaited condition is already true; no need to wait.
    #[error("condition already satisfied")]
    AlreadySatisfied,

    /// The awaited condition can never become true.
    #[error("condition can never be satisfied")]
    NeverSatisfiable,

    /// The waiter was cancelled by the port closing under it.
    #[error("wait cancelled")]
    Cancelled,

    /// The wait deadline passed with no wake-up.
    #[error("wait timed out")]
    TimedOut,
}

pub type Result<T> = std::result::Result<T, PipeError>;
