use crate::registry::ProcessId;

/// Errors that can occur in routing and broker operations.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Route id 0 is the channel's own control route.
    #[error("route id 0 is reserved for channel control")]
    ReservedRoute,

    /// The pipe id is already bound on this channel.
    #[error("route {0} already bound")]
    RouteExists(u64),

    /// The pipe id is not bound on this channel.
    #[error("route {0} is not bound")]
    RouteMissing(u64),

    /// The pipe id is bound, but to a different dispatcher.
    #[error("route {0} is bound to a different dispatcher")]
    DispatcherMismatch(u64),

    /// The transport to the peer process is down.
    #[error("transport to peer process is down")]
    TransportDown,

    /// A channel to this peer process already exists.
    #[error("peer process {0} already registered")]
    PeerExists(ProcessId),

    /// No channel to this peer process exists.
    #[error("no channel to peer process {0}")]
    UnknownPeer(ProcessId),

    /// The pipe endpoint has not been bound to a channel yet.
    #[error("pipe endpoint is not bound to a channel")]
    NotBound,

    /// The pipe endpoint has already been closed.
    #[error("pipe endpoint already closed")]
    PipeClosed,

    /// The remote end of the pipe is gone.
    #[error("peer end of the pipe closed")]
    PeerClosed,

    /// The peer violated the wire protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The control channel to the broker failed.
    #[error("control channel to broker failed")]
    ControlFailed,

    /// A blocking broker operation timed out.
    #[error("timed out waiting for the broker")]
    Timeout,

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] pipemux_frame::FrameError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] pipemux_transport::TransportError),
}

pub type Result<T> = std::result::Result<T, RouterError>;
