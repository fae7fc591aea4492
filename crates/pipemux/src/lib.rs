//! Cross-process message pipe multiplexing.
//!
//! pipemux routes many logical bidirectional pipes over one Unix-socket
//! transport per process pair, with a broker process arbitrating
//! introductions and OS-handle transfer.
//!
//! # Crate Structure
//!
//! - [`transport`] — streams, handle passing, the broker socket, the I/O worker
//! - [`frame`] — route-tagged wire framing with out-of-band handles
//! - [`pipe`] — the in-process two-port message pipe and its waiters
//! - [`router`] — route demultiplexing, dispatchers, and the broker pair

/// Re-export transport types.
pub mod transport {
    pub use pipemux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use pipemux_frame::*;
}

/// Re-export pipe types.
pub mod pipe {
    pub use pipemux_pipe::*;
}

/// Re-export routing and broker types.
pub mod router {
    pub use pipemux_router::*;
}
