//! In-process message pipes.
//!
//! A [`MessagePipe`] is a pair of ports, each with a FIFO of buffered
//! messages. Writing on one port enqueues on the other; either port can be
//! closed independently; threads can park on a port with a [`Waiter`] until
//! it becomes readable or writable. This is the endpoint structure the
//! routing layer dispatches cross-process traffic into.

pub mod error;
pub mod pipe;
pub mod waiter;

pub use error::{PipeError, Result};
pub use pipe::{
    MessagePipe, PipeMessage, ReadFlags, ReadOutcome, WaitFlags, MAX_MESSAGE_BYTES,
    MAX_MESSAGE_HANDLES, PORT_COUNT,
};
pub use waiter::Waiter;
