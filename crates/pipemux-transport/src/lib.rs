//! Stream transport and OS-handle plumbing for pipemux.
//!
//! Provides the pieces every other layer builds on:
//! - [`IpcStream`] — a connected Unix-socket stream that can carry file
//!   descriptors alongside bytes (`sendmsg`/`recvmsg` with `SCM_RIGHTS`)
//! - [`PlatformHandle`] — an exclusively-owned OS handle attached to messages
//! - [`UnixDomainSocket`] — bind/accept/connect for the broker rendezvous
//! - [`IoRunner`] — the process-wide I/O worker thread, passed in explicitly
//!   wherever inbound dispatch happens

pub mod error;
pub mod handle;
pub mod runner;
pub mod stream;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use handle::PlatformHandle;
pub use runner::IoRunner;
pub use stream::{IpcStream, MAX_HANDLES_PER_MESSAGE};

#[cfg(unix)]
pub use uds::UnixDomainSocket;
