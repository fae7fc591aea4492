//! Route demultiplexing and the broker control plane.
//!
//! One [`RoutedChannel`] owns the transport to one remote process and fans
//! inbound frames out to local [`PipeDispatcher`]s by pipe id, buffering for
//! routes that have not registered yet. The [`Broker`] / [`BrokerClient`]
//! pair introduces processes to each other and tells each side where the
//! other end of a pipe lives; after an introduction the data plane runs
//! peer-to-peer with no broker involvement.

pub mod client;
pub mod control;
pub mod dispatcher;
pub mod error;
pub mod host;
pub mod registry;
pub mod router;
pub mod transport;

pub use client::BrokerClient;
pub use control::BrokerMessage;
pub use dispatcher::PipeDispatcher;
pub use error::{Result, RouterError};
pub use host::{Broker, BrokerHost};
pub use registry::{ProcessId, Registry};
pub use router::{RouteDelegate, RouteError, RoutedChannel, CONTROL_ROUTE};
pub use transport::{Transport, TransportDelegate};

pub(crate) mod sync {
    use std::sync::{Mutex, MutexGuard, PoisonError};

    pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
