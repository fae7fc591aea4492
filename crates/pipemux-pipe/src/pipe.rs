use std::collections::VecDeque;
use std::ops::BitOr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pipemux_transport::PlatformHandle;
use tracing::trace;

use crate::error::{PipeError, Result};
use crate::waiter::Waiter;

/// Ports per pipe.
pub const PORT_COUNT: usize = 2;

/// Default maximum message size: 16 MiB.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Default maximum attached handles per message.
pub const MAX_MESSAGE_HANDLES: usize = 64;

/// Conditions a waiter can watch on a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitFlags(u8);

impl WaitFlags {
    /// A message can be read from the port.
    pub const READABLE: WaitFlags = WaitFlags(0b01);
    /// A message can be written into the port.
    pub const WRITABLE: WaitFlags = WaitFlags(0b10);

    pub fn readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }
}

impl BitOr for WaitFlags {
    type Output = WaitFlags;

    fn bitor(self, rhs: WaitFlags) -> WaitFlags {
        WaitFlags(self.0 | rhs.0)
    }
}

/// Options for [`MessagePipe::read_message`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadFlags {
    /// Drop the head message when the caller's buffer is too small,
    /// instead of leaving it queued.
    pub may_discard: bool,
}

impl ReadFlags {
    pub const NONE: ReadFlags = ReadFlags { may_discard: false };
    pub const MAY_DISCARD: ReadFlags = ReadFlags { may_discard: true };
}

/// One buffered message: payload bytes plus attached handles.
#[derive(Debug)]
pub struct PipeMessage {
    pub bytes: Vec<u8>,
    pub handles: Vec<PlatformHandle>,
}

/// Result of a successful read.
#[derive(Debug)]
pub struct ReadOutcome {
    /// Bytes copied into the caller's buffer.
    pub bytes: usize,
    /// Handles transferred to the caller.
    pub handles: Vec<PlatformHandle>,
}

struct WaiterEntry {
    waiter: Arc<Waiter>,
    flags: WaitFlags,
    context: u64,
}

#[derive(Default)]
struct PortState {
    queue: VecDeque<PipeMessage>,
    self_closed: bool,
    peer_closed: bool,
    waiters: Vec<WaiterEntry>,
}

impl PortState {
    fn satisfied(&self, flags: WaitFlags) -> bool {
        (flags.readable() && !self.queue.is_empty()) || (flags.writable() && !self.peer_closed)
    }

    fn satisfiable(&self, flags: WaitFlags) -> bool {
        (flags.readable() && (!self.peer_closed || !self.queue.is_empty()))
            || (flags.writable() && !self.peer_closed)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A bidirectional in-process pipe with two independently-closeable ports.
///
/// Writing on port `i` enqueues on port `1 - i`. All state for both ports
/// sits behind one lock, so close/write/read interleavings observe a single
/// total order.
pub struct MessagePipe {
    ports: Mutex<[PortState; PORT_COUNT]>,
    max_bytes: usize,
    max_handles: usize,
}

impl MessagePipe {
    pub fn new() -> Arc<Self> {
        Self::with_limits(MAX_MESSAGE_BYTES, MAX_MESSAGE_HANDLES)
    }

    /// A pipe with explicit per-message limits.
    pub fn with_limits(max_bytes: usize, max_handles: usize) -> Arc<Self> {
        Arc::new(Self {
            ports: Mutex::new([PortState::default(), PortState::default()]),
            max_bytes,
            max_handles,
        })
    }

    /// Enqueue a message on the peer port's queue.
    ///
    /// Fails with [`PipeError::PeerClosed`] once the peer port is closed and
    /// with the size errors for over-limit messages. Failed writes close the
    /// passed handles (a handle is always delivered once or closed once).
    pub fn write_message(
        &self,
        port: usize,
        bytes: &[u8],
        handles: Vec<PlatformHandle>,
    ) -> Result<()> {
        assert!(port < PORT_COUNT);
        if bytes.len() > self.max_bytes {
            return Err(PipeError::TooLarge {
                size: bytes.len(),
                max: self.max_bytes,
            });
        }
        if handles.len() > self.max_handles {
            return Err(PipeError::TooManyHandles {
                count: handles.len(),
                max: self.max_handles,
            });
        }

        let mut ports = lock(&self.ports);
        let (own, peer) = split_ports(&mut ports, port);
        if own.self_closed {
            return Err(PipeError::AlreadyClosed);
        }
        if own.peer_closed {
            return Err(PipeError::PeerClosed);
        }

        peer.queue.push_back(PipeMessage {
            bytes: bytes.to_vec(),
            handles,
        });

        // Anyone parked on the peer becoming readable is satisfied now.
        let mut i = 0;
        while i < peer.waiters.len() {
            if peer.waiters[i].flags.readable() {
                let entry = peer.waiters.swap_remove(i);
                entry.waiter.wake(Ok(entry.context));
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// Dequeue the head message into `buf`.
    ///
    /// - empty queue, peer open → [`PipeError::NotFound`]
    /// - empty queue, peer closed → [`PipeError::PeerClosed`]
    /// - `buf` smaller than the head → [`PipeError::BufferTooSmall`] carrying
    ///   the required sizes; with [`ReadFlags::MAY_DISCARD`] the head is
    ///   dropped (its handles closed), otherwise it stays queued
    pub fn read_message(
        &self,
        port: usize,
        buf: &mut [u8],
        flags: ReadFlags,
    ) -> Result<ReadOutcome> {
        assert!(port < PORT_COUNT);
        let mut ports = lock(&self.ports);
        let own = &mut ports[port];
        if own.self_closed {
            return Err(PipeError::AlreadyClosed);
        }

        let Some(head) = own.queue.front() else {
            return if own.peer_closed {
                Err(PipeError::PeerClosed)
            } else {
                Err(PipeError::NotFound)
            };
        };

        if head.bytes.len() > buf.len() {
            let needed = (head.bytes.len(), head.handles.len());
            if flags.may_discard {
                trace!(port, bytes = needed.0, "discarding undersized read");
                drop(own.queue.pop_front());
            }
            return Err(PipeError::BufferTooSmall {
                bytes: needed.0,
                handles: needed.1,
            });
        }

        let message = own
            .queue
            .pop_front()
            .expect("head checked non-empty above");
        buf[..message.bytes.len()].copy_from_slice(&message.bytes);
        Ok(ReadOutcome {
            bytes: message.bytes.len(),
            handles: message.handles,
        })
    }

    /// Close a port.
    ///
    /// Cancels the port's own waiters, drops its queued messages (closing
    /// their handles), marks the peer's `peer_closed`, and wakes any peer
    /// waiter whose condition just became impossible. A second close returns
    /// [`PipeError::AlreadyClosed`] and changes nothing.
    pub fn close(&self, port: usize) -> Result<()> {
        assert!(port < PORT_COUNT);
        let mut ports = lock(&self.ports);
        let (own, peer) = split_ports(&mut ports, port);
        if own.self_closed {
            return Err(PipeError::AlreadyClosed);
        }
        own.self_closed = true;

        for entry in own.waiters.drain(..) {
            entry.waiter.wake(Err(PipeError::Cancelled));
        }
        own.queue.clear();

        peer.peer_closed = true;
        let mut i = 0;
        while i < peer.waiters.len() {
            if peer.satisfiable(peer.waiters[i].flags) {
                i += 1;
            } else {
                let entry = peer.waiters.swap_remove(i);
                entry.waiter.wake(Err(PipeError::NeverSatisfiable));
            }
        }
        Ok(())
    }

    /// Register a waiter for `flags` on `port`.
    ///
    /// Rejected synchronously with [`PipeError::AlreadySatisfied`] when any
    /// watched condition already holds, and with
    /// [`PipeError::NeverSatisfiable`] when none can ever hold; the waiter is
    /// only armed on `Ok`.
    pub fn add_waiter(
        &self,
        port: usize,
        waiter: &Arc<Waiter>,
        flags: WaitFlags,
        context: u64,
    ) -> Result<()> {
        assert!(port < PORT_COUNT);
        let mut ports = lock(&self.ports);
        let own = &mut ports[port];
        if own.self_closed {
            return Err(PipeError::AlreadyClosed);
        }
        if own.satisfied(flags) {
            return Err(PipeError::AlreadySatisfied);
        }
        if !own.satisfiable(flags) {
            return Err(PipeError::NeverSatisfiable);
        }
        own.waiters.push(WaiterEntry {
            waiter: Arc::clone(waiter),
            flags,
            context,
        });
        Ok(())
    }

    /// Unregister a waiter. No effect if it is not registered.
    pub fn remove_waiter(&self, port: usize, waiter: &Arc<Waiter>) {
        assert!(port < PORT_COUNT);
        let mut ports = lock(&self.ports);
        ports[port]
            .waiters
            .retain(|entry| !Arc::ptr_eq(&entry.waiter, waiter));
    }

    /// Wake every waiter on `port` with [`PipeError::Cancelled`].
    pub fn cancel_all_waiters(&self, port: usize) {
        assert!(port < PORT_COUNT);
        let mut ports = lock(&self.ports);
        for entry in ports[port].waiters.drain(..) {
            entry.waiter.wake(Err(PipeError::Cancelled));
        }
    }
}

/// Mutably borrow a port and its peer at once.
fn split_ports(
    ports: &mut [PortState; PORT_COUNT],
    port: usize,
) -> (&mut PortState, &mut PortState) {
    let (left, right) = ports.split_at_mut(1);
    if port == 0 {
        (&mut left[0], &mut right[0])
    } else {
        (&mut right[0], &mut left[0])
    }
}
