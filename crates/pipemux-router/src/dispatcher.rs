use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use pipemux_pipe::{MessagePipe, PipeError, ReadFlags, ReadOutcome, WaitFlags, Waiter};
use pipemux_transport::PlatformHandle;
use tracing::{debug, trace};

use crate::error::{Result, RouterError};
use crate::router::{RouteDelegate, RouteError, RoutedChannel};
use crate::sync::lock;

/// Port of the internal pipe the routing layer writes inbound frames into.
const ROUTING_PORT: usize = 0;
/// Port the application reads and waits on.
const APP_PORT: usize = 1;

struct Binding {
    channel: Arc<RoutedChannel>,
    pipe_id: u64,
}

#[derive(Default)]
struct DispatchState {
    binding: Option<Binding>,
    /// The channel already told us the peer is gone (one notice, ever).
    failure: Option<RouteError>,
    closed: bool,
}

/// The local endpoint of a cross-process pipe.
///
/// Owns a [`MessagePipe`] whose routing-side port receives demultiplexed
/// frames; the application reads and waits on the other port through this
/// object's surface. Outbound writes bypass the pipe and go straight to the
/// bound channel, stamped with this endpoint's pipe id.
///
/// When the peer closes (or the whole transport dies) the routing-side port
/// closes, so readers drain whatever already arrived and then observe
/// [`PipeError::PeerClosed`].
pub struct PipeDispatcher {
    pipe: Arc<MessagePipe>,
    state: Mutex<DispatchState>,
}

impl PipeDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pipe: MessagePipe::new(),
            state: Mutex::new(DispatchState::default()),
        })
    }

    /// Attach this endpoint to `pipe_id` on `channel`.
    ///
    /// Frames the channel buffered for the route replay into the pipe before
    /// this returns. One-shot: an endpoint never rebinds.
    pub fn bind(self: &Arc<Self>, channel: Arc<RoutedChannel>, pipe_id: u64) -> Result<()> {
        {
            let state = lock(&self.state);
            if state.closed {
                return Err(RouterError::PipeClosed);
            }
            if state.binding.is_some() {
                return Err(RouterError::RouteExists(pipe_id));
            }
        }
        // add_route replays buffered traffic into on_message/on_error
        // synchronously, so the state lock must be free here.
        channel.add_route(pipe_id, self.as_route_delegate())?;
        lock(&self.state).binding = Some(Binding { channel, pipe_id });
        trace!(pipe_id, "pipe endpoint bound");
        Ok(())
    }

    /// Send a message to the remote end.
    pub fn write_message(&self, bytes: &[u8], handles: Vec<PlatformHandle>) -> Result<()> {
        let (channel, pipe_id) = {
            let state = lock(&self.state);
            if state.closed {
                return Err(RouterError::PipeClosed);
            }
            if state.failure.is_some() {
                return Err(RouterError::PeerClosed);
            }
            match &state.binding {
                Some(binding) => (Arc::clone(&binding.channel), binding.pipe_id),
                None => return Err(RouterError::NotBound),
            }
        };
        channel.write(pipe_id, Bytes::copy_from_slice(bytes), handles)
    }

    /// Read the next received message. Pipe semantics apply: `NotFound`
    /// while empty, `PeerClosed` once empty and the remote end is gone.
    pub fn read_message(
        &self,
        buf: &mut [u8],
        flags: ReadFlags,
    ) -> std::result::Result<ReadOutcome, PipeError> {
        self.pipe.read_message(APP_PORT, buf, flags)
    }

    /// Park `waiter` until the endpoint is readable.
    pub fn add_waiter(
        &self,
        waiter: &Arc<Waiter>,
        flags: WaitFlags,
        context: u64,
    ) -> std::result::Result<(), PipeError> {
        self.pipe.add_waiter(APP_PORT, waiter, flags, context)
    }

    pub fn remove_waiter(&self, waiter: &Arc<Waiter>) {
        self.pipe.remove_waiter(APP_PORT, waiter)
    }

    /// Block until a message is readable, then read it.
    ///
    /// Convenience over the add-waiter/wait/read cycle.
    pub fn read_blocking(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<ReadOutcome> {
        loop {
            match self.pipe.read_message(APP_PORT, buf, ReadFlags::NONE) {
                Ok(outcome) => return Ok(outcome),
                Err(PipeError::NotFound) => {}
                Err(error) => return Err(RouterError::from_pipe(error)),
            }

            let waiter = Arc::new(Waiter::new());
            match self.pipe.add_waiter(APP_PORT, &waiter, WaitFlags::READABLE, 0) {
                Ok(()) => {}
                // Both resolve on the next read: as a message or PeerClosed.
                Err(PipeError::AlreadySatisfied) | Err(PipeError::NeverSatisfiable) => continue,
                Err(error) => return Err(RouterError::from_pipe(error)),
            }
            let waited = waiter.wait(timeout);
            self.pipe.remove_waiter(APP_PORT, &waiter);
            match waited {
                Ok(_) | Err(PipeError::NeverSatisfiable) => continue,
                Err(error) => return Err(RouterError::from_pipe(error)),
            }
        }
    }

    /// Wait until writes queued on the underlying channel reach the socket.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        let channel = {
            let state = lock(&self.state);
            match &state.binding {
                Some(binding) => Arc::clone(&binding.channel),
                None => return Err(RouterError::NotBound),
            }
        };
        channel.flush(timeout)
    }

    /// Why the channel gave up on this endpoint, if it has.
    pub fn failure(&self) -> Option<RouteError> {
        lock(&self.state).failure
    }

    /// Close the endpoint: unbind from the channel (telling the peer) and
    /// close both pipe ports. Exactly-once; a second close is an error.
    pub fn close(self: &Arc<Self>) -> Result<()> {
        let binding = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(RouterError::PipeClosed);
            }
            state.closed = true;
            state.binding.take()
        };

        let _ = self.pipe.close(APP_PORT);
        let _ = self.pipe.close(ROUTING_PORT);

        if let Some(binding) = binding {
            binding
                .channel
                .remove_route(binding.pipe_id, &self.as_route_delegate())?;
        }
        Ok(())
    }

    fn as_route_delegate(self: &Arc<Self>) -> Arc<dyn RouteDelegate> {
        Arc::clone(self) as Arc<dyn RouteDelegate>
    }
}

impl RouteDelegate for PipeDispatcher {
    fn on_message(&self, payload: Bytes, handles: Vec<PlatformHandle>) {
        // Routing port closed means the app already hung up; the message
        // (and its handles) just gets dropped.
        if let Err(error) = self.pipe.write_message(ROUTING_PORT, &payload, handles) {
            debug!(%error, "dropping inbound message for closed endpoint");
        }
    }

    fn on_error(&self, error: RouteError) {
        {
            let mut state = lock(&self.state);
            if state.failure.is_some() {
                return;
            }
            state.failure = Some(error);
        }
        trace!(?error, "pipe endpoint lost its peer");
        // Readers drain the queue, then see PeerClosed; waiters wake.
        let _ = self.pipe.close(ROUTING_PORT);
    }
}

impl RouterError {
    fn from_pipe(error: PipeError) -> RouterError {
        match error {
            PipeError::PeerClosed => RouterError::PeerClosed,
            PipeError::AlreadyClosed | PipeError::Cancelled => RouterError::PipeClosed,
            PipeError::TimedOut => RouterError::Timeout,
            other => RouterError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use pipemux_frame::FrameConfig;
    use pipemux_transport::{IoRunner, IpcStream};

    use super::*;

    fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        check()
    }

    fn channel_pair(runner: &IoRunner) -> (Arc<RoutedChannel>, Arc<RoutedChannel>) {
        let (left, right) = IpcStream::pair().unwrap();
        let a = RoutedChannel::new(left, FrameConfig::default(), runner.clone(), Box::new(|| {}))
            .unwrap();
        let b = RoutedChannel::new(right, FrameConfig::default(), runner.clone(), Box::new(|| {}))
            .unwrap();
        (a, b)
    }

    #[test]
    fn write_requires_binding() {
        let endpoint = PipeDispatcher::new();
        assert!(matches!(
            endpoint.write_message(b"early", Vec::new()),
            Err(RouterError::NotBound)
        ));
    }

    #[test]
    fn end_to_end_write_read() {
        let runner = IoRunner::new().unwrap();
        let (a, b) = channel_pair(&runner);

        let sender = PipeDispatcher::new();
        let receiver = PipeDispatcher::new();
        sender.bind(Arc::clone(&a), 5).unwrap();
        receiver.bind(Arc::clone(&b), 5).unwrap();

        sender.write_message(b"across processes", Vec::new()).unwrap();

        let mut buf = [0u8; 64];
        let outcome = receiver
            .read_blocking(&mut buf, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(&buf[..outcome.bytes], b"across processes");

        runner.shutdown();
    }

    #[test]
    fn close_tells_the_peer_exactly_once() {
        let runner = IoRunner::new().unwrap();
        let (a, b) = channel_pair(&runner);

        let near = PipeDispatcher::new();
        let far = PipeDispatcher::new();
        near.bind(Arc::clone(&a), 8).unwrap();
        far.bind(Arc::clone(&b), 8).unwrap();

        near.close().unwrap();

        assert!(wait_until(1000, || far.failure().is_some()));
        assert_eq!(far.failure(), Some(RouteError::PeerClosed));

        // Writes from the surviving side now fail.
        assert!(matches!(
            far.write_message(b"into the void", Vec::new()),
            Err(RouterError::PeerClosed)
        ));

        // And a second close of the near side is rejected.
        assert!(matches!(near.close(), Err(RouterError::PipeClosed)));

        far.close().unwrap();
        runner.shutdown();
    }

    #[test]
    fn peer_close_drains_before_failing_reads() {
        let runner = IoRunner::new().unwrap();
        let (a, b) = channel_pair(&runner);

        let near = PipeDispatcher::new();
        let far = PipeDispatcher::new();
        near.bind(Arc::clone(&a), 2).unwrap();
        far.bind(Arc::clone(&b), 2).unwrap();

        near.write_message(b"parting gift", Vec::new()).unwrap();
        a.flush(Duration::from_secs(1)).unwrap();
        near.close().unwrap();

        assert!(wait_until(1000, || far.failure().is_some()));

        let mut buf = [0u8; 64];
        let outcome = far.read_message(&mut buf, ReadFlags::NONE).unwrap();
        assert_eq!(&buf[..outcome.bytes], b"parting gift");
        assert!(matches!(
            far.read_message(&mut buf, ReadFlags::NONE),
            Err(PipeError::PeerClosed)
        ));

        far.close().unwrap();
        runner.shutdown();
    }

    #[test]
    fn waiter_wakes_on_arrival() {
        let runner = IoRunner::new().unwrap();
        let (a, b) = channel_pair(&runner);

        let sender = PipeDispatcher::new();
        let receiver = PipeDispatcher::new();
        sender.bind(Arc::clone(&a), 4).unwrap();
        receiver.bind(Arc::clone(&b), 4).unwrap();

        let waiter = Arc::new(Waiter::new());
        receiver.add_waiter(&waiter, WaitFlags::READABLE, 11).unwrap();

        let parked = Arc::clone(&waiter);
        let reader = thread::spawn(move || parked.wait(Some(Duration::from_secs(2))));

        sender.write_message(b"wake up", Vec::new()).unwrap();
        assert_eq!(reader.join().unwrap(), Ok(11));

        runner.shutdown();
    }
}
