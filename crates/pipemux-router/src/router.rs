use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use pipemux_frame::{Frame, FrameConfig, FrameError};
use pipemux_transport::{IoRunner, IpcStream, PlatformHandle};
use tracing::{debug, trace, warn};

use crate::error::{Result, RouterError};
use crate::sync::lock;
use crate::transport::{Transport, TransportDelegate};

/// Route id reserved for the channel's own control traffic.
pub const CONTROL_ROUTE: u64 = 0;

/// Control-route opcode: the sender has closed its end of a pipe.
const OP_ROUTE_CLOSED: u8 = 0;

/// Wire size of a ROUTE_CLOSED payload: opcode byte + pipe id.
const ROUTE_CLOSED_LEN: usize = 1 + 8;

/// Per-route errors delivered to a bound dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// The remote end of this pipe closed; no more data will arrive.
    #[error("peer closed its end of the pipe")]
    PeerClosed,

    /// The transport to the remote process failed; every route on it is dead.
    #[error("transport to the peer process failed")]
    Disconnected,
}

/// Callback surface a route binds into the channel.
///
/// Calls arrive on the I/O worker with the channel's lock held: they must
/// not call back into the same channel on the same stack (queue follow-up
/// work on the I/O runner instead).
pub trait RouteDelegate: Send + Sync {
    fn on_message(&self, payload: Bytes, handles: Vec<PlatformHandle>);
    fn on_error(&self, error: RouteError);
}

struct PendingFrame {
    route_id: u64,
    payload: Bytes,
    handles: Vec<PlatformHandle>,
}

struct RouterState {
    routes: HashMap<u64, Arc<dyn RouteDelegate>>,
    pending: Vec<PendingFrame>,
    /// Pipes whose remote end already announced its close.
    closed_routes: HashSet<u64>,
    transport_down: bool,
}

type DestructHook = Box<dyn FnOnce() + Send>;

/// Demultiplexes one transport into many logical routes keyed by pipe id.
///
/// Frames for routes nobody has bound yet are buffered and replayed, in
/// order, when the route appears — one side of a pipe may connect, send, and
/// even close before the other side registers. Route closure is bilateral
/// with no ping-pong: whichever side removes its route first tells the peer
/// once, and the peer's removal then consumes that notice silently.
///
/// The channel deregisters itself (via the hook handed to [`new`]) once the
/// transport is down and the last route is gone.
///
/// [`new`]: RoutedChannel::new
pub struct RoutedChannel {
    transport: Transport,
    state: Mutex<RouterState>,
    destruct: Mutex<Option<DestructHook>>,
    runner: IoRunner,
}

impl RoutedChannel {
    /// Build a channel over `stream` and start its I/O.
    ///
    /// `destruct` runs exactly once when the channel retires; the owner uses
    /// it to drop its reference (registry eviction).
    pub fn new(
        stream: IpcStream,
        config: FrameConfig,
        runner: IoRunner,
        destruct: DestructHook,
    ) -> Result<Arc<Self>> {
        let channel = Arc::new(Self {
            transport: Transport::new(stream, config, runner.clone()),
            state: Mutex::new(RouterState {
                routes: HashMap::new(),
                pending: Vec::new(),
                closed_routes: HashSet::new(),
                transport_down: false,
            }),
            destruct: Mutex::new(Some(destruct)),
            runner,
        });
        let delegate: Weak<dyn TransportDelegate> =
            Arc::downgrade(&(channel.clone() as Arc<dyn TransportDelegate>));
        channel.transport.start(delegate)?;
        Ok(channel)
    }

    /// Bind `delegate` to `pipe_id`.
    ///
    /// Any frames buffered for the route are replayed into the delegate in
    /// arrival order before this returns; if the peer already closed the
    /// route, `on_error(PeerClosed)` follows them.
    pub fn add_route(&self, pipe_id: u64, delegate: Arc<dyn RouteDelegate>) -> Result<()> {
        if pipe_id == CONTROL_ROUTE {
            return Err(RouterError::ReservedRoute);
        }
        let mut state = lock(&self.state);
        if state.routes.contains_key(&pipe_id) {
            return Err(RouterError::RouteExists(pipe_id));
        }
        state.routes.insert(pipe_id, Arc::clone(&delegate));
        trace!(pipe_id, "route bound");

        let mut i = 0;
        while i < state.pending.len() {
            if state.pending[i].route_id == pipe_id {
                let frame = state.pending.remove(i);
                delegate.on_message(frame.payload, frame.handles);
            } else {
                i += 1;
            }
        }

        if state.closed_routes.contains(&pipe_id) {
            delegate.on_error(RouteError::PeerClosed);
        }
        Ok(())
    }

    /// Unbind `pipe_id`; `delegate` must be the currently-bound dispatcher.
    ///
    /// Tells the peer the route closed — unless the peer said it first, in
    /// which case the notice is consumed and nothing is sent (each side
    /// hears at most one close per pipe).
    pub fn remove_route(&self, pipe_id: u64, delegate: &Arc<dyn RouteDelegate>) -> Result<()> {
        let mut state = lock(&self.state);
        match state.routes.get(&pipe_id) {
            None => return Err(RouterError::RouteMissing(pipe_id)),
            Some(bound) if !same_delegate(bound, delegate) => {
                return Err(RouterError::DispatcherMismatch(pipe_id));
            }
            Some(_) => {}
        }
        state.routes.remove(&pipe_id);
        trace!(pipe_id, "route unbound");

        if state.closed_routes.remove(&pipe_id) {
            // The peer closed first; both sides have now met.
        } else if !state.transport_down {
            let mut payload = BytesMut::with_capacity(ROUTE_CLOSED_LEN);
            payload.put_u8(OP_ROUTE_CLOSED);
            payload.put_u64_le(pipe_id);
            if let Err(error) = self
                .transport
                .send(Frame::internal(CONTROL_ROUTE, payload.freeze()))
            {
                debug!(pipe_id, %error, "close notice lost to a racing transport failure");
            }
        }

        if state.transport_down && state.routes.is_empty() {
            // Deferred: the caller may be several frames up the same stack.
            self.schedule_destruct();
        }
        Ok(())
    }

    /// Send `payload` and `handles` to the remote end of `pipe_id`.
    pub fn write(&self, pipe_id: u64, payload: Bytes, handles: Vec<PlatformHandle>) -> Result<()> {
        if pipe_id == CONTROL_ROUTE {
            return Err(RouterError::ReservedRoute);
        }
        self.transport.send(Frame::data(pipe_id, payload, handles))
    }

    /// Wait until everything queued on the transport reached the socket.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        self.transport.flush(timeout)
    }

    /// Frames currently buffered for unbound routes.
    pub fn pending_frame_count(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Whether a peer close notice for `pipe_id` is waiting to be consumed.
    pub fn peer_close_pending(&self, pipe_id: u64) -> bool {
        lock(&self.state).closed_routes.contains(&pipe_id)
    }

    pub fn is_transport_down(&self) -> bool {
        self.transport.is_down()
    }

    fn handle_control(&self, state: &mut RouterState, frame: Frame) {
        let payload = frame.payload;
        if payload.len() < ROUTE_CLOSED_LEN {
            // Shorter than the oldest layout any opcode ever had: a stray
            // from a confused-but-tolerable peer. Drop it and move on.
            debug!(len = payload.len(), "discarding undersized control frame");
            return;
        }
        if payload.len() != ROUTE_CLOSED_LEN || payload[0] != OP_ROUTE_CLOSED {
            warn!(
                len = payload.len(),
                opcode = payload[0],
                "malformed control frame; failing channel"
            );
            self.fail(state);
            return;
        }

        let pipe_id = u64::from_le_bytes(payload[1..9].try_into().expect("slice length is 8"));
        if !state.closed_routes.insert(pipe_id) {
            warn!(pipe_id, "second close notice for one route; failing channel");
            self.fail(state);
            return;
        }
        trace!(pipe_id, "peer closed route");

        // Bound: tell the dispatcher now (it stays bound until its owner
        // removes it). Unbound: the notice waits in closed_routes for a
        // future add_route to consume.
        if let Some(delegate) = state.routes.get(&pipe_id) {
            delegate.on_error(RouteError::PeerClosed);
        }
    }

    /// Fatal path: kill the transport and notify every bound route.
    fn fail(&self, state: &mut RouterState) {
        self.transport.shutdown();
        state.transport_down = true;
        for delegate in state.routes.values() {
            delegate.on_error(RouteError::Disconnected);
        }
        if state.routes.is_empty() {
            self.schedule_destruct();
        }
    }

    fn schedule_destruct(&self) {
        if let Some(hook) = lock(&self.destruct).take() {
            if self.runner.post(hook).is_err() {
                debug!("I/O runner gone; channel retires with it");
            }
        }
    }

    fn run_destruct_now(&self) {
        if let Some(hook) = lock(&self.destruct).take() {
            hook();
        }
    }
}

impl TransportDelegate for RoutedChannel {
    fn on_frame(&self, frame: Frame) {
        let mut state = lock(&self.state);
        if frame.route_id == CONTROL_ROUTE {
            self.handle_control(&mut state, frame);
            return;
        }

        // The common case finds a bound route. The miss is the registration
        // race: the peer connected and wrote before this side registered, so
        // buffer until add_route replays it.
        match state.routes.get(&frame.route_id) {
            Some(delegate) => {
                let delegate = Arc::clone(delegate);
                delegate.on_message(frame.payload, frame.handles);
            }
            None => {
                trace!(route_id = frame.route_id, "buffering frame for unbound route");
                state.pending.push(PendingFrame {
                    route_id: frame.route_id,
                    payload: frame.payload,
                    handles: frame.handles,
                });
            }
        }
    }

    fn on_error(&self, error: FrameError) {
        debug!(%error, "transport failed");
        let destruct_inline = {
            let mut state = lock(&self.state);
            self.transport.shutdown();
            state.transport_down = true;
            if state.routes.is_empty() {
                true
            } else {
                for delegate in state.routes.values() {
                    delegate.on_error(RouteError::Disconnected);
                }
                false
            }
        };
        // No routes means nobody upstack can hold a reference into us, and
        // we are on the I/O worker: retiring right here is safe.
        if destruct_inline {
            self.run_destruct_now();
        }
    }
}

impl Drop for RoutedChannel {
    fn drop(&mut self) {
        self.transport.shutdown();
        // Undrained pending frames drop here, closing their handles.
    }
}

/// Identity comparison for `Arc<dyn RouteDelegate>`.
///
/// Compares the data pointer only: `Arc::ptr_eq` on trait objects also
/// compares vtable pointers, which may differ across codegen units.
fn same_delegate(a: &Arc<dyn RouteDelegate>, b: &Arc<dyn RouteDelegate>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a).cast::<()>(),
        Arc::as_ptr(b).cast::<()>(),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::thread;
    use std::time::Instant;

    use super::*;

    struct Recorder {
        messages: StdMutex<Vec<Bytes>>,
        errors: StdMutex<Vec<RouteError>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: StdMutex::new(Vec::new()),
                errors: StdMutex::new(Vec::new()),
            })
        }

        fn as_delegate(self: &Arc<Self>) -> Arc<dyn RouteDelegate> {
            Arc::clone(self) as Arc<dyn RouteDelegate>
        }
    }

    impl RouteDelegate for Recorder {
        fn on_message(&self, payload: Bytes, _handles: Vec<PlatformHandle>) {
            self.messages.lock().unwrap().push(payload);
        }

        fn on_error(&self, error: RouteError) {
            self.errors.lock().unwrap().push(error);
        }
    }

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

    fn channel_pair(
        runner: &IoRunner,
    ) -> (Arc<RoutedChannel>, Arc<RoutedChannel>, Arc<AtomicUsize>) {
        let destructs = Arc::new(AtomicUsize::new(0));
        let (left, right) = IpcStream::pair().unwrap();
        let left_count = Arc::clone(&destructs);
        let a = RoutedChannel::new(
            left,
            FrameConfig::default(),
            runner.clone(),
            Box::new(move || {
                left_count.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        let right_count = Arc::clone(&destructs);
        let b = RoutedChannel::new(
            right,
            FrameConfig::default(),
            runner.clone(),
            Box::new(move || {
                right_count.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        (a, b, destructs)
    }

    #[test]
    fn reserved_route_rejected() {
        let runner = IoRunner::new().unwrap();
        let (a, _b, _d) = channel_pair(&runner);
        let recorder = Recorder::new();
        assert!(matches!(
            a.add_route(CONTROL_ROUTE, recorder.as_delegate()),
            Err(RouterError::ReservedRoute)
        ));
        assert!(matches!(
            a.write(CONTROL_ROUTE, Bytes::new(), Vec::new()),
            Err(RouterError::ReservedRoute)
        ));
        runner.shutdown();
    }

    #[test]
    fn double_bind_rejected() {
        let runner = IoRunner::new().unwrap();
        let (a, _b, _d) = channel_pair(&runner);
        let first = Recorder::new();
        let second = Recorder::new();
        a.add_route(4, first.as_delegate()).unwrap();
        assert!(matches!(
            a.add_route(4, second.as_delegate()),
            Err(RouterError::RouteExists(4))
        ));
        runner.shutdown();
    }

    #[test]
    fn remove_requires_matching_dispatcher() {
        let runner = IoRunner::new().unwrap();
        let (a, _b, _d) = channel_pair(&runner);
        let bound = Recorder::new();
        let impostor = Recorder::new();
        a.add_route(4, bound.as_delegate()).unwrap();

        assert!(matches!(
            a.remove_route(4, &impostor.as_delegate()),
            Err(RouterError::DispatcherMismatch(4))
        ));
        assert!(matches!(
            a.remove_route(9, &bound.as_delegate()),
            Err(RouterError::RouteMissing(9))
        ));
        a.remove_route(4, &bound.as_delegate()).unwrap();
        runner.shutdown();
    }

    #[test]
    fn bound_route_receives_in_order() {
        let runner = IoRunner::new().unwrap();
        let (a, b, _d) = channel_pair(&runner);
        let recorder = Recorder::new();
        a.add_route(7, recorder.as_delegate()).unwrap();

        for i in 0..5u8 {
            b.write(7, Bytes::copy_from_slice(&[i]), Vec::new()).unwrap();
        }

        assert!(wait_until(1000, || recorder.messages.lock().unwrap().len() == 5));
        let messages = recorder.messages.lock().unwrap();
        for (i, payload) in messages.iter().enumerate() {
            assert_eq!(payload.as_ref(), &[i as u8]);
        }
        runner.shutdown();
    }

    #[test]
    fn registration_race_replays_then_shuts_down() {
        // The peer binds, writes twice, and closes before this side
        // registers. The late add_route must observe both messages in order
        // and then the close, exactly once.
        let runner = IoRunner::new().unwrap();
        let (a, b, _d) = channel_pair(&runner);

        let remote = Recorder::new();
        b.add_route(7, remote.as_delegate()).unwrap();
        b.write(7, Bytes::from_static(b"first"), Vec::new()).unwrap();
        b.write(7, Bytes::from_static(b"second"), Vec::new()).unwrap();
        b.remove_route(7, &remote.as_delegate()).unwrap();

        assert!(wait_until(1000, || {
            a.pending_frame_count() == 2 && a.peer_close_pending(7)
        }));

        let late = Recorder::new();
        a.add_route(7, late.as_delegate()).unwrap();

        let messages = late.messages.lock().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].as_ref(), b"first");
        assert_eq!(messages[1].as_ref(), b"second");
        drop(messages);

        let errors = late.errors.lock().unwrap();
        assert_eq!(*errors, vec![RouteError::PeerClosed]);
        runner.shutdown();
    }

    #[test]
    fn symmetric_close_has_no_ping_pong() {
        let runner = IoRunner::new().unwrap();
        let (a, b, _d) = channel_pair(&runner);

        // A long-lived side route proves the channel survives: a duplicate
        // ROUTE_CLOSED would fail it.
        let side_a = Recorder::new();
        let side_b = Recorder::new();
        a.add_route(9, side_a.as_delegate()).unwrap();
        b.add_route(9, side_b.as_delegate()).unwrap();

        let end_a = Recorder::new();
        let end_b = Recorder::new();
        a.add_route(5, end_a.as_delegate()).unwrap();
        b.add_route(5, end_b.as_delegate()).unwrap();

        let a_clone = Arc::clone(&a);
        let end_a_delegate = end_a.as_delegate();
        let closer = thread::spawn(move || {
            a_clone.remove_route(5, &end_a_delegate).unwrap();
        });
        b.remove_route(5, &end_b.as_delegate()).unwrap();
        closer.join().unwrap();

        // Let both close notices (if any) land and be consumed.
        thread::sleep(Duration::from_millis(50));
        assert!(!a.is_transport_down(), "duplicate close notice failed channel");
        assert!(!b.is_transport_down(), "duplicate close notice failed channel");

        // The surviving route still works.
        b.write(9, Bytes::from_static(b"alive"), Vec::new()).unwrap();
        assert!(wait_until(1000, || !side_a.messages.lock().unwrap().is_empty()));
        runner.shutdown();
    }

    #[test]
    fn transport_loss_notifies_each_route_once_then_defers_destruction() {
        let runner = IoRunner::new().unwrap();
        let (a, b, destructs) = channel_pair(&runner);

        let recorders: Vec<Arc<Recorder>> = [3u64, 5, 7]
            .iter()
            .map(|&id| {
                let recorder = Recorder::new();
                a.add_route(id, recorder.as_delegate()).unwrap();
                recorder
            })
            .collect();

        drop(b); // Kill the remote end of the transport.

        assert!(wait_until(1000, || {
            recorders
                .iter()
                .all(|r| !r.errors.lock().unwrap().is_empty())
        }));
        thread::sleep(Duration::from_millis(30));
        for recorder in &recorders {
            assert_eq!(*recorder.errors.lock().unwrap(), vec![RouteError::Disconnected]);
        }

        // Still registered: destruction waits for the last remove_route.
        assert_eq!(destructs.load(Ordering::SeqCst), 0);
        for (recorder, id) in recorders.iter().zip([3u64, 5, 7]) {
            a.remove_route(id, &recorder.as_delegate()).unwrap();
        }
        assert!(wait_until(1000, || destructs.load(Ordering::SeqCst) == 1));
        runner.shutdown();
    }

    #[test]
    fn undersized_control_frame_is_discarded_not_fatal() {
        let runner = IoRunner::new().unwrap();
        let _destructs = Arc::new(AtomicUsize::new(0));
        let (left, right) = IpcStream::pair().unwrap();
        let count = Arc::clone(&_destructs);
        let a = RoutedChannel::new(
            left,
            FrameConfig::default(),
            runner.clone(),
            Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        let recorder = Recorder::new();
        a.add_route(3, recorder.as_delegate()).unwrap();

        // Hand-craft a known opcode with a payload one byte long, then a
        // valid data frame behind it.
        let mut writer = pipemux_frame::FrameWriter::new(right);
        writer
            .write_frame(Frame::internal(CONTROL_ROUTE, Bytes::from_static(&[OP_ROUTE_CLOSED])))
            .unwrap();
        writer
            .write_frame(Frame::data(3, Bytes::from_static(b"after"), Vec::new()))
            .unwrap();

        assert!(wait_until(1000, || !recorder.messages.lock().unwrap().is_empty()));
        assert_eq!(recorder.messages.lock().unwrap()[0].as_ref(), b"after");
        assert!(recorder.errors.lock().unwrap().is_empty());
        assert!(!a.is_transport_down());
        runner.shutdown();
    }

    #[test]
    fn malformed_control_frame_is_fatal() {
        let runner = IoRunner::new().unwrap();
        let (left, right) = IpcStream::pair().unwrap();
        let a = RoutedChannel::new(
            left,
            FrameConfig::default(),
            runner.clone(),
            Box::new(|| {}),
        )
        .unwrap();

        let recorder = Recorder::new();
        a.add_route(3, recorder.as_delegate()).unwrap();

        // Correct length, unknown opcode.
        let mut payload = BytesMut::new();
        payload.put_u8(0x7F);
        payload.put_u64_le(3);
        let mut writer = pipemux_frame::FrameWriter::new(right);
        writer
            .write_frame(Frame::internal(CONTROL_ROUTE, payload.freeze()))
            .unwrap();

        assert!(wait_until(1000, || !recorder.errors.lock().unwrap().is_empty()));
        assert_eq!(
            *recorder.errors.lock().unwrap(),
            vec![RouteError::Disconnected]
        );
        assert!(a.is_transport_down());
        runner.shutdown();
    }

    #[test]
    fn duplicate_close_notice_is_fatal() {
        let runner = IoRunner::new().unwrap();
        let (left, right) = IpcStream::pair().unwrap();
        let a = RoutedChannel::new(
            left,
            FrameConfig::default(),
            runner.clone(),
            Box::new(|| {}),
        )
        .unwrap();

        let mut payload = BytesMut::new();
        payload.put_u8(OP_ROUTE_CLOSED);
        payload.put_u64_le(42);
        let once = payload.freeze();

        let mut writer = pipemux_frame::FrameWriter::new(right);
        writer
            .write_frame(Frame::internal(CONTROL_ROUTE, once.clone()))
            .unwrap();
        writer
            .write_frame(Frame::internal(CONTROL_ROUTE, once))
            .unwrap();

        assert!(wait_until(1000, || a.is_transport_down()));
        runner.shutdown();
    }

    #[test]
    fn write_after_transport_loss_fails_cleanly() {
        let runner = IoRunner::new().unwrap();
        let (a, b, _d) = channel_pair(&runner);
        let recorder = Recorder::new();
        a.add_route(2, recorder.as_delegate()).unwrap();

        drop(b);
        assert!(wait_until(1000, || a.is_transport_down()));
        assert!(matches!(
            a.write(2, Bytes::from_static(b"too late"), Vec::new()),
            Err(RouterError::TransportDown)
        ));
        a.remove_route(2, &recorder.as_delegate()).unwrap();
        runner.shutdown();
    }
}
