use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use pipemux_frame::{Frame, FrameConfig, FrameError, FrameReader, FrameWriter};
use pipemux_transport::{IoRunner, IpcStream};
use tracing::{debug, trace};

use crate::error::{Result, RouterError};
use crate::sync::lock;

/// Callback surface for inbound transport events.
///
/// Both methods run on the I/O worker thread, in arrival order.
pub trait TransportDelegate: Send + Sync {
    fn on_frame(&self, frame: Frame);
    fn on_error(&self, error: FrameError);
}

/// A reliable ordered frame carrier to one remote endpoint.
///
/// Owns one [`IpcStream`]. A reader thread decodes inbound frames and posts
/// them to the I/O worker for the delegate; a writer thread drains an
/// internal queue, so [`send`](Transport::send) never blocks. The delegate
/// sees at most one `on_error`, and none at all after a local
/// [`shutdown`](Transport::shutdown).
pub struct Transport {
    shared: Arc<Shared>,
}

struct Shared {
    stream: IpcStream,
    config: FrameConfig,
    runner: IoRunner,
    tx: Mutex<Option<Sender<Frame>>>,
    queue: Mutex<QueueState>,
    queue_cv: Condvar,
    /// Set once an error has been delivered or suppressed; gates `on_error`.
    errored: AtomicBool,
    down: AtomicBool,
}

#[derive(Default)]
struct QueueState {
    in_flight: usize,
    failed: bool,
}

impl Transport {
    pub fn new(stream: IpcStream, config: FrameConfig, runner: IoRunner) -> Self {
        Self {
            shared: Arc::new(Shared {
                stream,
                config,
                runner,
                tx: Mutex::new(None),
                queue: Mutex::new(QueueState::default()),
                queue_cv: Condvar::new(),
                errored: AtomicBool::new(false),
                down: AtomicBool::new(false),
            }),
        }
    }

    /// Spawn the I/O threads and begin delivering frames to `delegate`.
    ///
    /// The delegate is held weakly; once it drops, inbound frames are
    /// silently discarded.
    pub fn start(&self, delegate: Weak<dyn TransportDelegate>) -> Result<()> {
        let (tx, rx) = mpsc::channel::<Frame>();
        *lock(&self.shared.tx) = Some(tx);

        let reader_shared = Arc::clone(&self.shared);
        let reader_delegate = delegate.clone();
        let reader_stream = self.shared.stream.try_clone()?;
        let _reader = thread::Builder::new()
            .name("pipemux-transport-read".to_string())
            .spawn(move || {
                let mut reader =
                    FrameReader::with_config(reader_stream, reader_shared.config.clone());
                loop {
                    match reader.read_frame() {
                        Ok(frame) => {
                            let delegate = reader_delegate.clone();
                            let posted = reader_shared.runner.post(move || {
                                if let Some(delegate) = delegate.upgrade() {
                                    delegate.on_frame(frame);
                                }
                            });
                            if posted.is_err() {
                                break;
                            }
                        }
                        Err(error) => {
                            reader_shared.report_error(&reader_delegate, error);
                            break;
                        }
                    }
                }
                trace!("transport reader exiting");
            })
            .map_err(pipemux_transport::TransportError::Io)
            .map_err(RouterError::Transport)?;

        let writer_shared = Arc::clone(&self.shared);
        let writer_delegate = delegate;
        let writer_stream = self.shared.stream.try_clone()?;
        let _writer = thread::Builder::new()
            .name("pipemux-transport-write".to_string())
            .spawn(move || {
                let mut writer =
                    FrameWriter::with_config(writer_stream, writer_shared.config.clone());
                for frame in rx.iter() {
                    match writer.write_frame(frame) {
                        Ok(()) => writer_shared.complete_one(false),
                        Err(error) => {
                            writer_shared.report_error(&writer_delegate, error);
                            writer_shared.complete_one(true);
                            break;
                        }
                    }
                }
                // Anything still queued at exit is dropped, closing its
                // handles; account for it so flushers wake up.
                let mut remaining = 0usize;
                while rx.try_recv().is_ok() {
                    remaining += 1;
                }
                if remaining > 0 {
                    writer_shared.complete_many(remaining, true);
                }
                trace!("transport writer exiting");
            })
            .map_err(pipemux_transport::TransportError::Io)
            .map_err(RouterError::Transport)?;

        Ok(())
    }

    /// Queue a frame for sending. Never blocks.
    pub fn send(&self, frame: Frame) -> Result<()> {
        if self.shared.down.load(Ordering::SeqCst) {
            return Err(RouterError::TransportDown);
        }
        let guard = lock(&self.shared.tx);
        match &*guard {
            Some(tx) => {
                lock(&self.shared.queue).in_flight += 1;
                if tx.send(frame).is_err() {
                    self.shared.complete_one(true);
                    return Err(RouterError::TransportDown);
                }
                Ok(())
            }
            None => Err(RouterError::TransportDown),
        }
    }

    /// Wait until every queued frame has hit the socket.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut queue = lock(&self.shared.queue);
        loop {
            if queue.failed {
                return Err(RouterError::TransportDown);
            }
            if queue.in_flight == 0 {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RouterError::Timeout);
            }
            let (guard, _) = self
                .shared
                .queue_cv
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            queue = guard;
        }
    }

    /// Tear the transport down. Idempotent.
    ///
    /// Suppresses any further `on_error` to the delegate and unblocks both
    /// I/O threads.
    pub fn shutdown(&self) {
        if self.shared.down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.errored.store(true, Ordering::SeqCst);
        drop(lock(&self.shared.tx).take());
        let _ = self.shared.stream.shutdown();
        debug!("transport shut down");
    }

    pub fn is_down(&self) -> bool {
        self.shared.down.load(Ordering::SeqCst)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    /// Deliver `error` to the delegate exactly once, via the I/O worker.
    fn report_error(&self, delegate: &Weak<dyn TransportDelegate>, error: FrameError) {
        if self.errored.swap(true, Ordering::SeqCst) {
            return;
        }
        self.down.store(true, Ordering::SeqCst);
        let delegate = delegate.clone();
        let _ = self.runner.post(move || {
            if let Some(delegate) = delegate.upgrade() {
                delegate.on_error(error);
            }
        });
    }

    fn complete_one(&self, failed: bool) {
        self.complete_many(1, failed);
    }

    fn complete_many(&self, count: usize, failed: bool) {
        let mut queue = lock(&self.queue);
        queue.in_flight = queue.in_flight.saturating_sub(count);
        if failed {
            queue.failed = true;
        }
        self.queue_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use bytes::Bytes;
    use pipemux_frame::FrameKind;

    use super::*;

    struct Recorder {
        frames: StdMutex<Vec<(u64, Bytes)>>,
        errors: StdMutex<Vec<FrameError>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: StdMutex::new(Vec::new()),
                errors: StdMutex::new(Vec::new()),
            })
        }
    }

    impl TransportDelegate for Recorder {
        fn on_frame(&self, frame: Frame) {
            self.frames
                .lock()
                .unwrap()
                .push((frame.route_id, frame.payload));
        }

        fn on_error(&self, error: FrameError) {
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

    #[test]
    fn frames_arrive_on_the_io_worker_in_order() {
        let runner = IoRunner::new().unwrap();
        let (left, right) = IpcStream::pair().unwrap();

        let sender = Transport::new(left, FrameConfig::default(), runner.clone());
        sender.start(Weak::<Recorder>::new()).unwrap();

        let receiver = Transport::new(right, FrameConfig::default(), runner.clone());
        let recorder = Recorder::new();
        let delegate: Weak<dyn TransportDelegate> =
            Arc::downgrade(&(recorder.clone() as Arc<dyn TransportDelegate>));
        receiver.start(delegate).unwrap();

        for i in 0..10u64 {
            sender
                .send(Frame::data(i + 1, format!("msg-{i}").into_bytes(), Vec::new()))
                .unwrap();
        }
        sender.flush(Duration::from_secs(1)).unwrap();

        assert!(wait_until(1000, || recorder.frames.lock().unwrap().len() == 10));
        let frames = recorder.frames.lock().unwrap();
        for (i, (route, payload)) in frames.iter().enumerate() {
            assert_eq!(*route, i as u64 + 1);
            assert_eq!(payload.as_ref(), format!("msg-{i}").as_bytes());
        }

        runner.shutdown();
    }

    #[test]
    fn peer_loss_reports_exactly_one_error() {
        let runner = IoRunner::new().unwrap();
        let (left, right) = IpcStream::pair().unwrap();

        let transport = Transport::new(left, FrameConfig::default(), runner.clone());
        let recorder = Recorder::new();
        let delegate: Weak<dyn TransportDelegate> =
            Arc::downgrade(&(recorder.clone() as Arc<dyn TransportDelegate>));
        transport.start(delegate).unwrap();

        drop(right);

        assert!(wait_until(1000, || !recorder.errors.lock().unwrap().is_empty()));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(recorder.errors.lock().unwrap().len(), 1);
        assert!(transport.is_down());

        runner.shutdown();
    }

    #[test]
    fn local_shutdown_is_silent() {
        let runner = IoRunner::new().unwrap();
        let (left, _right) = IpcStream::pair().unwrap();

        let transport = Transport::new(left, FrameConfig::default(), runner.clone());
        let recorder = Recorder::new();
        let delegate: Weak<dyn TransportDelegate> =
            Arc::downgrade(&(recorder.clone() as Arc<dyn TransportDelegate>));
        transport.start(delegate).unwrap();

        transport.shutdown();
        thread::sleep(Duration::from_millis(50));
        assert!(recorder.errors.lock().unwrap().is_empty());
        assert!(matches!(
            transport.send(Frame::data(1, Bytes::new(), Vec::new())),
            Err(RouterError::TransportDown)
        ));

        runner.shutdown();
    }

    #[test]
    fn internal_frames_pass_through() {
        let runner = IoRunner::new().unwrap();
        let (left, right) = IpcStream::pair().unwrap();

        let sender = Transport::new(left, FrameConfig::default(), runner.clone());
        sender.start(Weak::<Recorder>::new()).unwrap();

        let receiver = Transport::new(right, FrameConfig::default(), runner.clone());
        let kinds = Arc::new(StdMutex::new(Vec::new()));

        struct KindRecorder {
            kinds: Arc<StdMutex<Vec<FrameKind>>>,
        }
        impl TransportDelegate for KindRecorder {
            fn on_frame(&self, frame: Frame) {
                self.kinds.lock().unwrap().push(frame.kind);
            }
            fn on_error(&self, _error: FrameError) {}
        }

        let kind_recorder = Arc::new(KindRecorder {
            kinds: Arc::clone(&kinds),
        });
        let delegate: Weak<dyn TransportDelegate> =
            Arc::downgrade(&(kind_recorder.clone() as Arc<dyn TransportDelegate>));
        receiver.start(delegate).unwrap();

        sender
            .send(Frame::internal(0, Bytes::from_static(b"\0ctl")))
            .unwrap();
        sender.flush(Duration::from_secs(1)).unwrap();

        assert!(wait_until(1000, || !kinds.lock().unwrap().is_empty()));
        assert_eq!(kinds.lock().unwrap()[0], FrameKind::Internal);

        runner.shutdown();
    }
}
