use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::debug;

use crate::error::{Result, TransportError};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// The dedicated I/O worker thread.
///
/// Every transport reader posts inbound frames here, so all demultiplexing
/// and all delegate callbacks in a process run single-threaded and in posting
/// order. Construct one per process, hand clones to whatever needs to
/// schedule work, and call [`shutdown`](IoRunner::shutdown) during teardown;
/// tasks already queued at shutdown still run.
#[derive(Clone)]
pub struct IoRunner {
    inner: Arc<Inner>,
}

struct Inner {
    tx: Mutex<Option<Sender<Task>>>,
    thread_id: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl IoRunner {
    /// Spawn the worker thread.
    pub fn new() -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Task>();
        let handle = thread::Builder::new()
            .name("pipemux-io".to_string())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    task();
                }
                debug!("I/O worker exiting");
            })
            .map_err(TransportError::Io)?;
        let thread_id = handle.thread().id();

        Ok(Self {
            inner: Arc::new(Inner {
                tx: Mutex::new(Some(tx)),
                thread_id,
                join: Mutex::new(Some(handle)),
            }),
        })
    }

    /// Queue a task for the worker. FIFO with respect to other posts.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        match &*lock(&self.inner.tx) {
            Some(tx) => tx
                .send(Box::new(task))
                .map_err(|_| TransportError::RunnerShutdown),
            None => Err(TransportError::RunnerShutdown),
        }
    }

    /// Whether the calling thread is the worker itself.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Stop accepting tasks, run out the queue, and join the worker.
    ///
    /// Joining is skipped when called from the worker thread.
    pub fn shutdown(&self) {
        drop(lock(&self.inner.tx).take());
        if !self.is_current() {
            if let Some(handle) = lock(&self.inner.join).take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        drop(
            self.tx
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        if let Some(handle) = self
            .join
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
