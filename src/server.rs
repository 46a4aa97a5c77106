//! Public server API.
//!
//! A [`WatchServer`] owns a dedicated watcher thread running the
//! [`RunLoop`](crate::runloop::RunLoop). Registration calls block the
//! caller until the watcher thread acknowledges them, so when `register`
//! returns `Ok`, changes under that path are already being captured.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, bounded, unbounded};
use parking_lot::{Condvar, Mutex};

use crate::backend::{Completion, DirectoryBackend, RunLoopWaker};
use crate::config::WatchConfig;
use crate::error::WatchError;
use crate::event::EventSink;
use crate::runloop::{ControlRequest, RunLoop};

/// Result of a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// A new watch was started for the path.
    Watching,
    /// The path was already being watched; no new watch was started.
    AlreadyWatching,
}

/// Result of an unregister request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisterOutcome {
    /// The watch was stopped (or was already stopping).
    Stopped,
    /// The path was not being watched.
    NotFound,
}

/// Constructs a backend on the watcher thread, wired to the completion
/// channel the run loop consumes.
pub type BackendFactory =
    Box<dyn FnOnce(Sender<Completion>) -> Result<Box<dyn DirectoryBackend>, WatchError> + Send>;

/// One-shot latch the watcher thread trips when it has fully drained.
#[derive(Clone, Default)]
pub(crate) struct TerminationSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl TerminationSignal {
    pub(crate) fn signal(&self) {
        let (lock, condvar) = &*self.inner;
        *lock.lock() = true;
        condvar.notify_all();
    }

    fn wait_for(&self, timeout: Duration) -> bool {
        let (lock, condvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut terminated = lock.lock();
        while !*terminated {
            if condvar.wait_until(&mut terminated, deadline).timed_out() {
                return *terminated;
            }
        }
        true
    }
}

/// Watches a set of directories and delivers their changes to one
/// [`EventSink`].
pub struct WatchServer {
    control_tx: Sender<ControlRequest>,
    waker: Arc<dyn RunLoopWaker>,
    termination: TerminationSignal,
    thread: Option<JoinHandle<()>>,
}

impl WatchServer {
    /// Start a server with the platform backend and default configuration.
    pub fn create(sink: Box<dyn EventSink>) -> Result<Self, WatchError> {
        Self::with_config(sink, WatchConfig::default())
    }

    /// Start a server with the platform backend.
    pub fn with_config(sink: Box<dyn EventSink>, config: WatchConfig) -> Result<Self, WatchError> {
        #[cfg(windows)]
        {
            Self::with_backend(sink, config, crate::backend::overlapped::factory())
        }
        #[cfg(not(windows))]
        {
            let _ = (sink, config);
            Err(WatchError::InitFailed {
                reason: "no directory watch backend for this platform".to_string(),
            })
        }
    }

    /// Start a server over an explicit backend. This is the injection
    /// point tests use to run the server against the simulated backend.
    pub fn with_backend(
        sink: Box<dyn EventSink>,
        config: WatchConfig,
        factory: BackendFactory,
    ) -> Result<Self, WatchError> {
        config.validate()?;
        let buffer_size = config.buffer_size;

        let (control_tx, control_rx) = unbounded();
        let (completion_tx, completion_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded::<Result<Arc<dyn RunLoopWaker>, WatchError>>(1);
        let termination = TerminationSignal::default();
        let loop_termination = termination.clone();

        let thread = thread::Builder::new()
            .name("vigil-watcher".to_string())
            .spawn(move || {
                let mut backend = match factory(completion_tx) {
                    Ok(backend) => backend,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let waker = backend.start();
                let _ = ready_tx.send(Ok(waker));
                RunLoop::new(
                    control_rx,
                    completion_rx,
                    backend,
                    sink,
                    loop_termination,
                    buffer_size,
                )
                .run();
            })
            .map_err(|err| WatchError::InitFailed {
                reason: format!("failed to spawn watcher thread: {err}"),
            })?;

        let waker = match ready_rx.recv() {
            Ok(Ok(waker)) => waker,
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(err);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(WatchError::ChannelClosed);
            }
        };

        Ok(Self {
            control_tx,
            waker,
            termination,
            thread: Some(thread),
        })
    }

    /// Start watching a directory. Blocks until the watcher thread has
    /// armed the watch; on return, subsequent changes under `path` will
    /// be delivered to the sink.
    pub fn register(&self, path: impl Into<PathBuf>) -> Result<RegisterOutcome, WatchError> {
        let (ack_tx, ack_rx) = bounded(1);
        self.control_tx
            .send(ControlRequest::Register {
                path: path.into(),
                ack: ack_tx,
            })
            .map_err(|_| WatchError::Terminated)?;
        self.waker.wake();
        ack_rx.recv().map_err(|_| WatchError::ChannelClosed)?
    }

    /// Register a batch of directories. Paths are processed in order and
    /// report success or failure independently; one bad path does not
    /// abort registration of the rest.
    pub fn register_all<I, P>(&self, paths: I) -> Vec<(PathBuf, Result<RegisterOutcome, WatchError>)>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        paths
            .into_iter()
            .map(|path| {
                let path = path.into();
                let result = self.register(path.clone());
                (path, result)
            })
            .collect()
    }

    /// Stop watching a directory. Blocks until the watcher thread has
    /// requested cancellation; queued changes observed before the stop
    /// may still be delivered afterwards.
    pub fn unregister(&self, path: impl Into<PathBuf>) -> Result<UnregisterOutcome, WatchError> {
        let (ack_tx, ack_rx) = bounded(1);
        self.control_tx
            .send(ControlRequest::Unregister {
                path: path.into(),
                ack: ack_tx,
            })
            .map_err(|_| WatchError::Terminated)?;
        self.waker.wake();
        ack_rx.recv().map_err(|_| WatchError::ChannelClosed)
    }

    /// Unregister a batch of directories, reporting per path.
    pub fn unregister_all<I, P>(
        &self,
        paths: I,
    ) -> Vec<(PathBuf, Result<UnregisterOutcome, WatchError>)>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        paths
            .into_iter()
            .map(|path| {
                let path = path.into();
                let result = self.unregister(path.clone());
                (path, result)
            })
            .collect()
    }

    /// Request termination and return immediately. Idempotent; safe to
    /// call on an already-terminated server.
    pub fn terminate(&self) {
        let _ = self.control_tx.send(ControlRequest::Terminate);
        self.waker.wake();
    }

    /// Wait up to `timeout` for the watcher thread to finish draining.
    /// Returns `true` once the sink has received its termination report.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.termination.wait_for(timeout)
    }
}

impl Drop for WatchServer {
    fn drop(&mut self) {
        self.terminate();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
