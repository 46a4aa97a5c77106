//! Backend abstraction between the run loop and the OS watch mechanism.
//!
//! The run loop never talks to the operating system directly. It opens
//! directories through a [`DirectoryBackend`], submits reads through the
//! returned [`WatchHandle`], and consumes [`Completion`]s for reads that
//! finished. The production backend drives overlapped directory reads on
//! Windows; the simulated backend scripts completions for tests on any
//! platform.

use std::path::Path;
use std::sync::Arc;

use crate::error::WatchError;

pub mod sim;

#[cfg(windows)]
pub mod overlapped;

/// Identity of one watch for the lifetime of a server.
///
/// Tokens are never reused, so a completion carrying a token the run loop
/// no longer knows about is provably stale and can be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchToken(pub(crate) u64);

/// How a submitted read ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The read delivered `n` bytes of change records. Zero bytes means
    /// the OS buffer overflowed and changes were dropped.
    Transferred(usize),
    /// The read was cancelled; no further completions will arrive for
    /// this watch.
    Cancelled,
    /// The read failed with an OS error code.
    Failed(i32),
}

/// One finished read. The buffer lent out by `submit_read` travels back
/// here so the watch point can reuse it for the next read.
#[derive(Debug)]
pub struct Completion {
    pub token: WatchToken,
    pub status: CompletionStatus,
    pub buffer: Vec<u8>,
}

/// Factory and lifecycle hooks for a watch mechanism.
///
/// Lives on the watcher thread; `open` and `park` are only ever called
/// from there.
pub trait DirectoryBackend: Send {
    /// Open `path` for watching under the given token.
    fn open(&mut self, path: &Path, token: WatchToken) -> Result<Box<dyn WatchHandle>, WatchError>;

    /// Called once on the watcher thread before the run loop starts.
    /// Returns the waker other threads use to interrupt this backend's
    /// blocking wait.
    fn start(&mut self) -> Arc<dyn RunLoopWaker> {
        Arc::new(NoopWaker)
    }

    /// Block until woken or until a completion may have been produced.
    ///
    /// Returns `true` if the backend performed its own blocking wait, or
    /// `false` to let the run loop block on its channels instead.
    fn park(&mut self) -> bool {
        false
    }
}

/// One watched directory as seen by the backend.
///
/// Dropping the handle releases the underlying OS resource. The run loop
/// only drops a handle after the watch reached its terminal state, so no
/// completion can arrive for a closed handle.
pub trait WatchHandle: Send {
    /// Submit one asynchronous read into `buffer`. Ownership of the
    /// buffer moves to the backend until the matching [`Completion`]
    /// returns it.
    fn submit_read(&mut self, token: WatchToken, buffer: Vec<u8>) -> Result<(), WatchError>;

    /// Request cancellation of the in-flight read, if any. The read
    /// still ends with a completion (usually [`CompletionStatus::Cancelled`]).
    fn cancel(&mut self);
}

/// Interrupts the watcher thread's blocking wait so it notices new
/// control requests.
pub trait RunLoopWaker: Send + Sync {
    fn wake(&self);
}

/// Waker for backends whose run loop blocks on channels; channel sends
/// wake the receiver by themselves.
pub struct NoopWaker;

impl RunLoopWaker for NoopWaker {
    fn wake(&self) {}
}
