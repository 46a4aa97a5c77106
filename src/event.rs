//! Event model and the sink contract events are delivered through.

use std::path::{Path, PathBuf};

use crossbeam_channel::Sender;

use crate::error::WatchError;

/// Normalized classification of a filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Created,
    Removed,
    Modified,
    /// The OS change buffer overflowed. Changes within the overflow window
    /// were lost, so nothing under the watched root can be trusted.
    Invalidated,
    /// The OS reported an action code this engine does not recognize.
    Unknown,
}

/// Destination for decoded events, implemented by the embedding caller.
///
/// Every method is invoked on the watcher thread, strictly sequentially.
/// The engine never calls a sink reentrantly or from two threads at once,
/// so implementations need no internal synchronization beyond what their
/// own consumers require.
pub trait EventSink: Send {
    /// A change of the given type was observed at `path`.
    fn path_changed(&self, change: ChangeType, path: &Path);

    /// The OS reported an action this engine does not recognize for `path`.
    fn unknown_event(&self, path: &Path) {
        self.path_changed(ChangeType::Unknown, path);
    }

    /// The OS change buffer for the watch rooted at `path` overflowed.
    ///
    /// Reported once per overflow, for the root itself; the watch re-arms
    /// automatically.
    fn overflow(&self, path: &Path) {
        self.path_changed(ChangeType::Invalidated, path);
    }

    /// A failure occurred that is not expressible as a path change.
    fn report_failure(&self, error: &WatchError);

    /// The server has fully terminated; no further calls will follow.
    fn report_termination(&self);
}

/// Notification delivered by a [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Changed { change: ChangeType, path: PathBuf },
    Failure(WatchError),
    Terminated,
}

/// An [`EventSink`] that forwards every notification over a channel, for
/// callers that consume events from their own loop.
pub struct ChannelSink {
    tx: Sender<Notification>,
}

impl ChannelSink {
    pub fn new(tx: Sender<Notification>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn path_changed(&self, change: ChangeType, path: &Path) {
        // A dropped receiver means the caller stopped listening.
        let _ = self.tx.send(Notification::Changed {
            change,
            path: path.to_path_buf(),
        });
    }

    fn report_failure(&self, error: &WatchError) {
        let _ = self.tx.send(Notification::Failure(error.clone()));
    }

    fn report_termination(&self) {
        let _ = self.tx.send(Notification::Terminated);
    }
}
