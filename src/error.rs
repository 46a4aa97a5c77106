//! Error types for the watch engine.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by watch server operations.
///
/// Failures local to one watched path never cascade: a `PathWatchFailed`
/// or `WatchStopped` affects only the path it names.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    #[error("Failed to initialize watch server: {reason}")]
    InitFailed { reason: String },

    #[error("Cannot watch path {}: {reason}", .path.display())]
    PathWatchFailed { path: PathBuf, reason: String },

    #[error("Watch on {} stopped unexpectedly: {reason}", .path.display())]
    WatchStopped { path: PathBuf, reason: String },

    #[error("Watch server is terminated")]
    Terminated,

    #[error("Watch server channel closed unexpectedly")]
    ChannelClosed,
}
