//! Per-directory watch state machine.
//!
//! A watch point owns one backend handle and one read buffer. At most one
//! read is in flight at a time; the buffer moves to the backend while the
//! read is pending and comes back with the completion. The point drives
//! itself through:
//!
//! ```text
//! Uninitialized -> Listening <-> (completion handling) -> Listening
//!                      |                                    |
//!                      v                                    v
//!               FailedToListen                           Finished
//! ```
//!
//! `Finished` is terminal; the run loop drops the point (and with it the
//! handle) once it gets there.

use std::path::PathBuf;

use crate::backend::{CompletionStatus, WatchHandle, WatchToken};
use crate::error::WatchError;
use crate::event::EventSink;
use crate::record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PointStatus {
    Uninitialized,
    Listening,
    FailedToListen,
    Finished,
}

/// What the run loop should do with a point after a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompletionOutcome {
    /// The point re-armed itself; keep it.
    Listening,
    /// The point reached its terminal state; remove and drop it.
    Finished,
}

pub(crate) struct WatchPoint {
    path: PathBuf,
    token: WatchToken,
    handle: Box<dyn WatchHandle>,
    /// Read buffer; `None` while a read is in flight.
    buffer: Option<Vec<u8>>,
    status: PointStatus,
    cancelled: bool,
}

impl WatchPoint {
    pub(crate) fn new(
        path: PathBuf,
        token: WatchToken,
        handle: Box<dyn WatchHandle>,
        buffer_size: usize,
    ) -> Self {
        Self {
            path,
            token,
            handle,
            buffer: Some(vec![0u8; buffer_size]),
            status: PointStatus::Uninitialized,
            cancelled: false,
        }
    }

    pub(crate) fn path(&self) -> &PathBuf {
        &self.path
    }

    pub(crate) fn status(&self) -> PointStatus {
        self.status
    }

    /// True for a point that is watching and has not been told to stop.
    pub(crate) fn is_active(&self) -> bool {
        self.status == PointStatus::Listening && !self.cancelled
    }

    /// Submit the next read. On failure the point moves to
    /// `FailedToListen` and the error is returned to the caller.
    pub(crate) fn listen(&mut self) -> Result<(), WatchError> {
        let Some(buffer) = self.buffer.take() else {
            // A read is already in flight; the state machine never asks
            // for a second one, so treat this as a stopped watch.
            self.status = PointStatus::FailedToListen;
            return Err(WatchError::WatchStopped {
                path: self.path.clone(),
                reason: "read already in flight".to_string(),
            });
        };
        match self.handle.submit_read(self.token, buffer) {
            Ok(()) => {
                self.status = PointStatus::Listening;
                tracing::debug!(path = %self.path.display(), "listening");
                Ok(())
            }
            Err(err) => {
                self.status = PointStatus::FailedToListen;
                Err(err)
            }
        }
    }

    /// Ask the backend to cancel the in-flight read. Idempotent; the
    /// actual teardown happens when the cancellation completion arrives.
    pub(crate) fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        if self.status == PointStatus::Listening {
            tracing::debug!(path = %self.path.display(), "cancelling watch");
            self.handle.cancel();
        } else {
            // No read in flight, so no completion will arrive; finish now.
            self.status = PointStatus::Finished;
        }
    }

    /// Handle one completed read and decide whether the point stays alive.
    pub(crate) fn handle_completion(
        &mut self,
        status: CompletionStatus,
        buffer: Vec<u8>,
        sink: &dyn EventSink,
    ) -> CompletionOutcome {
        match status {
            CompletionStatus::Cancelled => {
                tracing::debug!(path = %self.path.display(), "watch cancelled");
                self.status = PointStatus::Finished;
                return CompletionOutcome::Finished;
            }
            CompletionStatus::Failed(code) => {
                self.status = PointStatus::Finished;
                sink.report_failure(&WatchError::WatchStopped {
                    path: self.path.clone(),
                    reason: format!("read failed with OS error {code}"),
                });
                return CompletionOutcome::Finished;
            }
            CompletionStatus::Transferred(0) => {
                // The OS ran out of buffer space and dropped changes; the
                // whole subtree must be treated as stale.
                tracing::warn!(path = %self.path.display(), "change buffer overflowed");
                sink.overflow(&self.path);
            }
            CompletionStatus::Transferred(n) => {
                let len = n.min(buffer.len());
                record::emit_records(&buffer[..len], &self.path, sink);
            }
        }

        self.buffer = Some(buffer);
        if self.cancelled {
            // A stop request arrived while this completion was queued.
            self.status = PointStatus::Finished;
            return CompletionOutcome::Finished;
        }
        match self.listen() {
            Ok(()) => CompletionOutcome::Listening,
            Err(err) => {
                self.status = PointStatus::Finished;
                sink.report_failure(&err);
                CompletionOutcome::Finished
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChangeType;
    use crate::record::{ACTION_ADDED, encode_records};
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubHandle {
        submits: Arc<AtomicUsize>,
        cancels: Arc<AtomicUsize>,
        fail_submit: Arc<AtomicBool>,
    }

    impl WatchHandle for StubHandle {
        fn submit_read(&mut self, _token: WatchToken, _buffer: Vec<u8>) -> Result<(), WatchError> {
            if self.fail_submit.load(Ordering::SeqCst) {
                return Err(WatchError::PathWatchFailed {
                    path: PathBuf::from("/p"),
                    reason: "stub failure".to_string(),
                });
            }
            self.submits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn cancel(&mut self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        changes: parking_lot::Mutex<Vec<(ChangeType, PathBuf)>>,
        failures: AtomicUsize,
    }

    impl EventSink for RecordingSink {
        fn path_changed(&self, change: ChangeType, path: &Path) {
            self.changes.lock().push((change, path.to_path_buf()));
        }

        fn report_failure(&self, _error: &WatchError) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }

        fn report_termination(&self) {}
    }

    fn point_with(handle: StubHandle) -> WatchPoint {
        WatchPoint::new(PathBuf::from("/p"), WatchToken(1), Box::new(handle), 64)
    }

    #[test]
    fn test_listen_moves_point_to_listening() {
        let mut point = point_with(StubHandle::default());
        assert_eq!(point.status(), PointStatus::Uninitialized);
        point.listen().unwrap();
        assert_eq!(point.status(), PointStatus::Listening);
        assert!(point.is_active());
    }

    #[test]
    fn test_failed_submit_moves_point_to_failed_to_listen() {
        let handle = StubHandle::default();
        handle.fail_submit.store(true, Ordering::SeqCst);
        let mut point = point_with(handle);
        assert!(point.listen().is_err());
        assert_eq!(point.status(), PointStatus::FailedToListen);
    }

    #[test]
    fn test_completion_emits_records_and_rearms() {
        let handle = StubHandle::default();
        let submits = Arc::clone(&handle.submits);
        let mut point = point_with(handle);
        point.listen().unwrap();

        let sink = RecordingSink::default();
        let mut buffer = vec![0u8; 64];
        let bytes = encode_records(&[(ACTION_ADDED, "new.txt")]);
        buffer[..bytes.len()].copy_from_slice(&bytes);

        let outcome =
            point.handle_completion(CompletionStatus::Transferred(bytes.len()), buffer, &sink);
        assert_eq!(outcome, CompletionOutcome::Listening);
        assert_eq!(submits.load(Ordering::SeqCst), 2);
        assert_eq!(
            *sink.changes.lock(),
            vec![(ChangeType::Created, PathBuf::from("/p").join("new.txt"))]
        );
    }

    #[test]
    fn test_overflow_reports_root_invalidated_and_rearms() {
        let mut point = point_with(StubHandle::default());
        point.listen().unwrap();

        let sink = RecordingSink::default();
        let outcome =
            point.handle_completion(CompletionStatus::Transferred(0), vec![0u8; 64], &sink);
        assert_eq!(outcome, CompletionOutcome::Listening);
        assert_eq!(
            *sink.changes.lock(),
            vec![(ChangeType::Invalidated, PathBuf::from("/p"))]
        );
    }

    #[test]
    fn test_cancelled_completion_finishes_point() {
        let mut point = point_with(StubHandle::default());
        point.listen().unwrap();
        point.cancel();

        let sink = RecordingSink::default();
        let outcome = point.handle_completion(CompletionStatus::Cancelled, vec![0u8; 64], &sink);
        assert_eq!(outcome, CompletionOutcome::Finished);
        assert_eq!(point.status(), PointStatus::Finished);
        assert_eq!(sink.failures.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_completion_reports_and_finishes() {
        let mut point = point_with(StubHandle::default());
        point.listen().unwrap();

        let sink = RecordingSink::default();
        let outcome = point.handle_completion(CompletionStatus::Failed(5), vec![0u8; 64], &sink);
        assert_eq!(outcome, CompletionOutcome::Finished);
        assert_eq!(sink.failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let handle = StubHandle::default();
        let cancels = Arc::clone(&handle.cancels);
        let mut point = point_with(handle);
        point.listen().unwrap();
        point.cancel();
        point.cancel();
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_before_listen_finishes_immediately() {
        let handle = StubHandle::default();
        let cancels = Arc::clone(&handle.cancels);
        let mut point = point_with(handle);
        point.cancel();
        assert_eq!(point.status(), PointStatus::Finished);
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_completion_after_cancel_finishes_without_rearm() {
        let handle = StubHandle::default();
        let submits = Arc::clone(&handle.submits);
        let mut point = point_with(handle);
        point.listen().unwrap();
        point.cancel();

        let sink = RecordingSink::default();
        let bytes = encode_records(&[(ACTION_ADDED, "late.txt")]);
        let mut buffer = vec![0u8; 64];
        buffer[..bytes.len()].copy_from_slice(&bytes);
        let outcome =
            point.handle_completion(CompletionStatus::Transferred(bytes.len()), buffer, &sink);

        // The queued change is still delivered, but no new read starts.
        assert_eq!(outcome, CompletionOutcome::Finished);
        assert_eq!(sink.changes.lock().len(), 1);
        assert_eq!(submits.load(Ordering::SeqCst), 1);
    }
}
