//! Simulated backend for deterministic tests.
//!
//! Mirrors the production backend's contract without touching the OS:
//! tests script read completions (change buffers, overflows, failures)
//! through a [`SimController`] and the run loop consumes them exactly as
//! it would consume real I/O completions.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::backend::{Completion, CompletionStatus, DirectoryBackend, WatchHandle, WatchToken};
use crate::error::WatchError;
use crate::server::BackendFactory;

struct SimWatch {
    path: PathBuf,
    /// Buffer for the in-flight read, if one is pending.
    pending: Option<Vec<u8>>,
}

#[derive(Default)]
struct SimShared {
    completion_tx: Mutex<Option<Sender<Completion>>>,
    watches: Mutex<HashMap<WatchToken, SimWatch>>,
    opened: Mutex<Vec<PathBuf>>,
    fail_open: Mutex<HashSet<PathBuf>>,
    fail_submit: Mutex<HashSet<PathBuf>>,
    defer_cancel: AtomicBool,
    held: Mutex<Vec<Completion>>,
}

impl SimShared {
    fn send(&self, completion: Completion) {
        if let Some(tx) = self.completion_tx.lock().as_ref() {
            // The run loop may already be gone at shutdown.
            let _ = tx.send(completion);
        }
    }

    fn token_for(&self, path: &Path) -> Option<WatchToken> {
        self.watches
            .lock()
            .iter()
            .find(|(_, watch)| watch.path == path)
            .map(|(token, _)| *token)
    }

    fn complete(&self, path: &Path, status: CompletionStatus, fill: &[u8]) -> bool {
        let token = match self.token_for(path) {
            Some(token) => token,
            None => return false,
        };
        let mut watches = self.watches.lock();
        let watch = match watches.get_mut(&token) {
            Some(watch) => watch,
            None => return false,
        };
        let mut buffer = match watch.pending.take() {
            Some(buffer) => buffer,
            None => return false,
        };
        let n = fill.len().min(buffer.len());
        buffer[..n].copy_from_slice(&fill[..n]);
        drop(watches);
        self.send(Completion {
            token,
            status,
            buffer,
        });
        true
    }
}

/// Test-side remote control for the simulated backend.
#[derive(Clone, Default)]
pub struct SimController {
    shared: Arc<SimShared>,
}

impl SimController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend factory to hand to `WatchServer::with_backend`.
    pub fn factory(&self) -> BackendFactory {
        let shared = Arc::clone(&self.shared);
        Box::new(move |completion_tx| {
            *shared.completion_tx.lock() = Some(completion_tx);
            Ok(Box::new(SimBackend { shared }) as Box<dyn DirectoryBackend>)
        })
    }

    /// How many opens the backend has seen in total, including watches
    /// that have since been closed.
    pub fn open_count(&self) -> usize {
        self.shared.opened.lock().len()
    }

    /// Number of watches currently open.
    pub fn live_watches(&self) -> usize {
        self.shared.watches.lock().len()
    }

    /// True while a read is pending for `path`.
    pub fn is_listening(&self, path: &Path) -> bool {
        let shared = &self.shared;
        shared
            .token_for(path)
            .map(|token| {
                shared
                    .watches
                    .lock()
                    .get(&token)
                    .is_some_and(|watch| watch.pending.is_some())
            })
            .unwrap_or(false)
    }

    /// Make the next open of `path` fail.
    pub fn fail_next_open(&self, path: &Path) {
        self.shared.fail_open.lock().insert(path.to_path_buf());
    }

    /// Make every read submission for `path` fail.
    pub fn fail_submit(&self, path: &Path) {
        self.shared.fail_submit.lock().insert(path.to_path_buf());
    }

    /// Complete the pending read for `path` with the given record bytes.
    /// Returns `false` if no read was pending.
    pub fn deliver(&self, path: &Path, bytes: &[u8]) -> bool {
        self.shared
            .complete(path, CompletionStatus::Transferred(bytes.len()), bytes)
    }

    /// Complete the pending read for `path` as a zero-byte transfer,
    /// the OS signal for a dropped-changes overflow.
    pub fn overflow(&self, path: &Path) -> bool {
        self.shared
            .complete(path, CompletionStatus::Transferred(0), &[])
    }

    /// Fail the pending read for `path` with an OS error code.
    pub fn fail_read(&self, path: &Path, code: i32) -> bool {
        self.shared
            .complete(path, CompletionStatus::Failed(code), &[])
    }

    /// Park cancellation completions instead of delivering them, so tests
    /// can observe a server stuck draining.
    pub fn hold_cancellations(&self) {
        self.shared.defer_cancel.store(true, Ordering::SeqCst);
    }

    /// Deliver every parked cancellation completion.
    pub fn release_cancellations(&self) {
        self.shared.defer_cancel.store(false, Ordering::SeqCst);
        let held: Vec<Completion> = self.shared.held.lock().drain(..).collect();
        for completion in held {
            self.shared.send(completion);
        }
    }
}

struct SimBackend {
    shared: Arc<SimShared>,
}

impl DirectoryBackend for SimBackend {
    fn open(&mut self, path: &Path, token: WatchToken) -> Result<Box<dyn WatchHandle>, WatchError> {
        if self.shared.fail_open.lock().remove(path) {
            return Err(WatchError::PathWatchFailed {
                path: path.to_path_buf(),
                reason: "simulated open failure".to_string(),
            });
        }
        self.shared.opened.lock().push(path.to_path_buf());
        self.shared.watches.lock().insert(
            token,
            SimWatch {
                path: path.to_path_buf(),
                pending: None,
            },
        );
        Ok(Box::new(SimHandle {
            shared: Arc::clone(&self.shared),
            path: path.to_path_buf(),
            token,
        }))
    }
}

struct SimHandle {
    shared: Arc<SimShared>,
    path: PathBuf,
    token: WatchToken,
}

impl WatchHandle for SimHandle {
    fn submit_read(&mut self, token: WatchToken, buffer: Vec<u8>) -> Result<(), WatchError> {
        if self.shared.fail_submit.lock().contains(&self.path) {
            return Err(WatchError::PathWatchFailed {
                path: self.path.clone(),
                reason: "simulated read submission failure".to_string(),
            });
        }
        let mut watches = self.shared.watches.lock();
        if let Some(watch) = watches.get_mut(&token) {
            watch.pending = Some(buffer);
        }
        Ok(())
    }

    fn cancel(&mut self) {
        let buffer = {
            let mut watches = self.shared.watches.lock();
            watches
                .get_mut(&self.token)
                .and_then(|watch| watch.pending.take())
        };
        let Some(buffer) = buffer else { return };
        let completion = Completion {
            token: self.token,
            status: CompletionStatus::Cancelled,
            buffer,
        };
        if self.shared.defer_cancel.load(Ordering::SeqCst) {
            self.shared.held.lock().push(completion);
        } else {
            self.shared.send(completion);
        }
    }
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        self.shared.watches.lock().remove(&self.token);
    }
}
