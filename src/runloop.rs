//! The watcher thread's event loop.
//!
//! All watch state is confined to this loop: it owns the backend, every
//! watch point, and the path-to-token index. Other threads only reach it
//! through the control channel, acknowledged per request, so the state
//! needs no locking at all.
//!
//! The loop always drains control requests before completions. A stop
//! request for a path therefore takes effect before any change that was
//! already queued behind it gets a chance to re-arm the watch.

use std::collections::HashMap;
use std::path::PathBuf;

use crossbeam_channel::{Receiver, Select, Sender, TryRecvError};

use crate::backend::{Completion, DirectoryBackend, WatchToken};
use crate::error::WatchError;
use crate::event::EventSink;
use crate::point::{CompletionOutcome, PointStatus, WatchPoint};
use crate::server::{RegisterOutcome, TerminationSignal, UnregisterOutcome};

/// Requests other threads send to the watcher thread.
pub(crate) enum ControlRequest {
    Register {
        path: PathBuf,
        ack: Sender<Result<RegisterOutcome, WatchError>>,
    },
    Unregister {
        path: PathBuf,
        ack: Sender<UnregisterOutcome>,
    },
    Terminate,
}

enum Wakeup {
    Control(ControlRequest),
    Completion(Completion),
    /// Both channels are gone; nothing further can arrive.
    Shutdown,
}

pub(crate) struct RunLoop {
    control_rx: Receiver<ControlRequest>,
    completion_rx: Receiver<Completion>,
    backend: Box<dyn DirectoryBackend>,
    sink: Box<dyn EventSink>,
    termination: TerminationSignal,
    buffer_size: usize,
    points: HashMap<WatchToken, WatchPoint>,
    paths: HashMap<PathBuf, WatchToken>,
    next_token: u64,
    terminated: bool,
    control_closed: bool,
    completion_closed: bool,
}

impl RunLoop {
    pub(crate) fn new(
        control_rx: Receiver<ControlRequest>,
        completion_rx: Receiver<Completion>,
        backend: Box<dyn DirectoryBackend>,
        sink: Box<dyn EventSink>,
        termination: TerminationSignal,
        buffer_size: usize,
    ) -> Self {
        Self {
            control_rx,
            completion_rx,
            backend,
            sink,
            termination,
            buffer_size,
            points: HashMap::new(),
            paths: HashMap::new(),
            next_token: 0,
            terminated: false,
            control_closed: false,
            completion_closed: false,
        }
    }

    /// Run until terminated and every watch has drained.
    pub(crate) fn run(mut self) {
        tracing::debug!("watcher thread started");
        while !self.terminated || !self.points.is_empty() {
            match self.next_wakeup() {
                Wakeup::Control(request) => self.handle_control(request),
                Wakeup::Completion(completion) => self.route_completion(completion),
                Wakeup::Shutdown => {
                    // No channel left to deliver cancellation completions;
                    // abandon any remaining points.
                    self.begin_termination();
                    self.points.clear();
                    self.paths.clear();
                }
            }
        }
        tracing::debug!("watcher thread terminated");
        self.sink.report_termination();
        // Drop the receivers before signalling so a caller that observed
        // termination sees its next control send fail, not hang.
        let termination = self.termination.clone();
        drop(self);
        termination.signal();
    }

    fn next_wakeup(&mut self) -> Wakeup {
        loop {
            if !self.control_closed {
                match self.control_rx.try_recv() {
                    Ok(request) => return Wakeup::Control(request),
                    Err(TryRecvError::Disconnected) => {
                        // Every server handle is gone; treat it as a
                        // terminate request.
                        self.control_closed = true;
                        return Wakeup::Control(ControlRequest::Terminate);
                    }
                    Err(TryRecvError::Empty) => {}
                }
            }
            if !self.completion_closed {
                match self.completion_rx.try_recv() {
                    Ok(completion) => return Wakeup::Completion(completion),
                    Err(TryRecvError::Disconnected) => self.completion_closed = true,
                    Err(TryRecvError::Empty) => {}
                }
            }
            if self.control_closed && self.completion_closed {
                return Wakeup::Shutdown;
            }
            // Backends that deliver completions through their own blocking
            // wait park here; the rest block on the channels.
            if self.backend.park() {
                continue;
            }
            let mut select = Select::new();
            if !self.control_closed {
                select.recv(&self.control_rx);
            }
            if !self.completion_closed {
                select.recv(&self.completion_rx);
            }
            select.ready();
        }
    }

    fn handle_control(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::Register { path, ack } => {
                let result = self.register_path(path);
                if let Err(err) = &result {
                    self.sink.report_failure(err);
                }
                let _ = ack.send(result);
            }
            ControlRequest::Unregister { path, ack } => {
                let outcome = self.unregister_path(path);
                let _ = ack.send(outcome);
            }
            ControlRequest::Terminate => self.begin_termination(),
        }
    }

    fn register_path(&mut self, path: PathBuf) -> Result<RegisterOutcome, WatchError> {
        if self.terminated {
            return Err(WatchError::Terminated);
        }
        if let Some(token) = self.paths.get(&path) {
            let point = &self.points[token];
            if point.is_active() {
                tracing::debug!(path = %path.display(), "already watching");
                return Ok(RegisterOutcome::AlreadyWatching);
            }
            // A cancelled watch on this path has not drained yet; its
            // token still owns the path key.
            return Err(WatchError::PathWatchFailed {
                path,
                reason: "previous watch is still shutting down".to_string(),
            });
        }
        if !path.is_absolute() {
            return Err(WatchError::PathWatchFailed {
                path,
                reason: "path must be absolute".to_string(),
            });
        }
        if !path.is_dir() {
            return Err(WatchError::PathWatchFailed {
                path,
                reason: "not a directory".to_string(),
            });
        }

        let token = WatchToken(self.next_token);
        self.next_token += 1;
        let handle = self.backend.open(&path, token)?;
        let mut point = WatchPoint::new(path.clone(), token, handle, self.buffer_size);
        point.listen()?;
        tracing::info!(path = %path.display(), "watching directory");
        self.points.insert(token, point);
        self.paths.insert(path, token);
        Ok(RegisterOutcome::Watching)
    }

    fn unregister_path(&mut self, path: PathBuf) -> UnregisterOutcome {
        let Some(token) = self.paths.get(&path).copied() else {
            tracing::debug!(path = %path.display(), "unregister of unwatched path");
            return UnregisterOutcome::NotFound;
        };
        let Some(point) = self.points.get_mut(&token) else {
            return UnregisterOutcome::NotFound;
        };
        if !point.is_active() {
            // Already stopping; the pending cancellation will finish it.
            return UnregisterOutcome::Stopped;
        }
        tracing::info!(path = %path.display(), "stopping watch");
        point.cancel();
        if point.status() == PointStatus::Finished {
            self.remove_point(token);
        }
        UnregisterOutcome::Stopped
    }

    fn begin_termination(&mut self) {
        if self.terminated {
            return;
        }
        tracing::info!(watches = self.points.len(), "terminating watch server");
        self.terminated = true;
        for point in self.points.values_mut() {
            point.cancel();
        }
        let finished: Vec<WatchToken> = self
            .points
            .iter()
            .filter(|(_, point)| point.status() == PointStatus::Finished)
            .map(|(token, _)| *token)
            .collect();
        for token in finished {
            self.remove_point(token);
        }
    }

    fn route_completion(&mut self, completion: Completion) {
        let Some(point) = self.points.get_mut(&completion.token) else {
            // Stale completion for a watch that was already dropped.
            tracing::trace!(token = completion.token.0, "dropping stale completion");
            return;
        };
        let outcome =
            point.handle_completion(completion.status, completion.buffer, self.sink.as_ref());
        if outcome == CompletionOutcome::Finished {
            self.remove_point(completion.token);
        }
    }

    fn remove_point(&mut self, token: WatchToken) {
        if let Some(point) = self.points.remove(&token) {
            self.paths.remove(point.path());
            // Dropping the point closes the backend handle; safe now
            // because no read is in flight anymore.
            tracing::debug!(path = %point.path().display(), "watch closed");
        }
    }
}
