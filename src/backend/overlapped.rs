//! Windows backend driving overlapped `ReadDirectoryChangesW` reads.
//!
//! Each read is submitted with a completion routine. The OS queues the
//! routine as an APC on the watcher thread and runs it while that thread
//! sits in an alertable wait ([`OverlappedBackend::park`]). The routine
//! reclaims the request, translates the result into a [`Completion`] and
//! pushes it onto the completion channel; the run loop picks it up right
//! after the wait returns.
//!
//! Other threads interrupt the wait by queueing a no-op APC through
//! [`ApcWaker`]. If duplicating the watcher thread handle for that fails,
//! the backend degrades to a short periodic alertable sleep.

use std::ffi::c_void;
use std::os::windows::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;

use crossbeam_channel::Sender;
use windows_sys::Win32::Foundation::{
    CloseHandle, DUPLICATE_SAME_ACCESS, DuplicateHandle, ERROR_OPERATION_ABORTED, GetLastError,
    HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
    FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME,
    FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SIZE, FILE_SHARE_DELETE, FILE_SHARE_READ,
    FILE_SHARE_WRITE, OPEN_EXISTING, ReadDirectoryChangesW,
};
use windows_sys::Win32::System::IO::{CancelIo, OVERLAPPED};
use windows_sys::Win32::System::Threading::{
    GetCurrentProcess, GetCurrentThread, INFINITE, QueueUserAPC, SleepEx,
};

use crate::backend::{
    Completion, CompletionStatus, DirectoryBackend, RunLoopWaker, WatchHandle, WatchToken,
};
use crate::error::WatchError;
use crate::server::BackendFactory;

const EVENT_MASK: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
    | FILE_NOTIFY_CHANGE_DIR_NAME
    | FILE_NOTIFY_CHANGE_ATTRIBUTES
    | FILE_NOTIFY_CHANGE_SIZE
    | FILE_NOTIFY_CHANGE_LAST_WRITE;

/// Poll interval for the degraded mode without an APC waker.
const FALLBACK_WAIT_MILLIS: u32 = 100;

/// Factory for the production backend.
pub fn factory() -> BackendFactory {
    Box::new(|completion_tx| {
        Ok(Box::new(OverlappedBackend {
            completion_tx,
            poll_fallback: false,
        }) as Box<dyn DirectoryBackend>)
    })
}

struct OverlappedBackend {
    completion_tx: Sender<Completion>,
    poll_fallback: bool,
}

impl DirectoryBackend for OverlappedBackend {
    fn open(&mut self, path: &Path, _token: WatchToken) -> Result<Box<dyn WatchHandle>, WatchError> {
        let encoded: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
        let handle = unsafe {
            CreateFileW(
                encoded.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                ptr::null_mut(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            let code = unsafe { GetLastError() };
            return Err(WatchError::PathWatchFailed {
                path: path.to_path_buf(),
                reason: format!("failed to open directory, OS error {code}"),
            });
        }
        Ok(Box::new(OverlappedHandle {
            handle: SendHandle(handle),
            path: path.to_path_buf(),
            completion_tx: self.completion_tx.clone(),
        }))
    }

    fn start(&mut self) -> Arc<dyn RunLoopWaker> {
        // Completion routines only run on the thread that submitted the
        // read, so wakeups must target the watcher thread itself.
        let mut target: HANDLE = ptr::null_mut();
        let ok = unsafe {
            DuplicateHandle(
                GetCurrentProcess(),
                GetCurrentThread(),
                GetCurrentProcess(),
                &mut target,
                0,
                0,
                DUPLICATE_SAME_ACCESS,
            )
        };
        if ok == 0 {
            let code = unsafe { GetLastError() };
            tracing::warn!(code, "failed to duplicate watcher thread handle; polling instead");
            self.poll_fallback = true;
            return Arc::new(crate::backend::NoopWaker);
        }
        Arc::new(ApcWaker {
            thread: SendHandle(target),
        })
    }

    fn park(&mut self) -> bool {
        let timeout = if self.poll_fallback {
            FALLBACK_WAIT_MILLIS
        } else {
            INFINITE
        };
        // Alertable wait; returns early when an APC (a completion routine
        // or a waker) ran.
        unsafe {
            SleepEx(timeout, 1);
        }
        true
    }
}

/// Raw handle wrapper confined to the watcher thread, or to the waker
/// which only uses it for `QueueUserAPC`.
struct SendHandle(HANDLE);

unsafe impl Send for SendHandle {}
unsafe impl Sync for SendHandle {}

struct OverlappedHandle {
    handle: SendHandle,
    path: PathBuf,
    completion_tx: Sender<Completion>,
}

/// Heap state owned by the OS while a read is in flight. The completion
/// routine reclaims it.
struct ReadRequest {
    token: WatchToken,
    buffer: Vec<u8>,
    completion_tx: Sender<Completion>,
}

impl WatchHandle for OverlappedHandle {
    fn submit_read(&mut self, token: WatchToken, buffer: Vec<u8>) -> Result<(), WatchError> {
        let request = Box::into_raw(Box::new(ReadRequest {
            token,
            buffer,
            completion_tx: self.completion_tx.clone(),
        }));
        // With a completion routine the hEvent field is free for user
        // data; it carries the request pointer to the routine.
        let overlapped: *mut OVERLAPPED = Box::into_raw(Box::new(unsafe { std::mem::zeroed() }));
        let ret = unsafe {
            let req = &mut *request;
            (*overlapped).hEvent = request as *mut c_void;
            ReadDirectoryChangesW(
                self.handle.0,
                req.buffer.as_mut_ptr() as *mut c_void,
                req.buffer.len() as u32,
                1,
                EVENT_MASK,
                ptr::null_mut(),
                overlapped,
                Some(read_complete),
            )
        };
        if ret == 0 {
            // Ownership never passed to the OS; reclaim both allocations.
            let code = unsafe { GetLastError() };
            unsafe {
                drop(Box::from_raw(overlapped));
                drop(Box::from_raw(request));
            }
            return Err(WatchError::PathWatchFailed {
                path: self.path.clone(),
                reason: format!("failed to submit directory read, OS error {code}"),
            });
        }
        Ok(())
    }

    fn cancel(&mut self) {
        let ret = unsafe { CancelIo(self.handle.0) };
        if ret == 0 {
            let code = unsafe { GetLastError() };
            tracing::warn!(path = %self.path.display(), code, "CancelIo failed");
        }
    }
}

impl Drop for OverlappedHandle {
    fn drop(&mut self) {
        // The run loop drops the handle only after the final completion
        // for it was observed, so no routine can still reference it.
        unsafe {
            CloseHandle(self.handle.0);
        }
    }
}

unsafe extern "system" fn read_complete(
    error_code: u32,
    bytes_transferred: u32,
    overlapped: *mut OVERLAPPED,
) {
    let (request, _overlapped) = unsafe {
        let overlapped = Box::from_raw(overlapped);
        let request = Box::from_raw(overlapped.hEvent as *mut ReadRequest);
        (request, overlapped)
    };
    let status = match error_code {
        0 => CompletionStatus::Transferred(bytes_transferred as usize),
        ERROR_OPERATION_ABORTED => CompletionStatus::Cancelled,
        code => CompletionStatus::Failed(code as i32),
    };
    // The run loop may already be gone during teardown.
    let _ = request.completion_tx.send(Completion {
        token: request.token,
        status,
        buffer: request.buffer,
    });
}

/// Wakes the watcher thread out of its alertable wait by queueing a
/// no-op APC onto it.
struct ApcWaker {
    thread: SendHandle,
}

impl RunLoopWaker for ApcWaker {
    fn wake(&self) {
        let ret = unsafe { QueueUserAPC(Some(wake_apc), self.thread.0, 0) };
        if ret == 0 {
            // The watcher thread has exited; nothing left to wake.
            tracing::trace!("wakeup APC not queued");
        }
    }
}

impl Drop for ApcWaker {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.thread.0);
        }
    }
}

unsafe extern "system" fn wake_apc(_param: usize) {}
