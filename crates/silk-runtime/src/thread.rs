//! Worker thread wrapper
//!
//! A `Thread` is an OS thread with an assigned name and a recorded kernel
//! thread id. The constructor blocks until the new thread has stored its id
//! and taken ownership of its closure, so a caller can rely on `tid()`
//! immediately - scheduling by thread affinity needs the id before the first
//! task is queued.

use std::cell::Cell;
use std::sync::mpsc;
use std::thread::JoinHandle;

use silk_core::{SilkError, SilkResult};

thread_local! {
    static CACHED_TID: Cell<u64> = const { Cell::new(0) };
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn os_thread_id() -> u64 {
            unsafe { libc::syscall(libc::SYS_gettid) as u64 }
        }
    } else {
        fn os_thread_id() -> u64 {
            unsafe { libc::pthread_self() as u64 }
        }
    }
}

/// Kernel thread id of the calling thread (cached per thread)
#[inline]
pub fn current_thread_id() -> u64 {
    CACHED_TID.with(|cell| {
        let mut tid = cell.get();
        if tid == 0 {
            tid = os_thread_id();
            cell.set(tid);
        }
        tid
    })
}

/// A named OS thread with a known kernel thread id
pub struct Thread {
    name: String,
    tid: u64,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Spawn a named thread and wait for it to report its thread id.
    pub fn spawn<F>(name: &str, f: F) -> SilkResult<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<u64>();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _ = tx.send(current_thread_id());
                f();
            })
            .map_err(|_| SilkError::SpawnFailed)?;

        let tid = rx.recv().map_err(|_| SilkError::SpawnFailed)?;

        Ok(Thread {
            name: name.to_string(),
            tid,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// Wait for the thread to finish.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_tid_matches_inside() {
        let observed = Arc::new(Mutex::new(0u64));
        let observed2 = observed.clone();
        let t = Thread::spawn("tid-check", move || {
            *observed2.lock().unwrap() = current_thread_id();
        })
        .unwrap();
        let tid = t.tid();
        assert_ne!(tid, 0);
        t.join();
        assert_eq!(*observed.lock().unwrap(), tid);
    }

    #[test]
    fn test_name_is_set() {
        let seen = Arc::new(Mutex::new(String::new()));
        let seen2 = seen.clone();
        let t = Thread::spawn("named-worker", move || {
            *seen2.lock().unwrap() = std::thread::current().name().unwrap_or("").to_string();
        })
        .unwrap();
        t.join();
        assert_eq!(*seen.lock().unwrap(), "named-worker");
    }
}
