//! Per-descriptor metadata registry
//!
//! The hook layer consults this registry on every intercepted call: whether
//! the fd is a socket, whether the *user* asked for non-blocking semantics
//! (pass through untouched) versus the runtime having forced O_NONBLOCK
//! underneath (intercept), and the configured per-direction timeouts.
//!
//! Entries are created lazily on first use and removed when the descriptor
//! is closed through the hook layer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use libc::c_int;
use silk_core::kerror;

use crate::iomanager::Event;

/// Tracked state for one descriptor
pub struct FdCtx {
    fd: c_int,
    is_socket: bool,
    /// Runtime forced O_NONBLOCK on the real descriptor
    sys_nonblock: AtomicBool,
    /// The application itself asked for non-blocking semantics
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    /// u64::MAX = no timeout
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    fn new(fd: c_int) -> FdCtx {
        let mut is_socket = false;
        unsafe {
            let mut st: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut st) == 0 {
                is_socket = (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
            } else {
                kerror!("fdmanager: fstat({}) failed", fd);
            }
        }

        // Sockets run non-blocking underneath; the hook layer recreates
        // blocking semantics by suspending the coroutine instead.
        let mut sys_nonblock = false;
        if is_socket {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
            sys_nonblock = true;
        }

        FdCtx {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(u64::MAX),
            send_timeout_ms: AtomicU64::new(u64::MAX),
        }
    }

    #[inline]
    pub fn fd(&self) -> c_int {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Release);
    }

    /// Per-direction timeout in ms; u64::MAX when unset
    pub fn timeout(&self, direction: Event) -> u64 {
        match direction {
            Event::Read => self.recv_timeout_ms.load(Ordering::Acquire),
            Event::Write => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout(&self, direction: Event, ms: u64) {
        match direction {
            Event::Read => self.recv_timeout_ms.store(ms, Ordering::Release),
            Event::Write => self.send_timeout_ms.store(ms, Ordering::Release),
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Registry of tracked descriptors, indexed by fd
pub struct FdManager {
    fds: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdManager {
    fn new() -> FdManager {
        FdManager {
            fds: RwLock::new(vec![None; 64]),
        }
    }

    /// Fetch the context for `fd`, creating it when `auto_create` is set.
    pub fn get(&self, fd: c_int, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;

        {
            let fds = self.fds.read().unwrap();
            if idx < fds.len() {
                if let Some(ctx) = &fds[idx] {
                    return Some(ctx.clone());
                }
            }
            if !auto_create {
                return None;
            }
        }

        let mut fds = self.fds.write().unwrap();
        if idx >= fds.len() {
            fds.resize(idx + idx / 2 + 1, None);
        }
        // Double-check under the write lock.
        if let Some(ctx) = &fds[idx] {
            return Some(ctx.clone());
        }
        let ctx = Arc::new(FdCtx::new(fd));
        fds[idx] = Some(ctx.clone());
        Some(ctx)
    }

    /// Drop the entry for `fd` (descriptor closed).
    pub fn del(&self, fd: c_int) {
        if fd < 0 {
            return;
        }
        let mut fds = self.fds.write().unwrap();
        let idx = fd as usize;
        if idx < fds.len() {
            if let Some(ctx) = fds[idx].take() {
                ctx.mark_closed();
            }
        }
    }
}

/// The process-wide registry
pub fn fd_manager() -> &'static FdManager {
    static MANAGER: OnceLock<FdManager> = OnceLock::new();
    MANAGER.get_or_init(FdManager::new)
}
