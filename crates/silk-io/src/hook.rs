//! Blocking-style call interception
//!
//! The fixed POSIX-shaped call set, made cooperative. Each wrapper preserves
//! the underlying call's return-value and errno contract exactly; only the
//! way blocking is realized changes. With the per-thread flag off (any
//! thread not running an IoManager dispatch loop) every wrapper degrades to
//! the plain OS call.
//!
//! The heart is [`do_io`]: try the call, retry through EINTR, and on
//! would-block arm a condition timer, register readiness interest binding
//! the current coroutine, and yield. Resumption means either readiness
//! (retry the call) or the timer fired (fail with ETIMEDOUT). The condition
//! timer holds only a weak reference to the per-call cancel flag, so a timer
//! that outlives the call is a no-op.

use std::any::Any;
use std::cell::Cell;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use libc::{c_int, c_long, c_ulong, c_void, socklen_t};

use silk_core::config::{self, ConfigVar};
use silk_core::{kdebug, kerror, kinfo};
use silk_runtime::coroutine::Coroutine;
use silk_runtime::scheduler::{self, ScheduledTask};
use silk_runtime::timer::TimerCallback;

use crate::fdmanager::fd_manager;
use crate::iomanager::{Event, IoManager};

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Is interception active on this thread?
#[inline]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Turn interception on or off for this thread. The IoManager enables it on
/// every dispatch thread.
pub fn set_hook_enabled(on: bool) {
    HOOK_ENABLED.with(|c| c.set(on));
}

static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(5000);

fn connect_timeout_config() -> &'static Arc<ConfigVar<u64>> {
    static VAR: OnceLock<Arc<ConfigVar<u64>>> = OnceLock::new();
    VAR.get_or_init(|| {
        let var = config::lookup::<u64>("tcp.connect.timeout", 5000, "tcp connect timeout (ms)");
        CONNECT_TIMEOUT_MS.store(var.get(), Ordering::Relaxed);
        var.add_listener(|old, new| {
            kinfo!("tcp connect timeout changed from {} to {}", old, new);
            CONNECT_TIMEOUT_MS.store(*new, Ordering::Relaxed);
        });
        var
    })
}

/// Wire the config listeners (idempotent; called by `IoManager::new`).
pub(crate) fn init() {
    connect_timeout_config();
}

/// The configured default connect timeout in ms
pub fn connect_timeout_ms() -> u64 {
    connect_timeout_config();
    CONNECT_TIMEOUT_MS.load(Ordering::Relaxed)
}

#[inline]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(e: i32) {
    unsafe { *libc::__errno_location() = e };
}

/// Per-call cancel flag shared between `do_io` and its condition timer
#[derive(Default)]
struct TimerCondition {
    /// 0 = not cancelled, otherwise the errno to fail with
    cancelled: AtomicI32,
}

/// Core wrapper shared by every read- and write-family interception.
///
/// `direction` selects both the readiness direction to wait for and which of
/// the descriptor's per-direction timeouts applies.
fn do_io<F>(fd: c_int, name: &'static str, direction: Event, mut real: F) -> isize
where
    F: FnMut() -> isize,
{
    if !hook_enabled() {
        return real();
    }

    // Untracked descriptors are not sockets we manage.
    let Some(ctx) = fd_manager().get(fd, false) else {
        return real();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return real();
    }

    let timeout = ctx.timeout(direction);
    let tinfo = Arc::new(TimerCondition::default());

    loop {
        let mut n = real();
        while n == -1 && errno() == libc::EINTR {
            n = real();
        }
        if !(n == -1 && errno() == libc::EAGAIN) {
            return n;
        }

        // Would block: suspend instead.
        let Some(iom) = IoManager::current() else {
            // Interception enabled but no reactor on this thread; behave
            // like the plain non-blocking call.
            return n;
        };

        let timer = if timeout != u64::MAX {
            let winfo = Arc::downgrade(&tinfo);
            let wiom = Arc::downgrade(&iom);
            let cb: TimerCallback = Arc::new(move || {
                let Some(t) = winfo.upgrade() else {
                    return;
                };
                if t.cancelled.load(Ordering::Acquire) != 0 {
                    return;
                }
                t.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
                if let Some(iom) = wiom.upgrade() {
                    iom.cancel_event(fd, direction);
                }
            });
            let cond: Arc<dyn Any + Send + Sync> = tinfo.clone();
            Some(iom.add_condition_timer(timeout, cb, Arc::downgrade(&cond)))
        } else {
            None
        };

        if let Err(e) = iom.add_event(fd, direction, None) {
            kerror!("{}: add_event({}, {:?}) failed: {}", name, fd, direction, e);
            if let Some(t) = &timer {
                t.cancel();
            }
            return -1;
        }

        Coroutine::yield_to_hold();
        // Resumed: either the fd turned ready or the timer force-triggered.

        if let Some(t) = &timer {
            t.cancel();
        }
        let cancelled = tinfo.cancelled.load(Ordering::Acquire);
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
        // Genuine readiness; retry the real call.
    }
}

/* ---------------------------------- sleep --------------------------------- */

fn sleep_ms(iom: &Arc<IoManager>, ms: u64) {
    let co = Coroutine::current();
    let wiom = Arc::downgrade(iom);
    iom.add_timer(
        ms,
        Arc::new(move || {
            if let Some(iom) = wiom.upgrade() {
                scheduler::schedule(&iom, ScheduledTask::coroutine(co.clone()));
            }
        }),
        false,
    );
    Coroutine::yield_to_hold();
}

pub fn sleep(seconds: libc::c_uint) -> libc::c_uint {
    if !hook_enabled() {
        return unsafe { libc::sleep(seconds) };
    }
    let Some(iom) = IoManager::current() else {
        return unsafe { libc::sleep(seconds) };
    };
    sleep_ms(&iom, seconds as u64 * 1000);
    0
}

pub fn usleep(usec: libc::c_uint) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::usleep(usec) };
    }
    let Some(iom) = IoManager::current() else {
        return unsafe { libc::usleep(usec) };
    };
    sleep_ms(&iom, usec as u64 / 1000);
    0
}

pub fn nanosleep(req: &libc::timespec, rem: Option<&mut libc::timespec>) -> c_int {
    if !hook_enabled() {
        return unsafe {
            libc::nanosleep(
                req,
                rem.map_or(std::ptr::null_mut(), |r| r as *mut libc::timespec),
            )
        };
    }
    let Some(iom) = IoManager::current() else {
        return unsafe {
            libc::nanosleep(
                req,
                rem.map_or(std::ptr::null_mut(), |r| r as *mut libc::timespec),
            )
        };
    };

    let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
    sleep_ms(&iom, ms);
    if let Some(r) = rem {
        r.tv_sec = 0;
        r.tv_nsec = 0;
    }
    0
}

/* --------------------------------- socket --------------------------------- */

pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if !hook_enabled() || fd < 0 {
        return fd;
    }
    kdebug!("hook socket -> fd {}", fd);
    fd_manager().get(fd, true);
    fd
}

/// `connect` with an explicit timeout in ms (`u64::MAX` = none).
///
/// Issues the non-blocking connect, waits for write readiness, then reads
/// the socket's pending error to decide success - a writable socket alone
/// does not mean the connection was established.
pub fn connect_with_timeout(
    fd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }

    let Some(ctx) = fd_manager().get(fd, false) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }

    // The registry forced O_NONBLOCK, so this returns immediately.
    let n = unsafe { libc::connect(fd, addr, addrlen) };
    if n == 0 {
        return 0;
    }
    if !(n == -1 && errno() == libc::EINPROGRESS) {
        return n as c_int;
    }

    let Some(iom) = IoManager::current() else {
        return n as c_int;
    };

    let tinfo = Arc::new(TimerCondition::default());
    let timer = if timeout_ms != u64::MAX {
        let winfo = Arc::downgrade(&tinfo);
        let wiom = Arc::downgrade(&iom);
        let cb: TimerCallback = Arc::new(move || {
            let Some(t) = winfo.upgrade() else {
                return;
            };
            if t.cancelled.load(Ordering::Acquire) != 0 {
                return;
            }
            t.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
            if let Some(iom) = wiom.upgrade() {
                iom.cancel_event(fd, Event::Write);
            }
        });
        let cond: Arc<dyn Any + Send + Sync> = tinfo.clone();
        Some(iom.add_condition_timer(timeout_ms, cb, Arc::downgrade(&cond)))
    } else {
        None
    };

    // Connection completion shows up as write readiness.
    match iom.add_event(fd, Event::Write, None) {
        Ok(()) => {
            Coroutine::yield_to_hold();
            if let Some(t) = &timer {
                t.cancel();
            }
            if tinfo.cancelled.load(Ordering::Acquire) != 0 {
                set_errno(tinfo.cancelled.load(Ordering::Acquire));
                return -1;
            }
        }
        Err(e) => {
            if let Some(t) = &timer {
                t.cancel();
            }
            kerror!("connect: add_event({}, WRITE) failed: {}", fd, e);
        }
    }

    let mut err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    if unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut c_int as *mut c_void,
            &mut len,
        )
    } < 0
    {
        kerror!("connect: getsockopt(SO_ERROR) on fd {} failed", fd);
        return -1;
    }
    if err == 0 {
        0
    } else {
        set_errno(err);
        -1
    }
}

pub fn connect(fd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int {
    connect_with_timeout(fd, addr, addrlen, connect_timeout_ms())
}

pub fn accept(fd: c_int, addr: *mut libc::sockaddr, addrlen: *mut socklen_t) -> c_int {
    let n = do_io(fd, "accept", Event::Read, || unsafe {
        libc::accept(fd, addr, addrlen) as isize
    });
    if n >= 0 {
        fd_manager().get(n as c_int, true);
    }
    n as c_int
}

/// Cancels any pending registrations, drops the registry entry, then closes,
/// so no stale event binding can fire after the descriptor is gone.
pub fn close(fd: c_int) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::close(fd) };
    }
    if fd_manager().get(fd, false).is_some() {
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        fd_manager().del(fd);
    }
    unsafe { libc::close(fd) }
}

/* ---------------------------------- read ---------------------------------- */

pub fn read(fd: c_int, buf: &mut [u8]) -> isize {
    let (ptr, len) = (buf.as_mut_ptr(), buf.len());
    do_io(fd, "read", Event::Read, || unsafe {
        libc::read(fd, ptr as *mut c_void, len)
    })
}

pub fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> isize {
    do_io(fd, "readv", Event::Read, || unsafe {
        libc::readv(fd, iov, iovcnt)
    })
}

pub fn recv(fd: c_int, buf: &mut [u8], flags: c_int) -> isize {
    let (ptr, len) = (buf.as_mut_ptr(), buf.len());
    do_io(fd, "recv", Event::Read, || unsafe {
        libc::recv(fd, ptr as *mut c_void, len, flags)
    })
}

pub fn recvfrom(
    fd: c_int,
    buf: &mut [u8],
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> isize {
    let (ptr, len) = (buf.as_mut_ptr(), buf.len());
    do_io(fd, "recvfrom", Event::Read, || unsafe {
        libc::recvfrom(fd, ptr as *mut c_void, len, flags, src_addr, addrlen)
    })
}

pub fn recvmsg(fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> isize {
    do_io(fd, "recvmsg", Event::Read, || unsafe {
        libc::recvmsg(fd, msg, flags)
    })
}

/* ---------------------------------- write --------------------------------- */

pub fn write(fd: c_int, buf: &[u8]) -> isize {
    let (ptr, len) = (buf.as_ptr(), buf.len());
    do_io(fd, "write", Event::Write, || unsafe {
        libc::write(fd, ptr as *const c_void, len)
    })
}

pub fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> isize {
    do_io(fd, "writev", Event::Write, || unsafe {
        libc::writev(fd, iov, iovcnt)
    })
}

pub fn send(fd: c_int, buf: &[u8], flags: c_int) -> isize {
    let (ptr, len) = (buf.as_ptr(), buf.len());
    do_io(fd, "send", Event::Write, || unsafe {
        libc::send(fd, ptr as *const c_void, len, flags)
    })
}

pub fn sendto(
    fd: c_int,
    buf: &[u8],
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> isize {
    let (ptr, len) = (buf.as_ptr(), buf.len());
    do_io(fd, "sendto", Event::Write, || unsafe {
        libc::sendto(fd, ptr as *const c_void, len, flags, dest_addr, addrlen)
    })
}

pub fn sendmsg(fd: c_int, msg: *const libc::msghdr, flags: c_int) -> isize {
    do_io(fd, "sendmsg", Event::Write, || unsafe {
        libc::sendmsg(fd, msg, flags)
    })
}

/* ------------------------------ fcntl / ioctl ------------------------------ */

/// Tracks the user-requested non-blocking flag for F_SETFL/F_GETFL; every
/// other command passes through with its integer argument.
pub fn fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as c_int;
            match fd_manager().get(fd, false) {
                Some(ctx) if ctx.is_socket() && !ctx.is_closed() => {
                    ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                    // The descriptor itself stays in the mode the runtime
                    // needs, whatever the caller asked for.
                    if ctx.sys_nonblock() {
                        flags |= libc::O_NONBLOCK;
                    } else {
                        flags &= !libc::O_NONBLOCK;
                    }
                    unsafe { libc::fcntl(fd, cmd, flags) }
                }
                _ => unsafe { libc::fcntl(fd, cmd, flags) },
            }
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            if flags < 0 {
                return flags;
            }
            match fd_manager().get(fd, false) {
                Some(ctx) if ctx.is_socket() && !ctx.is_closed() => {
                    // Report what the caller believes, not what the runtime
                    // set underneath.
                    if ctx.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// Tracks FIONBIO as a user non-blocking request; passes everything through.
pub fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong {
        if let Some(ctx) = fd_manager().get(fd, false) {
            if ctx.is_socket() && !ctx.is_closed() {
                let on = unsafe { *(arg as *const c_int) } != 0;
                ctx.set_user_nonblock(on);
            }
        }
    }
    unsafe { libc::ioctl(fd, request, arg) }
}

/* -------------------------------- sockopts -------------------------------- */

pub fn getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    unsafe { libc::getsockopt(fd, level, optname, optval, optlen) }
}

/// Captures SO_RCVTIMEO/SO_SNDTIMEO into the registry's per-direction
/// timeouts (the hook realizes them with timers), then passes through.
pub fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && optlen as usize >= std::mem::size_of::<libc::timeval>()
    {
        if let Some(ctx) = fd_manager().get(fd, false) {
            let tv = unsafe { *(optval as *const libc::timeval) };
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            let direction = if optname == libc::SO_RCVTIMEO {
                Event::Read
            } else {
                Event::Write
            };
            ctx.set_timeout(direction, ms);
        }
    }
    unsafe { libc::setsockopt(fd, level, optname, optval, optlen) }
}
