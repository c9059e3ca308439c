//! IoManager: scheduler + timer manager + edge-triggered epoll reactor
//!
//! The scheduler's idle hook becomes the reactor loop: wait on epoll bounded
//! by the next timer deadline, convert expired timers and ready descriptors
//! into scheduled tasks, yield back to the dispatch loop.
//!
//! Per descriptor the manager keeps an [`FdContext`] with one event binding
//! slot per direction. At most one binding may exist per (fd, direction);
//! binding a second one while the first is pending is a caller bug and
//! aborts the process.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use libc::{c_int, c_void};
use silk_core::{fatal_assert, kdebug, kerror, kinfo, SilkError, SilkResult};
use silk_runtime::coroutine::Coroutine;
use silk_runtime::scheduler::{self, Schedule, ScheduledTask, Scheduler, TaskFn};
use silk_runtime::timer::{Timer, TimerCallback, TimerManager};
use silk_core::CoState;

use crate::hook;

const EV_IN: u32 = libc::EPOLLIN as u32;
const EV_OUT: u32 = libc::EPOLLOUT as u32;
const EV_ET: u32 = libc::EPOLLET as u32;
const EV_ERR: u32 = libc::EPOLLERR as u32;
const EV_HUP: u32 = libc::EPOLLHUP as u32;

/// I/O readiness direction, valued to match the epoll bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Event {
    Read = 0x1,  // EPOLLIN
    Write = 0x4, // EPOLLOUT
}

impl Event {
    #[inline]
    fn bit(self) -> u32 {
        self as u32
    }
}

/// The task bound to one (fd, direction)
struct EventContext {
    scheduler: Option<Weak<IoManager>>,
    coroutine: Option<Arc<Coroutine>>,
    callback: Option<TaskFn>,
}

impl EventContext {
    const fn empty() -> EventContext {
        EventContext {
            scheduler: None,
            coroutine: None,
            callback: None,
        }
    }

    fn is_bound(&self) -> bool {
        self.coroutine.is_some() || self.callback.is_some()
    }

    fn reset(&mut self) {
        self.scheduler = None;
        self.coroutine = None;
        self.callback = None;
    }
}

struct FdContextInner {
    /// Directions currently registered with epoll
    events: u32,
    read: EventContext,
    write: EventContext,
}

impl FdContextInner {
    fn event_context(&mut self, ev: Event) -> &mut EventContext {
        match ev {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }

    /// Force the binding for `ev` onto its scheduler and clear it.
    ///
    /// Call with the owning mutex held and `ev` registered.
    fn trigger(&mut self, fd: c_int, ev: Event) {
        fatal_assert!(
            self.events & ev.bit() != 0,
            "trigger of unregistered {:?} on fd {}",
            ev,
            fd
        );
        self.events &= !ev.bit();

        let ctx = self.event_context(ev);
        let iom = ctx.scheduler.take().and_then(|w| w.upgrade());
        let Some(iom) = iom else {
            // Manager already torn down; nothing left to run the task on.
            ctx.reset();
            return;
        };
        if let Some(cb) = ctx.callback.take() {
            scheduler::schedule(&iom, ScheduledTask::call_boxed(cb));
        } else if let Some(co) = ctx.coroutine.take() {
            scheduler::schedule(&iom, ScheduledTask::coroutine(co));
        }
        ctx.scheduler = None;
    }
}

/// Per-descriptor reactor bookkeeping
pub struct FdContext {
    fd: c_int,
    inner: Mutex<FdContextInner>,
}

impl FdContext {
    fn new(fd: c_int) -> FdContext {
        FdContext {
            fd,
            inner: Mutex::new(FdContextInner {
                events: 0,
                read: EventContext::empty(),
                write: EventContext::empty(),
            }),
        }
    }
}

thread_local! {
    static CURRENT_IOM: RefCell<Option<Weak<IoManager>>> = const { RefCell::new(None) };
}

/// Scheduler specialization waiting on readiness events and timers
pub struct IoManager {
    base: Scheduler,
    timers: TimerManager,
    epfd: c_int,
    /// [0] read end (registered with epoll), [1] write end (tickle target)
    tickle_fds: [c_int; 2],
    pending_events: AtomicUsize,
    fd_contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
    self_ref: OnceLock<Weak<IoManager>>,
}

impl IoManager {
    /// Build and immediately start the manager.
    ///
    /// Reactor setup failures (epoll/pipe creation, self-wake registration)
    /// are unrecoverable environment problems and abort.
    pub fn new(name: &str, threads: usize, use_caller: bool) -> Arc<IoManager> {
        let epfd = unsafe { libc::epoll_create1(0) };
        fatal_assert!(epfd >= 0, "epoll_create1 failed (errno {})", errno());

        let mut pipe_fds = [0 as c_int; 2];
        let ret = unsafe { libc::pipe(pipe_fds.as_mut_ptr()) };
        fatal_assert!(ret == 0, "tickle pipe creation failed (errno {})", errno());

        unsafe {
            let flags = libc::fcntl(pipe_fds[0], libc::F_GETFL, 0);
            fatal_assert!(
                flags >= 0 && libc::fcntl(pipe_fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) == 0,
                "tickle pipe fcntl failed (errno {})",
                errno()
            );
        }

        let mut ev = libc::epoll_event {
            events: EV_IN | EV_ET,
            u64: pipe_fds[0] as u64,
        };
        let ret = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ev) };
        fatal_assert!(ret == 0, "tickle pipe registration failed (errno {})", errno());

        let iom = Arc::new(IoManager {
            base: Scheduler::new(name, threads, use_caller),
            timers: TimerManager::new(),
            epfd,
            tickle_fds: pipe_fds,
            pending_events: AtomicUsize::new(0),
            fd_contexts: RwLock::new(Vec::new()),
            self_ref: OnceLock::new(),
        });
        let _ = iom.self_ref.set(Arc::downgrade(&iom));

        iom.resize_contexts(256);

        // A timer inserted at the front invalidates a wait deadline computed
        // from the previous head; wake the reactor so it re-arms.
        let weak = Arc::downgrade(&iom);
        iom.timers.set_front_notify(move || {
            if let Some(iom) = weak.upgrade() {
                iom.tickle_now();
            }
        });

        hook::init();
        scheduler::start(&iom);
        iom
    }

    /// The IoManager whose dispatch loop runs the current thread, if any
    pub fn current() -> Option<Arc<IoManager>> {
        CURRENT_IOM.with(|c| c.borrow().as_ref().and_then(|w| w.upgrade()))
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// Schedule `cb` after `delay_ms`, recurring if asked.
    pub fn add_timer(&self, delay_ms: u64, cb: TimerCallback, recurring: bool) -> Timer {
        self.timers.add_timer(delay_ms, cb, recurring)
    }

    /// Timer that no-ops if `cond` is gone by fire time.
    pub fn add_condition_timer(
        &self,
        delay_ms: u64,
        cb: TimerCallback,
        cond: std::sync::Weak<dyn std::any::Any + Send + Sync>,
    ) -> Timer {
        self.timers.add_condition_timer(delay_ms, cb, cond)
    }

    fn resize_contexts(&self, size: usize) {
        let mut contexts = self.fd_contexts.write().unwrap();
        let old = contexts.len();
        if size <= old {
            return;
        }
        contexts.resize_with(size, || None);
        for (fd, slot) in contexts.iter_mut().enumerate().skip(old) {
            *slot = Some(Arc::new(FdContext::new(fd as c_int)));
        }
    }

    fn fd_context(&self, fd: c_int) -> Arc<FdContext> {
        let idx = fd as usize;
        {
            let contexts = self.fd_contexts.read().unwrap();
            if idx < contexts.len() {
                return contexts[idx].as_ref().unwrap().clone();
            }
        }
        self.resize_contexts(idx + idx / 2 + 1);
        self.fd_contexts.read().unwrap()[idx].as_ref().unwrap().clone()
    }

    /// Register interest in `ev` on `fd`.
    ///
    /// With `cb`, the callback is scheduled when the event triggers. Without,
    /// the *currently executing* coroutine is bound and will be rescheduled -
    /// the caller is expected to yield right after.
    ///
    /// Double-binding one (fd, direction) aborts; a multiplexer rejection is
    /// returned as an error with no bookkeeping left behind.
    pub fn add_event(&self, fd: c_int, ev: Event, cb: Option<TaskFn>) -> SilkResult<()> {
        let fd_ctx = self.fd_context(fd);
        let mut inner = fd_ctx.inner.lock().unwrap();

        fatal_assert!(
            inner.events & ev.bit() == 0,
            "add_event: {:?} already registered on fd {} (events={:#x})",
            ev,
            fd,
            inner.events
        );

        let op = if inner.events != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let mut epev = libc::epoll_event {
            events: EV_ET | inner.events | ev.bit(),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut epev) };
        if ret != 0 {
            let e = errno();
            kerror!(
                "add_event: epoll_ctl({}, {}, {}) failed (errno {})",
                self.epfd,
                op,
                fd,
                e
            );
            return Err(SilkError::RegistrationFailed(e));
        }

        self.pending_events.fetch_add(1, Ordering::AcqRel);
        inner.events |= ev.bit();

        let ctx = inner.event_context(ev);
        fatal_assert!(!ctx.is_bound(), "add_event: stale binding on fd {}", fd);
        ctx.scheduler = self.self_ref.get().cloned();
        match cb {
            Some(f) => ctx.callback = Some(f),
            None => {
                let co = Coroutine::current();
                fatal_assert!(
                    co.state() == CoState::Exec,
                    "add_event: binding coroutine {} in state {}",
                    co.id(),
                    co.state()
                );
                ctx.coroutine = Some(co);
            }
        }
        Ok(())
    }

    /// Unregister `ev` on `fd`, dropping the binding without running it.
    pub fn del_event(&self, fd: c_int, ev: Event) -> bool {
        let Some(fd_ctx) = self.lookup_context(fd) else {
            return false;
        };
        let mut inner = fd_ctx.inner.lock().unwrap();
        if inner.events & ev.bit() == 0 {
            return false;
        }

        let left = inner.events & !ev.bit();
        if !self.reregister(fd, left) {
            return false;
        }

        inner.events = left;
        self.pending_events.fetch_sub(1, Ordering::AcqRel);
        inner.event_context(ev).reset();
        true
    }

    /// Unregister `ev` on `fd` and force-run its binding immediately,
    /// regardless of actual readiness. Used for timeouts and forced
    /// unblocking.
    pub fn cancel_event(&self, fd: c_int, ev: Event) -> bool {
        let Some(fd_ctx) = self.lookup_context(fd) else {
            return false;
        };
        let mut inner = fd_ctx.inner.lock().unwrap();
        if inner.events & ev.bit() == 0 {
            return false;
        }

        let left = inner.events & !ev.bit();
        if !self.reregister(fd, left) {
            return false;
        }

        inner.trigger(fd, ev);
        self.pending_events.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Force-run both directions and fully drop the registration. Used on
    /// descriptor close.
    pub fn cancel_all(&self, fd: c_int) -> bool {
        let Some(fd_ctx) = self.lookup_context(fd) else {
            return false;
        };
        let mut inner = fd_ctx.inner.lock().unwrap();
        if inner.events == 0 {
            return false;
        }

        if !self.reregister(fd, 0) {
            return false;
        }

        if inner.events & Event::Read.bit() != 0 {
            inner.trigger(fd, Event::Read);
            self.pending_events.fetch_sub(1, Ordering::AcqRel);
        }
        if inner.events & Event::Write.bit() != 0 {
            inner.trigger(fd, Event::Write);
            self.pending_events.fetch_sub(1, Ordering::AcqRel);
        }
        fatal_assert!(inner.events == 0);
        true
    }

    fn lookup_context(&self, fd: c_int) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let contexts = self.fd_contexts.read().unwrap();
        contexts.get(fd as usize).and_then(|slot| slot.clone())
    }

    /// Modify (or remove, when `events` is 0) the epoll registration of `fd`.
    fn reregister(&self, fd: c_int, events: u32) -> bool {
        let op = if events != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        let mut epev = libc::epoll_event {
            events: EV_ET | events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut epev) };
        if ret != 0 {
            kerror!(
                "epoll_ctl({}, {}, {}) failed (errno {})",
                self.epfd,
                op,
                fd,
                errno()
            );
            return false;
        }
        true
    }

    fn tickle_now(&self) {
        if !self.base.has_idle_threads() {
            return;
        }
        let ret = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr() as *const c_void, 1) };
        // A full pipe already guarantees a pending wake-up.
        fatal_assert!(
            ret == 1 || errno() == libc::EAGAIN,
            "tickle write failed (errno {})",
            errno()
        );
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.tickle_fds[0],
                    buf.as_mut_ptr() as *mut c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Schedule for IoManager {
    fn base(&self) -> &Scheduler {
        &self.base
    }

    /// Self-pipe wake-up; skipped when nobody is blocked in the wait.
    fn tickle(&self) {
        self.tickle_now();
    }

    /// Also requires no pending registrations and no timers, so `stop` will
    /// not tear the pool down under outstanding I/O.
    fn stopping(&self) -> bool {
        self.pending_events.load(Ordering::Acquire) == 0
            && self.timers.is_empty()
            && self.base.base_stopping()
    }

    fn on_thread_start(this: &Arc<Self>) {
        CURRENT_IOM.with(|c| *c.borrow_mut() = Some(Arc::downgrade(this)));
        hook::set_hook_enabled(true);
    }

    /// The reactor loop, run inside each thread's idle coroutine.
    fn idle(this: &Arc<Self>) {
        kdebug!("iomanager {} idle start", this.base.name());

        const MAX_EVENTS: usize = 256;
        const MAX_TIMEOUT_MS: u64 = 3000;
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            if this.stopping() {
                kinfo!("iomanager {} stopping, idle exit", this.base.name());
                return;
            }

            let timeout = this.timers.next_time().min(MAX_TIMEOUT_MS) as c_int;
            let n = loop {
                let n = unsafe {
                    libc::epoll_wait(this.epfd, events.as_mut_ptr(), MAX_EVENTS as c_int, timeout)
                };
                if n < 0 && errno() == libc::EINTR {
                    continue;
                }
                break n.max(0) as usize;
            };

            // Expired timers become ordinary scheduled callbacks.
            let cbs = this.timers.take_expired();
            if !cbs.is_empty() {
                let tasks = cbs
                    .into_iter()
                    .map(|cb| ScheduledTask::call(move || (*cb)()))
                    .collect();
                scheduler::schedule_batch(this, tasks);
            }

            for event in events.iter().take(n) {
                let mut bits = event.events;
                let fd = event.u64 as c_int;

                if fd == this.tickle_fds[0] {
                    this.drain_tickle_pipe();
                    continue;
                }

                let Some(fd_ctx) = this.lookup_context(fd) else {
                    continue;
                };
                let mut inner = fd_ctx.inner.lock().unwrap();

                // Errors and hangups must wake whatever is bound so it can
                // observe the failure from the retried call.
                if bits & (EV_ERR | EV_HUP) != 0 {
                    bits |= (EV_IN | EV_OUT) & inner.events;
                }

                let mut ready = 0u32;
                if bits & EV_IN != 0 {
                    ready |= Event::Read.bit();
                }
                if bits & EV_OUT != 0 {
                    ready |= Event::Write.bit();
                }
                // Only directions someone actually registered count.
                ready &= inner.events;
                if ready == 0 {
                    continue;
                }

                // Re-register whatever is not being satisfied right now.
                let left = inner.events & !ready;
                if !this.reregister(fd, left) {
                    continue;
                }

                if ready & Event::Read.bit() != 0 {
                    inner.trigger(fd_ctx.fd, Event::Read);
                    this.pending_events.fetch_sub(1, Ordering::AcqRel);
                }
                if ready & Event::Write.bit() != 0 {
                    inner.trigger(fd_ctx.fd, Event::Write);
                    this.pending_events.fetch_sub(1, Ordering::AcqRel);
                }
            }

            // Let the dispatch loop look at the queue we just filled.
            Coroutine::yield_to_hold();
        }
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_bits_match_epoll() {
        assert_eq!(Event::Read.bit(), EV_IN);
        assert_eq!(Event::Write.bit(), EV_OUT);
    }
}
