//! Stackful coroutines
//!
//! A `Coroutine` owns a guard-paged stack and a saved execution context.
//! Control moves with explicit switch pairs:
//!
//! - `resume` / `yield_to_ready` / `yield_to_hold` switch between a thread's
//!   dispatch context and a task coroutine
//! - `call` / `back` switch between a thread's root context and a scheduler's
//!   caller-mode main coroutine
//!
//! Every thread lazily owns a stackless "root" coroutine describing its
//! original execution context; the dispatch context is the root on worker
//! threads and the scheduler's main coroutine on a caller-participating
//! thread.
//!
//! Lifecycle: `Init -> Exec -> {Ready | Hold} -> Exec -> ... -> {Term |
//! Except}`. The trampoline catches panics (`Except`), performs the terminal
//! switch, and aborts the process if control ever returns past it.

use std::cell::{RefCell, UnsafeCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use silk_core::config::{self, ConfigVar};
use silk_core::{fatal, fatal_assert, kdebug, kerror, AtomicState, CoState};

use crate::arch::{self, SavedContext};
use crate::stack::Stack;

/// A coroutine body. Runs exactly once per `new`/`reset`.
pub type CoroutineFn = Box<dyn FnOnce() + Send + 'static>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static TOTAL: AtomicU64 = AtomicU64::new(0);

/// `coroutine.stack_size` tunable, default 1 MiB
fn stack_size_config() -> &'static Arc<ConfigVar<usize>> {
    static VAR: OnceLock<Arc<ConfigVar<usize>>> = OnceLock::new();
    VAR.get_or_init(|| config::lookup("coroutine.stack_size", 1024 * 1024, "coroutine stack size"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoKind {
    /// A thread's original execution context; no stack, no body
    Root,
    /// Ordinary task coroutine; terminal switch goes to the dispatch context
    Task,
    /// A scheduler's caller-mode main coroutine; terminal switch goes to the
    /// thread's root context
    SchedMain,
}

/// A single stackful unit of cooperative execution
pub struct Coroutine {
    id: u64,
    kind: CoKind,
    state: AtomicState,
    stack: Option<Stack>,
    ctx: UnsafeCell<SavedContext>,
    body: UnsafeCell<Option<CoroutineFn>>,
    self_ref: OnceLock<Weak<Coroutine>>,
}

// Safety: `ctx`, `body` and the stack are only touched by whichever thread
// currently drives the coroutine. The state machine hands that role over:
// a coroutine is mutated either by its own body (state Exec, exactly one
// thread) or by a dispatcher that observed a non-Exec state after the saving
// switch completed (the dispatcher publishes Hold/Ready with a release store
// once the registers are parked). `state` itself is atomic.
unsafe impl Send for Coroutine {}
unsafe impl Sync for Coroutine {}

thread_local! {
    /// Currently executing coroutine on this thread
    static CURRENT: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };
    /// This thread's root coroutine
    static ROOT: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };
    /// The coroutine running this thread's dispatch loop
    static DISPATCH: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };
}

impl Coroutine {
    /// Create a task coroutine with its own stack.
    ///
    /// `stack_size` of 0 means the configured `coroutine.stack_size`.
    pub fn new(body: CoroutineFn, stack_size: usize) -> Arc<Coroutine> {
        Self::with_kind(body, stack_size, CoKind::Task)
    }

    /// Create a scheduler's caller-mode main coroutine (entered via `call`,
    /// left via `back`).
    pub(crate) fn new_main(body: CoroutineFn) -> Arc<Coroutine> {
        Self::with_kind(body, 0, CoKind::SchedMain)
    }

    fn with_kind(body: CoroutineFn, stack_size: usize, kind: CoKind) -> Arc<Coroutine> {
        let size = if stack_size != 0 {
            stack_size
        } else {
            stack_size_config().get()
        };
        let stack = match Stack::alloc(size) {
            Ok(s) => s,
            Err(e) => fatal!("coroutine stack allocation ({} bytes) failed: {}", size, e),
        };

        let co = Arc::new(Coroutine {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            state: AtomicState::new(CoState::Init),
            stack: Some(stack),
            ctx: UnsafeCell::new(SavedContext::zeroed()),
            body: UnsafeCell::new(Some(body)),
            self_ref: OnceLock::new(),
        });
        let _ = co.self_ref.set(Arc::downgrade(&co));
        TOTAL.fetch_add(1, Ordering::Relaxed);

        unsafe {
            arch::init_context(
                co.ctx.get(),
                co.stack.as_ref().unwrap().top(),
                coroutine_entry as usize,
                Arc::as_ptr(&co) as usize,
            );
        }
        kdebug!("coroutine {} created", co.id);
        co
    }

    fn new_root() -> Arc<Coroutine> {
        TOTAL.fetch_add(1, Ordering::Relaxed);
        let co = Arc::new(Coroutine {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            kind: CoKind::Root,
            state: AtomicState::new(CoState::Exec),
            stack: None,
            ctx: UnsafeCell::new(SavedContext::zeroed()),
            body: UnsafeCell::new(None),
            self_ref: OnceLock::new(),
        });
        let _ = co.self_ref.set(Arc::downgrade(&co));
        co
    }

    /// The shared handle to this coroutine
    fn arc(&self) -> Arc<Coroutine> {
        match self.self_ref.get().and_then(|w| w.upgrade()) {
            Some(co) => co,
            None => fatal!("coroutine {} used after its last handle dropped", self.id),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> CoState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, s: CoState) {
        self.state.set(s);
    }

    /// Live coroutines in the process (roots included)
    pub fn total() -> u64 {
        TOTAL.load(Ordering::Relaxed)
    }

    /// Give this coroutine a new body, reusing its stack allocation.
    ///
    /// Legal only from `Init`, `Term` or `Except`.
    pub fn reset(&self, body: CoroutineFn) {
        fatal_assert!(self.stack.is_some(), "reset on a stackless root coroutine");
        let state = self.state.get();
        fatal_assert!(
            state.is_resettable(),
            "reset from illegal state {} (coroutine {})",
            state,
            self.id
        );

        unsafe {
            *self.body.get() = Some(body);
            arch::init_context(
                self.ctx.get(),
                self.stack.as_ref().unwrap().top(),
                coroutine_entry as usize,
                self as *const Coroutine as usize,
            );
        }
        self.state.set(CoState::Init);
    }

    /// Switch from the dispatch context into this coroutine.
    ///
    /// Returns when the coroutine yields or terminates. Resuming a coroutine
    /// that is already executing is a caller bug and aborts.
    pub fn resume(&self) {
        let state = self.state.get();
        fatal_assert!(
            state != CoState::Exec,
            "resume of an executing coroutine {}",
            self.id
        );

        let dispatch = dispatch_coroutine();
        fatal_assert!(
            !std::ptr::eq(self, Arc::as_ptr(&dispatch)),
            "coroutine {} cannot resume itself",
            self.id
        );

        CURRENT.with(|c| *c.borrow_mut() = Some(self.arc()));
        self.state.set(CoState::Exec);
        unsafe {
            arch::context_switch(dispatch.ctx.get(), self.ctx.get());
        }
    }

    /// Switch from this (currently executing) coroutine back to the dispatch
    /// context.
    fn swap_out(&self) {
        let dispatch = dispatch_coroutine();
        CURRENT.with(|c| *c.borrow_mut() = Some(dispatch.clone()));
        unsafe {
            arch::context_switch(self.ctx.get(), dispatch.ctx.get());
        }
    }

    /// Enter a caller-mode main coroutine from the thread's root context.
    pub(crate) fn call(&self) {
        let root = root_coroutine();
        CURRENT.with(|c| *c.borrow_mut() = Some(self.arc()));
        self.state.set(CoState::Exec);
        unsafe {
            arch::context_switch(root.ctx.get(), self.ctx.get());
        }
    }

    /// Leave a caller-mode main coroutine back to the thread's root context.
    fn back(&self) {
        let root = root_coroutine();
        CURRENT.with(|c| *c.borrow_mut() = Some(root.clone()));
        unsafe {
            arch::context_switch(self.ctx.get(), root.ctx.get());
        }
    }

    /// Initialize this thread's root coroutine (idempotent).
    pub fn init_thread() {
        root_coroutine();
    }

    /// The coroutine currently executing on this thread (the root context if
    /// none has been resumed yet).
    pub fn current() -> Arc<Coroutine> {
        if let Some(cur) = CURRENT.with(|c| c.borrow().clone()) {
            return cur;
        }
        root_coroutine()
    }

    /// Id of the current coroutine, 0 if this thread has none yet
    pub fn current_id() -> u64 {
        CURRENT.with(|c| c.borrow().as_ref().map_or(0, |co| co.id))
    }

    /// Yield, asking the dispatcher to re-enqueue this coroutine.
    pub fn yield_to_ready() {
        let cur = Coroutine::current();
        fatal_assert!(
            cur.state.get() == CoState::Exec,
            "yield from non-executing coroutine {}",
            cur.id
        );
        cur.state.set(CoState::Ready);
        cur.swap_out();
    }

    /// Yield without re-enqueueing; something else (an event or timer) will
    /// reschedule this coroutine. The dispatcher marks the state `Hold` once
    /// the switch has completed.
    pub fn yield_to_hold() {
        let cur = Coroutine::current();
        fatal_assert!(
            cur.state.get() == CoState::Exec,
            "yield from non-executing coroutine {}",
            cur.id
        );
        cur.swap_out();
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        TOTAL.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            fatal_assert!(
                self.state.get() != CoState::Exec,
                "dropping executing coroutine {}",
                self.id
            );
            kdebug!("coroutine {} destroyed", self.id);
        }
    }
}

/// This thread's root coroutine, created on first use
fn root_coroutine() -> Arc<Coroutine> {
    if let Some(root) = ROOT.with(|r| r.borrow().clone()) {
        return root;
    }
    let root = Coroutine::new_root();
    ROOT.with(|r| *r.borrow_mut() = Some(root.clone()));
    CURRENT.with(|c| {
        let mut cur = c.borrow_mut();
        if cur.is_none() {
            *cur = Some(root.clone());
        }
    });
    root
}

/// The dispatch context for this thread: explicitly installed by a scheduler,
/// otherwise the root context (standalone use).
fn dispatch_coroutine() -> Arc<Coroutine> {
    if let Some(d) = DISPATCH.with(|d| d.borrow().clone()) {
        return d;
    }
    root_coroutine()
}

/// Install the coroutine that runs this thread's dispatch loop.
pub(crate) fn set_dispatch(co: &Arc<Coroutine>) {
    DISPATCH.with(|d| *d.borrow_mut() = Some(co.clone()));
}

/// Trampoline target: runs the body, records the outcome, switches away for
/// good.
extern "C" fn coroutine_entry(arg: usize) {
    let co = unsafe { &*(arg as *const Coroutine) };

    let body = unsafe { (*co.body.get()).take() };
    let Some(body) = body else {
        fatal!("coroutine {} entered without a body", co.id);
    };

    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(()) => co.state.set(CoState::Term),
        Err(_) => {
            co.state.set(CoState::Except);
            kerror!("coroutine {} body panicked", co.id);
        }
    }

    // Terminal switch. The dispatcher (or `stop`) still holds an Arc to this
    // coroutine, so the stack stays mapped until after the switch lands.
    match co.kind {
        CoKind::SchedMain => co.back(),
        _ => co.swap_out(),
    }

    fatal!("coroutine {} resumed past its terminal switch", co.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn test_lifecycle_ready_then_term() {
        let states = Arc::new(Mutex::new(Vec::new()));
        let states2 = states.clone();
        let co = Coroutine::new(
            Box::new(move || {
                states2.lock().unwrap().push(Coroutine::current().state());
                Coroutine::yield_to_ready();
                states2.lock().unwrap().push(Coroutine::current().state());
            }),
            64 * 1024,
        );

        assert_eq!(co.state(), CoState::Init);
        co.resume();
        assert_eq!(co.state(), CoState::Ready);
        co.resume();
        assert_eq!(co.state(), CoState::Term);

        // The body observed itself as executing at both entry points.
        assert_eq!(*states.lock().unwrap(), vec![CoState::Exec, CoState::Exec]);
    }

    #[test]
    fn test_yield_hold_and_manual_requeue() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let co = Coroutine::new(
            Box::new(move || {
                hits2.fetch_add(1, Ordering::Relaxed);
                Coroutine::yield_to_hold();
                hits2.fetch_add(1, Ordering::Relaxed);
            }),
            64 * 1024,
        );

        co.resume();
        // A dispatcher would mark the coroutine Hold now.
        assert!(!co.state().is_terminal());
        co.set_state(CoState::Hold);
        assert_eq!(hits.load(Ordering::Relaxed), 1);

        co.resume();
        assert_eq!(co.state(), CoState::Term);
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_panic_marks_except() {
        let co = Coroutine::new(Box::new(|| panic!("boom")), 64 * 1024);
        co.resume();
        assert_eq!(co.state(), CoState::Except);
    }

    #[test]
    fn test_reset_reuses_stack() {
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        let co = Coroutine::new(
            Box::new(move || {
                c1.fetch_add(1, Ordering::Relaxed);
            }),
            64 * 1024,
        );
        co.resume();
        assert_eq!(co.state(), CoState::Term);

        let c2 = count.clone();
        co.reset(Box::new(move || {
            c2.fetch_add(10, Ordering::Relaxed);
        }));
        assert_eq!(co.state(), CoState::Init);
        co.resume();
        assert_eq!(co.state(), CoState::Term);
        assert_eq!(count.load(Ordering::Relaxed), 11);
    }

    #[test]
    fn test_current_id_inside_body() {
        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = seen.clone();
        let co = Coroutine::new(
            Box::new(move || {
                seen2.store(Coroutine::current_id(), Ordering::Relaxed);
            }),
            64 * 1024,
        );
        let id = co.id();
        co.resume();
        assert_eq!(seen.load(Ordering::Relaxed), id);
    }

    #[test]
    fn test_ids_are_monotonic() {
        let a = Coroutine::new(Box::new(|| {}), 64 * 1024);
        let b = Coroutine::new(Box::new(|| {}), 64 * 1024);
        assert!(b.id() > a.id());
    }
}
