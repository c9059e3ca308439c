//! M:N coroutine scheduler
//!
//! A [`Scheduler`] owns a task queue and a pool of worker threads, each
//! running the dispatch loop in [`run`]. Tasks are coroutines or plain
//! callbacks, optionally pinned to one worker by kernel thread id.
//!
//! Specializations (the I/O manager) override the [`Schedule`] trait's
//! `tickle`/`stopping`/`idle`/`on_thread_start` hooks; the generic driver
//! functions [`start`], [`stop`], [`schedule`] and [`schedule_batch`] carry
//! the shared machinery.
//!
//! Caller-participates mode: when constructed with `use_caller`, the
//! constructing thread counts as one of the workers. It does not dispatch
//! until [`stop`], which enters the dispatch loop inside the scheduler's
//! distinguished main coroutine and returns once the scheduler has drained.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use silk_core::{fatal, fatal_assert, kdebug, kinfo, CoState};

use crate::coroutine::{self, Coroutine};
use crate::thread::{current_thread_id, Thread};

/// A boxed task body
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

enum TaskKind {
    Coroutine(Arc<Coroutine>),
    Call(TaskFn),
}

/// One schedulable unit: a coroutine or a callback, with optional thread
/// affinity
pub struct ScheduledTask {
    kind: TaskKind,
    thread: Option<u64>,
}

impl ScheduledTask {
    pub fn coroutine(co: Arc<Coroutine>) -> ScheduledTask {
        ScheduledTask {
            kind: TaskKind::Coroutine(co),
            thread: None,
        }
    }

    pub fn call<F>(f: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        Self::call_boxed(Box::new(f))
    }

    pub fn call_boxed(f: TaskFn) -> ScheduledTask {
        ScheduledTask {
            kind: TaskKind::Call(f),
            thread: None,
        }
    }

    /// Pin this task to the worker with the given kernel thread id.
    pub fn with_affinity(mut self, tid: u64) -> ScheduledTask {
        self.thread = Some(tid);
        self
    }
}

struct SchedulerInner {
    tasks: VecDeque<ScheduledTask>,
    threads: Vec<Thread>,
    thread_ids: Vec<u64>,
    main_coroutine: Option<Arc<Coroutine>>,
}

/// Shared scheduler state (embedded by specializations)
pub struct Scheduler {
    name: String,
    inner: Mutex<SchedulerInner>,
    /// OS threads to spawn (caller already subtracted in use_caller mode)
    worker_count: usize,
    use_caller: bool,
    caller_tid: Option<u64>,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    /// True before start() and again once stop() begins
    stop_requested: AtomicBool,
    auto_stop: AtomicBool,
}

impl Scheduler {
    /// `threads` counts the constructing thread when `use_caller` is set.
    pub fn new(name: &str, threads: usize, use_caller: bool) -> Scheduler {
        fatal_assert!(threads > 0, "scheduler needs at least one thread");

        let (worker_count, caller_tid) = if use_caller {
            Coroutine::init_thread();
            (threads - 1, Some(current_thread_id()))
        } else {
            (threads, None)
        };

        Scheduler {
            name: name.to_string(),
            inner: Mutex::new(SchedulerInner {
                tasks: VecDeque::new(),
                threads: Vec::new(),
                thread_ids: Vec::new(),
                main_coroutine: None,
            }),
            worker_count,
            use_caller,
            caller_tid,
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel thread ids of every dispatching thread (for affinity pinning)
    pub fn thread_ids(&self) -> Vec<u64> {
        self.inner.lock().unwrap().thread_ids.clone()
    }

    #[inline]
    pub fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::Acquire) > 0
    }

    /// Base stop predicate: stop requested, queue drained, nothing running
    pub fn base_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::Acquire)
            && self.stop_requested.load(Ordering::Acquire)
            && self.inner.lock().unwrap().tasks.is_empty()
            && self.active_threads.load(Ordering::Acquire) == 0
    }

    /// Returns true if the queue was empty before the push (tickle needed).
    fn push_task(&self, task: ScheduledTask) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let was_empty = inner.tasks.is_empty();
        inner.tasks.push_back(task);
        was_empty
    }

    fn push_batch(&self, tasks: Vec<ScheduledTask>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let was_empty = inner.tasks.is_empty();
        inner.tasks.extend(tasks);
        was_empty
    }
}

/// Scheduler specialization hooks
///
/// The base [`Scheduler`] implements this with the defaults; the I/O manager
/// overrides all four hooks.
pub trait Schedule: Send + Sync + Sized + 'static {
    fn base(&self) -> &Scheduler;

    /// Wake an idle dispatching thread. The base scheduler's idle loop
    /// re-polls on its own, so this is only a trace point.
    fn tickle(&self) {
        kdebug!("scheduler {} tickle", self.base().name());
    }

    /// Full stop predicate; specializations may add conditions.
    fn stopping(&self) -> bool {
        self.base().base_stopping()
    }

    /// Runs inside the per-thread idle coroutine whenever the dispatch loop
    /// finds no task. Must yield regularly and return once `stopping()`.
    fn idle(this: &Arc<Self>) {
        while !this.stopping() {
            std::thread::yield_now();
            Coroutine::yield_to_hold();
        }
    }

    /// Called once on every dispatching thread before its first task.
    fn on_thread_start(_this: &Arc<Self>) {}
}

impl Schedule for Scheduler {
    fn base(&self) -> &Scheduler {
        self
    }
}

/// Enqueue a task, waking an idle thread if the queue was empty.
pub fn schedule<S: Schedule>(this: &Arc<S>, task: ScheduledTask) {
    if this.base().push_task(task) {
        this.tickle();
    }
}

/// Enqueue several tasks under one lock acquisition and at most one tickle.
pub fn schedule_batch<S: Schedule>(this: &Arc<S>, tasks: Vec<ScheduledTask>) {
    if tasks.is_empty() {
        return;
    }
    if this.base().push_batch(tasks) {
        this.tickle();
    }
}

/// Spawn the worker threads. Idempotent once running.
pub fn start<S: Schedule>(this: &Arc<S>) {
    let base = this.base();
    {
        let mut inner = base.inner.lock().unwrap();
        if !base.stop_requested.load(Ordering::Acquire) {
            return; // already running
        }
        base.stop_requested.store(false, Ordering::Release);
        fatal_assert!(inner.threads.is_empty());

        if let Some(tid) = base.caller_tid {
            inner.thread_ids.push(tid);
        }

        for i in 0..base.worker_count {
            let name = format!("{}_{}", base.name, i);
            let s = this.clone();
            let thread = match Thread::spawn(&name, move || run(s)) {
                Ok(t) => t,
                Err(e) => fatal!("scheduler {}: worker spawn failed: {}", base.name, e),
            };
            inner.thread_ids.push(thread.tid());
            inner.threads.push(thread);
        }
    }

    if base.use_caller {
        S::on_thread_start(this);
    }
}

/// Cooperative shutdown: request stop, wake every thread, run the caller's
/// main coroutine to completion (caller-participates mode), join workers.
pub fn stop<S: Schedule>(this: &Arc<S>) {
    let base = this.base();
    base.auto_stop.store(true, Ordering::Release);

    // Caller-only scheduler whose main coroutine never ran (or already
    // finished): nothing to drain but the queue.
    if base.use_caller && base.worker_count == 0 {
        let main_done = {
            let inner = base.inner.lock().unwrap();
            match &inner.main_coroutine {
                None => true,
                Some(c) => matches!(c.state(), CoState::Init | CoState::Term),
            }
        };
        if main_done {
            base.stop_requested.store(true, Ordering::Release);
            if this.stopping() {
                kinfo!("scheduler {} stopped", base.name);
                return;
            }
        }
    }

    if base.use_caller {
        fatal_assert!(
            base.caller_tid == Some(current_thread_id()),
            "stop() of a caller-participating scheduler must run on the constructing thread"
        );
    }

    base.stop_requested.store(true, Ordering::Release);
    for _ in 0..base.worker_count {
        this.tickle();
    }
    if base.use_caller {
        this.tickle();
    }

    if base.use_caller && !this.stopping() {
        let main = {
            let mut inner = base.inner.lock().unwrap();
            if let Some(c) = inner.main_coroutine.clone() {
                c
            } else {
                let s = this.clone();
                let c = Coroutine::new_main(Box::new(move || run(s)));
                inner.main_coroutine = Some(c.clone());
                c
            }
        };
        coroutine::set_dispatch(&main);
        main.call();
    }

    let threads = {
        let mut inner = base.inner.lock().unwrap();
        std::mem::take(&mut inner.threads)
    };
    for t in threads {
        t.join();
    }
    kinfo!("scheduler {} stopped", base.name);
}

/// The dispatch loop. Runs on every worker thread, and inside the main
/// coroutine of a caller-participating thread during [`stop`].
fn run<S: Schedule>(this: Arc<S>) {
    S::on_thread_start(&this);
    let base = this.base();
    let my_tid = current_thread_id();
    kdebug!("scheduler {} dispatch loop start", base.name);

    if base.caller_tid != Some(my_tid) {
        // Worker thread: its root context is the dispatch context. (On the
        // caller thread, stop() installed the main coroutine already.)
        coroutine::set_dispatch(&Coroutine::current());
    }

    let idle_this = this.clone();
    let idle_co = Coroutine::new(Box::new(move || S::idle(&idle_this)), 0);
    let mut cb_co: Option<Arc<Coroutine>> = None;

    loop {
        let mut task: Option<ScheduledTask> = None;
        let mut need_tickle = false;
        {
            let mut inner = base.inner.lock().unwrap();
            let mut found = None;
            for (i, t) in inner.tasks.iter().enumerate() {
                // Pinned to another thread: leave it, but make sure someone
                // over there wakes up.
                if let Some(tid) = t.thread {
                    if tid != my_tid {
                        need_tickle = true;
                        continue;
                    }
                }
                // A coroutine still running on another thread stays queued
                // until its switch-out completes.
                if let TaskKind::Coroutine(co) = &t.kind {
                    if co.state() == CoState::Exec {
                        continue;
                    }
                }
                found = Some(i);
                break;
            }
            if let Some(i) = found {
                task = inner.tasks.remove(i);
                base.active_threads.fetch_add(1, Ordering::AcqRel);
                need_tickle |= !inner.tasks.is_empty();
            }
        }
        if need_tickle {
            this.tickle();
        }

        match task {
            Some(ScheduledTask {
                kind: TaskKind::Coroutine(co),
                ..
            }) => {
                if !co.state().is_terminal() {
                    co.resume();
                    base.active_threads.fetch_sub(1, Ordering::AcqRel);
                    match co.state() {
                        CoState::Ready => schedule(&this, ScheduledTask::coroutine(co)),
                        s if !s.is_terminal() => co.set_state(CoState::Hold),
                        _ => {}
                    }
                } else {
                    base.active_threads.fetch_sub(1, Ordering::AcqRel);
                }
            }
            Some(ScheduledTask {
                kind: TaskKind::Call(f),
                ..
            }) => {
                // Recycle one coroutine per thread for plain callbacks.
                let co = match cb_co.take() {
                    Some(c) => {
                        c.reset(f);
                        c
                    }
                    None => Coroutine::new(f, 0),
                };
                co.resume();
                base.active_threads.fetch_sub(1, Ordering::AcqRel);
                match co.state() {
                    CoState::Ready => schedule(&this, ScheduledTask::coroutine(co)),
                    s if s.is_terminal() => cb_co = Some(co),
                    _ => {
                        // Parked on an event or timer; whoever triggers it
                        // holds the handle now.
                        co.set_state(CoState::Hold);
                    }
                }
            }
            None => {
                if idle_co.state() == CoState::Term {
                    kinfo!("scheduler {} idle coroutine finished, thread exits", base.name);
                    break;
                }
                base.idle_threads.fetch_add(1, Ordering::AcqRel);
                idle_co.resume();
                base.idle_threads.fetch_sub(1, Ordering::AcqRel);
                if !idle_co.state().is_terminal() {
                    idle_co.set_state(CoState::Hold);
                }
            }
        }
    }
}
