//! # silk - stackful M:N coroutine runtime
//!
//! Cooperative coroutines scheduled across a fixed thread pool, driven by an
//! edge-triggered epoll reactor and a timer collection, with a call-shim
//! layer that makes blocking-style I/O transparently asynchronous.
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use silk::{hook, scheduler, IoManager, ScheduledTask};
//!
//! fn main() {
//!     // Two dispatch threads; the calling thread is one of them and joins
//!     // the pool inside `stop`.
//!     let iom = IoManager::new("app", 2, true);
//!
//!     scheduler::schedule(&iom, ScheduledTask::call(|| {
//!         // Looks blocking; suspends the coroutine instead of the thread.
//!         hook::usleep(10_000);
//!         let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
//!         // ... hook::connect / hook::read / hook::write / hook::close
//!     }));
//!
//!     scheduler::stop(&iom);
//! }
//! ```
//!
//! ## Layers
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  application code: blocking-style calls via `hook`   │
//! └──────────────────────────────────────────────────────┘
//!                  │ would-block: register + yield
//!                  ▼
//! ┌──────────────────────────────────────────────────────┐
//! │  IoManager: epoll reactor + timers   (silk-io)       │
//! │  Scheduler: dispatch loops           (silk-runtime)  │
//! │  Coroutine: stacks + context switch  (silk-runtime)  │
//! └──────────────────────────────────────────────────────┘
//! ```

pub use silk_core::config;
pub use silk_core::error::{SilkError, SilkResult};
pub use silk_core::klog;
pub use silk_core::state::CoState;
pub use silk_core::{kdebug, kerror, kinfo, ktrace, kwarn};

pub use silk_runtime::coroutine::{Coroutine, CoroutineFn};
pub use silk_runtime::scheduler::{self, Schedule, ScheduledTask, Scheduler};
pub use silk_runtime::thread::Thread;
pub use silk_runtime::timer::{Timer, TimerManager};

pub use silk_io::fdmanager::{fd_manager, FdCtx, FdManager};
pub use silk_io::hook;
pub use silk_io::iomanager::{Event, IoManager};
