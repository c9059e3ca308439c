//! # silk-io
//!
//! The I/O half of the silk runtime, Linux/epoll.
//!
//! ## Modules
//!
//! - `fdmanager` - lazy per-descriptor metadata registry
//! - `iomanager` - scheduler specialization driving an edge-triggered epoll
//!   reactor and the timer collection
//! - `hook` - blocking-style call set made cooperative

pub mod fdmanager;
pub mod hook;
pub mod iomanager;

// Re-exports for convenience
pub use fdmanager::{fd_manager, FdCtx, FdManager};
pub use iomanager::{Event, IoManager};
