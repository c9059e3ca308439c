//! # silk-core
//!
//! Core types for the silk coroutine runtime.
//!
//! This crate is platform-agnostic: no OS calls, no scheduling policy. The
//! runtime and I/O layers live in `silk-runtime` and `silk-io`.
//!
//! ## Modules
//!
//! - `state` - coroutine lifecycle states
//! - `error` - error types
//! - `klog` - kernel-style leveled print macros
//! - `config` - named tunables with subscribe/notify listeners

#[macro_use]
pub mod klog;
#[macro_use]
pub mod macros;

pub mod config;
pub mod error;
pub mod state;

// Re-exports for convenience
pub use config::ConfigVar;
pub use error::{SilkError, SilkResult};
pub use state::{AtomicState, CoState};
