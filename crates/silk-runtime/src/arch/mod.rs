//! Architecture-specific context switching
//!
//! Each backend provides:
//! - `SavedContext` - the callee-saved register set plus stack and resume
//!   pointers for one suspended execution context
//! - `init_context` - prime a fresh context so the first switch into it lands
//!   in the entry trampoline
//! - `context_switch` - save the current registers into one context and load
//!   another, returning only when something switches back

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::{context_switch, init_context, SavedContext};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::{context_switch, init_context, SavedContext};
    } else {
        compile_error!("silk-runtime: unsupported target architecture");
    }
}
