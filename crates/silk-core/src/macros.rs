//! Fatal assertion macros
//!
//! Caller-contract violations (double event binding, resuming a running
//! coroutine, control escaping a trampoline) terminate the process. They are
//! never recoverable runtime conditions, so these abort rather than unwind -
//! an unwinding panic inside a dispatch loop would be caught by a coroutine
//! trampoline and misreported as a task failure.

/// Log an error and abort the process.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        $crate::kerror!($($arg)*);
        ::std::process::abort()
    }};
}

/// Abort the process unless `cond` holds.
#[macro_export]
macro_rules! fatal_assert {
    ($cond:expr) => {{
        if !$cond {
            $crate::fatal!("assertion failed: {} ({}:{})", stringify!($cond), file!(), line!());
        }
    }};
    ($cond:expr, $($arg:tt)*) => {{
        if !$cond {
            $crate::kerror!("assertion failed: {} ({}:{})", stringify!($cond), file!(), line!());
            $crate::fatal!($($arg)*);
        }
    }};
}
