//! Wall-clock time helpers
//!
//! Timers are ordered by absolute wall-clock milliseconds so that the
//! manager's backward-jump detection is meaningful (a monotonic clock cannot
//! jump).

use nix::time::{clock_gettime, ClockId};
use silk_core::fatal;

/// Current wall-clock time in milliseconds
pub fn current_ms() -> u64 {
    match clock_gettime(ClockId::CLOCK_REALTIME) {
        Ok(ts) => ts.tv_sec() as u64 * 1000 + ts.tv_nsec() as u64 / 1_000_000,
        Err(e) => fatal!("clock_gettime(CLOCK_REALTIME) failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_ms_advances() {
        let a = current_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = current_ms();
        assert!(b >= a + 4);
    }
}
