//! Timers and the timer manager
//!
//! Timers live in an ordered collection keyed by `(absolute due ms, sequence
//! id)` - the sequence id gives a deterministic tie-break for equal
//! deadlines. Mutating a due time always removes and reinserts, since the
//! ordering key cannot change in place.
//!
//! An insertion that lands at the front of the collection fires the
//! registered front notifier: a reactor blocked on a wait computed from the
//! previous head must be woken to shorten its deadline.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use silk_core::kwarn;

use crate::time::current_ms;

/// A timer callback. Recurring timers invoke it once per period.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// A backward wall-clock jump larger than this drains the whole collection.
const CLOCK_ROLLBACK_MS: u64 = 60 * 60 * 1000;

struct TimerEntry {
    seq: u64,
    deadline_ms: AtomicU64,
    period_ms: AtomicU64,
    recurring: bool,
    cb: Mutex<Option<TimerCallback>>,
}

impl TimerEntry {
    fn key(&self) -> (u64, u64) {
        (self.deadline_ms.load(Ordering::Relaxed), self.seq)
    }
}

struct TimerCore {
    timers: RwLock<BTreeMap<(u64, u64), Arc<TimerEntry>>>,
    /// Set when the front has already triggered a wake that nobody has
    /// consumed yet; cleared when the next deadline is polled.
    tickled: AtomicBool,
    previous_ms: Mutex<u64>,
    next_seq: AtomicU64,
    front_notify: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl TimerCore {
    fn insert(&self, entry: Arc<TimerEntry>) {
        let key = entry.key();
        let at_front = {
            let mut timers = self.timers.write().unwrap();
            timers.insert(key, entry);
            timers.keys().next() == Some(&key) && !self.tickled.swap(true, Ordering::AcqRel)
        };
        if at_front {
            if let Some(notify) = self.front_notify.get() {
                notify();
            }
        }
    }
}

/// Handle to a scheduled timer
pub struct Timer {
    entry: Arc<TimerEntry>,
    core: Weak<TimerCore>,
}

impl Timer {
    /// Drop the callback and unschedule. Returns false if the timer already
    /// fired (non-recurring) or was cancelled.
    pub fn cancel(&self) -> bool {
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        let mut timers = core.timers.write().unwrap();
        let mut cb = self.entry.cb.lock().unwrap();
        if cb.is_none() {
            return false;
        }
        *cb = None;
        timers.remove(&self.entry.key());
        true
    }

    /// Recompute the due time as now + period, keeping the period.
    pub fn refresh(&self) -> bool {
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        let mut timers = core.timers.write().unwrap();
        if self.entry.cb.lock().unwrap().is_none() {
            return false;
        }
        if timers.remove(&self.entry.key()).is_none() {
            return false;
        }
        let deadline = current_ms() + self.entry.period_ms.load(Ordering::Relaxed);
        self.entry.deadline_ms.store(deadline, Ordering::Relaxed);
        timers.insert(self.entry.key(), self.entry.clone());
        true
    }

    /// Change the period; `from_now` re-anchors the due time at now,
    /// otherwise the original start point is kept. Reinsertion may land at
    /// the front and then wakes the reactor like any front insert.
    pub fn reset(&self, period_ms: u64, from_now: bool) -> bool {
        if period_ms == self.entry.period_ms.load(Ordering::Relaxed) && !from_now {
            return true;
        }
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        {
            let mut timers = core.timers.write().unwrap();
            if self.entry.cb.lock().unwrap().is_none() {
                return false;
            }
            if timers.remove(&self.entry.key()).is_none() {
                return false;
            }
            let old_deadline = self.entry.deadline_ms.load(Ordering::Relaxed);
            let old_period = self.entry.period_ms.load(Ordering::Relaxed);
            let start = if from_now {
                current_ms()
            } else {
                old_deadline - old_period
            };
            self.entry.period_ms.store(period_ms, Ordering::Relaxed);
            self.entry
                .deadline_ms
                .store(start + period_ms, Ordering::Relaxed);
        }
        // Reinsert outside the lock so the front notifier runs unlocked.
        core.insert(self.entry.clone());
        true
    }
}

/// Due-time-ordered timer collection
pub struct TimerManager {
    core: Arc<TimerCore>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager {
            core: Arc::new(TimerCore {
                timers: RwLock::new(BTreeMap::new()),
                tickled: AtomicBool::new(false),
                previous_ms: Mutex::new(current_ms()),
                next_seq: AtomicU64::new(1),
                front_notify: OnceLock::new(),
            }),
        }
    }

    /// Install the front-insertion hook (at most once).
    pub fn set_front_notify<F>(&self, notify: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.core.front_notify.set(Box::new(notify)).is_err() {
            kwarn!("timer front notifier installed twice, keeping the first");
        }
    }

    /// Schedule `cb` to run after `delay_ms` (and every `delay_ms` after
    /// that if `recurring`).
    pub fn add_timer(&self, delay_ms: u64, cb: TimerCallback, recurring: bool) -> Timer {
        let entry = Arc::new(TimerEntry {
            seq: self.core.next_seq.fetch_add(1, Ordering::Relaxed),
            deadline_ms: AtomicU64::new(current_ms() + delay_ms),
            period_ms: AtomicU64::new(delay_ms),
            recurring,
            cb: Mutex::new(Some(cb)),
        });
        self.core.insert(entry.clone());
        Timer {
            entry,
            core: Arc::downgrade(&self.core),
        }
    }

    /// Schedule `cb`, but make it a no-op if `cond` has been dropped by fire
    /// time. Used to avoid waking a coroutine whose I/O already completed
    /// through the normal readiness path.
    pub fn add_condition_timer(
        &self,
        delay_ms: u64,
        cb: TimerCallback,
        cond: Weak<dyn Any + Send + Sync>,
    ) -> Timer {
        let wrapped: TimerCallback = Arc::new(move || {
            if cond.upgrade().is_some() {
                (*cb)();
            }
        });
        self.add_timer(delay_ms, wrapped, false)
    }

    /// Milliseconds until the earliest timer is due: 0 if overdue,
    /// `u64::MAX` if the collection is empty.
    pub fn next_time(&self) -> u64 {
        self.core.tickled.store(false, Ordering::Release);
        let timers = self.core.timers.read().unwrap();
        match timers.keys().next() {
            None => u64::MAX,
            Some(&(deadline, _)) => {
                let now = current_ms();
                deadline.saturating_sub(now)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.core.timers.read().unwrap().is_empty()
    }

    /// Remove every timer due at or before now and return their callbacks in
    /// non-decreasing due-time order. Recurring timers are reinserted with
    /// due = now + period. A large backward clock jump drains everything.
    pub fn take_expired(&self) -> Vec<TimerCallback> {
        let now = current_ms();
        let mut cbs = Vec::new();

        let mut timers = self.core.timers.write().unwrap();
        if timers.is_empty() {
            return cbs;
        }

        let rolled_back = self.clock_rolled_back(now);
        if !rolled_back {
            if let Some(&(deadline, _)) = timers.keys().next() {
                if deadline > now {
                    return cbs;
                }
            }
        }

        let expired = if rolled_back {
            std::mem::take(&mut *timers)
        } else {
            let rest = timers.split_off(&(now + 1, 0));
            std::mem::replace(&mut *timers, rest)
        };

        cbs.reserve(expired.len());
        for entry in expired.into_values() {
            let mut slot = entry.cb.lock().unwrap();
            let Some(cb) = slot.take() else {
                continue; // cancelled while expiring
            };
            cbs.push(cb.clone());
            if entry.recurring {
                *slot = Some(cb);
                drop(slot);
                entry
                    .deadline_ms
                    .store(now + entry.period_ms.load(Ordering::Relaxed), Ordering::Relaxed);
                timers.insert(entry.key(), entry);
            }
        }
        cbs
    }

    fn clock_rolled_back(&self, now: u64) -> bool {
        let mut prev = self.core.previous_ms.lock().unwrap();
        let rolled = now < *prev && now < prev.saturating_sub(CLOCK_ROLLBACK_MS);
        *prev = now;
        rolled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread::sleep;
    use std::time::Duration;

    fn tagging_cb(tag: usize, log: &Arc<Mutex<Vec<usize>>>) -> TimerCallback {
        let log = log.clone();
        Arc::new(move || log.lock().unwrap().push(tag))
    }

    #[test]
    fn test_expired_in_due_order() {
        let mgr = TimerManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        mgr.add_timer(30, tagging_cb(3, &log), false);
        mgr.add_timer(10, tagging_cb(1, &log), false);
        mgr.add_timer(20, tagging_cb(2, &log), false);

        sleep(Duration::from_millis(50));
        for cb in mgr.take_expired() {
            (*cb)();
        }

        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_equal_deadlines_fire_in_insertion_order() {
        let mgr = TimerManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..5 {
            mgr.add_timer(5, tagging_cb(tag, &log), false);
        }
        sleep(Duration::from_millis(20));
        for cb in mgr.take_expired() {
            (*cb)();
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_recurring_reinserts_with_now_plus_period() {
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let timer = mgr.add_timer(
            10,
            Arc::new(move || {
                c.fetch_add(1, Ordering::Relaxed);
            }),
            true,
        );

        sleep(Duration::from_millis(20));
        for cb in mgr.take_expired() {
            (*cb)();
        }
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert!(!mgr.is_empty());
        assert!(mgr.next_time() <= 10);

        assert!(timer.cancel());
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_cancel_is_one_shot() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(10_000, Arc::new(|| {}), false);
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(mgr.is_empty());
        assert!(mgr.take_expired().is_empty());
    }

    #[test]
    fn test_next_time_empty_is_infinite() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_time(), u64::MAX);
        mgr.add_timer(5_000, Arc::new(|| {}), false);
        let next = mgr.next_time();
        assert!(next > 4_000 && next <= 5_000);
    }

    #[test]
    fn test_front_insert_notifies_once_per_poll() {
        let mgr = TimerManager::new();
        let wakes = Arc::new(AtomicUsize::new(0));
        let w = wakes.clone();
        mgr.set_front_notify(move || {
            w.fetch_add(1, Ordering::Relaxed);
        });

        mgr.add_timer(1_000, Arc::new(|| {}), false);
        assert_eq!(wakes.load(Ordering::Relaxed), 1);

        // Behind the head: no wake.
        mgr.add_timer(2_000, Arc::new(|| {}), false);
        assert_eq!(wakes.load(Ordering::Relaxed), 1);

        // New front, but the previous wake has not been consumed yet.
        mgr.add_timer(500, Arc::new(|| {}), false);
        assert_eq!(wakes.load(Ordering::Relaxed), 1);

        // After a poll the next front insert wakes again.
        mgr.next_time();
        mgr.add_timer(100, Arc::new(|| {}), false);
        assert_eq!(wakes.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_refresh_pushes_deadline_out() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(50, Arc::new(|| {}), false);
        sleep(Duration::from_millis(30));
        assert!(timer.refresh());
        let next = mgr.next_time();
        assert!(next > 35, "refresh should re-anchor at now (next={})", next);
    }

    #[test]
    fn test_reset_changes_period() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(10_000, Arc::new(|| {}), false);
        assert!(timer.reset(20_000, true));
        let next = mgr.next_time();
        assert!(next > 15_000 && next <= 20_000);

        // Same period without re-anchoring is a no-op success.
        assert!(timer.reset(20_000, false));
    }

    #[test]
    fn test_condition_timer_noops_after_drop() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();

        let cond: Arc<dyn Any + Send + Sync> = Arc::new(0u32);
        mgr.add_condition_timer(
            5,
            Arc::new(move || {
                f.fetch_add(1, Ordering::Relaxed);
            }),
            Arc::downgrade(&cond),
        );
        drop(cond);

        sleep(Duration::from_millis(20));
        for cb in mgr.take_expired() {
            (*cb)();
        }
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }
}
