//! Reactor integration tests: event registration, cancellation, timers.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use libc::c_int;
use silk_io::iomanager::{Event, IoManager};
use silk_runtime::scheduler::{self, ScheduledTask};

fn socketpair() -> (c_int, c_int) {
    let mut fds = [0 as c_int; 2];
    let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(ret, 0, "socketpair failed");
    (fds[0], fds[1])
}

fn close_fd(fd: c_int) {
    unsafe { libc::close(fd) };
}

fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn two_callbacks_run_and_stop_waits() {
    let iom = IoManager::new("io-two", 2, false);
    let count = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let count = count.clone();
        scheduler::schedule(
            &iom,
            ScheduledTask::call(move || {
                std::thread::sleep(Duration::from_millis(20));
                count.fetch_add(1, Ordering::Relaxed);
            }),
        );
    }

    scheduler::stop(&iom);
    assert_eq!(count.load(Ordering::Relaxed), 2);
}

#[test]
fn del_event_leaves_no_residual_binding() {
    let iom = IoManager::new("io-del", 1, false);
    let (a, b) = socketpair();

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    iom.add_event(
        a,
        Event::Read,
        Some(Box::new(move || {
            f.fetch_add(1, Ordering::Relaxed);
        })),
    )
    .unwrap();

    assert!(iom.del_event(a, Event::Read));
    // Deleting a second time reports nothing to delete.
    assert!(!iom.del_event(a, Event::Read));

    // Readiness on a deregistered fd must not resume anything.
    let ret = unsafe { libc::write(b, b"x".as_ptr() as *const libc::c_void, 1) };
    assert_eq!(ret, 1);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(fired.load(Ordering::Relaxed), 0);

    scheduler::stop(&iom);
    close_fd(a);
    close_fd(b);
}

#[test]
fn cancel_event_triggers_exactly_once() {
    let iom = IoManager::new("io-cancel", 1, false);
    // Never written to: the read side never becomes ready on its own.
    let (a, b) = socketpair();

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    iom.add_event(
        a,
        Event::Read,
        Some(Box::new(move || {
            f.fetch_add(1, Ordering::Relaxed);
        })),
    )
    .unwrap();

    assert!(iom.cancel_event(a, Event::Read));
    assert!(wait_for(Duration::from_secs(2), || {
        fired.load(Ordering::Relaxed) == 1
    }));

    // No second firing, and the registration is gone.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::Relaxed), 1);
    assert!(!iom.cancel_event(a, Event::Read));

    scheduler::stop(&iom);
    close_fd(a);
    close_fd(b);
}

#[test]
fn cancel_all_runs_both_directions() {
    let iom = IoManager::new("io-cancel-all", 1, false);
    let (a, b) = socketpair();

    let reads = Arc::new(AtomicUsize::new(0));
    let writes = Arc::new(AtomicUsize::new(0));
    let r = reads.clone();
    let w = writes.clone();

    iom.add_event(
        a,
        Event::Read,
        Some(Box::new(move || {
            r.fetch_add(1, Ordering::Relaxed);
        })),
    )
    .unwrap();
    // Fill nothing: bind the write side with a callback as well.
    iom.add_event(
        a,
        Event::Write,
        Some(Box::new(move || {
            w.fetch_add(1, Ordering::Relaxed);
        })),
    )
    .unwrap();

    assert!(iom.cancel_all(a));
    assert!(wait_for(Duration::from_secs(2), || {
        reads.load(Ordering::Relaxed) == 1 && writes.load(Ordering::Relaxed) == 1
    }));
    assert!(!iom.cancel_all(a));

    scheduler::stop(&iom);
    close_fd(a);
    close_fd(b);
}

#[test]
fn readiness_runs_bound_callback() {
    let iom = IoManager::new("io-ready", 1, false);
    let (a, b) = socketpair();

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    iom.add_event(
        a,
        Event::Read,
        Some(Box::new(move || {
            f.fetch_add(1, Ordering::Relaxed);
        })),
    )
    .unwrap();

    let ret = unsafe { libc::write(b, b"x".as_ptr() as *const libc::c_void, 1) };
    assert_eq!(ret, 1);

    assert!(wait_for(Duration::from_secs(2), || {
        fired.load(Ordering::Relaxed) == 1
    }));

    scheduler::stop(&iom);
    close_fd(a);
    close_fd(b);
}

#[test]
fn recurring_timer_fires_repeatedly() {
    let iom = IoManager::new("io-timer", 1, false);
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();

    let timer = iom.add_timer(
        100,
        Arc::new(move || {
            c.fetch_add(1, Ordering::Relaxed);
        }),
        true,
    );

    // Three periods fit in the window with scheduling jitter to spare.
    std::thread::sleep(Duration::from_millis(400));
    assert!(
        count.load(Ordering::Relaxed) >= 3,
        "expected >= 3 fires, got {}",
        count.load(Ordering::Relaxed)
    );

    assert!(timer.cancel());
    scheduler::stop(&iom);
}

#[test]
fn condition_timer_noops_once_condition_dropped() {
    let iom = IoManager::new("io-cond", 1, false);
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();

    let cond: Arc<dyn Any + Send + Sync> = Arc::new(0u8);
    iom.add_condition_timer(
        50,
        Arc::new(move || {
            f.fetch_add(1, Ordering::Relaxed);
        }),
        Arc::downgrade(&cond),
    );
    drop(cond);

    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(fired.load(Ordering::Relaxed), 0);

    scheduler::stop(&iom);
}

#[test]
fn one_shot_timer_fires_near_deadline() {
    let iom = IoManager::new("io-oneshot", 1, false);
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    let start = Instant::now();

    iom.add_timer(
        80,
        Arc::new(move || {
            f.fetch_add(1, Ordering::Relaxed);
        }),
        false,
    );

    assert!(wait_for(Duration::from_secs(2), || {
        fired.load(Ordering::Relaxed) == 1
    }));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(75), "fired early: {:?}", elapsed);

    scheduler::stop(&iom);
}
