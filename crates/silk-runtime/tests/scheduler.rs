//! Scheduler integration tests: exactly-once execution, thread affinity,
//! cooperative shutdown, caller-participates mode.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use silk_runtime::coroutine::Coroutine;
use silk_runtime::scheduler::{self, ScheduledTask, Scheduler};
use silk_runtime::thread::current_thread_id;

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
fn exactly_once_from_many_producers() {
    let sched = Arc::new(Scheduler::new("exact", 3, false));
    scheduler::start(&sched);

    let count = Arc::new(AtomicUsize::new(0));
    let mut producers = Vec::new();
    for _ in 0..4 {
        let sched = sched.clone();
        let count = count.clone();
        producers.push(std::thread::spawn(move || {
            for _ in 0..25 {
                let count = count.clone();
                scheduler::schedule(
                    &sched,
                    ScheduledTask::call(move || {
                        count.fetch_add(1, Ordering::Relaxed);
                    }),
                );
            }
        }));
    }
    for p in producers {
        p.join().unwrap();
    }

    assert!(wait_for(Duration::from_secs(5), || {
        count.load(Ordering::Relaxed) == 100
    }));
    scheduler::stop(&sched);
    assert_eq!(count.load(Ordering::Relaxed), 100);
}

#[test]
fn affinity_pins_to_one_worker() {
    let sched = Arc::new(Scheduler::new("pin", 3, false));
    scheduler::start(&sched);

    let target = sched.thread_ids()[0];
    let seen = Arc::new(Mutex::new(HashSet::new()));
    let count = Arc::new(AtomicUsize::new(0));

    for _ in 0..50 {
        let seen = seen.clone();
        let count = count.clone();
        scheduler::schedule(
            &sched,
            ScheduledTask::call(move || {
                seen.lock().unwrap().insert(current_thread_id());
                count.fetch_add(1, Ordering::Relaxed);
            })
            .with_affinity(target),
        );
    }

    assert!(wait_for(Duration::from_secs(5), || {
        count.load(Ordering::Relaxed) == 50
    }));
    scheduler::stop(&sched);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen.contains(&target));
}

#[test]
fn stop_returns_after_queue_drains() {
    let sched = Arc::new(Scheduler::new("drain", 2, false));
    scheduler::start(&sched);

    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let count = count.clone();
        scheduler::schedule(
            &sched,
            ScheduledTask::call(move || {
                std::thread::sleep(Duration::from_millis(20));
                count.fetch_add(1, Ordering::Relaxed);
            }),
        );
    }

    scheduler::stop(&sched);
    assert_eq!(count.load(Ordering::Relaxed), 10);
}

#[test]
fn ready_yield_requeues_coroutine() {
    let sched = Arc::new(Scheduler::new("requeue", 2, false));
    scheduler::start(&sched);

    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let co = Coroutine::new(
        Box::new(move || {
            c.fetch_add(1, Ordering::Relaxed);
            Coroutine::yield_to_ready();
            c.fetch_add(1, Ordering::Relaxed);
        }),
        0,
    );
    scheduler::schedule(&sched, ScheduledTask::coroutine(co.clone()));

    assert!(wait_for(Duration::from_secs(5), || {
        count.load(Ordering::Relaxed) == 2
    }));
    scheduler::stop(&sched);
    assert!(co.state().is_terminal());
}

#[test]
fn caller_participates_runs_tasks_in_stop() {
    let sched = Arc::new(Scheduler::new("caller", 1, true));
    scheduler::start(&sched);

    let my_tid = current_thread_id();
    let count = Arc::new(AtomicUsize::new(0));
    let tids = Arc::new(Mutex::new(HashSet::new()));
    for _ in 0..3 {
        let count = count.clone();
        let tids = tids.clone();
        scheduler::schedule(
            &sched,
            ScheduledTask::call(move || {
                tids.lock().unwrap().insert(current_thread_id());
                count.fetch_add(1, Ordering::Relaxed);
            }),
        );
    }

    // No worker threads exist; nothing runs until stop().
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(count.load(Ordering::Relaxed), 0);

    scheduler::stop(&sched);
    assert_eq!(count.load(Ordering::Relaxed), 3);
    let tids = tids.lock().unwrap();
    assert_eq!(tids.len(), 1);
    assert!(tids.contains(&my_tid));
}
