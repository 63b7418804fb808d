use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use taskweave::JobSystem;

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_continuation_chains_under_parent() {
    let system = JobSystem::new(2);
    let events = Arc::new(Mutex::new(Vec::new()));
    let subtree_done = Arc::new(AtomicBool::new(false));

    let sys = Arc::clone(&system);
    let ev = Arc::clone(&events);
    let done = Arc::clone(&subtree_done);
    system.run(move || {
        // Parent P.
        ev.lock().unwrap().push("parent");

        let ev_a = Arc::clone(&ev);
        let ev_b = Arc::clone(&ev);
        let sys_a = Arc::clone(&sys);
        sys.run(move || {
            // Job A, child of P, with continuation B.
            ev_a.lock().unwrap().push("a");
            sys_a.continuation(move || {
                ev_b.lock().unwrap().push("b");
            });
        });

        // P's continuation runs only after A and B are both finished, so it
        // marks the completion of the whole subtree.
        let done = Arc::clone(&done);
        sys.continuation(move || {
            done.store(true, Ordering::SeqCst);
        });
    });

    wait_until("subtree completion", || subtree_done.load(Ordering::SeqCst));
    assert_eq!(*events.lock().unwrap(), vec!["parent", "a", "b"]);
    system.shutdown().expect("shutdown failed");
}

#[test]
fn test_continuation_runs_after_children() {
    let system = JobSystem::new(4);
    let children_done = Arc::new(Mutex::new(Vec::new()));
    let continuation_saw = Arc::new(Mutex::new(None));
    let finished = Arc::new(AtomicBool::new(false));

    let sys = Arc::clone(&system);
    let done = Arc::clone(&children_done);
    let saw = Arc::clone(&continuation_saw);
    let fin = Arc::clone(&finished);
    system.run(move || {
        for i in 0..8 {
            let done = Arc::clone(&done);
            sys.run(move || {
                thread::sleep(Duration::from_millis(1));
                done.lock().unwrap().push(i);
            });
        }
        let done = Arc::clone(&done);
        sys.continuation(move || {
            *saw.lock().unwrap() = Some(done.lock().unwrap().len());
            fin.store(true, Ordering::SeqCst);
        });
    });

    wait_until("continuation", || finished.load(Ordering::SeqCst));
    // The continuation observed every child already finished.
    assert_eq!(*continuation_saw.lock().unwrap(), Some(8));
    system.shutdown().expect("shutdown failed");
}
