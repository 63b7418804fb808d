use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use taskweave::JobSystem;

// Runs in its own process, so terminating the singleton is safe here.
#[test]
fn test_singleton_facade() {
    let system = JobSystem::instance();
    assert!(system.thread_count() >= 1);

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    system.run(move || {
        flag.store(true, Ordering::SeqCst);
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    while !ran.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "timed out waiting for the job");
        thread::sleep(Duration::from_millis(1));
    }

    system.shutdown().expect("shutdown failed");
}
