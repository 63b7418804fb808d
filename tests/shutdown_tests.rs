use std::alloc::Layout;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use taskweave::{JobSystem, JobSystemConfig, MemoryResource, SystemResource};

struct CountingResource {
    inner: SystemResource,
    allocs: AtomicUsize,
    frees: AtomicUsize,
}

impl CountingResource {
    fn new() -> Self {
        CountingResource {
            inner: SystemResource,
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        }
    }

    fn outstanding(&self) -> isize {
        self.allocs.load(Ordering::SeqCst) as isize - self.frees.load(Ordering::SeqCst) as isize
    }
}

impl MemoryResource for CountingResource {
    fn allocate(&self, layout: Layout) -> *mut u8 {
        self.allocs.fetch_add(1, Ordering::SeqCst);
        self.inner.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: *mut u8, layout: Layout) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        self.inner.deallocate(ptr, layout);
    }
}

#[test]
fn test_idle_shutdown() {
    let system = JobSystem::new(2);
    system.shutdown().expect("shutdown failed");
}

#[test]
fn test_shutdown_during_job_execution() {
    let system = JobSystem::new(2);

    for _ in 0..10 {
        system.run(|| {
            thread::sleep(Duration::from_millis(10));
        });
    }

    // Shut down immediately; in-flight jobs finish their current step and
    // queued ones are drained without running.
    let result = system.shutdown();
    assert!(result.is_ok(), "shutdown should succeed with jobs in flight");
}

#[test]
fn test_shutdown_while_busy_releases_all_storage() {
    let resource: &'static CountingResource = Box::leak(Box::new(CountingResource::new()));
    let system = JobSystem::with_config(JobSystemConfig {
        worker_count: 2,
        resource,
        ..JobSystemConfig::default()
    });

    // A long chain of slow jobs; most are still queued when we pull the
    // plug.
    for _ in 0..200 {
        system.run(|| {
            thread::sleep(Duration::from_millis(1));
        });
    }

    let started = Instant::now();
    system.terminate();
    system.wait_for_termination();
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "termination should be bounded by the in-flight step, not the queue"
    );

    assert_eq!(
        resource.outstanding(),
        0,
        "all job storage must be back with the resource after the drain"
    );
}

#[test]
fn test_wait_for_termination_joins_all_workers() {
    let system = JobSystem::new(4);
    let ran = Arc::new(AtomicUsize::new(0));

    for _ in 0..100 {
        let ran = Arc::clone(&ran);
        system.run(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }

    system.terminate();
    system.wait_for_termination();
    // After the wait there are no workers left; a second wait is a no-op.
    system.wait_for_termination();
    assert!(ran.load(Ordering::SeqCst) <= 100);
}
