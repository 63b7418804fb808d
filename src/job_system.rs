//! The worker pool and its dispatch/completion protocols.
//!
//! The `JobSystem` owns the worker threads, the per-worker inboxes, the
//! central queue, and the recycled-job pool. Workers pull nodes from their
//! own FIFO inbox first and the shared LIFO central queue second, run them,
//! and drive the parent/child accounting that gives the scheduler its
//! structured-concurrency guarantee: a parent finishes only after every
//! descendant has finished.

use crate::job::Job;
use crate::memory::{self, ResourceRef};
pub use crate::node::JobToken;
use crate::node::{NodeHeader, NodeKind, NodePtr};
use crate::queue::JobQueue;
use crate::scope::Suspend;
use crate::task::{Promise, Task, TaskState};
use corosensei::CoroutineResult;
use crossbeam::utils::CachePadded;
use lazy_static::lazy_static;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

/// Consecutive empty polls before an idle worker naps.
const IDLE_POLLS_BEFORE_SLEEP: usize = 20;
/// Length of the idle nap. Worker 0 never naps, to keep the pool reactive.
const IDLE_SLEEP: Duration = Duration::from_micros(1);
/// Soft cap on pooled job slots; beyond it, finished jobs are freed.
const RECYCLER_CAPACITY: usize = 4096;

thread_local! {
    static THREAD_INDEX: Cell<i32> = const { Cell::new(-1) };
    static CURRENT_NODE: Cell<*mut NodeHeader> = const { Cell::new(ptr::null_mut()) };
}

/// Index of the worker running the current thread, or `-1` off-worker.
pub fn thread_index() -> i32 {
    THREAD_INDEX.get()
}

pub(crate) fn current_node() -> *mut NodeHeader {
    CURRENT_NODE.get()
}

/// Borrow of the engine handed into a resumed coroutine.
///
/// Carried as the coroutine resume argument so a task body always talks to
/// the system that is actually driving it, even after migrating workers.
#[derive(Clone, Copy)]
pub(crate) struct EngineRef(pub(crate) *const JobSystem);

// SAFETY: points at the JobSystem inside its Arc, which outlives every
// worker; the reference only crosses threads together with the promise.
unsafe impl Send for EngineRef {}

/// Construction parameters for a [`JobSystem`].
#[derive(Clone, Copy)]
pub struct JobSystemConfig {
    /// Number of workers; 0 means one per hardware thread.
    pub worker_count: usize,
    /// 0 or 1. With 1, the calling thread plays worker 0 and must enter the
    /// dispatch loop itself via [`JobSystem::drive`].
    pub start_index: usize,
    /// Pin each worker to a CPU core.
    pub pin_to_cores: bool,
    /// Memory resource backing job and promise storage.
    pub resource: ResourceRef,
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        JobSystemConfig {
            worker_count: 0,
            start_index: 0,
            pin_to_cores: false,
            resource: memory::system_resource(),
        }
    }
}

lazy_static! {
    static ref INSTANCE: Arc<JobSystem> = JobSystem::new(0);
}

/// The scheduler engine: worker pool, queues, and recycler.
///
/// Constructed behind an `Arc` so worker threads and callers share it; all
/// scheduling state is internal and the public methods take `&self`.
pub struct JobSystem {
    thread_count: usize,
    start_index: usize,
    resource: ResourceRef,
    terminate: AtomicBool,
    /// Workers that have reached the startup barrier.
    entered: AtomicUsize,
    /// Workers currently inside the dispatch loop; the last one out drains
    /// the queues.
    alive: AtomicUsize,
    local_queues: Vec<CachePadded<JobQueue<true>>>,
    central_queue: CachePadded<JobQueue<false>>,
    recycler: JobQueue<false>,
    recycler_len: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobSystem {
    /// Creates a pool with `worker_count` workers (0 = hardware threads).
    pub fn new(worker_count: usize) -> Arc<JobSystem> {
        JobSystem::with_config(JobSystemConfig {
            worker_count,
            ..JobSystemConfig::default()
        })
    }

    /// Like [`JobSystem::new`], with each worker pinned to a CPU core.
    pub fn new_with_affinity(worker_count: usize) -> Arc<JobSystem> {
        JobSystem::with_config(JobSystemConfig {
            worker_count,
            pin_to_cores: true,
            ..JobSystemConfig::default()
        })
    }

    /// Creates a pool from explicit configuration.
    pub fn with_config(config: JobSystemConfig) -> Arc<JobSystem> {
        let thread_count = if config.worker_count == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        } else {
            config.worker_count
        };
        let start_index = config.start_index.min(1);

        let mut local_queues = Vec::with_capacity(thread_count);
        for _ in 0..thread_count {
            local_queues.push(CachePadded::new(JobQueue::new()));
        }

        let system = Arc::new(JobSystem {
            thread_count,
            start_index,
            resource: config.resource,
            terminate: AtomicBool::new(false),
            entered: AtomicUsize::new(0),
            alive: AtomicUsize::new(thread_count - start_index),
            local_queues,
            central_queue: CachePadded::new(JobQueue::new()),
            recycler: JobQueue::new(),
            recycler_len: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        });
        debug!(thread_count, start_index, "starting job system");

        let core_ids = if config.pin_to_cores {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        for index in start_index..thread_count {
            let worker = Arc::clone(&system);
            let core_id = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[index % core_ids.len()])
            };
            let handle = thread::Builder::new()
                .name(format!("taskweave-worker-{index}"))
                .spawn(move || {
                    if let Some(core) = core_id {
                        core_affinity::set_for_current(core);
                    }
                    worker.worker_loop(index);
                })
                .expect("failed to spawn worker thread");
            system.handles.lock().unwrap().push(handle);
        }

        system
    }

    /// Lazily-constructed process-wide pool, sized to the hardware.
    ///
    /// Convenience facade; libraries that need explicit lifetimes should
    /// construct their own engine instead.
    pub fn instance() -> &'static Arc<JobSystem> {
        &INSTANCE
    }

    /// Number of workers in the pool.
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Enters the dispatch loop on the calling thread.
    ///
    /// Only valid for caller-owned worker slots, i.e. `index <
    /// start_index`. Returns once the system terminates.
    pub fn drive(&self, index: usize) {
        assert!(
            index < self.start_index,
            "drive() is reserved for caller-owned worker slots"
        );
        self.alive.fetch_add(1, Ordering::SeqCst);
        self.worker_loop(index);
    }

    // ----- dispatch loop ---------------------------------------------------

    fn worker_loop(&self, index: usize) {
        THREAD_INDEX.set(index as i32);
        self.entered.fetch_add(1, Ordering::SeqCst);
        while self.entered.load(Ordering::Acquire) < self.thread_count
            && !self.terminate.load(Ordering::Acquire)
        {
            thread::sleep(Duration::from_micros(1));
        }
        trace!(index, "worker entered dispatch loop");

        let mut idle_polls = 0usize;
        while !self.terminate.load(Ordering::Acquire) {
            let node = self.local_queues[index]
                .pop()
                .or_else(|| self.central_queue.pop());
            match node {
                Some(node) => {
                    idle_polls = 0;
                    unsafe { self.run_node(node) };
                }
                None => {
                    idle_polls += 1;
                    if idle_polls >= IDLE_POLLS_BEFORE_SLEEP && index != 0 {
                        thread::sleep(IDLE_SLEEP);
                    }
                }
            }
        }

        CURRENT_NODE.set(ptr::null_mut());
        THREAD_INDEX.set(-1);
        trace!(index, "worker exiting");
        if self.alive.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drain_queues();
        }
    }

    unsafe fn run_node(&self, node: NodePtr) {
        CURRENT_NODE.set(node.0);
        match (*node.0).kind {
            NodeKind::Job => self.run_job(node.0 as *mut Job),
            NodeKind::Task => self.resume_promise(node.0 as *mut Promise),
        }
        CURRENT_NODE.set(ptr::null_mut());
    }

    unsafe fn run_job(&self, job: *mut Job) {
        // The unconditional store is only sound while nothing has been
        // scheduled under this job yet; children may be added only from
        // inside the body.
        debug_assert_eq!(
            (*job).header.children.load(Ordering::Relaxed),
            0,
            "children were scheduled under a job before its body ran"
        );
        (*job).header.children.store(1, Ordering::Release);

        let body = (*job).body.take();
        debug_assert!(body.is_some(), "job scheduled without a body");
        if let Some(body) = body {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
                fatal_body_panic(payload);
            }
        }
        #[cfg(feature = "metrics")]
        crate::metrics::metrics().jobs_executed.fetch_add(1, Ordering::Relaxed);

        // Drop the job's own count; fires on_finished once all children are
        // also done.
        self.child_finished(NodePtr(job as *mut NodeHeader));
    }

    unsafe fn resume_promise(&self, promise: *mut Promise) {
        debug_assert_eq!(
            (*promise).state(),
            TaskState::Suspended,
            "resumed a task that was not suspended"
        );
        (*promise).set_state(TaskState::Running);
        #[cfg(feature = "metrics")]
        crate::metrics::metrics().tasks_resumed.fetch_add(1, Ordering::Relaxed);

        let engine = EngineRef(self as *const JobSystem);
        let step = {
            let coroutine = (*promise)
                .coroutine
                .as_mut()
                .expect("task promise lost its coroutine");
            match panic::catch_unwind(AssertUnwindSafe(|| coroutine.resume(engine))) {
                Ok(step) => step,
                Err(payload) => fatal_body_panic(payload),
            }
        };

        match step {
            CoroutineResult::Yield(action) => {
                (*promise).set_state(TaskState::Suspended);
                match action {
                    Suspend::Spawn(children) => {
                        for child in children {
                            self.schedule_node(child);
                        }
                    }
                    Suspend::Migrate => {
                        self.schedule_node(NodePtr(promise as *mut NodeHeader));
                    }
                    Suspend::Yield => {
                        self.notify_parent(promise as *mut NodeHeader);
                    }
                }
            }
            CoroutineResult::Return(()) => {
                (*promise).set_state(TaskState::Final);
                self.notify_parent(promise as *mut NodeHeader);
                // The scheduler is done with the promise; the holder's drop
                // is the other release party.
                Promise::release(promise);
            }
        }
    }

    // ----- completion protocol ---------------------------------------------

    unsafe fn notify_parent(&self, node: *mut NodeHeader) {
        let parent = (*node).parent;
        if !parent.is_null() {
            self.child_finished(NodePtr(parent));
        }
    }

    /// One child of `node` has finished. Fires the node's completion when
    /// the counter drops to zero: a job runs its finish step, a suspended
    /// task is rescheduled to resume past its await.
    pub(crate) unsafe fn child_finished(&self, node: NodePtr) {
        let header = node.0;
        match (*header).kind {
            NodeKind::Job => {
                if (*header).children.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.finish_job(header as *mut Job);
                }
            }
            NodeKind::Task => {
                if (*header).children.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.schedule_node(node);
                }
            }
        }
    }

    /// Runs once per job, when its subtree has fully completed: enqueue the
    /// continuation (which joins the same parent), then notify the parent,
    /// then recycle the storage.
    unsafe fn finish_job(&self, job: *mut Job) {
        let parent = (*job).header.parent;
        let continuation = (*job).continuation;
        (*job).continuation = ptr::null_mut();

        if !continuation.is_null() {
            (*continuation).header.parent = parent;
            if !parent.is_null() {
                (*parent).children.fetch_add(1, Ordering::AcqRel);
            }
            self.schedule_node(NodePtr(continuation as *mut NodeHeader));
        }
        if !parent.is_null() {
            self.child_finished(NodePtr(parent));
        }
        self.recycle_job(job);
    }

    unsafe fn recycle_job(&self, job: *mut Job) {
        (*job).reset();
        if self.recycler_len.fetch_add(1, Ordering::AcqRel) < RECYCLER_CAPACITY {
            self.recycler.push(NodePtr(job as *mut NodeHeader));
        } else {
            self.recycler_len.fetch_sub(1, Ordering::AcqRel);
            memory::free_node(job);
        }
    }

    fn allocate_job(&self) -> *mut Job {
        if let Some(node) = self.recycler.pop() {
            self.recycler_len.fetch_sub(1, Ordering::AcqRel);
            #[cfg(feature = "metrics")]
            crate::metrics::metrics().recycler_hits.fetch_add(1, Ordering::Relaxed);
            debug_assert_eq!(
                unsafe { (*node.0).children.load(Ordering::Relaxed) },
                0,
                "recycled job slot was not reset"
            );
            node.0 as *mut Job
        } else {
            #[cfg(feature = "metrics")]
            crate::metrics::metrics().recycler_misses.fetch_add(1, Ordering::Relaxed);
            memory::alloc_node(self.resource, Job::empty())
        }
    }

    /// Builds a job child of `parent` without touching any counter; the
    /// awaiter pre-adds the whole batch before anything is enqueued.
    pub(crate) fn make_child_job<F>(&self, f: F, parent: NodePtr) -> NodePtr
    where
        F: FnOnce() + Send + 'static,
    {
        let job = self.allocate_job();
        unsafe {
            (*job).body = Some(Box::new(f));
            (*job).header.parent = parent.0;
        }
        NodePtr(job as *mut NodeHeader)
    }

    // ----- scheduling ------------------------------------------------------

    /// Routes a node to its requested worker's inbox, or to the central
    /// queue when it has no affinity.
    pub(crate) fn schedule_node(&self, node: NodePtr) {
        let index = unsafe { (*node.0).thread_index };
        if index >= 0 && (index as usize) < self.thread_count {
            #[cfg(feature = "metrics")]
            crate::metrics::metrics().local_pushes.fetch_add(1, Ordering::Relaxed);
            self.local_queues[index as usize].push(node);
        } else {
            #[cfg(feature = "metrics")]
            crate::metrics::metrics().central_pushes.fetch_add(1, Ordering::Relaxed);
            self.central_queue.push(node);
        }
    }

    /// Schedules a callable as a job on any worker.
    ///
    /// When called from inside a running node, the new job becomes a child
    /// of that node, which then completes only after the job (and its own
    /// descendants) complete.
    pub fn run<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_job(f, -1, current_node());
    }

    /// Schedules a callable pinned to a specific worker's inbox.
    pub fn run_on<F>(&self, thread_index: i32, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_job(f, thread_index, current_node());
    }

    /// Schedules a callable under an explicit parent (`None` = top level).
    pub fn run_child_of<F>(&self, parent: Option<JobToken>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let parent = parent.map_or(ptr::null_mut(), |token| token.0 .0);
        self.spawn_job(f, -1, parent);
    }

    fn spawn_job<F>(&self, f: F, thread_index: i32, parent: *mut NodeHeader)
    where
        F: FnOnce() + Send + 'static,
    {
        let job = self.allocate_job();
        unsafe {
            (*job).body = Some(Box::new(f));
            (*job).header.thread_index = thread_index;
            (*job).header.parent = parent;
            // The parent must observe the increment before the child can
            // possibly finish.
            if !parent.is_null() {
                (*parent).children.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.schedule_node(NodePtr(job as *mut NodeHeader));
    }

    /// Schedules (or re-schedules, for a yielded task) a suspendable task.
    ///
    /// Called from inside a running node, the task becomes its child.
    pub fn schedule<T>(&self, task: &Task<T>) {
        self.schedule_task(task, current_node());
    }

    /// Schedules a task pinned to a specific worker.
    pub fn schedule_on<T>(&self, thread_index: i32, task: &Task<T>) {
        unsafe { (*task.promise).header.thread_index = thread_index };
        self.schedule_task(task, current_node());
    }

    /// Schedules a task under an explicit parent (`None` = top level).
    pub fn schedule_child_of<T>(&self, parent: Option<JobToken>, task: &Task<T>) {
        let parent = parent.map_or(ptr::null_mut(), |token| token.0 .0);
        self.schedule_task(task, parent);
    }

    /// Schedules a batch of tasks, pre-adding the whole batch to the
    /// current node's child count before any of them is enqueued.
    pub fn schedule_all<T>(&self, tasks: &[Task<T>]) {
        if tasks.is_empty() {
            return;
        }
        let parent = current_node();
        if !parent.is_null() {
            unsafe {
                (*parent)
                    .children
                    .fetch_add(tasks.len() as i32, Ordering::AcqRel);
            }
        }
        for task in tasks {
            unsafe { (*task.promise).header.parent = parent };
            task.registered.set(true);
            self.schedule_node(NodePtr(task.promise as *mut NodeHeader));
        }
    }

    fn schedule_task<T>(&self, task: &Task<T>, parent: *mut NodeHeader) {
        unsafe {
            (*task.promise).header.parent = parent;
            if !parent.is_null() {
                (*parent).children.fetch_add(1, Ordering::AcqRel);
            }
        }
        task.registered.set(true);
        self.schedule_node(NodePtr(task.promise as *mut NodeHeader));
    }

    /// Installs `f` as the continuation of the job currently running on
    /// this worker: it is enqueued after the job and all of its children
    /// complete, and before the job's parent is notified.
    ///
    /// Calling this outside a job body is a caller error.
    pub fn continuation<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let current = current_node();
        debug_assert!(
            !current.is_null(),
            "continuation() called outside a running node"
        );
        if current.is_null() {
            return;
        }
        unsafe {
            debug_assert_eq!(
                (*current).kind,
                NodeKind::Job,
                "continuations attach to plain jobs"
            );
            if (*current).kind != NodeKind::Job {
                return;
            }
            let job = current as *mut Job;
            debug_assert!(
                (*job).continuation.is_null(),
                "job already has a continuation"
            );
            let prior = (*job).continuation;
            if !prior.is_null() {
                self.recycle_job(prior);
            }
            let next = self.allocate_job();
            (*next).body = Some(Box::new(f));
            (*job).continuation = next;
        }
    }

    /// Token for the node currently being run on this worker, or `None`
    /// when called off-worker or between nodes.
    pub fn current_job(&self) -> Option<JobToken> {
        let node = current_node();
        if node.is_null() {
            None
        } else {
            Some(JobToken(NodePtr(node)))
        }
    }

    // ----- shutdown --------------------------------------------------------

    /// Signals every worker to exit its dispatch loop. In-flight nodes
    /// finish their current step; enqueued nodes are drained, not run.
    pub fn terminate(&self) {
        debug!("terminating job system");
        self.terminate.store(true, Ordering::Release);
    }

    /// Blocks until every worker has left the dispatch loop and all spawned
    /// worker threads have exited.
    pub fn wait_for_termination(&self) {
        let _ = self.join_workers();
    }

    /// [`JobSystem::terminate`] followed by [`JobSystem::wait_for_termination`],
    /// reporting workers that died abnormally.
    pub fn shutdown(&self) -> Result<(), String> {
        self.terminate();
        let failed = self.join_workers();
        if failed > 0 {
            Err(format!("{failed} worker thread(s) panicked"))
        } else {
            Ok(())
        }
    }

    fn join_workers(&self) -> usize {
        let mut backoff_us = 1u64;
        while self.alive.load(Ordering::Acquire) != 0 {
            thread::sleep(Duration::from_micros(backoff_us));
            backoff_us = (backoff_us * 2).min(1000);
        }

        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        let mut failed = 0;
        for handle in handles {
            if handle.join().is_err() {
                failed += 1;
            }
        }
        failed
    }

    /// Frees every node still sitting in a queue. Runs on the last worker
    /// out of the dispatch loop, when the pool is quiescent.
    fn drain_queues(&self) {
        let mut dropped = 0usize;
        for queue in &self.local_queues {
            dropped += queue.drain(|node| unsafe { drop_node(node) });
        }
        dropped += self.central_queue.drain(|node| unsafe { drop_node(node) });

        let recycled = self
            .recycler
            .drain(|node| unsafe { memory::free_node(node.0 as *mut Job) });
        self.recycler_len.store(0, Ordering::Release);
        debug!(dropped, recycled, "drained queues at shutdown");
    }
}

/// Frees a node abandoned in a queue at shutdown.
unsafe fn drop_node(node: NodePtr) {
    match (*node.0).kind {
        NodeKind::Job => memory::free_node(node.0 as *mut Job),
        // The holder may still be reading the result; let the two-party
        // protocol decide who frees.
        NodeKind::Task => Promise::release(node.0 as *mut Promise),
    }
}

/// A panic escaped a work body. The child counters may be inconsistent, so
/// there is no recovery path.
fn fatal_body_panic(payload: Box<dyn std::any::Any + Send>) -> ! {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    };
    eprintln!("taskweave: work body panicked: {message}");
    std::process::abort();
}
