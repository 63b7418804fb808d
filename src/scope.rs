//! Suspension points available inside a task body.
//!
//! The body of a [`crate::Task`] receives a [`Scope`]: the handle through
//! which it awaits children, migrates between workers, and yields values.
//! Each operation is an awaiter with the same three-phase shape: decide
//! whether to suspend at all, describe what the worker must do once the
//! suspension is visible, and resume with the slot cleared.
//!
//! Worker-side actions are deferred on purpose: scheduling a child or
//! re-enqueuing the promise before the coroutine has actually suspended
//! would let another worker resume it while it is still running.

use crate::job_system::{self, EngineRef, JobSystem};
use crate::node::NodePtr;
use crate::task::{ResultSlot, Task};
use corosensei::Yielder;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Action a suspending task hands to the worker driving it.
///
/// The worker performs it after `Coroutine::resume` has returned, i.e. once
/// the suspension point is fully established.
pub(crate) enum Suspend {
    /// Enqueue these children; their parent link and the awaiting promise's
    /// child count were already set up body-side.
    Spawn(Vec<NodePtr>),
    /// Re-enqueue the suspended promise itself; its `thread_index` was
    /// already retargeted. The promise is its own in-flight marker, so no
    /// counter changes.
    Migrate,
    /// A value was stored in the result slot; notify the parent as if a
    /// child had finished.
    Yield,
}

/// In-body handle for a running task.
pub struct Scope<'y, T> {
    yielder: &'y Yielder<EngineRef, Suspend>,
    promise: NodePtr,
    engine: EngineRef,
    slot: Arc<ResultSlot<T>>,
}

impl<'y, T> Scope<'y, T> {
    pub(crate) fn new(
        yielder: &'y Yielder<EngineRef, Suspend>,
        promise: NodePtr,
        engine: EngineRef,
        slot: Arc<ResultSlot<T>>,
    ) -> Self {
        Scope {
            yielder,
            promise,
            engine,
            slot,
        }
    }

    /// The job system driving this task.
    pub fn system(&self) -> &JobSystem {
        unsafe { &*self.engine.0 }
    }

    /// Index of the worker currently running this task.
    pub fn thread_index(&self) -> i32 {
        job_system::thread_index()
    }

    /// Awaits the completion of `children`: a `&Task`, a slice or `Vec` of
    /// tasks, or a tuple of those (up to arity four).
    ///
    /// An empty collection completes immediately without suspending.
    /// Otherwise the total child count is added to this task's counter
    /// before any child is enqueued, so a fast child cannot complete the
    /// await while its siblings are still being handed out. After resuming,
    /// each child's value is readable through [`Task::get`].
    pub fn join<J: Joinable>(&mut self, children: J) {
        let count = children.child_count();
        if count == 0 {
            return;
        }
        let mut nodes = Vec::with_capacity(count);
        children.collect(self.promise, &mut nodes);
        unsafe {
            (*self.promise.0)
                .children
                .fetch_add(count as i32, Ordering::AcqRel);
        }
        self.suspend(Suspend::Spawn(nodes));
    }

    /// Awaits a single callable child, run as a job under this task.
    pub fn join_fn<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let engine = self.engine;
        let system = unsafe { &*engine.0 };
        let job = system.make_child_job(f, self.promise);
        unsafe {
            (*self.promise.0).children.fetch_add(1, Ordering::AcqRel);
        }
        self.suspend(Suspend::Spawn(vec![job]));
    }

    /// Awaits a batch of callable children.
    pub fn join_fns<F>(&mut self, fs: Vec<F>)
    where
        F: FnOnce() + Send + 'static,
    {
        if fs.is_empty() {
            return;
        }
        let engine = self.engine;
        let system = unsafe { &*engine.0 };
        let promise = self.promise;
        let count = fs.len();
        let mut nodes = Vec::with_capacity(count);
        for f in fs {
            nodes.push(system.make_child_job(f, promise));
        }
        unsafe {
            (*promise.0).children.fetch_add(count as i32, Ordering::AcqRel);
        }
        self.suspend(Suspend::Spawn(nodes));
    }

    /// Moves this task to the given worker.
    ///
    /// Completes immediately when already running there; out-of-range
    /// indices are ignored. Otherwise the task suspends, is re-enqueued on
    /// the target worker's inbox, and resumes on that worker. The pin
    /// persists for subsequent re-schedules.
    pub fn migrate_to(&mut self, worker: usize) {
        let system = unsafe { &*self.engine.0 };
        if worker >= system.thread_count() {
            debug_assert!(false, "migrate_to({worker}) exceeds the worker count");
            return;
        }
        if job_system::thread_index() == worker as i32 {
            return;
        }
        unsafe { (*self.promise.0).thread_index = worker as i32 };
        self.suspend(Suspend::Migrate);
    }

    /// Publishes `value` in the result slot and notifies the parent, as if
    /// this task had finished.
    ///
    /// The task stays suspended at the yield point; scheduling it again
    /// resumes it there with the slot cleared. Only the parent notification
    /// orders the suspension, so re-schedule from the parent's resumed
    /// await (or its continuation), not from a thread that merely observed
    /// the value appear.
    pub fn yield_value(&mut self, value: T) {
        self.slot.put(value);
        self.suspend(Suspend::Yield);
    }

    fn suspend(&mut self, action: Suspend) {
        self.engine = self.yielder.suspend(action);
        // Resumed: empty the slot before re-entering the body.
        self.slot.clear();
    }
}

/// A set of child tasks that can be awaited with [`Scope::join`].
///
/// Implemented for `&Task`, slices and `Vec`s of tasks, and tuples of those.
pub trait Joinable {
    /// Total number of children in the set.
    #[doc(hidden)]
    fn child_count(&self) -> usize;

    /// Links every child to `parent` and appends its node to `out`. Does not
    /// enqueue anything; the caller owns the counter protocol.
    #[doc(hidden)]
    fn collect(&self, parent: NodePtr, out: &mut Vec<NodePtr>);
}

impl<T> Joinable for Task<T> {
    fn child_count(&self) -> usize {
        1
    }

    fn collect(&self, parent: NodePtr, out: &mut Vec<NodePtr>) {
        unsafe { (*self.promise).header.parent = parent.0 };
        self.registered.set(true);
        out.push(NodePtr(self.promise as *mut crate::node::NodeHeader));
    }
}

impl<J: Joinable + ?Sized> Joinable for &J {
    fn child_count(&self) -> usize {
        (**self).child_count()
    }

    fn collect(&self, parent: NodePtr, out: &mut Vec<NodePtr>) {
        (**self).collect(parent, out)
    }
}

impl<T> Joinable for [Task<T>] {
    fn child_count(&self) -> usize {
        self.len()
    }

    fn collect(&self, parent: NodePtr, out: &mut Vec<NodePtr>) {
        for child in self {
            child.collect(parent, out);
        }
    }
}

impl<T> Joinable for Vec<Task<T>> {
    fn child_count(&self) -> usize {
        self.len()
    }

    fn collect(&self, parent: NodePtr, out: &mut Vec<NodePtr>) {
        self.as_slice().collect(parent, out)
    }
}

macro_rules! joinable_tuple {
    ($($name:ident),+) => {
        impl<$($name: Joinable),+> Joinable for ($($name,)+) {
            fn child_count(&self) -> usize {
                #[allow(non_snake_case)]
                let ($($name,)+) = self;
                0 $(+ $name.child_count())+
            }

            fn collect(&self, parent: NodePtr, out: &mut Vec<NodePtr>) {
                #[allow(non_snake_case)]
                let ($($name,)+) = self;
                $($name.collect(parent, out);)+
            }
        }
    };
}

joinable_tuple!(A);
joinable_tuple!(A, B);
joinable_tuple!(A, B, C);
joinable_tuple!(A, B, C, D);
