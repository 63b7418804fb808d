//! Suspendable tasks and their promises.
//!
//! A task is a coroutine-like computation producing an optional value. The
//! externally held [`Task`] is an accessor, much like a future, that reads
//! the promised value without blocking; the hidden [`Promise`] is the
//! schedulable node that carries the coroutine between workers.
//!
//! Uses `corosensei` stackful coroutines for suspension: the body runs on
//! its own stack and each suspension point hands a [`Suspend`] action out to
//! the worker that is driving it.

use crate::job_system::EngineRef;
use crate::memory::{self, MemoryResource};
use crate::node::{NodeHeader, NodeKind, NodePtr};
use crate::scope::{Scope, Suspend};
use corosensei::Coroutine;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Lifecycle of a promise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum TaskState {
    /// Created, yielded, or awaiting; resumable.
    Suspended = 0,
    /// A worker is inside the body.
    Running = 1,
    /// The body returned; the result is stable.
    Final = 2,
    /// Storage is about to be returned to its memory resource.
    Destroyed = 3,
}

/// Shared result slot between a promise's body and its external holder.
///
/// Written by `yield_value` and by the body's return, cleared each time the
/// body resumes past a suspension point. Readable at any time; the
/// completion protocol provides the happens-before edge that makes the read
/// meaningful after an await resumes.
pub(crate) struct ResultSlot<T> {
    value: Mutex<Option<T>>,
}

impl<T> ResultSlot<T> {
    pub(crate) fn new() -> Self {
        ResultSlot {
            value: Mutex::new(None),
        }
    }

    pub(crate) fn put(&self, value: T) {
        *self.value.lock().unwrap() = Some(value);
    }

    pub(crate) fn clear(&self) {
        *self.value.lock().unwrap() = None;
    }

    pub(crate) fn take(&self) -> Option<T> {
        self.value.lock().unwrap().take()
    }

    pub(crate) fn get(&self) -> Option<T>
    where
        T: Clone,
    {
        self.value.lock().unwrap().clone()
    }
}

/// The stateful record behind a task: node header, coroutine, lifecycle
/// state, and the destruction flag shared with the external holder.
#[repr(C)]
pub(crate) struct Promise {
    pub(crate) header: NodeHeader,
    pub(crate) coroutine: Option<Coroutine<EngineRef, Suspend, ()>>,
    state: AtomicU8,
    /// Two-party destruction flag: one party is the holder's `Drop`, the
    /// other is the scheduler finishing with the promise (final step or
    /// shutdown drain). Whoever arrives second destroys the promise.
    released: AtomicBool,
}

// SAFETY: the promise migrates between workers through the queues; at most
// one thread resumes the coroutine at a time, and the holder only touches
// the atomic release flag.
unsafe impl Send for Promise {}
unsafe impl Sync for Promise {}

impl Promise {
    pub(crate) fn new() -> Self {
        Promise {
            header: NodeHeader::new(NodeKind::Task),
            coroutine: None,
            state: AtomicU8::new(TaskState::Suspended as u8),
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        match self.state.load(Ordering::Acquire) {
            0 => TaskState::Suspended,
            1 => TaskState::Running,
            2 => TaskState::Final,
            _ => TaskState::Destroyed,
        }
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// One party letting go of the promise. The second caller destroys it.
    pub(crate) unsafe fn release(promise: *mut Promise) {
        if (*promise).released.swap(true, Ordering::AcqRel) {
            (*promise).set_state(TaskState::Destroyed);
            memory::free_node(promise);
        }
    }
}

/// Creates a suspendable task from a body, using the system memory resource.
///
/// The body receives a [`Scope`] exposing the suspension points: awaiting
/// children, migrating to a worker, and yielding intermediate values. The
/// task does not run until it is handed to [`crate::JobSystem::schedule`].
pub fn task<T, F>(body: F) -> Task<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Scope<'_, T>) -> T + Send + 'static,
{
    Task::with_resource(memory::system_resource(), body)
}

/// External accessor for a suspendable computation.
///
/// Holds a shared view of the result slot; [`Task::get`] reads the latest
/// yielded or returned value without blocking. Dropping the holder detaches
/// it: the promise destroys itself once the scheduler is also done with it.
pub struct Task<T> {
    pub(crate) promise: *mut Promise,
    pub(crate) slot: Arc<ResultSlot<T>>,
    /// Whether the scheduler ever saw the promise. An unregistered promise
    /// is owned solely by this handle and freed on drop.
    pub(crate) registered: Cell<bool>,
}

// SAFETY: the raw promise pointer is only used under the two-party release
// protocol; the result slot is internally synchronised.
unsafe impl<T: Send> Send for Task<T> {}

impl<T: Send + 'static> Task<T> {
    /// Creates a task whose promise is allocated through `resource`.
    ///
    /// The resource reference is stamped behind the promise allocation, so
    /// whichever thread destroys the promise can return the storage without
    /// consulting a registry.
    pub fn with_resource<F>(resource: &'static dyn MemoryResource, body: F) -> Self
    where
        F: FnOnce(&mut Scope<'_, T>) -> T + Send + 'static,
    {
        let slot = Arc::new(ResultSlot::new());
        let promise = memory::alloc_node(resource, Promise::new());
        let handle = NodePtr(promise as *mut NodeHeader);

        let body_slot = Arc::clone(&slot);
        let coroutine = Coroutine::new(move |yielder, engine: EngineRef| {
            let mut scope = Scope::new(yielder, handle, engine, Arc::clone(&body_slot));
            let value = body(&mut scope);
            body_slot.put(value);
        });
        unsafe { (*promise).coroutine = Some(coroutine) };

        Task {
            promise,
            slot,
            registered: Cell::new(false),
        }
    }

    /// Requests that the task run on a specific worker (`< 0` = any).
    pub fn on_thread(self, thread_index: i32) -> Self {
        unsafe { (*self.promise).header.thread_index = thread_index };
        self
    }

    /// Attaches a caller-defined type tag, carried for diagnostics.
    pub fn with_type(self, type_id: i32) -> Self {
        unsafe { (*self.promise).header.type_id = type_id };
        self
    }

    /// Attaches a caller-defined id, carried for diagnostics.
    pub fn with_id(self, id: i32) -> Self {
        unsafe { (*self.promise).header.id = id };
        self
    }

    /// The worker this task is pinned to, or `-1`.
    pub fn thread_index(&self) -> i32 {
        unsafe { (*self.promise).header.thread_index }
    }

    /// Caller-defined type tag.
    pub fn type_id(&self) -> i32 {
        unsafe { (*self.promise).header.type_id }
    }

    /// Caller-defined id.
    pub fn id(&self) -> i32 {
        unsafe { (*self.promise).header.id }
    }

    /// Non-blocking read of the latest yielded or returned value.
    ///
    /// Returns `None` while the body has not produced a value since its last
    /// resumption; this is a normal state, not an error.
    pub fn get(&self) -> Option<T>
    where
        T: Clone,
    {
        self.slot.get()
    }

    /// Non-blocking read that moves the value out of the slot.
    pub fn take(&self) -> Option<T> {
        self.slot.take()
    }

    /// True once the body has returned.
    pub fn is_finished(&self) -> bool {
        unsafe { (*self.promise).state() == TaskState::Final }
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        unsafe {
            if self.registered.get() {
                Promise::release(self.promise);
            } else {
                // Never scheduled: this handle is the sole owner.
                memory::free_node(self.promise);
            }
        }
    }
}
