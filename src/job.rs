//! Run-to-completion job nodes.
//!
//! A job owns a boxed callable, an optional continuation link, and the
//! shared node header. Jobs are pooled: on completion their storage goes
//! back to the recycler and is reused for the next schedule call.

use crate::node::{NodeHeader, NodeKind};
use std::ptr;
use std::sync::atomic::Ordering;

/// A schedulable callable unit.
///
/// Owned exclusively by the scheduler; user code only ever sees the closure
/// it hands to [`crate::JobSystem::run`] and friends.
#[repr(C)]
pub(crate) struct Job {
    pub(crate) header: NodeHeader,
    /// Taken exactly once, when the worker runs the job.
    pub(crate) body: Option<Box<dyn FnOnce() + Send + 'static>>,
    /// Job to schedule after this job and all of its children complete.
    /// Inherits this job's parent when it is enqueued.
    pub(crate) continuation: *mut Job,
}

// SAFETY: a job is mutated by one thread at a time: the scheduling thread
// hands it over through a queue, and the finish protocol serialises the
// completion path per node.
unsafe impl Send for Job {}
unsafe impl Sync for Job {}

impl Job {
    /// An empty slot, ready for a body to be installed.
    pub(crate) fn empty() -> Self {
        Job {
            header: NodeHeader::new(NodeKind::Job),
            body: None,
            continuation: ptr::null_mut(),
        }
    }

    /// Clears all per-run state before the slot re-enters the recycler.
    /// The queue link is not reset here; pushing overwrites it.
    pub(crate) fn reset(&mut self) {
        self.header.children.store(0, Ordering::Release);
        self.header.parent = ptr::null_mut();
        self.header.thread_index = -1;
        self.header.type_id = -1;
        self.header.id = -1;
        self.body = None;
        self.continuation = ptr::null_mut();
    }
}
