//! # taskweave - Structured Fiber/Job Scheduler
//!
//! A job scheduler with structured parent-child concurrency for game-loop
//! and simulation workloads: many short-lived units of work, organised into
//! trees, dispatched to a fixed pool of worker threads.
//!
//! Two kinds of work unit share the scheduler:
//!
//! - **Jobs**: plain callables that run to completion on a worker.
//! - **Tasks**: suspendable units (stackful coroutines) that can yield
//!   values, await children, and migrate between workers.
//!
//! A parent completes only after all of its descendants have completed.
//! Completion is tracked with intrusive atomic child counters rather than
//! blocking joins, so workers never wait on each other.
//!
//! ## Example
//!
//! ```no_run
//! use taskweave::{task, JobSystem};
//!
//! let system = JobSystem::new(4);
//!
//! let total = task(|scope| {
//!     let children: Vec<_> = (0..8).map(|i| task(move |_| i)).collect();
//!     scope.join(&children);
//!     children.iter().map(|c| c.get().unwrap_or(0)).sum::<i32>()
//! });
//!
//! system.schedule(&total);
//! while total.get().is_none() {
//!     std::thread::yield_now();
//! }
//! system.shutdown().expect("shutdown failed");
//! ```

pub mod job_system;
pub mod memory;
pub mod scope;
pub mod task;

mod job;
mod node;
mod queue;

#[cfg(feature = "metrics")]
pub mod metrics;

pub use job_system::{thread_index, JobSystem, JobSystemConfig, JobToken};
pub use memory::{system_resource, LinearResource, MemoryResource, SystemResource};
pub use scope::{Joinable, Scope};
pub use task::{task, Task};
