//! Lockfree intrusive node queues.
//!
//! A single type covers the three queue roles in the scheduler: the central
//! shared queue and the recycled-job pool (`FIFO = false`, multi-producer
//! multi-consumer LIFO) and the per-worker inbox (`FIFO = true`,
//! multi-producer single-consumer FIFO). Internally both are a singly-linked
//! list threaded through the nodes' intrusive `next` pointers, with an
//! atomic head.

use crate::node::{NodeHeader, NodePtr};
use crossbeam::utils::Backoff;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Lockfree stack of intrusive nodes.
///
/// In LIFO mode any thread may push and pop. In FIFO mode any thread may
/// push but exactly one consumer may pop; the consumer walks to the oldest
/// element and detaches it, tolerating producers racing on the head.
pub(crate) struct JobQueue<const FIFO: bool> {
    head: AtomicPtr<NodeHeader>,
}

impl<const FIFO: bool> JobQueue<FIFO> {
    pub(crate) fn new() -> Self {
        JobQueue {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pushes a node. Safe from any thread.
    ///
    /// The node must not currently be in any queue; the queue owns its
    /// `next` link until the node is popped or drained.
    pub(crate) fn push(&self, node: NodePtr) {
        let backoff = Backoff::new();
        let node = node.0;
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => {
                    head = current;
                    backoff.spin();
                }
            }
        }
    }

    /// Pops a node, or returns `None` when the queue is empty.
    ///
    /// LIFO mode detaches the head with a CAS. Reused nodes can re-enter the
    /// queue, so the loop tolerates the head changing identity under it;
    /// popped nodes only return to circulation through the finish protocol,
    /// which is serialised per node.
    ///
    /// FIFO mode must only ever be called from the queue's single consumer.
    pub(crate) fn pop(&self) -> Option<NodePtr> {
        if FIFO {
            self.pop_oldest()
        } else {
            self.pop_head()
        }
    }

    fn pop_head(&self) -> Option<NodePtr> {
        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head.is_null() {
                return None;
            }
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(NodePtr(head)),
                Err(current) => {
                    head = current;
                    backoff.spin();
                }
            }
        }
    }

    fn pop_oldest(&self) -> Option<NodePtr> {
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            if next.is_null() {
                // Single element: race producers for the head itself.
                match self.head.compare_exchange(
                    head,
                    ptr::null_mut(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Some(NodePtr(head)),
                    Err(_) => {
                        // A producer pushed in front; the list now has a
                        // stable interior, re-walk from the new head.
                        backoff.spin();
                        continue;
                    }
                }
            }

            // Two or more elements: the tail cannot change under the single
            // consumer, and producers only touch the head. Walk to the tail
            // and detach it.
            let mut prev = head;
            let mut tail = next;
            loop {
                let after = unsafe { (*tail).next.load(Ordering::Acquire) };
                if after.is_null() {
                    break;
                }
                prev = tail;
                tail = after;
            }
            unsafe { (*prev).next.store(ptr::null_mut(), Ordering::Release) };
            return Some(NodePtr(tail));
        }
    }

    /// Detaches the whole list and hands each node to `f`, newest first.
    ///
    /// Only sound once the pool is quiescent; used by the shutdown drain.
    pub(crate) fn drain(&self, mut f: impl FnMut(NodePtr)) -> usize {
        let mut count = 0;
        let mut current = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        while !current.is_null() {
            let next = unsafe { (*current).next.load(Ordering::Relaxed) };
            f(NodePtr(current));
            current = next;
            count += 1;
        }
        count
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeKind;
    use std::collections::HashSet;
    use std::thread;

    fn make_node(id: i32) -> NodePtr {
        let mut header = NodeHeader::new(NodeKind::Job);
        header.id = id;
        NodePtr(Box::into_raw(Box::new(header)))
    }

    fn release_node(node: NodePtr) {
        unsafe { drop(Box::from_raw(node.0)) };
    }

    fn id_of(node: NodePtr) -> i32 {
        unsafe { (*node.0).id }
    }

    #[test]
    fn test_lifo_pop_order() {
        let queue: JobQueue<false> = JobQueue::new();
        for id in 0..4 {
            queue.push(make_node(id));
        }

        for expected in (0..4).rev() {
            let node = queue.pop().expect("queue should not be empty");
            assert_eq!(id_of(node), expected);
            release_node(node);
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_fifo_pop_order() {
        let queue: JobQueue<true> = JobQueue::new();
        for id in 0..4 {
            queue.push(make_node(id));
        }

        for expected in 0..4 {
            let node = queue.pop().expect("queue should not be empty");
            assert_eq!(id_of(node), expected);
            release_node(node);
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_fifo_interleaved_push_pop() {
        let queue: JobQueue<true> = JobQueue::new();
        queue.push(make_node(0));
        queue.push(make_node(1));

        let first = queue.pop().unwrap();
        assert_eq!(id_of(first), 0);
        queue.push(make_node(2));

        let second = queue.pop().unwrap();
        assert_eq!(id_of(second), 1);
        let third = queue.pop().unwrap();
        assert_eq!(id_of(third), 2);

        for node in [first, second, third] {
            release_node(node);
        }
    }

    #[test]
    fn test_drain_counts_and_empties() {
        let queue: JobQueue<false> = JobQueue::new();
        for id in 0..10 {
            queue.push(make_node(id));
        }

        let mut seen = 0;
        let drained = queue.drain(|node| {
            seen += 1;
            release_node(node);
        });
        assert_eq!(drained, 10);
        assert_eq!(seen, 10);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_producers_single_consumer() {
        const PRODUCERS: i32 = 4;
        const PER_PRODUCER: i32 = 1000;

        let queue: &'static JobQueue<true> = Box::leak(Box::new(JobQueue::new()));

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.push(make_node(p * PER_PRODUCER + i));
                    }
                })
            })
            .collect();

        let mut seen = HashSet::new();
        while seen.len() < (PRODUCERS * PER_PRODUCER) as usize {
            if let Some(node) = queue.pop() {
                assert!(seen.insert(id_of(node)), "node popped twice");
                release_node(node);
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_concurrent_lifo_popping() {
        const PRODUCERS: i32 = 4;
        const PER_PRODUCER: i32 = 500;

        let queue: &'static JobQueue<false> = Box::leak(Box::new(JobQueue::new()));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.push(make_node(p * PER_PRODUCER + i));
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                thread::spawn(move || {
                    let mut got = Vec::new();
                    for _ in 0..(PRODUCERS * PER_PRODUCER / 2) {
                        loop {
                            if let Some(node) = queue.pop() {
                                got.push(id_of(node));
                                release_node(node);
                                break;
                            }
                        }
                    }
                    got
                })
            })
            .collect();

        for handle in producers {
            handle.join().unwrap();
        }
        let mut all = Vec::new();
        for handle in consumers {
            all.extend(handle.join().unwrap());
        }
        all.sort_unstable();
        let expected: Vec<i32> = (0..PRODUCERS * PER_PRODUCER).collect();
        assert_eq!(all, expected);
    }
}
