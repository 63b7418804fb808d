//! Pluggable memory resources for node storage.
//!
//! Jobs and task promises are allocated through a [`MemoryResource`] rather
//! than directly through the global allocator, so callers can supply arena
//! allocators for bounded lifetimes. Each allocation reserves room for a
//! trailing copy of the resource reference and stamps it after the node;
//! deallocation recovers the resource by the same offset arithmetic, which
//! removes any need for a process-wide allocator registry.

use std::alloc::{alloc, dealloc, Layout};
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Shared reference to a memory resource, stamped after every node.
pub type ResourceRef = &'static dyn MemoryResource;

/// An `allocate`/`deallocate` pair used by every heap-owning component.
///
/// Implementations must be thread-safe: nodes are allocated on whichever
/// thread schedules them and freed on whichever worker finishes them.
pub trait MemoryResource: Send + Sync {
    /// Allocates storage for `layout`, or returns null on exhaustion.
    ///
    /// The scheduler has no recovery path for a failed node allocation and
    /// aborts the process when this returns null.
    fn allocate(&self, layout: Layout) -> *mut u8;

    /// Returns storage previously obtained from [`MemoryResource::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on the same resource with
    /// the same `layout`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: *mut u8, layout: Layout);
}

/// Pass-through to the global allocator. The default resource.
pub struct SystemResource;

impl MemoryResource for SystemResource {
    fn allocate(&self, layout: Layout) -> *mut u8 {
        unsafe { alloc(layout) }
    }

    unsafe fn deallocate(&self, ptr: *mut u8, layout: Layout) {
        dealloc(ptr, layout);
    }
}

/// Returns the process-wide default [`SystemResource`].
pub fn system_resource() -> &'static SystemResource {
    static SYSTEM: SystemResource = SystemResource;
    &SYSTEM
}

/// A fixed-capacity bump arena.
///
/// Allocation advances an atomic cursor; deallocation is a no-op and the
/// whole block is released when the arena is dropped. Suited to promise
/// storage with a bounded lifetime, e.g. one arena per frame.
pub struct LinearResource {
    base: NonNull<u8>,
    capacity: usize,
    cursor: AtomicUsize,
}

const ARENA_ALIGN: usize = 16;

impl LinearResource {
    /// Creates an arena with the given capacity in bytes.
    ///
    /// # Panics
    ///
    /// Panics if the backing allocation fails.
    pub fn new(capacity: usize) -> Self {
        let layout = Layout::from_size_align(capacity, ARENA_ALIGN)
            .expect("invalid arena capacity");
        let ptr = unsafe { alloc(layout) };
        LinearResource {
            base: NonNull::new(ptr).expect("failed to allocate arena backing memory"),
            capacity,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Bytes handed out so far, including alignment padding.
    pub fn used_bytes(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Rewinds the cursor, reclaiming the whole arena at once.
    ///
    /// # Safety
    ///
    /// Invalidates every allocation handed out so far; the caller must
    /// ensure no live node still uses arena storage.
    pub unsafe fn reset(&self) {
        self.cursor.store(0, Ordering::Release);
    }
}

impl MemoryResource for LinearResource {
    fn allocate(&self, layout: Layout) -> *mut u8 {
        let base = self.base.as_ptr() as usize;
        let mut cursor = self.cursor.load(Ordering::Relaxed);
        loop {
            let start = (base + cursor + layout.align() - 1) & !(layout.align() - 1);
            let end = start - base + layout.size();
            if end > self.capacity {
                return ptr::null_mut();
            }
            match self
                .cursor
                .compare_exchange_weak(cursor, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return start as *mut u8,
                Err(current) => cursor = current,
            }
        }
    }

    unsafe fn deallocate(&self, _ptr: *mut u8, _layout: Layout) {}
}

impl Drop for LinearResource {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.capacity, ARENA_ALIGN).unwrap();
        unsafe { dealloc(self.base.as_ptr(), layout) };
    }
}

// SAFETY: the arena hands out disjoint ranges through an atomic cursor.
unsafe impl Send for LinearResource {}
unsafe impl Sync for LinearResource {}

/// Byte offset of the resource stamp behind a node of type `T`.
fn stamp_offset<T>() -> usize {
    let align = mem::align_of::<ResourceRef>();
    (mem::size_of::<T>() + align - 1) & !(align - 1)
}

fn node_layout<T>() -> Layout {
    let size = stamp_offset::<T>() + mem::size_of::<ResourceRef>();
    let align = mem::align_of::<T>().max(mem::align_of::<ResourceRef>());
    Layout::from_size_align(size, align).expect("invalid node layout")
}

/// Allocates a node through `resource` and stamps the resource after it.
pub(crate) fn alloc_node<T>(resource: ResourceRef, value: T) -> *mut T {
    let ptr = resource.allocate(node_layout::<T>());
    if ptr.is_null() {
        eprintln!(
            "taskweave: memory resource failed to allocate {} bytes",
            node_layout::<T>().size()
        );
        std::process::abort();
    }
    unsafe {
        ptr.cast::<T>().write(value);
        ptr.add(stamp_offset::<T>()).cast::<ResourceRef>().write(resource);
    }
    ptr.cast()
}

/// Drops the node in place and returns its storage to the stamped resource.
///
/// # Safety
///
/// `ptr` must come from [`alloc_node`] with the same `T` and must not be
/// used afterwards.
pub(crate) unsafe fn free_node<T>(ptr: *mut T) {
    let resource: ResourceRef = ptr.cast::<u8>().add(stamp_offset::<T>()).cast::<ResourceRef>().read();
    ptr::drop_in_place(ptr);
    resource.deallocate(ptr.cast(), node_layout::<T>());
}
