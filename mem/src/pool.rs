//! Fixed-capacity typed object pool
//!
//! One aligned slab is carved into blocks at construction; idle blocks are
//! threaded onto an embedded LIFO free list, so the pool itself stores no
//! bookkeeping per block. Exhaustion falls back to one-off system
//! allocations that are tracked for teardown and counted as jitter.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;

use tracing::debug;

/// A free-list node, stored directly in the idle block it describes.
struct FreeNode {
    next: *mut FreeNode,
}

/// Typed pool allocator. Not thread-safe; one pool per consumer thread.
pub struct Pool<T> {
    slab: NonNull<u8>,
    slab_layout: Layout,
    capacity: usize,
    free: *mut FreeNode,
    fallbacks: Vec<NonNull<u8>>,
    fallback_count: u64,
    _marker: PhantomData<T>,
}

// SAFETY: the pool owns every block it vends; moving it between threads is
// sound as long as the objects themselves are Send.
unsafe impl<T: Send> Send for Pool<T> {}

impl<T> Pool<T> {
    /// Block large enough for either a `T` or a free-list node.
    const BLOCK_SIZE: usize = {
        let t = size_of::<T>();
        let n = size_of::<FreeNode>();
        if t > n {
            t
        } else {
            n
        }
    };

    const BLOCK_ALIGN: usize = {
        let t = align_of::<T>();
        let n = align_of::<FreeNode>();
        if t > n {
            t
        } else {
            n
        }
    };

    /// Pre-allocate `count` blocks. Panics if `count` is zero or the slab
    /// cannot be allocated.
    #[must_use]
    pub fn new(count: usize) -> Self {
        assert!(count > 0, "pool capacity must be non-zero");
        let slab_layout = Layout::from_size_align(Self::BLOCK_SIZE * count, Self::BLOCK_ALIGN)
            .expect("pool layout overflow");

        // SAFETY: layout has non-zero size (count > 0, BLOCK_SIZE >= 8).
        let raw = unsafe { alloc(slab_layout) };
        let Some(slab) = NonNull::new(raw) else {
            handle_alloc_error(slab_layout)
        };

        let mut pool = Self {
            slab,
            slab_layout,
            capacity: count,
            free: std::ptr::null_mut(),
            fallbacks: Vec::new(),
            fallback_count: 0,
            _marker: PhantomData,
        };
        for i in 0..count {
            // SAFETY: i * BLOCK_SIZE stays within the slab allocation.
            unsafe { pool.push(slab.as_ptr().add(i * Self::BLOCK_SIZE)) };
        }
        pool
    }

    /// Move `value` into a pool block and return a pointer to it.
    ///
    /// Pops the free-list head; when the pre-allocated slab is exhausted,
    /// performs one aligned system allocation. That path is the jitter
    /// event: it is tracked for teardown and visible via
    /// [`Pool::fallback_count`].
    pub fn allocate(&mut self, value: T) -> NonNull<T> {
        let block = if self.free.is_null() {
            self.allocate_fallback()
        } else {
            let node = self.free;
            // SAFETY: non-null head was pushed by us and points at an idle block.
            self.free = unsafe { (*node).next };
            node.cast::<u8>()
        };

        // SAFETY: block is BLOCK_SIZE bytes, aligned for T, and exclusively ours.
        unsafe {
            let typed = block.cast::<T>();
            typed.write(value);
            NonNull::new_unchecked(typed)
        }
    }

    /// Drop the object in place and return its block to the free list.
    ///
    /// # Safety
    /// `ptr` must have come from [`Pool::allocate`] on this pool and must
    /// not have been freed already.
    pub unsafe fn free(&mut self, ptr: NonNull<T>) {
        // SAFETY: caller guarantees the pointer is live and ours.
        unsafe {
            ptr.as_ptr().drop_in_place();
            self.push(ptr.as_ptr().cast::<u8>());
        }
    }

    /// Number of pre-allocated blocks.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// How many times the pool fell back to the system allocator.
    #[must_use]
    pub fn fallback_count(&self) -> u64 {
        self.fallback_count
    }

    fn allocate_fallback(&mut self) -> *mut u8 {
        let layout = Self::block_layout();
        // SAFETY: BLOCK_SIZE is non-zero.
        let raw = unsafe { alloc(layout) };
        let Some(block) = NonNull::new(raw) else {
            handle_alloc_error(layout)
        };
        self.fallbacks.push(block);
        self.fallback_count += 1;
        if self.fallback_count == 1 {
            debug!(
                capacity = self.capacity,
                "pool exhausted, falling back to system allocation"
            );
        }
        block.as_ptr()
    }

    /// # Safety
    /// `block` must be an idle BLOCK_SIZE-byte block owned by this pool.
    unsafe fn push(&mut self, block: *mut u8) {
        let node = block.cast::<FreeNode>();
        // SAFETY: blocks are aligned for FreeNode and no T lives there.
        unsafe { (*node).next = self.free };
        self.free = node;
    }

    fn block_layout() -> Layout {
        // Unwrap is fine: the same layout was validated in new().
        Layout::from_size_align(Self::BLOCK_SIZE, Self::BLOCK_ALIGN).expect("pool block layout")
    }
}

impl<T> Drop for Pool<T> {
    /// Releases the slab and every fallback block.
    ///
    /// Objects still outstanding at teardown are a caller bug: their
    /// destructors do not run and their blocks are reclaimed anyway.
    fn drop(&mut self) {
        let layout = Self::block_layout();
        for block in self.fallbacks.drain(..) {
            // SAFETY: each fallback block was allocated with this layout.
            unsafe { dealloc(block.as_ptr(), layout) };
        }
        // SAFETY: the slab was allocated with slab_layout in new().
        unsafe { dealloc(self.slab.as_ptr(), self.slab_layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn allocate_and_free_reuses_blocks_lifo() {
        let mut pool: Pool<u64> = Pool::new(4);
        let a = pool.allocate(1);
        let b = pool.allocate(2);
        // SAFETY: both pointers came from this pool.
        unsafe {
            pool.free(a);
            pool.free(b);
        }
        // LIFO free list hands back b's block first.
        let c = pool.allocate(3);
        assert_eq!(c, b.cast());
        let d = pool.allocate(4);
        assert_eq!(d, a.cast());
        unsafe {
            pool.free(c);
            pool.free(d);
        }
    }

    #[test]
    fn exhaustion_falls_back_and_counts_jitter() {
        let mut pool: Pool<[u8; 64]> = Pool::new(2);
        let a = pool.allocate([0; 64]);
        let b = pool.allocate([1; 64]);
        assert_eq!(pool.fallback_count(), 0);
        let c = pool.allocate([2; 64]);
        assert_eq!(pool.fallback_count(), 1);
        unsafe {
            pool.free(a);
            pool.free(b);
            pool.free(c);
        }
        // Freed fallback blocks rejoin the free list and are reused.
        let d = pool.allocate([3; 64]);
        assert_eq!(d, c.cast());
        assert_eq!(pool.fallback_count(), 1);
        unsafe { pool.free(d) };
    }

    #[test]
    fn free_runs_destructors() {
        thread_local! {
            static DROPS: Cell<u32> = const { Cell::new(0) };
        }
        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.with(|d| d.set(d.get() + 1));
            }
        }

        let mut pool: Pool<Tracked> = Pool::new(1);
        let obj = pool.allocate(Tracked);
        assert_eq!(DROPS.with(Cell::get), 0);
        unsafe { pool.free(obj) };
        assert_eq!(DROPS.with(Cell::get), 1);
        drop(pool);
        // Teardown never re-runs destructors for already-freed blocks.
        assert_eq!(DROPS.with(Cell::get), 1);
    }

    #[test]
    fn values_survive_round_trip() {
        let mut pool: Pool<(u64, u64)> = Pool::new(8);
        let mut ptrs = Vec::new();
        for i in 0..8u64 {
            ptrs.push(pool.allocate((i, i * 3)));
        }
        for (i, p) in ptrs.iter().enumerate() {
            // SAFETY: blocks are live until freed below.
            let v = unsafe { *p.as_ref() };
            assert_eq!(v, (i as u64, i as u64 * 3));
        }
        for p in ptrs {
            unsafe { pool.free(p) };
        }
    }
}
