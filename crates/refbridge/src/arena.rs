//! Chunked slot arena with stable addresses.
//!
//! Slots live in fixed-size chunks obtained from the [`Allocator`]. Chunks
//! are never moved or freed before the arena itself is dropped, so a slot
//! reference stays valid for the arena's lifetime and hot paths (refcount
//! updates) never take the free-list lock. Index 0 is never handed out; it
//! is reserved for null identities.

use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::alloc::Allocator;
use crate::error::Result;

struct FreeList {
    free: Vec<u32>,
    /// Next never-used index.
    next: u32,
}

pub(crate) struct ChunkedArena<T> {
    allocator: Arc<Allocator>,
    chunk_len: usize,
    chunks: RwLock<Vec<NonNull<T>>>,
    free: Mutex<FreeList>,
    /// Serializes growth. Never held together with `free`, so an
    /// out-of-memory hook that frees slots cannot deadlock.
    growth: Mutex<()>,
}

// SAFETY: slots are only reached through `&T`, and `T: Sync` makes shared
// access from several threads sound. Chunk pointers are owned by the arena.
unsafe impl<T: Send + Sync> Send for ChunkedArena<T> {}
unsafe impl<T: Send + Sync> Sync for ChunkedArena<T> {}

impl<T: Default> ChunkedArena<T> {
    pub(crate) fn new(allocator: Arc<Allocator>, chunk_len: usize) -> Self {
        assert!(
            align_of::<T>() <= sys_alloc::MIN_ALIGN,
            "arena slot alignment exceeds backend guarantee"
        );
        Self {
            allocator,
            chunk_len: chunk_len.max(1),
            chunks: RwLock::new(Vec::new()),
            free: Mutex::new(FreeList {
                free: Vec::new(),
                next: 1,
            }),
            growth: Mutex::new(()),
        }
    }

    fn chunk_bytes(&self) -> usize {
        self.chunk_len * size_of::<T>()
    }

    /// Hands out a free slot index, growing the arena if needed.
    ///
    /// The slot's contents are whatever its previous user left behind; the
    /// caller re-initializes it.
    pub(crate) fn alloc_slot(&self) -> Result<u32> {
        loop {
            {
                let mut free = self.free.lock();
                if let Some(index) = free.free.pop() {
                    return Ok(index);
                }
                let index = free.next;
                if (index as usize) < self.capacity() {
                    free.next += 1;
                    return Ok(index);
                }
            }

            // The allocator may run the collector's out-of-memory hook, which
            // may free slots; the next iteration picks those up first.
            let _growth = self.growth.lock();
            if self.free.lock().next as usize >= self.capacity() {
                self.grow()?;
            }
        }
    }

    fn capacity(&self) -> usize {
        self.chunks.read().len() * self.chunk_len
    }

    fn grow(&self) -> Result<()> {
        let bytes = self.chunk_bytes();
        let raw = self.allocator.allocate(bytes)?;
        let chunk = raw.cast::<T>();
        for i in 0..self.chunk_len {
            // SAFETY: `chunk` spans `chunk_len` properly aligned `T`s.
            unsafe { chunk.as_ptr().add(i).write(T::default()) };
        }
        self.chunks.write().push(chunk);
        Ok(())
    }

    /// Allocates the first chunk up front so backend exhaustion shows up at
    /// startup rather than on the first handle.
    pub(crate) fn prime(&self) -> Result<()> {
        let _growth = self.growth.lock();
        if self.chunks.read().is_empty() {
            self.grow()?;
        }
        Ok(())
    }

    /// Returns a slot index to the free list.
    pub(crate) fn free_slot(&self, index: u32) {
        debug_assert_ne!(index, 0, "slot 0 is never allocated");
        self.free.lock().free.push(index);
    }

    /// Returns the slot at `index`, or `None` if it was never allocated.
    pub(crate) fn get(&self, index: u32) -> Option<&T> {
        if index == 0 {
            return None;
        }
        let index = index as usize;
        let chunks = self.chunks.read();
        let chunk = chunks.get(index / self.chunk_len)?;
        // SAFETY: chunks stay allocated and initialized until `self` drops,
        // so the reference may outlive the read guard.
        Some(unsafe { &*chunk.as_ptr().add(index % self.chunk_len) })
    }

    /// Number of slots ever handed out (including freed ones).
    pub(crate) fn high_water(&self) -> u32 {
        self.free.lock().next - 1
    }

    /// Visits every slot that was ever handed out.
    pub(crate) fn for_each(&self, mut f: impl FnMut(u32, &T)) {
        let high = self.high_water();
        for index in 1..=high {
            if let Some(slot) = self.get(index) {
                f(index, slot);
            }
        }
    }
}

impl<T> Drop for ChunkedArena<T> {
    fn drop(&mut self) {
        let bytes = self.chunk_len * size_of::<T>();
        for chunk in self.chunks.get_mut().drain(..) {
            for i in 0..self.chunk_len {
                // SAFETY: every slot in a chunk was initialized in `grow`.
                unsafe { std::ptr::drop_in_place(chunk.as_ptr().add(i)) };
            }
            // SAFETY: the chunk was allocated from this allocator with `bytes`.
            unsafe { self.allocator.free(chunk.cast(), bytes) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::SystemBackend;
    use crate::error::BridgeError;
    use crate::test_util::ScriptedBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn arena(chunk_len: usize) -> ChunkedArena<AtomicUsize> {
        ChunkedArena::new(Arc::new(Allocator::new(Arc::new(SystemBackend))), chunk_len)
    }

    #[test]
    fn indices_start_at_one() {
        let arena = arena(4);
        assert_eq!(arena.alloc_slot().unwrap(), 1);
        assert_eq!(arena.alloc_slot().unwrap(), 2);
        assert!(arena.get(0).is_none());
    }

    #[test]
    fn grows_across_chunks() {
        let arena = arena(2);
        let indices: Vec<u32> = (0..7).map(|_| arena.alloc_slot().unwrap()).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5, 6, 7]);
        for &i in &indices {
            arena.get(i).unwrap().store(i as usize, Ordering::Relaxed);
        }
        for &i in &indices {
            assert_eq!(arena.get(i).unwrap().load(Ordering::Relaxed), i as usize);
        }
        assert_eq!(arena.high_water(), 7);
    }

    #[test]
    fn freed_slots_are_reused() {
        let arena = arena(8);
        let a = arena.alloc_slot().unwrap();
        let _b = arena.alloc_slot().unwrap();
        arena.free_slot(a);
        assert_eq!(arena.alloc_slot().unwrap(), a);
    }

    #[test]
    fn slot_addresses_are_stable_across_growth() {
        let arena = arena(1);
        let first = arena.alloc_slot().unwrap();
        let before: *const AtomicUsize = arena.get(first).unwrap();
        for _ in 0..32 {
            arena.alloc_slot().unwrap();
        }
        let after: *const AtomicUsize = arena.get(first).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn prime_allocates_once() {
        let arena = arena(4);
        arena.prime().unwrap();
        arena.prime().unwrap();
        assert_eq!(arena.chunks.read().len(), 1);
        assert_eq!(arena.alloc_slot().unwrap(), 1);
        assert_eq!(arena.chunks.read().len(), 1);
    }

    #[test]
    fn growth_failure_propagates() {
        let allocator = Arc::new(Allocator::new(Arc::new(ScriptedBackend::new([
            false, false,
        ]))));
        let arena: ChunkedArena<AtomicUsize> = ChunkedArena::new(allocator, 4);
        assert!(matches!(
            arena.alloc_slot(),
            Err(BridgeError::OutOfMemory { .. })
        ));
        // The failed attempt must not consume an index.
        assert_eq!(arena.high_water(), 0);
    }

    #[test]
    fn oom_hook_may_free_slots_during_growth() {
        let backend = Arc::new(ScriptedBackend::default());
        let allocator = Arc::new(Allocator::new(backend.clone()));
        let arena: Arc<ChunkedArena<AtomicUsize>> =
            Arc::new(ChunkedArena::new(Arc::clone(&allocator), 2));
        let first = arena.alloc_slot().unwrap();

        let hooked = Arc::downgrade(&arena);
        allocator.set_oom_hook(move |_| {
            if let Some(arena) = hooked.upgrade() {
                arena.free_slot(first);
            }
        });
        backend.push([false]);

        // Needs a second chunk; the hook frees `first` while growth runs.
        let second = arena.alloc_slot().unwrap();
        assert_eq!(second, first);
        assert_eq!(backend.attempts(), 3);
        assert_eq!(arena.alloc_slot().unwrap(), 2);
    }
}
