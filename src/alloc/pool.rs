//! A pool: one fixed-address mapping serving a single call site.
//!
//! ```plaintext
//! pool_base(tag)
//! +-------------+-------+-------+-----+-----------------+-------+
//! | PoolHeader  | entry | chunk | ... | chunk           | fence |
//! +-------------+-------+-------+-----+-----------------+-------+
//! ^             ^                                       ^
//! base          base + POOL_OVERHEAD                    entry + capacity
//! ```
//!
//! The entry chunk is created already in use for the request that caused the
//! pool to exist. The fence is a permanently in-use, zero-sized chunk, so
//! coalescing forward stops there without a bounds check. The entry chunk's
//! `PREV_IN_USE` bit is always set for the same reason in the other
//! direction.

use std::{
    iter,
    mem::size_of,
    ptr::{self, NonNull},
};

use super::chunk::{ChunkPtr, CHUNK_ALIGNMENT, CHUNK_OVERHEAD, MIN_CHUNK_SIZE};
use crate::{
    error::{CorruptionKind, PoolError},
    os::mem::PoolRegion,
    sync::{RawMutex, RawMutexGuard},
    tag::{get_pool_tag, pool_base, Tag},
    util::num::{align_down, align_up, is_aligned},
};

#[repr(C)]
struct PoolHeader {
    /// Mapped size of the whole pool, header included
    size: usize,
    free_list: Option<ChunkPtr>,
    entry: ChunkPtr,
    fence: ChunkPtr,
    call_site: Tag,
    lock: RawMutex,
}

/// Bytes reserved for the pool header in front of the entry chunk
pub const POOL_OVERHEAD: usize = match align_up(size_of::<PoolHeader>(), CHUNK_ALIGNMENT) {
    Some(n) => n,
    None => panic!("pool header too large"),
};

/// Bytes reserved for the fence. Large enough for a whole chunk header so
/// that every `ChunkPtr` accessor stays inside the mapping.
const FENCE_SIZE: usize = MIN_CHUNK_SIZE;

/// Pools are never smaller than this
pub const MIN_POOL_SIZE: usize = 1 << 16;

/// What a walk over a pool's chunks found
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Bytes between the entry chunk and the fence
    pub capacity: usize,
    pub in_use_bytes: usize,
    pub free_bytes: usize,
    pub in_use_chunks: usize,
    pub free_chunks: usize,
    pub largest_free_chunk: usize,
}

/// A handle to a live pool. `Copy`, since a pool outlives every handle to it
/// (pools are only unmapped when their heap goes away).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Pool {
    header: NonNull<PoolHeader>,
}

impl Pool {
    /// Bytes available for chunks in a pool mapped with `pool_size` bytes
    pub const fn capacity_for(pool_size: usize) -> usize {
        align_down(
            pool_size.saturating_sub(POOL_OVERHEAD + FENCE_SIZE),
            CHUNK_ALIGNMENT,
        )
    }

    /// Lay out a fresh pool in `region` and carve the entry chunk for a
    /// `request` byte chunk out of it.
    ///
    /// # Safety
    /// `region` must be a fresh mapping at the base of its pool tag, and
    /// `request` a valid chunk size no larger than
    /// [`Pool::capacity_for`]`(region.size())`.
    pub unsafe fn create(region: PoolRegion, call_site: Tag, request: usize) -> (Pool, ChunkPtr) {
        let capacity = Self::capacity_for(region.size());
        debug_assert!(request >= MIN_CHUNK_SIZE && request <= capacity);

        let base = region.as_ptr();
        let entry = ChunkPtr::from_raw(NonNull::new_unchecked(base.as_ptr().add(POOL_OVERHEAD)));
        let fence = ChunkPtr::from_raw(NonNull::new_unchecked(
            base.as_ptr().add(POOL_OVERHEAD + capacity),
        ));
        ptr::write(
            base.as_ptr().cast::<PoolHeader>(),
            PoolHeader {
                size: region.size(),
                free_list: None,
                entry,
                fence,
                call_site,
                lock: RawMutex::new(),
            },
        );
        let pool = Pool {
            header: base.cast(),
        };

        // Start out as one free chunk spanning the arena, then hand out the
        // front of it like any other allocation
        fence.init(capacity, false, 0, true);
        entry.init(0, true, 0, false);
        entry.set(capacity, false);
        let mut guard = pool.lock();
        guard.link_free(entry);
        let chunk = guard.allocate(request);
        debug_assert_eq!(chunk, Some(entry));
        (pool, entry)
    }

    /// # Safety
    /// A pool must have been created at `pool_base(tag)` and still be mapped
    pub unsafe fn from_tag(tag: Tag) -> Pool {
        Pool {
            header: NonNull::new_unchecked(pool_base(tag) as *mut PoolHeader),
        }
    }

    fn header(self) -> *mut PoolHeader {
        self.header.as_ptr()
    }

    pub fn tag(self) -> Tag {
        get_pool_tag(self.header())
    }

    /// Mapped size of the pool
    pub fn size(self) -> usize {
        // SAFETY: set once by `create()`, read-only afterwards
        unsafe { (*self.header()).size }
    }

    pub fn call_site(self) -> Tag {
        // SAFETY: as above
        unsafe { (*self.header()).call_site }
    }

    pub fn entry(self) -> ChunkPtr {
        // SAFETY: as above
        unsafe { (*self.header()).entry }
    }

    pub fn fence(self) -> ChunkPtr {
        // SAFETY: as above
        unsafe { (*self.header()).fence }
    }

    pub fn capacity(self) -> usize {
        self.fence().addr() - self.entry().addr()
    }

    /// Could `addr` be a payload pointer handed out from this pool? Only
    /// checks position and alignment, not the header behind it.
    pub fn owns_payload(self, addr: usize) -> bool {
        let first = self.entry().addr() + CHUNK_OVERHEAD;
        addr >= first && addr < self.fence().addr() && is_aligned(addr - first, CHUNK_ALIGNMENT)
    }

    /// Take the pool lock
    pub fn lock(&self) -> PoolGuard<'_> {
        // SAFETY: only the lock is borrowed, and `RawMutex` synchronizes
        // itself
        let lock = unsafe { &*ptr::addr_of!((*self.header()).lock) };
        PoolGuard {
            pool: *self,
            _lock: lock.guard(),
        }
    }

    /// Unmap the pool.
    ///
    /// # Safety
    /// No pointer into the pool may be used afterwards, and the pool must
    /// be unbound from its directory first.
    pub unsafe fn destroy(self) {
        PoolRegion::from_raw_parts(self.header.cast(), self.size()).unmap();
    }
}

/// Exclusive access to a pool's free list and chunk headers
pub(crate) struct PoolGuard<'a> {
    pool: Pool,
    _lock: RawMutexGuard<'a>,
}

impl PoolGuard<'_> {
    fn free_list(&self) -> Option<ChunkPtr> {
        // SAFETY: lock held
        unsafe { (*self.pool.header()).free_list }
    }

    fn set_free_list(&mut self, head: Option<ChunkPtr>) {
        // SAFETY: lock held
        unsafe { (*self.pool.header()).free_list = head }
    }

    /// The free list, head first
    pub fn free_chunks(&self) -> impl Iterator<Item = ChunkPtr> + '_ {
        iter::successors(self.free_list(), |chunk| chunk.next_free())
    }

    /// First fit: the first free chunk of at least `min_size` bytes
    pub fn find_free_chunk(&self, min_size: usize) -> Option<ChunkPtr> {
        self.free_chunks().find(|chunk| chunk.size() >= min_size)
    }

    /// Remove `chunk` from the free list
    pub fn unlink_free(&mut self, chunk: ChunkPtr) {
        let (prev, next) = (chunk.prev_free(), chunk.next_free());
        match prev {
            Some(prev) => prev.set_next_free(next),
            None => self.set_free_list(next),
        }
        if let Some(next) = next {
            next.set_prev_free(prev);
        }
        chunk.set_next_free(None);
        chunk.set_prev_free(None);
    }

    /// Push `chunk` onto the head of the free list
    pub fn link_free(&mut self, chunk: ChunkPtr) {
        let head = self.free_list();
        chunk.set_prev_free(None);
        chunk.set_next_free(head);
        if let Some(head) = head {
            head.set_prev_free(Some(chunk));
        }
        self.set_free_list(Some(chunk));
    }

    /// Take a chunk of at least `request` bytes (a valid chunk size) off the
    /// free list and mark it in use, splitting off the tail if it is big
    /// enough to be a chunk of its own.
    pub fn allocate(&mut self, request: usize) -> Option<ChunkPtr> {
        let chunk = self.find_free_chunk(request)?;
        self.unlink_free(chunk);
        let size = chunk.size();
        // SAFETY: every position written below lies inside `chunk`, or is
        // its successor, which was already a header
        unsafe {
            if size - request >= MIN_CHUNK_SIZE {
                chunk.set(request, true);
                let rest = chunk.next_physical();
                rest.set(size - request, false);
                self.link_free(rest);
            } else {
                chunk.set(size, true);
            }
        }
        Some(chunk)
    }

    /// Does `chunk` describe a plausible chunk inside this pool?
    fn check_bounds(&self, chunk: ChunkPtr) -> Result<(), PoolError> {
        let (entry, fence) = (self.pool.entry().addr(), self.pool.fence().addr());
        let size = chunk.size();
        let fits = chunk.addr() >= entry
            && size >= MIN_CHUNK_SIZE
            && is_aligned(size, CHUNK_ALIGNMENT)
            && chunk.addr().checked_add(size).is_some_and(|end| end <= fence);
        if fits {
            Ok(())
        } else {
            Err(PoolError::Corruption {
                chunk: chunk.addr(),
                kind: CorruptionKind::OutOfBounds { size },
            })
        }
    }

    /// The checks done before any chunk is released or resized: `chunk`
    /// lies inside the pool, is in use, and its successor's boundary tag
    /// agrees with it.
    pub fn check_in_use(&self, chunk: ChunkPtr) -> Result<(), PoolError> {
        self.check_bounds(chunk)?;
        // SAFETY: bounds checked above
        unsafe { chunk.check_in_use() }.map_err(|kind| PoolError::Corruption {
            chunk: chunk.addr(),
            kind,
        })
    }

    /// The free chunk physically before `chunk`, if `chunk`'s boundary tag
    /// says there is one. The predecessor's own header must agree before
    /// anything is merged into it, or a cleared `PREV_IN_USE` bit would hand
    /// live memory back to the free list.
    fn free_predecessor(&self, chunk: ChunkPtr) -> Result<Option<ChunkPtr>, PoolError> {
        if chunk.prev_in_use() {
            return Ok(None);
        }
        let prev_size = chunk.prev_size();
        let room = chunk.addr() - self.pool.entry().addr();
        if prev_size < MIN_CHUNK_SIZE
            || !is_aligned(prev_size, CHUNK_ALIGNMENT)
            || prev_size > room
        {
            return Err(PoolError::Corruption {
                chunk: chunk.addr(),
                kind: CorruptionKind::OutOfBounds { size: prev_size },
            });
        }
        // SAFETY: `prev_size` was checked to land between the entry chunk
        // and `chunk`
        let prev = unsafe { chunk.prev_physical() };
        let corrupt = |kind| PoolError::Corruption {
            chunk: prev.addr(),
            kind,
        };
        if prev.size() != prev_size {
            return Err(corrupt(CorruptionKind::SizeMismatch {
                size: prev.size(),
                recorded: prev_size,
            }));
        }
        if prev.in_use() {
            return Err(corrupt(CorruptionKind::InUseMismatch));
        }
        Ok(Some(prev))
    }

    /// Mark `chunk` free, merge it with free physical neighbours and put the
    /// result on the free list.
    pub fn release(&mut self, chunk: ChunkPtr) -> Result<(), PoolError> {
        self.check_in_use(chunk)?;
        let prev = self.free_predecessor(chunk)?;

        let mut start = chunk;
        let mut size = chunk.size();
        if let Some(prev) = prev {
            self.unlink_free(prev);
            size += prev.size();
            start = prev;
        }
        // SAFETY: both boundary tags of `chunk` were just checked
        unsafe {
            // The fence is in use, so this never runs off the end
            let next = chunk.next_physical();
            if !next.in_use() {
                self.unlink_free(next);
                size += next.size();
            }
            start.set(size, false);
        }
        self.link_free(start);
        Ok(())
    }

    /// Shrink the in-use `chunk` to `request` bytes. The tail, if it is big
    /// enough to stand alone, becomes an in-use chunk and is released
    /// through [`PoolGuard::release`], which merges it with a free successor.
    pub fn shrink(&mut self, chunk: ChunkPtr, request: usize) -> Result<(), PoolError> {
        self.check_in_use(chunk)?;
        let size = chunk.size();
        debug_assert!(request <= size);
        if size - request < MIN_CHUNK_SIZE {
            return Ok(());
        }
        // SAFETY: both headers lie inside the checked chunk
        let tail = unsafe {
            chunk.set(request, true);
            let tail = chunk.next_physical();
            tail.set(size - request, true);
            tail
        };
        self.release(tail)
    }

    /// Walk every chunk from the entry to the fence, checking every boundary
    /// tag and that no two free chunks touch. Each chunk's header is compared
    /// with the tag its successor keeps, which covers both directions.
    pub fn stats(&self) -> Result<PoolStats, PoolError> {
        let fence = self.pool.fence();
        let mut stats = PoolStats {
            capacity: self.pool.capacity(),
            ..PoolStats::default()
        };
        let mut chunk = self.pool.entry();
        // Nothing precedes the entry chunk, so nothing may merge backwards
        // out of it
        if !chunk.prev_in_use() {
            return Err(PoolError::Corruption {
                chunk: chunk.addr(),
                kind: CorruptionKind::InUseMismatch,
            });
        }
        let mut after_free = false;
        while chunk != fence {
            self.check_bounds(chunk)?;
            let corrupt = |kind| PoolError::Corruption {
                chunk: chunk.addr(),
                kind,
            };
            // SAFETY: bounds checked
            let next = unsafe { chunk.next_physical() };
            if next.prev_size() != chunk.size() {
                return Err(corrupt(CorruptionKind::SizeMismatch {
                    size: chunk.size(),
                    recorded: next.prev_size(),
                }));
            }
            if next.prev_in_use() != chunk.in_use() {
                return Err(corrupt(CorruptionKind::InUseMismatch));
            }
            if chunk.in_use() {
                stats.in_use_bytes += chunk.size();
                stats.in_use_chunks += 1;
                after_free = false;
            } else {
                if after_free {
                    return Err(corrupt(CorruptionKind::Uncoalesced));
                }
                stats.free_bytes += chunk.size();
                stats.free_chunks += 1;
                stats.largest_free_chunk = stats.largest_free_chunk.max(chunk.size());
                after_free = true;
            }
            chunk = next;
        }

        // Bounded, in case the list has grown a cycle
        let listed = self.free_chunks().take(stats.free_chunks + 1).count();
        if listed != stats.free_chunks {
            return Err(PoolError::Corruption {
                chunk: self.pool.entry().addr(),
                kind: CorruptionKind::FreeListMismatch {
                    listed,
                    found: stats.free_chunks,
                },
            });
        }
        Ok(stats)
    }
}
