//! The allocator façade: allocate, zero-allocate, resize and release, each
//! routed to the pool owned by the caller's call-site tag.
//!
//! Every operation comes in two flavours. The `try_*` methods return the
//! [`PoolError`] instead of acting on it and leave the heap untouched when
//! they fail. The plain methods have `malloc()` semantics: invalid arguments
//! give a null pointer and `ENOMEM`, and every [`PoolError`] aborts the
//! process through [`fatal`].

use std::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicU16, AtomicUsize, Ordering},
};

use super::{
    chunk::{check_alignment, request_size, ChunkPtr},
    directory::TagDirectory,
    pool::{Pool, PoolStats},
};
use crate::{
    config::{self, clamp_pool_size},
    deref::Recorder,
    error::{AlignmentError, PoolError},
    os::{mem::PoolRegion, set_errno},
    tag::{get_pool_tag, next_pool_tag, Tag, FIRST_POOL_TAG, MAX_POOL_TAG},
    util::{hint::unlikely, print::fatal},
};

/// The process heap, serving the C ABI and [`TaggedAlloc`](super::global::TaggedAlloc)
pub static HEAP: Heap = Heap::new();

pub struct Heap {
    directory: TagDirectory,
    /// 0 until first read from the environment
    pool_size: AtomicUsize,
    /// Where the next pool region search starts
    next_pool_tag: AtomicU16,
    recorder: Recorder,
}

impl Heap {
    /// A heap whose pool size comes from the environment
    pub const fn new() -> Self {
        Self {
            directory: TagDirectory::new(),
            pool_size: AtomicUsize::new(0),
            next_pool_tag: AtomicU16::new(FIRST_POOL_TAG),
            recorder: Recorder::new(),
        }
    }

    /// A heap whose pools are `pool_size` bytes (page-rounded and clamped
    /// like the environment setting)
    pub fn with_pool_size(pool_size: usize) -> Self {
        let heap = Self::new();
        heap.pool_size.store(clamp_pool_size(pool_size), Ordering::Relaxed);
        heap
    }

    /// The size new pools are mapped with
    pub fn configured_pool_size(&self) -> usize {
        match self.pool_size.load(Ordering::Relaxed) {
            0 => {
                let size = config::pool_size();
                self.pool_size.store(size, Ordering::Relaxed);
                size
            }
            size => size,
        }
    }

    pub fn directory(&self) -> &TagDirectory {
        &self.directory
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    fn pool_for(&self, call_site: Tag) -> Option<Pool> {
        // SAFETY: bound pools stay mapped until the heap is dropped
        self.directory
            .resolve_pool(call_site)
            .map(|tag| unsafe { Pool::from_tag(tag) })
    }

    /// The pool `ptr` was handed out from, checked against the directory
    /// and the pool's bounds before any of its memory is read
    fn owning_pool(&self, ptr: NonNull<u8>) -> Result<Pool, PoolError> {
        let addr = ptr.as_ptr() as usize;
        let tag = get_pool_tag(ptr.as_ptr());
        if !self.directory.is_bound(tag) {
            return Err(PoolError::ForeignPointer { ptr: addr });
        }
        // SAFETY: bound
        let pool = unsafe { Pool::from_tag(tag) };
        if !pool.owns_payload(addr) {
            return Err(PoolError::ForeignPointer { ptr: addr });
        }
        Ok(pool)
    }

    /// Allocate `size` bytes from `call_site`'s pool, creating the pool on
    /// first use. `Ok(None)` for a zero or unrepresentable size.
    pub fn try_allocate(
        &self,
        call_site: Tag,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, PoolError> {
        if size == 0 {
            return Ok(None);
        }
        let Some(request) = request_size(size) else {
            return Ok(None);
        };
        loop {
            if let Some(pool) = self.pool_for(call_site) {
                let chunk = pool
                    .lock()
                    .allocate(request)
                    .ok_or(PoolError::Exhausted {
                        pool: pool.tag(),
                        requested: request,
                    })?;
                return Ok(Some(chunk.payload()));
            }
            if let Some(entry) = self.create_pool(call_site, request)? {
                return Ok(Some(entry.payload()));
            }
            // Somebody else created the pool while we waited for the lock
        }
    }

    /// Create and bind `call_site`'s pool with a `request` byte entry chunk.
    /// `Ok(None)` if another thread got there first.
    fn create_pool(&self, call_site: Tag, request: usize) -> Result<Option<ChunkPtr>, PoolError> {
        // Read before locking: the first read may print a warning
        let pool_size = self.configured_pool_size();
        let capacity = Pool::capacity_for(pool_size);
        if request > capacity {
            return Err(PoolError::TooLarge {
                requested: request,
                capacity,
            });
        }

        let directory = self.directory.lock();
        if self.directory.resolve_pool(call_site).is_some() {
            return Ok(None);
        }
        let region = self.claim_region(pool_size)?;
        // SAFETY: a fresh region at its tag's base, and its capacity is at
        // least `capacity`
        let (pool, entry) = unsafe { Pool::create(region, call_site, request) };
        self.directory.bind(call_site, pool.tag());
        drop(directory);

        log::debug!(
            "created pool {:#x} at {:#x} ({} bytes) for call site {:#x}",
            pool.tag(),
            entry.addr(),
            pool.size(),
            pool.call_site()
        );
        Ok(Some(entry))
    }

    /// Map `pool_size` bytes at the first free pool base, probing every
    /// pool tag at most once
    fn claim_region(&self, pool_size: usize) -> Result<PoolRegion, PoolError> {
        for _ in 0..MAX_POOL_TAG {
            let tag = self.advance_pool_tag();
            match PoolRegion::map_fixed(tag, pool_size) {
                Ok(region) => return Ok(region),
                Err(PoolError::AddressInUse { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(PoolError::TagsExhausted)
    }

    fn advance_pool_tag(&self) -> Tag {
        let mut tag = self.next_pool_tag.load(Ordering::Relaxed);
        loop {
            match self.next_pool_tag.compare_exchange_weak(
                tag,
                next_pool_tag(tag),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return tag,
                Err(current) => tag = current,
            }
        }
    }

    /// Allocate `nmemb * size` zeroed bytes. `Ok(None)` if the product
    /// overflows, without allocating anything.
    pub fn try_zero_allocate(
        &self,
        call_site: Tag,
        nmemb: usize,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, PoolError> {
        let Some(total) = nmemb.checked_mul(size) else {
            return Ok(None);
        };
        let mem = self.try_allocate(call_site, total)?;
        if let Some(mem) = mem {
            // SAFETY: we just allocated at least `total` bytes there. Reused
            // chunks hold stale data, so this can't be skipped.
            unsafe { mem.as_ptr().write_bytes(0, total) };
        }
        Ok(mem)
    }

    /// Resize the allocation at `ptr` to `new_size` bytes.
    ///
    /// - a null `ptr` allocates from `call_site`'s pool
    /// - a zero `new_size` releases `ptr` and gives `Ok(None)`
    /// - shrinking stays in place and releases the tail
    /// - growing moves to another chunk of the *same* pool, whichever call
    ///   site is asking
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation from this heap
    pub unsafe fn try_resize(
        &self,
        call_site: Tag,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, PoolError> {
        let Some(old) = NonNull::new(ptr) else {
            return self.try_allocate(call_site, new_size);
        };
        if new_size == 0 {
            self.try_release(ptr)?;
            return Ok(None);
        }
        let pool = self.owning_pool(old)?;
        let Some(request) = request_size(new_size) else {
            return Ok(None);
        };

        let mut guard = pool.lock();
        let chunk = ChunkPtr::from_payload(old);
        guard.check_in_use(chunk)?;
        if request <= chunk.size() {
            guard.shrink(chunk, request)?;
            return Ok(Some(old));
        }
        let new = guard.allocate(request).ok_or(PoolError::Exhausted {
            pool: pool.tag(),
            requested: request,
        })?;
        ptr::copy_nonoverlapping(old.as_ptr(), new.payload().as_ptr(), chunk.payload_size());
        guard.release(chunk)?;
        Ok(Some(new.payload()))
    }

    /// Release the allocation at `ptr`. Null is a no-op.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation from this heap. The boundary
    /// checks catch double releases and most overwritten headers, but
    /// nothing can catch a pointer that happens to look right.
    pub unsafe fn try_release(&self, ptr: *mut u8) -> Result<(), PoolError> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(());
        };
        let pool = self.owning_pool(ptr)?;
        let mut guard = pool.lock();
        guard.release(ChunkPtr::from_payload(ptr))
    }

    /// Payload bytes usable at `ptr`, 0 for null
    ///
    /// # Safety
    /// As [`Heap::try_release`]
    pub unsafe fn try_usable_size(&self, ptr: *mut u8) -> Result<usize, PoolError> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(0);
        };
        let pool = self.owning_pool(ptr)?;
        let guard = pool.lock();
        let chunk = ChunkPtr::from_payload(ptr);
        guard.check_in_use(chunk)?;
        Ok(chunk.payload_size())
    }

    /// `malloc()` for `call_site`
    pub fn allocate(&self, call_site: Tag, size: usize) -> *mut u8 {
        into_raw(self.try_allocate(call_site, size), size != 0)
    }

    /// `calloc()` for `call_site`
    pub fn zero_allocate(&self, call_site: Tag, nmemb: usize, size: usize) -> *mut u8 {
        into_raw(
            self.try_zero_allocate(call_site, nmemb, size),
            nmemb != 0 && size != 0,
        )
    }

    /// `memalign()` for `call_site`. Alignments up to 16 bytes are plain
    /// allocations; anything stricter is refused rather than wasting a
    /// chunk on padding.
    pub fn aligned_allocate(
        &self,
        call_site: Tag,
        alignment: usize,
        size: usize,
    ) -> Result<*mut u8, AlignmentError> {
        check_alignment(alignment)?;
        Ok(self.allocate(call_site, size))
    }

    /// `realloc()` for `call_site`
    ///
    /// # Safety
    /// As [`Heap::try_resize`]
    pub unsafe fn resize(&self, call_site: Tag, ptr: *mut u8, new_size: usize) -> *mut u8 {
        into_raw(self.try_resize(call_site, ptr, new_size), new_size != 0)
    }

    /// `free()`
    ///
    /// # Safety
    /// As [`Heap::try_release`]
    pub unsafe fn release(&self, ptr: *mut u8) {
        if let Err(err) = self.try_release(ptr) {
            fatal(&err)
        }
    }

    /// `malloc_usable_size()`
    ///
    /// # Safety
    /// As [`Heap::try_release`]
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        self.try_usable_size(ptr).unwrap_or_else(|err| fatal(&err))
    }

    /// Mapped size of the pool owning `ptr`, `None` if no pool of this heap
    /// does
    pub fn pool_size<T>(&self, ptr: *const T) -> Option<usize> {
        let tag = get_pool_tag(ptr);
        // SAFETY: bound
        self.directory
            .is_bound(tag)
            .then(|| unsafe { Pool::from_tag(tag) }.size())
    }

    /// Record a dereference of `ptr` from `return_address`. Pointers into
    /// the default pool, or into no pool at all, are ignored.
    #[inline]
    pub fn on_dereference<T>(&self, ptr: *const T, return_address: usize) {
        let call_site = self.directory.resolve_call_site(get_pool_tag(ptr));
        self.recorder.record(call_site, return_address);
    }

    /// Walk `call_site`'s pool, verifying every chunk. `Ok(None)` if the
    /// call site has no pool yet.
    pub fn pool_stats(&self, call_site: Tag) -> Result<Option<PoolStats>, PoolError> {
        self.pool_for(call_site)
            .map(|pool| pool.lock().stats())
            .transpose()
    }
}

/// The `malloc()` view of a `try_*` result. `requested` says whether a null
/// result means the arguments were invalid.
#[inline]
fn into_raw(result: Result<Option<NonNull<u8>>, PoolError>, requested: bool) -> *mut u8 {
    match result {
        Ok(Some(mem)) => mem.as_ptr(),
        Ok(None) => {
            if unlikely(requested) {
                set_errno(libc::ENOMEM);
            }
            ptr::null_mut()
        }
        Err(err) => fatal(&err),
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // `&mut self`: no other thread can reach the directory or the pools,
        // so no lock is taken except the one `stats()` needs
        for (call_site, tag) in self.directory.bindings() {
            self.directory.unbind(call_site);
            // SAFETY: we are being dropped, so nothing can reach the pool
            // through us any more
            let pool = unsafe { Pool::from_tag(tag) };
            let stats = pool.lock().stats();
            match stats {
                Ok(stats) => log::debug!(
                    "destroying pool {:#x} for call site {:#x}: {:?}",
                    tag,
                    call_site,
                    stats
                ),
                Err(err) => log::warn!("destroying pool {:#x}: {}", tag, err),
            }
            unsafe { pool.destroy() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{alloc::pool::MIN_POOL_SIZE, error::CorruptionKind, os::errno, tag::DEFAULT_TAG};

    fn heap() -> Box<Heap> {
        let _ = env_logger::builder().is_test(true).try_init();
        Box::new(Heap::with_pool_size(1 << 20))
    }

    #[test]
    fn first_fit_reuses_the_released_chunk() {
        let heap = heap();
        let p1 = heap.allocate(5, 40);
        let p2 = heap.allocate(5, 40);
        assert!(!p1.is_null() && !p2.is_null());
        assert_ne!(p1, p2);
        assert_eq!(get_pool_tag(p1), get_pool_tag(p2));
        unsafe { heap.release(p1) };
        let p3 = heap.allocate(5, 40);
        assert_eq!(p3, p1);
    }

    #[test]
    fn pointers_round_trip_to_their_pool() {
        let heap = heap();
        for call_site in [1, 2, 0x300, Tag::MAX] {
            let p = heap.allocate(call_site, 24);
            let pool = heap.directory().resolve_pool(call_site).unwrap();
            assert_eq!(get_pool_tag(p), pool);
            assert_eq!(heap.directory().resolve_call_site(pool), call_site);
            assert_eq!(p as usize % 16, 0);
        }
    }

    #[test]
    fn call_sites_get_separate_pools() {
        let heap = heap();
        let a = heap.allocate(10, 8);
        let b = heap.allocate(11, 8);
        assert_ne!(get_pool_tag(a), get_pool_tag(b));
        assert_eq!(heap.pool_size(a), Some(1 << 20));
        assert_eq!(heap.pool_size(ptr::null::<u8>()), None);
    }

    #[test]
    fn null_and_zero_sizes() {
        let heap = heap();
        assert!(heap.allocate(3, 0).is_null());
        assert!(heap.directory().resolve_pool(3).is_none(), "size 0 must not create a pool");
        unsafe {
            heap.release(ptr::null_mut());
            assert_eq!(heap.usable_size(ptr::null_mut()), 0);

            let p = heap.resize(3, ptr::null_mut(), 100);
            assert!(!p.is_null());
            assert_eq!(get_pool_tag(p), heap.directory().resolve_pool(3).unwrap());

            let before = heap.pool_stats(3).unwrap().unwrap();
            assert!(heap.resize(3, p, 0).is_null());
            let after = heap.pool_stats(3).unwrap().unwrap();
            assert_eq!(after.in_use_bytes, before.in_use_bytes - 128);
        }
    }

    #[test]
    fn zero_allocate_fills_reused_memory() {
        let heap = heap();
        let p = heap.allocate(4, 256);
        unsafe {
            p.write_bytes(0xa5, 256);
            heap.release(p);
        }
        let q = heap.zero_allocate(4, 16, 16);
        assert_eq!(q, p);
        let bytes = unsafe { std::slice::from_raw_parts(q, 256) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_allocate_rejects_overflow() {
        let heap = heap();
        assert!(heap.zero_allocate(6, usize::MAX, 2).is_null());
        assert_eq!(errno(), libc::ENOMEM);
        assert!(heap.directory().resolve_pool(6).is_none());
        assert!(heap.allocate(6, usize::MAX - 4).is_null());
        assert_eq!(heap.try_zero_allocate(6, usize::MAX, 2), Ok(None));
    }

    #[test]
    fn resize_shrinks_in_place_and_grows_by_copying() {
        let heap = heap();
        let p = heap.allocate(7, 200);
        unsafe {
            for i in 0..200 {
                p.add(i).write(i as u8);
            }
            let q = heap.resize(7, p, 40);
            assert_eq!(q, p);
            assert_eq!(heap.usable_size(q), 48);

            let r = heap.resize(7, q, 4000);
            assert_ne!(r, q);
            assert!(heap.usable_size(r) >= 4000);
            for i in 0..40 {
                assert_eq!(r.add(i).read(), i as u8);
            }
            let stats = heap.pool_stats(7).unwrap().unwrap();
            assert_eq!(stats.in_use_chunks, 1);
            assert_eq!(stats.in_use_bytes + stats.free_bytes, stats.capacity);
        }
    }

    #[test]
    fn adjacent_releases_coalesce_in_either_order() {
        for order in [[0, 1], [1, 0]] {
            let heap = heap();
            let keep = heap.allocate(8, 32);
            let pair = [heap.allocate(8, 64), heap.allocate(8, 64)];
            let fence = heap.allocate(8, 32);
            for i in order {
                unsafe { heap.release(pair[i]) };
            }
            let stats = heap.pool_stats(8).unwrap().unwrap();
            // the merged pair plus the tail of the pool
            assert_eq!(stats.free_chunks, 2);
            assert_eq!(stats.in_use_chunks, 2);
            unsafe {
                heap.release(keep);
                heap.release(fence);
            }
            let stats = heap.pool_stats(8).unwrap().unwrap();
            assert_eq!(stats.free_chunks, 1);
            assert_eq!(stats.free_bytes, stats.capacity);
        }
    }

    #[test]
    fn errors_instead_of_aborting() {
        let heap = heap();
        let p = heap.allocate(9, 16);
        unsafe {
            heap.release(p);
            assert!(matches!(
                heap.try_release(p),
                Err(PoolError::Corruption {
                    kind: CorruptionKind::NotInUse,
                    ..
                })
            ));
            let local = 0u64;
            assert!(matches!(
                heap.try_release(&local as *const u64 as *mut u8),
                Err(PoolError::ForeignPointer { .. })
            ));
            // Inside the pool, but not on a payload boundary
            let q = heap.allocate(9, 64);
            assert!(matches!(
                heap.try_release(q.add(8)),
                Err(PoolError::ForeignPointer { .. })
            ));
        }
        assert!(matches!(
            heap.try_allocate(9, 2 << 20),
            Err(PoolError::Exhausted { .. })
        ));
        assert!(matches!(
            heap.try_allocate(12, 2 << 20),
            Err(PoolError::TooLarge { .. })
        ));
        assert!(heap.directory().resolve_pool(12).is_none());
    }

    #[test]
    fn exhaustion_leaves_the_pool_intact() {
        let heap = heap();
        let mut held = Vec::new();
        loop {
            match heap.try_allocate(13, 4096) {
                Ok(Some(p)) => held.push(p),
                Err(PoolError::Exhausted { .. }) => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(held.len() > 200);
        let stats = heap.pool_stats(13).unwrap().unwrap();
        assert_eq!(stats.in_use_bytes + stats.free_bytes, stats.capacity);
        for p in held {
            unsafe { heap.try_release(p.as_ptr()).unwrap() };
        }
        assert_eq!(heap.pool_stats(13).unwrap().unwrap().free_chunks, 1);
    }

    #[test]
    fn dereferences_are_attributed_to_the_call_site() {
        let heap = heap();
        let mut map = vec![0u8; 1 << 16];
        unsafe {
            heap.recorder()
                .install(map.as_mut_ptr(), map.len(), Default::default())
        };
        let p = heap.allocate(0x42, 8);
        let untagged = heap.allocate(DEFAULT_TAG, 8);
        heap.on_dereference(p, 0x1234);
        heap.on_dereference(untagged, 0x1234);
        heap.on_dereference(&map as *const _, 0x1234);
        heap.recorder().uninstall();

        let index = crate::deref::feedback_index(0x42, 0x1234) & 0xffff;
        assert_eq!(map[index], 1);
        assert_eq!(map.iter().map(|&b| b as usize).sum::<usize>(), 1);
    }

    #[test]
    fn aligned_allocate_serves_chunk_alignments_only() {
        let heap = heap();
        let p = heap.aligned_allocate(15, 16, 100).unwrap();
        assert!(!p.is_null());
        assert_eq!(p as usize % 16, 0);
        assert_eq!(get_pool_tag(p), heap.directory().resolve_pool(15).unwrap());
        assert!(heap.aligned_allocate(15, 8, 0).unwrap().is_null());
        assert_eq!(
            heap.aligned_allocate(15, 64, 100),
            Err(AlignmentError::Unsupported(64))
        );
        assert_eq!(
            heap.aligned_allocate(15, 3, 100),
            Err(AlignmentError::NotPowerOfTwo(3))
        );
        // Refusals allocate nothing
        assert_eq!(heap.pool_stats(15).unwrap().unwrap().in_use_chunks, 1);
    }

    #[test]
    fn small_pool_sizes_are_clamped() {
        let heap = Box::new(Heap::with_pool_size(1));
        assert!(heap.configured_pool_size() >= MIN_POOL_SIZE);
        let p = heap.allocate(1, 1);
        assert_eq!(heap.pool_size(p), Some(heap.configured_pool_size()));
    }

    #[test]
    fn drop_survives_a_corrupt_pool() {
        let heap = heap();
        heap.allocate(14, 40);
        let q = heap.allocate(14, 40);
        // q's prev_size
        unsafe { *(q.sub(16) as *mut usize) = 0x4141 };
        assert!(heap.pool_stats(14).is_err());
        // The pool lock is free again once the walk has failed, which is
        // what `drop` relies on before it logs
        assert!(heap.pool_stats(14).is_err());
        drop(heap);
    }
}
