use std::{io, num::NonZeroUsize, ptr::NonNull};

use libc::{
    mmap, munmap, EEXIST, MAP_ANONYMOUS, MAP_FAILED, MAP_FIXED_NOREPLACE, MAP_NORESERVE,
    MAP_PRIVATE, PROT_READ, PROT_WRITE,
};
use once_cell::race::OnceNonZeroUsize;

use crate::{
    error::PoolError,
    tag::{pool_base, Tag},
    util::num::round_up,
};

static PAGE_SIZE: OnceNonZeroUsize = OnceNonZeroUsize::new();

/// The system page size, queried once
pub fn page_size() -> usize {
    PAGE_SIZE
        .get_or_init(|| NonZeroUsize::new(page_size::get()).unwrap_or(NonZeroUsize::MIN))
        .get()
}

/// A read/write, private anonymous mapping placed at exactly the base address
/// of one pool tag. The region is *not* unmapped on drop: pools normally live
/// until the process exits, and the owner calls [`PoolRegion::unmap`] when
/// they don't.
#[derive(Debug)]
pub struct PoolRegion {
    ptr: NonNull<u8>,
    size: usize,
}

impl PoolRegion {
    /// `mmap()` `size` bytes (rounded up to whole pages) at the base address
    /// of `tag`, without reserving swap. Never replaces an existing mapping.
    ///
    /// # Errors
    /// - [`PoolError::AddressInUse`] if anything is already mapped in the
    ///   range, the caller should try another tag
    /// - [`PoolError::MapFailed`] for anything else
    pub fn map_fixed(tag: Tag, size: usize) -> Result<PoolRegion, PoolError> {
        debug_assert!(tag != 0, "tag 0 would map the null page");
        let size = round_up(size.max(1), page_size()).ok_or(PoolError::TooLarge {
            requested: size,
            capacity: usize::MAX,
        })?;
        let want = pool_base(tag) as *mut libc::c_void;
        // SAFETY: MAP_FIXED_NOREPLACE never clobbers an existing mapping, so
        // this can't invalidate memory anybody else holds
        let got = unsafe {
            mmap(
                want,
                size,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE | MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if got == MAP_FAILED {
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(if errno == EEXIST {
                PoolError::AddressInUse { pool: tag }
            } else {
                PoolError::MapFailed { pool: tag, errno }
            });
        }
        if got != want {
            // Kernels older than 4.17 don't know MAP_FIXED_NOREPLACE and treat
            // the address as a hint. Somebody is in the way either way.
            // SAFETY: we own this fresh mapping and nothing points into it
            unsafe { munmap(got, size) };
            return Err(PoolError::AddressInUse { pool: tag });
        }
        Ok(PoolRegion {
            // SAFETY: `got == want`, which is non-null because `tag != 0`
            ptr: unsafe { NonNull::new_unchecked(got.cast()) },
            size,
        })
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Mapped length, a multiple of the page size
    pub fn size(&self) -> usize {
        self.size
    }

    /// Give the region back to the kernel.
    ///
    /// # Safety
    /// Nothing may read or write the region afterwards.
    pub unsafe fn unmap(self) {
        // - The address is page-aligned because it is a pool base
        // - `self.size` is exactly what we mapped
        munmap(self.ptr.as_ptr().cast(), self.size);
    }

    /// Reconstitute a region from a pool base and the size it was mapped
    /// with.
    ///
    /// # Safety
    /// `ptr` and `size` must describe a mapping made by
    /// [`PoolRegion::map_fixed`] that is still live.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, size: usize) -> Self {
        Self { ptr, size }
    }
}
