//! Chunk headers and boundary tags.
//!
//! ```plaintext
//!            +---------------------------+
//! chunk ->   | prev_size                 |  size of the physically previous chunk
//!            | size | PREV_IN_USE | IN_USE|  size of this chunk, header included
//!            +---------------------------+
//! payload -> | next  (free chunks only)  |  free list links, overlaid on the
//!            | prev  (free chunks only)  |  payload of in-use chunks
//!            | ...                       |
//!            +---------------------------+
//! next ->    | prev_size == size         |  boundary tag of this chunk
//!            | size | PREV_IN_USE == IN_USE
//! ```
//!
//! Chunk sizes are multiples of [`CHUNK_ALIGNMENT`], which leaves the low
//! bits of `size` free for the status bits. Every write of a chunk's size or
//! status goes through [`ChunkPtr::set`], which mirrors both into the
//! successor, so the two copies only disagree if something outside the
//! allocator wrote over them.

use std::{
    mem::size_of,
    ptr::{self, NonNull},
};

use crate::{
    error::{AlignmentError, CorruptionKind},
    util::num::align_up,
};

#[repr(C)]
pub(crate) struct Chunk {
    prev_size: usize,
    size: usize,
    next: *mut Chunk,
    prev: *mut Chunk,
}

/// Alignment of every chunk and every payload
pub const CHUNK_ALIGNMENT: usize = 2 * size_of::<usize>();

/// Header bytes in front of every payload
pub const CHUNK_OVERHEAD: usize = 2 * size_of::<usize>();

/// The smallest chunk that can hold the free list links
pub const MIN_CHUNK_SIZE: usize = size_of::<Chunk>();

const IN_USE: usize = 0b01;
const PREV_IN_USE: usize = 0b10;
const FLAGS: usize = IN_USE | PREV_IN_USE;

/// The chunk size needed to serve a `size` byte request, or `None` if that
/// can't be represented.
pub const fn request_size(size: usize) -> Option<usize> {
    let Some(with_header) = size.checked_add(CHUNK_OVERHEAD) else {
        return None;
    };
    match align_up(with_header, CHUNK_ALIGNMENT) {
        Some(n) if n < MIN_CHUNK_SIZE => Some(MIN_CHUNK_SIZE),
        aligned => aligned,
    }
}

/// Can a payload be `alignment` aligned? Only alignments a chunk already has
/// can be served.
pub fn check_alignment(alignment: usize) -> Result<(), AlignmentError> {
    if !alignment.is_power_of_two() {
        Err(AlignmentError::NotPowerOfTwo(alignment))
    } else if alignment > CHUNK_ALIGNMENT {
        Err(AlignmentError::Unsupported(alignment))
    } else {
        Ok(())
    }
}

/// A pointer to a chunk header.
///
/// Holding a `ChunkPtr` asserts that at least [`MIN_CHUNK_SIZE`] bytes at
/// that address are mapped and belong to one pool; all accessors rely on it.
/// Nothing is asserted about the *contents*: walking to a neighbour trusts
/// the header, and is `unsafe` for that reason.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ChunkPtr(NonNull<Chunk>);

impl ChunkPtr {
    /// # Safety
    /// See the type-level invariant
    pub unsafe fn from_raw(ptr: NonNull<u8>) -> Self {
        debug_assert!(ptr.as_ptr() as usize % CHUNK_ALIGNMENT == 0);
        Self(ptr.cast())
    }

    /// Recover the chunk header from a pointer handed out by the allocator
    ///
    /// # Safety
    /// `payload` must be a payload pointer inside a live pool
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        Self::from_raw(NonNull::new_unchecked(payload.as_ptr().sub(CHUNK_OVERHEAD)))
    }

    fn raw(self) -> *mut Chunk {
        self.0.as_ptr()
    }

    pub fn addr(self) -> usize {
        self.raw() as usize
    }

    /// The pointer the user sees
    pub fn payload(self) -> NonNull<u8> {
        // SAFETY: the header lies inside a mapping, so header + overhead is
        // at most one-past-the-end and non-null
        unsafe { NonNull::new_unchecked(self.raw().cast::<u8>().add(CHUNK_OVERHEAD)) }
    }

    /// Chunk size in bytes, header included, status bits masked off
    pub fn size(self) -> usize {
        // SAFETY: type invariant
        unsafe { (*self.raw()).size & !FLAGS }
    }

    /// Bytes the user may use
    pub fn payload_size(self) -> usize {
        self.size().saturating_sub(CHUNK_OVERHEAD)
    }

    pub fn in_use(self) -> bool {
        // SAFETY: type invariant
        unsafe { (*self.raw()).size & IN_USE != 0 }
    }

    pub fn prev_in_use(self) -> bool {
        // SAFETY: type invariant
        unsafe { (*self.raw()).size & PREV_IN_USE != 0 }
    }

    /// Size of the physically previous chunk, as recorded in our header
    pub fn prev_size(self) -> usize {
        // SAFETY: type invariant
        unsafe { (*self.raw()).prev_size }
    }

    /// Write only the boundary tag describing our predecessor
    pub fn set_prev(self, prev_size: usize, prev_in_use: bool) {
        // SAFETY: type invariant
        unsafe {
            let header = self.raw();
            (*header).prev_size = prev_size;
            let flag = if prev_in_use { PREV_IN_USE } else { 0 };
            (*header).size = ((*header).size & !PREV_IN_USE) | flag;
        }
    }

    /// Set this chunk's size and status and mirror both into the boundary
    /// tag of the chunk that now follows it. Our own `PREV_IN_USE` bit is
    /// preserved.
    ///
    /// # Safety
    /// `self + size` must be a chunk header (or the pool fence) in the same
    /// pool.
    pub unsafe fn set(self, size: usize, in_use: bool) {
        debug_assert!(size % CHUNK_ALIGNMENT == 0);
        let header = self.raw();
        (*header).size = size | ((*header).size & PREV_IN_USE) | if in_use { IN_USE } else { 0 };
        self.next_physical().set_prev(size, in_use);
    }

    /// Write a header from scratch, without touching any neighbour. Only
    /// used for the pool fence.
    pub fn init(self, prev_size: usize, prev_in_use: bool, size: usize, in_use: bool) {
        // SAFETY: type invariant
        unsafe {
            ptr::write(
                self.raw(),
                Chunk {
                    prev_size,
                    size: size
                        | if prev_in_use { PREV_IN_USE } else { 0 }
                        | if in_use { IN_USE } else { 0 },
                    next: ptr::null_mut(),
                    prev: ptr::null_mut(),
                },
            );
        }
    }

    /// The chunk physically after this one
    ///
    /// # Safety
    /// Our `size` must be intact, so the result is a header in this pool
    pub unsafe fn next_physical(self) -> ChunkPtr {
        Self(NonNull::new_unchecked(self.raw().cast::<u8>().add(self.size()).cast()))
    }

    /// The chunk physically before this one
    ///
    /// # Safety
    /// Our `prev_size` must be intact and there must be a predecessor
    pub unsafe fn prev_physical(self) -> ChunkPtr {
        Self(NonNull::new_unchecked(self.raw().cast::<u8>().sub(self.prev_size()).cast()))
    }

    /// Next entry on the free list. Garbage unless this chunk is free.
    pub fn next_free(self) -> Option<ChunkPtr> {
        // SAFETY: type invariant (MIN_CHUNK_SIZE covers the links)
        NonNull::new(unsafe { (*self.raw()).next }).map(Self)
    }

    /// Previous entry on the free list. Garbage unless this chunk is free.
    pub fn prev_free(self) -> Option<ChunkPtr> {
        // SAFETY: type invariant
        NonNull::new(unsafe { (*self.raw()).prev }).map(Self)
    }

    pub fn set_next_free(self, next: Option<ChunkPtr>) {
        // SAFETY: type invariant
        unsafe { (*self.raw()).next = next.map_or(ptr::null_mut(), ChunkPtr::raw) }
    }

    pub fn set_prev_free(self, prev: Option<ChunkPtr>) {
        // SAFETY: type invariant
        unsafe { (*self.raw()).prev = prev.map_or(ptr::null_mut(), ChunkPtr::raw) }
    }

    /// Check that this chunk is in use and that its successor's boundary tag
    /// agrees, i.e. `in_use(c) == prev_in_use(next(c))` and
    /// `size(c) == prev_size(next(c))`. Callers must have bounds-checked
    /// `size()` first.
    ///
    /// # Safety
    /// `self + size()` must lie inside the pool
    pub unsafe fn check_in_use(self) -> Result<(), CorruptionKind> {
        if !self.in_use() {
            return Err(CorruptionKind::NotInUse);
        }
        let next = self.next_physical();
        if !next.prev_in_use() {
            return Err(CorruptionKind::InUseMismatch);
        }
        if next.prev_size() != self.size() {
            return Err(CorruptionKind::SizeMismatch {
                size: self.size(),
                recorded: next.prev_size(),
            });
        }
        Ok(())
    }
}
