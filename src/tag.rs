//! Call-site and pool tags, and the address layout that ties pool tags to
//! pointers.
//!
//! A pool tag is nothing more than the top [`NUM_TAG_BITS`] of the
//! [`NUM_USABLE_BITS`] of a virtual address. Every pool is mapped at
//! `tag << POOL_SHIFT`, so getting from a pointer to its pool is one shift.

/// Tag type, shared by call-site tags and pool tags
pub type Tag = u16;

/// The number of usable bits in a user-space virtual address (4-level paging)
pub const NUM_USABLE_BITS: u32 = 48;

/// Number of bits in a tag
pub const NUM_TAG_BITS: u32 = Tag::BITS;

/// Call-site tag for allocations that carry no site information
pub const DEFAULT_TAG: Tag = 0;

/// The largest tag value
pub const TAG_MAX: Tag = Tag::MAX;

/// Number of entries in a table indexed by tag
pub const NUM_TAGS: usize = 1 << NUM_TAG_BITS;

/// Distance between two pool bases, and the alignment of every pool
pub const POOL_SHIFT: u32 = NUM_USABLE_BITS - NUM_TAG_BITS;

/// Pool alignment. This is also the largest pool we can ever map, since the
/// next pool tag starts right after it.
pub const POOL_ALIGNMENT: usize = 1 << POOL_SHIFT;

/// The largest pool tag whose region lies in the lower half of the address
/// space (the kernel owns the upper half).
pub const MAX_POOL_TAG: Tag = (1 << (NUM_TAG_BITS - 1)) - 1;

/// Where we start looking for free pool regions. Low tags overlap the program
/// image and the brk heap; this one is far above both and far below the
/// default mmap base.
pub const FIRST_POOL_TAG: Tag = 0x1000;

/// Extract the pool tag from any pointer. No memory is touched, and the result
/// is only meaningful for pointers returned by this allocator.
#[inline(always)]
pub fn get_pool_tag<T>(ptr: *const T) -> Tag {
    ((ptr as usize) >> POOL_SHIFT) as Tag
}

/// The base address of the pool with tag `tag`
#[inline(always)]
pub const fn pool_base(tag: Tag) -> usize {
    (tag as usize) << POOL_SHIFT
}

/// The pool tag probed after `tag`, wrapping back to 1 after
/// [`MAX_POOL_TAG`] (tag 0 is never a pool).
pub const fn next_pool_tag(tag: Tag) -> Tag {
    if tag >= MAX_POOL_TAG {
        1
    } else {
        tag + 1
    }
}
