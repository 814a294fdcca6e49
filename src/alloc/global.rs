use std::alloc::{GlobalAlloc, Layout};

use super::{
    chunk::CHUNK_ALIGNMENT,
    heap::{Heap, HEAP},
};
use crate::tag::{Tag, DEFAULT_TAG};

/// A Rust allocator drawing from one call site's pool.
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: TaggedAlloc = TaggedAlloc::new(DEFAULT_TAG);
/// ```
///
/// Layouts aligned to more than 16 bytes are refused with a null pointer.
#[derive(Clone, Copy)]
pub struct TaggedAlloc {
    /// `None` means the process heap
    heap: Option<&'static Heap>,
    call_site: Tag,
}

impl TaggedAlloc {
    pub const fn new(call_site: Tag) -> Self {
        Self {
            heap: None,
            call_site,
        }
    }

    pub const fn with_heap(heap: &'static Heap, call_site: Tag) -> Self {
        Self {
            heap: Some(heap),
            call_site,
        }
    }

    pub fn heap(&self) -> &'static Heap {
        self.heap.unwrap_or(&HEAP)
    }

    pub fn call_site(&self) -> Tag {
        self.call_site
    }
}

impl Default for TaggedAlloc {
    fn default() -> Self {
        Self::new(DEFAULT_TAG)
    }
}

unsafe impl GlobalAlloc for TaggedAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > CHUNK_ALIGNMENT {
            return std::ptr::null_mut();
        }
        self.heap().allocate(self.call_site, layout.size())
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > CHUNK_ALIGNMENT {
            return std::ptr::null_mut();
        }
        self.heap().zero_allocate(self.call_site, 1, layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _: Layout) {
        self.heap().release(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > CHUNK_ALIGNMENT {
            return std::ptr::null_mut();
        }
        self.heap().resize(self.call_site, ptr, new_size)
    }
}
