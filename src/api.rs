//! The process-wide allocation API. Each function forwards to [`HEAP`]; the
//! untagged ones use [`DEFAULT_TAG`].

use crate::{
    alloc::HEAP,
    deref::CounterPolicy,
    error::AlignmentError,
    tag::{Tag, DEFAULT_TAG},
};

pub fn allocate_tagged(call_site: Tag, size: usize) -> *mut u8 {
    HEAP.allocate(call_site, size)
}

pub fn zero_allocate_tagged(call_site: Tag, nmemb: usize, size: usize) -> *mut u8 {
    HEAP.zero_allocate(call_site, nmemb, size)
}

/// # Safety
/// `ptr` must be null or a live allocation from the process heap
pub unsafe fn resize_tagged(call_site: Tag, ptr: *mut u8, new_size: usize) -> *mut u8 {
    HEAP.resize(call_site, ptr, new_size)
}

/// # Safety
/// `ptr` must be null or a live allocation from the process heap
pub unsafe fn release(ptr: *mut u8) {
    HEAP.release(ptr)
}

pub fn allocate(size: usize) -> *mut u8 {
    allocate_tagged(DEFAULT_TAG, size)
}

pub fn zero_allocate(nmemb: usize, size: usize) -> *mut u8 {
    zero_allocate_tagged(DEFAULT_TAG, nmemb, size)
}

pub fn aligned_allocate(alignment: usize, size: usize) -> Result<*mut u8, AlignmentError> {
    HEAP.aligned_allocate(DEFAULT_TAG, alignment, size)
}

/// # Safety
/// As [`resize_tagged`]
pub unsafe fn resize(ptr: *mut u8, new_size: usize) -> *mut u8 {
    resize_tagged(DEFAULT_TAG, ptr, new_size)
}

/// # Safety
/// As [`release`]
pub unsafe fn usable_size(ptr: *mut u8) -> usize {
    HEAP.usable_size(ptr)
}

#[inline]
pub fn on_dereference<T>(ptr: *const T, return_address: usize) {
    HEAP.on_dereference(ptr, return_address)
}

/// Install the counter map dereferences are recorded into
///
/// # Safety
/// See [`Recorder::install`](crate::deref::Recorder::install)
pub unsafe fn set_feedback_map(map: *mut u8, len: usize, policy: CounterPolicy) {
    HEAP.recorder().install(map, len, policy)
}
