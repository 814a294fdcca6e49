//! The C ABI. Instrumented code calls the `__tagged_*` functions in place of
//! `malloc()` and friends, and `__tagpool_deref()` before guarded accesses.

use libc::{c_void, size_t};

use crate::{
    api,
    deref::CounterPolicy,
    tag::{get_pool_tag, Tag},
};

#[no_mangle]
pub extern "C" fn __tagged_malloc(call_site: Tag, size: size_t) -> *mut c_void {
    api::allocate_tagged(call_site, size).cast()
}

#[no_mangle]
pub extern "C" fn __tagged_calloc(call_site: Tag, nmemb: size_t, size: size_t) -> *mut c_void {
    api::zero_allocate_tagged(call_site, nmemb, size).cast()
}

#[no_mangle]
pub unsafe extern "C" fn __tagged_realloc(
    call_site: Tag,
    ptr: *mut c_void,
    size: size_t,
) -> *mut c_void {
    api::resize_tagged(call_site, ptr.cast(), size).cast()
}

#[no_mangle]
pub unsafe extern "C" fn __tagged_free(ptr: *mut c_void) {
    api::release(ptr.cast())
}

#[no_mangle]
pub extern "C" fn __tagpool_deref(ptr: *const c_void, return_address: usize) {
    api::on_dereference(ptr, return_address)
}

/// Counters wrap, as AFL's do. A null `map` stops recording.
#[no_mangle]
pub unsafe extern "C" fn __tagpool_set_feedback_map(map: *mut u8, len: size_t) {
    api::set_feedback_map(map, len, CounterPolicy::Wrapping)
}

#[no_mangle]
pub extern "C" fn __tagpool_get_pool_tag(ptr: *const c_void) -> Tag {
    get_pool_tag(ptr)
}

/// Replace the process allocator. Everything lands in the default pool.
#[cfg(feature = "interpose")]
pub mod interpose {
    use std::{mem::size_of, ptr};

    use libc::{c_int, c_void, size_t};

    use crate::{
        api,
        error::AlignmentError,
        os::{mem::page_size, set_errno},
    };

    #[no_mangle]
    pub extern "C" fn malloc(size: size_t) -> *mut c_void {
        api::allocate(size).cast()
    }

    #[no_mangle]
    pub extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut c_void {
        api::zero_allocate(nmemb, size).cast()
    }

    #[no_mangle]
    pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
        api::resize(ptr.cast(), size).cast()
    }

    #[no_mangle]
    pub unsafe extern "C" fn free(ptr: *mut c_void) {
        api::release(ptr.cast())
    }

    #[no_mangle]
    pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> size_t {
        api::usable_size(ptr.cast())
    }

    // Chunks are 16-byte aligned. The aligned entry points serve anything
    // up to that and refuse the rest with ENOMEM, so memory from them is
    // always ours to free.

    fn aligned_or_null(result: Result<*mut u8, AlignmentError>) -> *mut c_void {
        match result {
            Ok(mem) => mem.cast(),
            Err(err) => {
                set_errno(err.errno());
                ptr::null_mut()
            }
        }
    }

    #[no_mangle]
    pub unsafe extern "C" fn posix_memalign(
        memptr: *mut *mut c_void,
        alignment: size_t,
        size: size_t,
    ) -> c_int {
        if memptr.is_null() || alignment < size_of::<*mut c_void>() {
            return libc::EINVAL;
        }
        match api::aligned_allocate(alignment, size) {
            Err(err) => err.errno(),
            Ok(mem) if mem.is_null() && size != 0 => libc::ENOMEM,
            Ok(mem) => {
                *memptr = mem.cast();
                0
            }
        }
    }

    #[no_mangle]
    pub extern "C" fn aligned_alloc(alignment: size_t, size: size_t) -> *mut c_void {
        // C11: the size must be a multiple of the alignment
        if alignment.is_power_of_two() && size % alignment != 0 {
            set_errno(libc::EINVAL);
            return ptr::null_mut();
        }
        aligned_or_null(api::aligned_allocate(alignment, size))
    }

    #[no_mangle]
    pub extern "C" fn memalign(alignment: size_t, size: size_t) -> *mut c_void {
        aligned_or_null(api::aligned_allocate(alignment, size))
    }

    #[no_mangle]
    pub extern "C" fn valloc(size: size_t) -> *mut c_void {
        aligned_or_null(api::aligned_allocate(page_size(), size))
    }

    #[no_mangle]
    pub extern "C" fn pvalloc(size: size_t) -> *mut c_void {
        aligned_or_null(api::aligned_allocate(page_size(), size))
    }
}
