pub mod mem;

/// Set the calling thread's `errno`
#[inline]
pub fn set_errno(errno: i32) {
    // SAFETY: `__errno_location()` always returns a valid thread-local
    unsafe { *libc::__errno_location() = errno }
}

/// Read the calling thread's `errno`
#[inline]
pub fn errno() -> i32 {
    // SAFETY: as above
    unsafe { *libc::__errno_location() }
}
