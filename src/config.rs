//! Run-time configuration. Everything is read through `libc::getenv()` and
//! parsed by hand: this runs inside the first `malloc()` of the process,
//! where `std::env` (which allocates) would recurse into us.

use std::{ffi::CStr, num::NonZeroUsize};

use once_cell::race::OnceNonZeroUsize;

use crate::{
    alloc::pool::MIN_POOL_SIZE,
    eputln,
    tag::POOL_ALIGNMENT,
    util::num::round_up,
};

/// The pool size environment variable
pub const POOL_SIZE_ENV_VAR: &CStr = c"TAGPOOL_POOL_SIZE";
const POOL_SIZE_ENV_NAME: &str = "TAGPOOL_POOL_SIZE";

/// Default pool size (in bytes)
pub const DEFAULT_POOL_SIZE: usize = 500_000_000;

static POOL_SIZE: OnceNonZeroUsize = OnceNonZeroUsize::new();

/// The size every pool of the process heap is mapped with. Read from
/// [`POOL_SIZE_ENV_VAR`] on first use, falling back to [`DEFAULT_POOL_SIZE`].
pub fn pool_size() -> usize {
    POOL_SIZE
        .get_or_init(|| {
            // SAFETY: the key is NUL-terminated; we copy nothing out of the
            // returned string after this call
            let raw = unsafe { libc::getenv(POOL_SIZE_ENV_VAR.as_ptr()) };
            let value = if raw.is_null() {
                None
            } else {
                // SAFETY: getenv returns a NUL-terminated string
                Some(unsafe { CStr::from_ptr(raw) }.to_bytes())
            };
            NonZeroUsize::new(pool_size_from(value)).unwrap_or(NonZeroUsize::MIN)
        })
        .get()
}

/// Resolve a raw pool size setting into the size pools are created with.
/// Anything unparsable, zero or too large for one pool region falls back to
/// the default. Sizes are rounded up to a multiple of the page size, and
/// never below [`MIN_POOL_SIZE`].
pub fn pool_size_from(value: Option<&[u8]>) -> usize {
    let size = match value {
        None => DEFAULT_POOL_SIZE,
        Some(raw) => match parse_usize(raw) {
            Some(n) if n > 0 && n <= POOL_ALIGNMENT => n,
            _ => {
                // No `log` here: a logger that allocates would land right
                // back in the first pool creation
                eputln!(
                    "tagpool: ignoring {}=\"{}\", using {} bytes",
                    POOL_SIZE_ENV_NAME,
                    raw.escape_ascii(),
                    DEFAULT_POOL_SIZE
                );
                DEFAULT_POOL_SIZE
            }
        },
    };
    clamp_pool_size(size)
}

/// Round `size` to something a pool can actually be mapped with
pub fn clamp_pool_size(size: usize) -> usize {
    let page = crate::os::mem::page_size();
    let size = round_up(size.max(MIN_POOL_SIZE), page).unwrap_or(POOL_ALIGNMENT);
    size.min(POOL_ALIGNMENT)
}

/// Parse an unsigned integer the way `strtoul(s, &end, 0)` does when the
/// whole string must be consumed: `0x`/`0X` prefix for hex, a leading `0`
/// for octal, decimal otherwise. Surrounding whitespace is not accepted.
pub fn parse_usize(s: &[u8]) -> Option<usize> {
    let (digits, radix) = match s {
        [b'0', b'x' | b'X', rest @ ..] => (rest, 16),
        [b'0', rest @ ..] if !rest.is_empty() => (rest, 8),
        _ => (s, 10),
    };
    if digits.is_empty() {
        return None;
    }
    digits.iter().try_fold(0usize, |acc, &byte| {
        let digit = (byte as char).to_digit(radix)? as usize;
        acc.checked_mul(radix as usize)?.checked_add(digit)
    })
}
