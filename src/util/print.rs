//! Printing that never allocates. Once `interpose` is on, *we* are `malloc()`,
//! so anything on the failure path must get by with the stack and raw `write`.

use std::fmt::{self, Write};

/// Size of the line buffer used by [`eput`]
pub const LINE_BUF_SIZE: usize = 512;

/// A fixed-capacity byte buffer implementing [`fmt::Write`]. Anything written
/// past the capacity is dropped, never reallocated.
pub struct StackBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> StackBuf<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Was anything dropped?
    pub fn is_full(&self) -> bool {
        self.len == N
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(N - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
    }
}

impl<const N: usize> Default for StackBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Write for StackBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_bytes(s.as_bytes());
        Ok(())
    }
}

/// `write(2)`... but safe (doesn't use the allocator). Short writes and
/// errors are ignored, this is best-effort diagnostics.
pub fn putstr(bytes: &[u8]) {
    // SAFETY: `bytes` is a valid slice for reads of `bytes.len()` bytes
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len());
    }
}

/// Format `args` into a stack buffer and write it to stderr, with a newline
pub fn eput(args: fmt::Arguments<'_>) {
    let mut line = StackBuf::<LINE_BUF_SIZE>::new();
    _ = line.write_fmt(args);
    if line.is_full() {
        line.len -= 1;
    }
    line.push_bytes(b"\n");
    putstr(line.as_bytes());
}

/// Basically just `eprintln!()`, minus the allocation and the stderr lock
#[macro_export]
macro_rules! eputln {
    ($($arg:tt)*) => {
        $crate::util::print::eput(::std::format_args!($($arg)*))
    };
}

/// Report `err` on stderr and abort the process. Used for every condition
/// the allocator cannot recover from: exhaustion and corruption.
#[cold]
#[inline(never)]
pub fn fatal(err: &dyn fmt::Display) -> ! {
    eput(format_args!("tagpool: fatal: {err}"));
    // SAFETY: always safe to call
    unsafe { libc::abort() }
}

#[cfg(test)]
mod tests {
    use std::fmt::Write;

    use super::StackBuf;

    #[test]
    fn stack_buf_truncates_instead_of_growing() {
        let mut buf = StackBuf::<8>::new();
        write!(buf, "pool {:#x}", 0x1000).unwrap();
        assert_eq!(buf.as_bytes(), b"pool 0x1");
        assert!(buf.is_full());
    }

    #[test]
    fn stack_buf_formats_short_lines_whole() {
        let mut buf = StackBuf::<64>::new();
        write!(buf, "{} + {}", 1, 2).unwrap();
        assert_eq!(buf.as_bytes(), b"1 + 2");
        assert!(!buf.is_full());
    }
}
