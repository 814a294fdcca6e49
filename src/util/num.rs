/// Round up `n` to the nearest multiple of `to`, or `None` on overflow. `to`
/// need not be a power of two.
pub const fn round_up(n: usize, to: usize) -> Option<usize> {
    match n.checked_add(to - 1) {
        Some(m) => Some(m / to * to),
        None => None,
    }
}

/// Align `n` up to `align`, which must be a power of two. `None` on overflow.
#[inline(always)]
pub const fn align_up(n: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    match n.checked_add(align - 1) {
        Some(m) => Some(m & !(align - 1)),
        None => None,
    }
}

/// Align `n` down to `align`, which must be a power of two
#[inline(always)]
pub const fn align_down(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    n & !(align - 1)
}

/// Test if `n` is a multiple of `align` (a power of two)
#[inline(always)]
pub const fn is_aligned(n: usize, align: usize) -> bool {
    n & (align - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn round_up_computes_correctly() {
        assert_eq!(round_up(9, 4), Some(12));
        assert_eq!(round_up(8, 4), Some(8));
        assert_eq!(round_up(0, 4096), Some(0));
        assert_eq!(round_up(4097, 4096), Some(8192));
        assert_eq!(round_up(10, 3), Some(12));
        assert_eq!(round_up(usize::MAX, 4096), None);
    }

    #[test]
    pub fn align_up_and_down() {
        assert_eq!(align_up(40 + 16, 16), Some(64));
        assert_eq!(align_up(64, 16), Some(64));
        assert_eq!(align_up(usize::MAX - 3, 16), None);
        assert_eq!(align_down(70, 16), 64);
        assert!(is_aligned(0x1_0000_0000, 1 << 32));
        assert!(!is_aligned(0x1_0000_0010, 1 << 32));
    }
}
