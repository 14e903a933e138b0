/// Align `val` up to the next multiple of `align`. `align` must be a power
/// of two.
pub const fn raw_align_up(val: usize, align: usize) -> usize {
    // See https://github.com/immunant/c2rust/issues/266
    val.wrapping_add(align).wrapping_sub(1) & !align.wrapping_sub(1)
}

/// Align `val` down to a multiple of `align`. `align` must be a power of two.
pub const fn raw_align_down(val: usize, align: usize) -> usize {
    val & !align.wrapping_sub(1)
}

/// Is `val` a multiple of `align`? `align` must be a power of two.
pub const fn raw_is_aligned(val: usize, align: usize) -> bool {
    val & align.wrapping_sub(1) == 0
}

/// The largest power of two that is less than or equal to `n`. `n` must be
/// non-zero.
pub const fn round_down_power_of_two(n: usize) -> usize {
    debug_assert!(n > 0);
    1 << (usize::BITS - 1 - n.leading_zeros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(raw_align_up(0, 8), 0);
        assert_eq!(raw_align_up(1, 8), 8);
        assert_eq!(raw_align_up(8, 8), 8);
        assert_eq!(raw_align_up(4095, 4096), 4096);
        assert_eq!(raw_align_up(4097, 4096), 8192);
    }

    #[test]
    fn test_align_down() {
        assert_eq!(raw_align_down(0, 8), 0);
        assert_eq!(raw_align_down(7, 8), 0);
        assert_eq!(raw_align_down(4097, 4096), 4096);
    }

    #[test]
    fn test_is_aligned() {
        assert!(raw_is_aligned(0, 8));
        assert!(raw_is_aligned(4096, 4096));
        assert!(!raw_is_aligned(4100, 4096));
    }

    #[test]
    fn test_round_down_power_of_two() {
        assert_eq!(round_down_power_of_two(1), 1);
        assert_eq!(round_down_power_of_two(2), 2);
        assert_eq!(round_down_power_of_two(3), 2);
        assert_eq!(round_down_power_of_two(8), 8);
        assert_eq!(round_down_power_of_two(31), 16);
    }
}
