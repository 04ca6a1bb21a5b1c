//! Address alignment helpers. All alignments must be powers of two.

use crate::config::PAGE_SIZE;

/// Align `value` upwards to `align`, or `None` on overflow.
#[inline]
#[must_use]
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Align `value` upwards to `align`.
///
/// The caller guarantees the result does not overflow.
#[inline]
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

/// Align `value` downwards to `align`.
#[inline]
#[must_use]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

#[inline]
#[must_use]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    debug_assert!(align.is_power_of_two());
    value & (align - 1) == 0
}

/// Bytes needed to move `addr` up to the next page boundary (zero if aligned).
#[inline]
#[must_use]
pub const fn page_padding(addr: usize) -> usize {
    align_up(addr, PAGE_SIZE) - addr
}
