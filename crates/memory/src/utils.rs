//! Utility functions and helpers for mosaic-memory
//!
//! Alignment arithmetic shared by the interval validator, the region
//! frontier computation and the first-fit allocator, plus size formatting
//! for diagnostics.

/// Aligns a value up to the nearest multiple of alignment
///
/// # Examples
/// ```
/// use mosaic_memory::utils::align_up;
///
/// assert_eq!(align_up(7, 8), 8);
/// assert_eq!(align_up(8, 8), 8);
/// assert_eq!(align_up(9, 8), 16);
/// ```
#[inline(always)]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Aligns a value up, returning `None` instead of wrapping past `usize::MAX`
#[inline(always)]
pub const fn checked_align_up(value: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two());
    match value.checked_add(alignment - 1) {
        Some(bumped) => Some(bumped & !(alignment - 1)),
        None => None,
    }
}

/// Aligns a value down to the nearest multiple of alignment
///
/// # Examples
/// ```
/// use mosaic_memory::utils::align_down;
///
/// assert_eq!(align_down(7, 8), 0);
/// assert_eq!(align_down(9, 8), 8);
/// ```
#[inline(always)]
pub const fn align_down(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// Checks if a value is aligned to the given alignment
///
/// # Examples
/// ```
/// use mosaic_memory::utils::is_aligned;
///
/// assert!(is_aligned(4096, 4096));
/// assert!(!is_aligned(3072, 4096));
/// ```
#[inline(always)]
pub const fn is_aligned(value: usize, alignment: usize) -> bool {
    debug_assert!(alignment.is_power_of_two());
    value & (alignment - 1) == 0
}

/// Format bytes into human-readable string
///
/// # Examples
/// ```
/// use mosaic_memory::utils::format_bytes;
///
/// assert_eq!(format_bytes(512), "512 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// assert_eq!(format_bytes(2 * 1024 * 1024), "2.00 MB");
/// ```
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_down(8191, 4096), 4096);
        assert!(is_aligned(2 * 1024 * 1024, 4096));
    }

    #[test]
    fn test_checked_align_up_overflow() {
        assert_eq!(checked_align_up(usize::MAX, 4096), None);
        assert_eq!(checked_align_up(4095, 4096), Some(4096));
    }

    #[test]
    fn test_format_bytes_units() {
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
        assert_eq!(format_bytes(0), "0 B");
    }
}
