//! Layout validation
//!
//! [`validate`] is pure: it reads the list, never reorders it, and reports
//! the first rule an interval breaks. Rules are applied over the list in
//! ascending start order regardless of how it is currently stored.
//!
//! Per interval, in this order:
//! 1. page size is 2 MiB or 1 GiB
//! 2. start offset is base-page aligned
//! 3. length is a positive multiple of the page size
//!
//! Then, per adjacent pair, the gap from one interval's end to the next one's
//! start must be non-negative and a whole number of pages: 1 GiB pages
//! between two 1 GiB windows, 2 MiB pages otherwise.

use thiserror::Error;

use super::{Interval, IntervalList};
use crate::core::PageSize;
use crate::utils::is_aligned;

/// Why a layout was rejected.
///
/// `index` is the position of the offending interval in the list as stored
/// (for pair rules, the later interval of the pair).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutViolation {
    #[error("INVALID_PAGE_SIZE: interval {index} is not a 2MB or 1GB window")]
    InvalidPageSize { index: usize },

    #[error("INVALID_1GB_START_OFFSET: interval {index} starts off a base page boundary")]
    InvalidLargeStartOffset { index: usize },

    #[error("INVALID_2MB_START_OFFSET: interval {index} starts off a base page boundary")]
    InvalidMediumStartOffset { index: usize },

    #[error("SIZE_OF_1GB_INTERVAL_ERROR: interval {index} is not a positive multiple of 1GB")]
    LargeIntervalSize { index: usize },

    #[error("SIZE_OF_2MB_INTERVAL_ERROR: interval {index} is not a positive multiple of 2MB")]
    MediumIntervalSize { index: usize },

    #[error("OFFSET_BETWEEN_TWO_1GB_INTERVALS_ERROR: interval {index} overlaps or is misplaced after the previous 1GB window")]
    LargeGap { index: usize },

    #[error("OFFSET_BETWEEN_TWO_2MB_INTERVALS_ERROR: interval {index} overlaps or is misplaced after the previous 2MB window")]
    MediumGap { index: usize },

    #[error("OFFSET_BETWEEN_1GB_AND_2MB_INTERVALS_ERROR: interval {index} overlaps or is misplaced after a window of the other size")]
    MixedGap { index: usize },
}

impl LayoutViolation {
    /// Outcome name as reported by operator tooling
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidPageSize { .. } => "INVALID_PAGE_SIZE",
            Self::InvalidLargeStartOffset { .. } => "INVALID_1GB_START_OFFSET",
            Self::InvalidMediumStartOffset { .. } => "INVALID_2MB_START_OFFSET",
            Self::LargeIntervalSize { .. } => "SIZE_OF_1GB_INTERVAL_ERROR",
            Self::MediumIntervalSize { .. } => "SIZE_OF_2MB_INTERVAL_ERROR",
            Self::LargeGap { .. } => "OFFSET_BETWEEN_TWO_1GB_INTERVALS_ERROR",
            Self::MediumGap { .. } => "OFFSET_BETWEEN_TWO_2MB_INTERVALS_ERROR",
            Self::MixedGap { .. } => "OFFSET_BETWEEN_1GB_AND_2MB_INTERVALS_ERROR",
        }
    }

    /// Position of the offending interval in the list
    #[must_use]
    pub const fn index(&self) -> usize {
        match *self {
            Self::InvalidPageSize { index }
            | Self::InvalidLargeStartOffset { index }
            | Self::InvalidMediumStartOffset { index }
            | Self::LargeIntervalSize { index }
            | Self::MediumIntervalSize { index }
            | Self::LargeGap { index }
            | Self::MediumGap { index }
            | Self::MixedGap { index } => index,
        }
    }
}

/// Check a layout. `Ok(())` means every rule holds; an empty list is valid.
pub fn validate(list: &IntervalList) -> Result<(), LayoutViolation> {
    let entries = list.as_slice();

    for index in SortedOrder::new(entries) {
        check_interval(index, &entries[index])?;
    }

    let mut previous: Option<usize> = None;
    for index in SortedOrder::new(entries) {
        if let Some(prev) = previous {
            check_gap(&entries[prev], index, &entries[index])?;
        }
        previous = Some(index);
    }
    Ok(())
}

fn check_interval(index: usize, interval: &Interval) -> Result<(), LayoutViolation> {
    let (start_error, size_error) = match interval.page_size {
        PageSize::HugeLarge => (
            LayoutViolation::InvalidLargeStartOffset { index },
            LayoutViolation::LargeIntervalSize { index },
        ),
        PageSize::HugeMedium => (
            LayoutViolation::InvalidMediumStartOffset { index },
            LayoutViolation::MediumIntervalSize { index },
        ),
        PageSize::Base => return Err(LayoutViolation::InvalidPageSize { index }),
    };

    if !is_aligned(interval.start_offset, PageSize::Base.bytes()) {
        return Err(start_error);
    }
    if interval.is_empty() || !is_aligned(interval.len(), interval.page_size.bytes()) {
        return Err(size_error);
    }
    Ok(())
}

fn check_gap(previous: &Interval, index: usize, next: &Interval) -> Result<(), LayoutViolation> {
    let (granularity, error) = match (previous.page_size, next.page_size) {
        (PageSize::HugeLarge, PageSize::HugeLarge) => {
            (PageSize::HugeLarge, LayoutViolation::LargeGap { index })
        }
        (PageSize::HugeMedium, PageSize::HugeMedium) => {
            (PageSize::HugeMedium, LayoutViolation::MediumGap { index })
        }
        _ => (PageSize::HugeMedium, LayoutViolation::MixedGap { index }),
    };

    match next.start_offset.checked_sub(previous.end_offset) {
        Some(gap) if is_aligned(gap, granularity.bytes()) => Ok(()),
        _ => Err(error),
    }
}

/// Indices of `entries` in ascending `(start_offset, index)` order.
///
/// Quadratic, but lists hold a handful of windows and this keeps the
/// validator free of allocation and of mutation.
struct SortedOrder<'a> {
    entries: &'a [Interval],
    last: Option<(usize, usize)>,
}

impl<'a> SortedOrder<'a> {
    fn new(entries: &'a [Interval]) -> Self {
        Self {
            entries,
            last: None,
        }
    }
}

impl Iterator for SortedOrder<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let last = self.last;
        let (start, index) = self
            .entries
            .iter()
            .enumerate()
            .map(|(index, interval)| (interval.start_offset, index))
            .filter(|key| last.is_none_or(|last| *key > last))
            .min()?;
        self.last = Some((start, index));
        Some(index)
    }
}
