//! Bounded list of page-size intervals

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::core::{MappedVec, PageSize};
use crate::error::{MemoryError, MemoryResult};
use crate::syscalls::SharedMapper;

/// One declared sub-range of a region, offsets relative to the region base
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    /// First byte covered
    pub start_offset: usize,
    /// One past the last byte covered
    pub end_offset: usize,
    /// Page size backing the range
    pub page_size: PageSize,
}

impl Interval {
    /// Create an interval
    #[must_use]
    pub const fn new(start_offset: usize, end_offset: usize, page_size: PageSize) -> Self {
        Self {
            start_offset,
            end_offset,
            page_size,
        }
    }

    /// Length in bytes; zero when `end_offset <= start_offset`
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end_offset.saturating_sub(self.start_offset)
    }

    /// Whether the interval covers no bytes
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end_offset <= self.start_offset
    }

    /// Whether `offset` falls inside `[start_offset, end_offset)`
    #[must_use]
    pub const fn contains(&self, offset: usize) -> bool {
        self.start_offset <= offset && offset < self.end_offset
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:#x}, {:#x}) {}",
            self.start_offset, self.end_offset, self.page_size
        )
    }
}

/// Append-only list of [`Interval`]s with a capacity fixed at creation.
///
/// Storage is obtained from the injected mapper, so the list never touches
/// the global allocator. Insertion does no checking; run [`sort`] and
/// [`validate`](crate::interval::validate) before driving a region with it.
///
/// [`sort`]: IntervalList::sort
pub struct IntervalList {
    entries: MappedVec<Interval>,
}

impl IntervalList {
    /// Create an empty list able to hold `capacity` intervals
    pub fn new(mapper: SharedMapper, capacity: usize) -> MemoryResult<Self> {
        Ok(Self {
            entries: MappedVec::with_capacity(mapper, capacity, "interval list")?,
        })
    }

    /// Append an interval
    pub fn add_interval(
        &mut self,
        start_offset: usize,
        end_offset: usize,
        page_size: PageSize,
    ) -> MemoryResult<()> {
        self.entries
            .push(Interval::new(start_offset, end_offset, page_size))
    }

    /// Sort ascending by start offset.
    ///
    /// Stable (ties keep insertion order) and in place, so sorting a sorted
    /// list leaves it untouched.
    pub fn sort(&mut self) {
        let entries = self.entries.as_mut_slice();
        for unsorted in 1..entries.len() {
            let mut slot = unsorted;
            while slot > 0 && entries[slot - 1].start_offset > entries[slot].start_offset {
                entries.swap(slot - 1, slot);
                slot -= 1;
            }
        }
    }

    /// Interval at `index`
    pub fn at(&self, index: usize) -> MemoryResult<Interval> {
        self.entries.get(index).ok_or(MemoryError::OutOfRange {
            index,
            len: self.entries.len(),
        })
    }

    /// Number of intervals
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list holds no intervals
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of intervals
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    /// Intervals in their current order
    #[must_use]
    pub fn as_slice(&self) -> &[Interval] {
        self.entries.as_slice()
    }

    /// Iterate intervals in their current order
    pub fn iter(&self) -> impl Iterator<Item = &Interval> {
        self.entries.as_slice().iter()
    }

    /// Interval covering `offset`, if any
    #[must_use]
    pub fn find(&self, offset: usize) -> Option<&Interval> {
        self.iter().find(|interval| interval.contains(offset))
    }
}

impl fmt::Debug for IntervalList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<'a> IntoIterator for &'a IntervalList {
    type Item = &'a Interval;
    type IntoIter = core::slice::Iter<'a, Interval>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.as_slice().iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::size::{GB, MB};
    use crate::syscalls::testing::RecordingMapper;

    fn list(capacity: usize) -> IntervalList {
        IntervalList::new(RecordingMapper::new(), capacity).unwrap()
    }

    #[test]
    fn test_zero_capacity_fails() {
        assert!(IntervalList::new(RecordingMapper::new(), 0).is_err());
    }

    #[test]
    fn test_add_beyond_capacity() {
        let mut intervals = list(2);
        intervals.add_interval(0, GB, PageSize::HugeLarge).unwrap();
        intervals.add_interval(GB, GB + 2 * MB, PageSize::HugeMedium).unwrap();
        let error = intervals.add_interval(2 * GB, 3 * GB, PageSize::HugeLarge);
        assert!(matches!(error, Err(MemoryError::CapacityExceeded { .. })));
        assert_eq!(intervals.len(), 2);
    }

    #[test]
    fn test_at_out_of_range() {
        let mut intervals = list(4);
        intervals.add_interval(0, 2 * MB, PageSize::HugeMedium).unwrap();
        assert_eq!(intervals.at(0).unwrap().end_offset, 2 * MB);
        assert!(matches!(
            intervals.at(1),
            Err(MemoryError::OutOfRange { index: 1, len: 1 })
        ));
    }

    #[test]
    fn test_sort_is_stable() {
        let mut intervals = list(4);
        intervals.add_interval(4 * MB, 6 * MB, PageSize::HugeMedium).unwrap();
        intervals.add_interval(0, GB, PageSize::HugeLarge).unwrap();
        intervals.add_interval(0, 2 * MB, PageSize::HugeMedium).unwrap();
        intervals.sort();

        let order: Vec<_> = intervals.iter().map(|i| (i.start_offset, i.page_size)).collect();
        assert_eq!(
            order,
            vec![
                (0, PageSize::HugeLarge),
                (0, PageSize::HugeMedium),
                (4 * MB, PageSize::HugeMedium),
            ]
        );
    }

    #[test]
    fn test_find_covering_interval() {
        let mut intervals = list(2);
        intervals.add_interval(GB, 2 * GB, PageSize::HugeMedium).unwrap();
        assert!(intervals.find(GB - 1).is_none());
        assert_eq!(intervals.find(GB).unwrap().page_size, PageSize::HugeMedium);
        assert!(intervals.find(2 * GB).is_none());
    }
}
