//! Huge-page backed regions
//!
//! A [`HugePageRegion`] reserves its whole address range once, as an
//! inaccessible non-resident placeholder, then commits and releases a prefix
//! of it on demand. Each byte of the prefix is backed by the page size its
//! offset falls in: one of the two huge windows of the [`RegionLayout`], or
//! base pages everywhere else.
//!
//! # Frontier
//!
//! Huge pages are mapped whole. The region therefore tracks two lengths: the
//! requested [`size`](HugePageRegion::size) and the page-granular
//! [`mapped_len`](HugePageRegion::mapped_len), which is `size` rounded up to
//! the end of the page containing its last byte. Growing maps only
//! `[mapped_len, new frontier)`; shrinking replaces only
//! `[new frontier, mapped_len)` with a placeholder. Bytes below the frontier
//! are never remapped, so their contents survive every resize.
//!
//! # Placement
//!
//! Huge mappings must start on a boundary of their page size. A region that
//! picks its own address over-reserves by one page of the largest window
//! size and places its base so that every window is aligned. A caller-fixed
//! base must already satisfy this.

use core::fmt;
use core::ptr::NonNull;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::PageSize;
use crate::error::{MemoryError, MemoryResult};
use crate::interval::{IntervalList, validate};
use crate::syscalls::{MapRequest, SharedMapper};
use crate::utils::{align_up, checked_align_up, is_aligned};

/// Maximum size and huge-page windows of one region.
///
/// Offsets are relative to the region base. A window with `start == end` is
/// absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionLayout {
    /// Hard ceiling for [`HugePageRegion::resize`]
    pub max_size: usize,
    /// 1 GiB window start
    pub large_start: usize,
    /// 1 GiB window end
    pub large_end: usize,
    /// 2 MiB window start
    pub medium_start: usize,
    /// 2 MiB window end
    pub medium_end: usize,
}

impl RegionLayout {
    /// Layout without huge windows
    #[must_use]
    pub const fn new(max_size: usize) -> Self {
        Self {
            max_size,
            large_start: 0,
            large_end: 0,
            medium_start: 0,
            medium_end: 0,
        }
    }

    /// Set the 1 GiB window
    #[must_use]
    pub const fn with_large_window(mut self, start: usize, end: usize) -> Self {
        self.large_start = start;
        self.large_end = end;
        self
    }

    /// Set the 2 MiB window
    #[must_use]
    pub const fn with_medium_window(mut self, start: usize, end: usize) -> Self {
        self.medium_start = start;
        self.medium_end = end;
        self
    }

    /// Windows that are present, as `(start, end, page size)`
    pub fn windows(&self) -> impl Iterator<Item = (usize, usize, PageSize)> + use<> {
        [
            (self.large_start, self.large_end, PageSize::HugeLarge),
            (self.medium_start, self.medium_end, PageSize::HugeMedium),
        ]
        .into_iter()
        .filter(|(start, end, _)| start != end)
    }

    /// Build and validate the sorted interval plan for this layout
    pub fn plan(&self, mapper: SharedMapper) -> MemoryResult<IntervalList> {
        let mut plan = IntervalList::new(mapper, 2)?;
        for (start, end, page_size) in self.windows() {
            plan.add_interval(start, end, page_size)?;
        }
        plan.sort();
        validate(&plan)?;

        if let Some(window) = plan.iter().find(|w| w.end_offset > self.max_size) {
            return Err(MemoryError::invalid_config(format!(
                "window {window} ends beyond the region maximum of {:#x}",
                self.max_size
            )));
        }
        Ok(plan)
    }
}

/// Contiguous offsets backed by a single page size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    start: usize,
    end: usize,
    page_size: PageSize,
}

/// Fixed-base address range with a resizable, layout-driven committed prefix
pub struct HugePageRegion {
    base: NonNull<u8>,
    max_size: usize,
    /// Page-aligned extent of the reservation
    reserved: usize,
    size: usize,
    mapped: usize,
    plan: IntervalList,
    mapper: SharedMapper,
}

// SAFETY: the region exclusively owns its reservation; the raw base pointer
// is only an address and carries no thread affinity.
unsafe impl Send for HugePageRegion {}

impl HugePageRegion {
    /// Reserve a region for `layout`.
    ///
    /// With `fixed_base` the reservation is placed exactly there and fails if
    /// anything already occupies the range. Nothing is committed: the region
    /// starts with size zero.
    pub fn new(
        layout: RegionLayout,
        mapper: SharedMapper,
        fixed_base: Option<NonNull<u8>>,
    ) -> MemoryResult<Self> {
        if layout.max_size == 0 {
            return Err(MemoryError::invalid_config("region max size must be non-zero"));
        }
        let plan = layout.plan(mapper.clone())?;
        let reserved = checked_align_up(layout.max_size, PageSize::Base.bytes())
            .ok_or_else(|| MemoryError::invalid_config("region max size overflows"))?;

        let base = match fixed_base {
            Some(base) => {
                check_placement(base.as_ptr() as usize, &plan)?;
                // SAFETY: FIXED_NOREPLACE never discards existing mappings.
                unsafe { mapper.map(&MapRequest::placeholder_at(base, reserved)) }
                    .map_err(|source| reserve_failed(reserved, source))?
            }
            None => reserve_aligned(&mapper, &plan, reserved)?,
        };

        debug!(
            base = format_args!("{:p}", base),
            max_size = layout.max_size,
            windows = plan.len(),
            "reserved region"
        );

        Ok(Self {
            base,
            max_size: layout.max_size,
            reserved,
            size: 0,
            mapped: 0,
            plan,
            mapper,
        })
    }

    /// Grow or shrink the committed prefix to `new_size` bytes.
    ///
    /// On a failed grow, [`size`](Self::size) covers exactly the pages that
    /// were mapped before the failure. On a failed shrink nothing changes.
    pub fn resize(&mut self, new_size: usize) -> MemoryResult<()> {
        if new_size > self.max_size {
            return Err(MemoryError::ExceedsMaxSize {
                size: new_size,
                max_size: self.max_size,
            });
        }
        if new_size == self.size {
            return Ok(());
        }
        if new_size > self.size {
            self.grow(new_size)
        } else {
            self.shrink(new_size)
        }
    }

    fn grow(&mut self, new_size: usize) -> MemoryResult<()> {
        let target = self.frontier(new_size);
        while self.mapped < target {
            let segment = self.segment_at(self.mapped);
            let end = segment.end.min(target);
            let len = end - self.mapped;
            let addr = self.address_of(self.mapped);

            // SAFETY: `[mapped, end)` lies inside our reservation and is
            // still a placeholder, so nothing live is replaced.
            let result = unsafe {
                self.mapper
                    .map(&MapRequest::commit(addr, len, segment.page_size))
            };
            if let Err(source) = result {
                warn!(
                    offset = self.mapped,
                    len,
                    page_size = %segment.page_size,
                    error = %source,
                    "failed to commit region pages"
                );
                self.size = new_size.min(self.mapped);
                return Err(MemoryError::MapFailed {
                    offset: self.mapped,
                    len,
                    page_size: segment.page_size,
                    source,
                });
            }
            debug!(offset = self.mapped, len, page_size = %segment.page_size, "committed");
            self.mapped = end;
        }
        self.size = new_size;
        Ok(())
    }

    fn shrink(&mut self, new_size: usize) -> MemoryResult<()> {
        let frontier = self.frontier(new_size);
        if frontier < self.mapped {
            let len = self.mapped - frontier;
            // SAFETY: `[frontier, mapped)` is committed memory of this region
            // above the new size; callers no longer use it.
            unsafe {
                self.mapper.map(&MapRequest::placeholder(
                    Some(self.address_of(frontier)),
                    len,
                ))
            }
            .map_err(|source| MemoryError::UnmapFailed {
                offset: frontier,
                len,
                source,
            })?;
            debug!(offset = frontier, len, "released");
            self.mapped = frontier;
        }
        self.size = new_size;
        Ok(())
    }

    /// End of the page holding byte `size - 1`, zero for an empty prefix
    fn frontier(&self, size: usize) -> usize {
        if size == 0 {
            return 0;
        }
        let segment = self.segment_at(size - 1);
        let page = segment.page_size.bytes();
        (segment.start + align_up(size - segment.start, page)).min(segment.end)
    }

    fn segment_at(&self, offset: usize) -> Segment {
        let mut start = 0;
        let mut end = self.reserved;
        for window in &self.plan {
            if window.contains(offset) {
                return Segment {
                    start: window.start_offset,
                    end: window.end_offset,
                    page_size: window.page_size,
                };
            }
            if window.end_offset <= offset {
                start = start.max(window.end_offset);
            } else {
                end = end.min(window.start_offset);
            }
        }
        Segment {
            start,
            end,
            page_size: PageSize::Base,
        }
    }

    fn address_of(&self, offset: usize) -> NonNull<u8> {
        // SAFETY: offsets passed here never exceed `reserved`, the length of
        // the allocation `base` points into.
        unsafe { self.base.add(offset) }
    }

    /// First byte of the region
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Base as an integer address
    #[must_use]
    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Requested committed size
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Page-granular length actually mapped, `>= size()`
    #[must_use]
    pub fn mapped_len(&self) -> usize {
        self.mapped
    }

    /// Hard ceiling on `size()`
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Validated, sorted huge-page windows
    #[must_use]
    pub fn plan(&self) -> &IntervalList {
        &self.plan
    }

    /// Page size backing `offset`
    #[must_use]
    pub fn page_size_at(&self, offset: usize) -> PageSize {
        self.segment_at(offset).page_size
    }

    /// Whether `addr` lies in the reserved range, committed or not
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base_addr();
        addr >= base && addr - base < self.max_size
    }
}

impl fmt::Debug for HugePageRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HugePageRegion")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("mapped", &self.mapped)
            .field("max_size", &self.max_size)
            .field("plan", &self.plan)
            .finish()
    }
}

impl Drop for HugePageRegion {
    fn drop(&mut self) {
        // SAFETY: the reservation `[base, base + reserved)` belongs to us and
        // no references into it outlive the region.
        if let Err(error) = unsafe { self.mapper.unmap(self.base, self.reserved) } {
            warn!(base = format_args!("{:p}", self.base), %error, "failed to release region");
        }
    }
}

/// Page size and offset the base must align, from the largest window
fn placement_anchor(plan: &IntervalList) -> Option<(usize, PageSize)> {
    plan.iter()
        .max_by_key(|window| window.page_size)
        .map(|window| (window.start_offset, window.page_size))
}

fn check_placement(base: usize, plan: &IntervalList) -> MemoryResult<()> {
    for window in plan {
        if !is_aligned(base.wrapping_add(window.start_offset), window.page_size.bytes()) {
            return Err(MemoryError::invalid_config(format!(
                "window {window} is not {} aligned at base {base:#x}",
                window.page_size
            )));
        }
    }
    Ok(())
}

fn reserve_failed(len: usize, source: std::io::Error) -> MemoryError {
    MemoryError::MapFailed {
        offset: 0,
        len,
        page_size: PageSize::Base,
        source,
    }
}

/// Reserve `reserved` bytes at a kernel-chosen address aligned for `plan`,
/// trimming the slack used for alignment.
fn reserve_aligned(
    mapper: &SharedMapper,
    plan: &IntervalList,
    reserved: usize,
) -> MemoryResult<NonNull<u8>> {
    let (anchor, page_size) = placement_anchor(plan).unwrap_or((0, PageSize::Base));
    let pad = if page_size.is_huge() { page_size.bytes() } else { 0 };
    let total = reserved
        .checked_add(pad)
        .ok_or_else(|| MemoryError::invalid_config("region max size overflows"))?;

    // SAFETY: a floating placeholder replaces nothing.
    let raw = unsafe { mapper.map(&MapRequest::placeholder(None, total)) }
        .map_err(|source| reserve_failed(total, source))?;
    let raw_addr = raw.as_ptr() as usize;
    let base_addr = align_up(raw_addr + anchor, page_size.bytes()) - anchor;
    let lead = base_addr - raw_addr;
    let trail = total - lead - reserved;

    // SAFETY: both slack ranges lie inside the placeholder mapped above and
    // are not part of the region.
    unsafe {
        if lead > 0 {
            mapper.unmap(raw, lead)?;
        }
        if trail > 0 {
            mapper.unmap(raw.add(lead + reserved), trail)?;
        }
    }

    // SAFETY: `lead < total`, so the result stays inside the placeholder.
    let base = unsafe { raw.add(lead) };
    check_placement(base_addr, plan)?;
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::size::{GB, KB, MB};
    use crate::syscalls::testing::RecordingMapper;

    #[test]
    fn test_reservation_commits_nothing() {
        let mapper = RecordingMapper::new();
        let region = HugePageRegion::new(RegionLayout::new(64 * MB), mapper.clone(), None).unwrap();
        assert_eq!(region.size(), 0);
        assert_eq!(region.mapped_len(), 0);
        assert!(mapper.huge_requests().is_empty());
        assert!(region.contains(region.base_addr() + 64 * MB - 1));
        assert!(!region.contains(region.base_addr() + 64 * MB));
    }

    #[test]
    fn test_base_aligned_for_medium_window() {
        let layout = RegionLayout::new(16 * MB).with_medium_window(4 * MB, 12 * MB);
        let region = HugePageRegion::new(layout, RecordingMapper::new(), None).unwrap();
        assert!(is_aligned(region.base_addr() + 4 * MB, 2 * MB));
        assert_eq!(region.page_size_at(4 * MB), PageSize::HugeMedium);
        assert_eq!(region.page_size_at(12 * MB), PageSize::Base);
    }

    #[test]
    fn test_grow_maps_whole_huge_pages() {
        let mapper = RecordingMapper::new();
        let layout = RegionLayout::new(8 * MB).with_medium_window(2 * MB, 6 * MB);
        let mut region = HugePageRegion::new(layout, mapper.clone(), None).unwrap();

        region.resize(3 * MB).unwrap();
        assert_eq!(region.size(), 3 * MB);
        assert_eq!(region.mapped_len(), 4 * MB);
        let huge = mapper.huge_requests();
        assert_eq!(huge.len(), 1);
        assert_eq!(huge[0].0, region.base_addr() + 2 * MB);
        assert_eq!(huge[0].1, 2 * MB);

        // Still inside the mapped huge page: nothing new is mapped.
        region.resize(4 * MB).unwrap();
        assert_eq!(mapper.huge_requests().len(), 1);

        region.resize(7 * MB).unwrap();
        assert_eq!(region.mapped_len(), 7 * MB);
    }

    #[test]
    fn test_resize_beyond_max_fails() {
        let mut region =
            HugePageRegion::new(RegionLayout::new(4 * MB), RecordingMapper::new(), None).unwrap();
        let error = region.resize(4 * MB + 1).unwrap_err();
        assert!(matches!(error, MemoryError::ExceedsMaxSize { .. }));
        assert_eq!(region.size(), 0);
    }

    #[test]
    fn test_failed_grow_keeps_successful_prefix() {
        let mapper = RecordingMapper::failing_huge_at(1);
        let layout = RegionLayout::new(16 * MB).with_medium_window(0, 8 * MB);
        let mut region = HugePageRegion::new(layout, mapper, None).unwrap();

        region.resize(2 * MB).unwrap();
        let error = region.resize(6 * MB).unwrap_err();
        assert!(matches!(error, MemoryError::MapFailed { offset, .. } if offset == 2 * MB));
        assert_eq!(region.size(), 2 * MB);
        assert_eq!(region.mapped_len(), 2 * MB);
    }

    #[test]
    fn test_shrink_releases_pages_above_frontier() {
        let mapper = RecordingMapper::new();
        let mut region =
            HugePageRegion::new(RegionLayout::new(64 * KB), mapper.clone(), None).unwrap();
        region.resize(64 * KB).unwrap();
        region.resize(10 * KB).unwrap();
        assert_eq!(region.size(), 10 * KB);
        assert_eq!(region.mapped_len(), 12 * KB);

        region.resize(0).unwrap();
        assert_eq!(region.mapped_len(), 0);
    }

    #[test]
    fn test_window_beyond_max_size_rejected() {
        let layout = RegionLayout::new(GB).with_large_window(GB, 2 * GB);
        let error = HugePageRegion::new(layout, RecordingMapper::new(), None).unwrap_err();
        assert!(matches!(error, MemoryError::InvalidConfig { .. }));
    }

    #[test]
    fn test_invalid_layout_rejected() {
        let layout = RegionLayout::new(4 * GB).with_large_window(0, 3 * MB);
        let error = HugePageRegion::new(layout, RecordingMapper::new(), None).unwrap_err();
        assert_eq!(error.code(), "MEM:CONFIG:LAYOUT");
    }

    #[test]
    fn test_misaligned_fixed_base_rejected() {
        let layout = RegionLayout::new(8 * MB).with_medium_window(0, 2 * MB);
        let base = NonNull::new((64 * GB + 4 * KB) as *mut u8).unwrap();
        let error = HugePageRegion::new(layout, RecordingMapper::new(), Some(base)).unwrap_err();
        assert!(matches!(error, MemoryError::InvalidConfig { .. }));
    }
}
