//! Huge page availability as reported by the kernel
//!
//! The engine never reserves huge pages itself. These helpers only read what
//! the administrator has pre-reserved so tools can warn before a layout is
//! used on a machine that cannot back it.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::PageSize;
use crate::utils::format_bytes;

const HUGEPAGES_ROOT: &str = "/sys/kernel/mm/hugepages";

/// Kernel hugetlb pool counters for one huge page size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HugePagePool {
    /// Page size of this pool
    pub page_size: PageSize,
    /// Pages reserved in the pool (`nr_hugepages`)
    pub total: usize,
    /// Pages not yet faulted in by anyone (`free_hugepages`)
    pub free: usize,
}

impl HugePagePool {
    /// Free bytes available to new mappings
    #[must_use]
    pub const fn free_bytes(&self) -> usize {
        self.free * self.page_size.bytes()
    }
}

impl fmt::Display for HugePagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} pages free ({})",
            self.page_size,
            self.free,
            self.total,
            format_bytes(self.free_bytes())
        )
    }
}

/// Huge page pools of the running system
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HugePageSupport {
    pools: Vec<HugePagePool>,
}

impl HugePageSupport {
    /// Read the counters under `/sys/kernel/mm/hugepages`.
    ///
    /// Missing directories (no hugetlbfs support, or a page size the CPU
    /// lacks) are reported as absent pools rather than errors.
    #[must_use]
    pub fn detect() -> Self {
        Self::detect_in(Path::new(HUGEPAGES_ROOT))
    }

    /// Same as [`detect`](Self::detect), rooted at `root`
    #[must_use]
    pub fn detect_in(root: &Path) -> Self {
        let pools = PageSize::ALL
            .into_iter()
            .filter(|page| page.is_huge())
            .filter_map(|page_size| {
                let dir = pool_dir(root, page_size);
                Some(HugePagePool {
                    page_size,
                    total: read_counter(&dir.join("nr_hugepages"))?,
                    free: read_counter(&dir.join("free_hugepages"))?,
                })
            })
            .collect();
        Self { pools }
    }

    /// Counters for `page_size`, if the kernel exposes that pool
    #[must_use]
    pub fn pool(&self, page_size: PageSize) -> Option<&HugePagePool> {
        self.pools.iter().find(|pool| pool.page_size == page_size)
    }

    /// Free pages of `page_size`, zero when the pool is absent
    #[must_use]
    pub fn free_pages(&self, page_size: PageSize) -> usize {
        self.pool(page_size).map_or(0, |pool| pool.free)
    }

    /// Whether `bytes` worth of `page_size` pages can currently be faulted in
    #[must_use]
    pub fn can_back(&self, page_size: PageSize, bytes: usize) -> bool {
        if !page_size.is_huge() {
            return true;
        }
        bytes.div_ceil(page_size.bytes()) <= self.free_pages(page_size)
    }

    /// All pools found
    #[must_use]
    pub fn pools(&self) -> &[HugePagePool] {
        &self.pools
    }
}

fn pool_dir(root: &Path, page_size: PageSize) -> PathBuf {
    root.join(format!("hugepages-{}kB", page_size.bytes() / 1024))
}

fn read_counter(path: &Path) -> Option<usize> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Base page size of the running system
#[must_use]
pub fn base_page_size() -> usize {
    // SAFETY: FFI call to libc::sysconf.
    // - _SC_PAGESIZE is a valid sysconf parameter
    // - sysconf returns page size or -1 on error
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(PageSize::Base.bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pool(root: &Path, kb: usize, total: usize, free: usize) {
        let dir = root.join(format!("hugepages-{kb}kB"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("nr_hugepages"), format!("{total}\n")).unwrap();
        fs::write(dir.join("free_hugepages"), format!("{free}\n")).unwrap();
    }

    #[test]
    fn test_detect_reads_counters() {
        let root = tempfile::tempdir().unwrap();
        write_pool(root.path(), 2048, 512, 100);
        write_pool(root.path(), 1_048_576, 2, 2);

        let support = HugePageSupport::detect_in(root.path());
        assert_eq!(support.pools().len(), 2);
        assert_eq!(support.free_pages(PageSize::HugeMedium), 100);
        assert_eq!(support.free_pages(PageSize::HugeLarge), 2);
        assert!(support.can_back(PageSize::HugeLarge, 2 * PageSize::HugeLarge.bytes()));
        assert!(!support.can_back(PageSize::HugeMedium, 101 * PageSize::HugeMedium.bytes()));
    }

    #[test]
    fn test_missing_pool_is_absent() {
        let root = tempfile::tempdir().unwrap();
        write_pool(root.path(), 2048, 4, 4);

        let support = HugePageSupport::detect_in(root.path());
        assert!(support.pool(PageSize::HugeLarge).is_none());
        assert_eq!(support.free_pages(PageSize::HugeLarge), 0);
        assert!(support.can_back(PageSize::Base, usize::MAX));
    }

    #[test]
    fn test_base_page_size() {
        assert!(base_page_size().is_power_of_two());
    }
}
