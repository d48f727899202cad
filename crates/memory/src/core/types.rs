//! Page sizes and size constants

use core::fmt;

use serde::{Deserialize, Serialize};

/// Memory size constants
pub mod size {
    /// 1 Kilobyte
    pub const KB: usize = 1024;

    /// 1 Megabyte
    pub const MB: usize = 1024 * KB;

    /// 1 Gigabyte
    pub const GB: usize = 1024 * MB;
}

/// Page size backing a range of a region.
///
/// The discriminant is the page size in bytes, so `page as usize` can be fed
/// straight into alignment arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(usize)]
pub enum PageSize {
    /// 4 KiB base page
    Base = 4 * size::KB,
    /// 2 MiB huge page
    HugeMedium = 2 * size::MB,
    /// 1 GiB huge page
    HugeLarge = size::GB,
}

impl PageSize {
    /// Every page size, smallest first
    pub const ALL: [PageSize; 3] = [Self::Base, Self::HugeMedium, Self::HugeLarge];

    /// Page size in bytes
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> usize {
        self as usize
    }

    /// Whether this is one of the huge page sizes
    #[inline]
    #[must_use]
    pub const fn is_huge(self) -> bool {
        !matches!(self, Self::Base)
    }

    /// Looks up the page size with exactly `bytes` bytes
    #[must_use]
    pub fn from_bytes(bytes: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|page| page.bytes() == bytes)
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base => write!(f, "4KB"),
            Self::HugeMedium => write!(f, "2MB"),
            Self::HugeLarge => write!(f, "1GB"),
        }
    }
}
