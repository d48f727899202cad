//! Direct system call wrappers for memory operations
//!
//! [`SystemMapper`] turns [`MapRequest`]s into `mmap(2)` / `munmap(2)` calls.
//!
//! # Safety
//!
//! All functions in this module perform unsafe FFI calls to libc. The OS
//! validates parameters and returns errors for invalid inputs, but callers
//! remain responsible for the ownership contract documented on
//! [`PageMapper`].

use std::io;
use std::ptr::{self, NonNull};

use super::{MapFlags, MapRequest, MemoryProtection, PageMapper};
use crate::core::PageSize;

// Kernel ABI for selecting the hugetlb page size (see mmap(2)).
const MAP_HUGE_SHIFT: i32 = 26;
const MAP_HUGE_2MB: i32 = 21 << MAP_HUGE_SHIFT;
const MAP_HUGE_1GB: i32 = 30 << MAP_HUGE_SHIFT;

impl MemoryProtection {
    /// Convert to platform-specific flags
    fn to_unix_flags(self) -> i32 {
        use libc::{PROT_EXEC, PROT_NONE, PROT_READ, PROT_WRITE};

        match self {
            Self::None => PROT_NONE,
            Self::ReadOnly => PROT_READ,
            Self::ReadWrite => PROT_READ | PROT_WRITE,
            Self::ReadExecute => PROT_READ | PROT_EXEC,
            Self::ReadWriteExecute => PROT_READ | PROT_WRITE | PROT_EXEC,
        }
    }
}

impl MapFlags {
    fn to_unix_flags(self) -> i32 {
        let table = [
            (Self::PRIVATE, libc::MAP_PRIVATE),
            (Self::SHARED, libc::MAP_SHARED),
            (Self::FIXED, libc::MAP_FIXED),
            (Self::FIXED_NOREPLACE, libc::MAP_FIXED_NOREPLACE),
            (Self::ANONYMOUS, libc::MAP_ANONYMOUS),
            (Self::NORESERVE, libc::MAP_NORESERVE),
        ];
        table
            .into_iter()
            .filter(|(flag, _)| self.contains(*flag))
            .fold(0, |acc, (_, bits)| acc | bits)
    }
}

/// libc-backed [`PageMapper`]
#[derive(Debug, Clone, Copy)]
pub struct SystemMapper {
    huge_pages: bool,
}

impl SystemMapper {
    /// Mapper that honours huge-page requests with `MAP_HUGETLB`.
    ///
    /// Huge pages must already be reserved in the kernel pool; otherwise
    /// huge mappings fail with `ENOMEM`.
    #[must_use]
    pub const fn new() -> Self {
        Self { huge_pages: true }
    }

    /// Mapper that serves every request with base pages.
    ///
    /// Addresses and alignment are unchanged, so layouts behave identically
    /// apart from TLB reach. Used where no huge pages are reserved.
    #[must_use]
    pub const fn base_pages_only() -> Self {
        Self { huge_pages: false }
    }

    /// Whether huge-page requests reach the kernel as such
    #[must_use]
    pub const fn uses_huge_pages(&self) -> bool {
        self.huge_pages
    }

    fn hugetlb_flags(&self, page_size: PageSize) -> i32 {
        if !self.huge_pages {
            return 0;
        }
        match page_size {
            PageSize::Base => 0,
            PageSize::HugeMedium => libc::MAP_HUGETLB | MAP_HUGE_2MB,
            PageSize::HugeLarge => libc::MAP_HUGETLB | MAP_HUGE_1GB,
        }
    }
}

impl Default for SystemMapper {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl PageMapper for SystemMapper {
    unsafe fn map(&self, request: &MapRequest) -> io::Result<NonNull<u8>> {
        let prot = request.protection.to_unix_flags();
        let flags = request.flags.to_unix_flags() | self.hugetlb_flags(request.page_size);
        let (fd, offset) = request
            .file
            .map_or((-1, 0), |file| (file.fd, file.offset as libc::off_t));
        let addr = request
            .addr
            .map_or(ptr::null_mut(), |addr| addr.as_ptr().cast::<libc::c_void>());

        // SAFETY: FFI call to libc mmap. We pass:
        // - addr: null or a range the caller owns (PageMapper::map contract)
        // - len/prot/flags: constructed from the typed request
        // - fd/offset: -1/0 for anonymous memory or the caller's file
        // OS validates all parameters and returns MAP_FAILED on error.
        let mapped = unsafe { libc::mmap(addr, request.len, prot, flags, fd, offset) };

        if mapped == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let mapped = NonNull::new(mapped.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "mmap returned null"))?;

        // Kernels before 4.17 treat MAP_FIXED_NOREPLACE as a plain hint.
        if request.flags.contains(MapFlags::FIXED_NOREPLACE) && request.addr != Some(mapped) {
            // SAFETY: the mapping was created just above and is not shared.
            unsafe { self.unmap(mapped, request.len)? };
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        Ok(mapped)
    }

    unsafe fn unmap(&self, addr: NonNull<u8>, len: usize) -> io::Result<()> {
        // SAFETY: FFI call to libc munmap. Caller guarantees it owns the range.
        let result = unsafe { libc::munmap(addr.as_ptr().cast::<libc::c_void>(), len) };
        if result == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hugetlb_flags() {
        let mapper = SystemMapper::new();
        assert_eq!(mapper.hugetlb_flags(PageSize::Base), 0);
        assert_eq!(
            mapper.hugetlb_flags(PageSize::HugeLarge),
            libc::MAP_HUGETLB | (30 << 26)
        );
        assert_eq!(SystemMapper::base_pages_only().hugetlb_flags(PageSize::HugeMedium), 0);
    }

    #[test]
    fn test_map_write_unmap() {
        let mapper = SystemMapper::base_pages_only();
        let request = MapRequest::anonymous(4096);
        // SAFETY: floating anonymous mapping, nothing is replaced.
        let ptr = unsafe { mapper.map(&request) }.unwrap();
        // SAFETY: the mapping is 4096 bytes of read-write memory.
        unsafe {
            ptr.as_ptr().write_bytes(0x5a, 4096);
            assert_eq!(*ptr.as_ptr().add(4095), 0x5a);
        }
        // SAFETY: we own the mapping and never touch it again.
        unsafe { mapper.unmap(ptr, 4096) }.unwrap();
    }

    #[test]
    fn test_fixed_noreplace_refuses_occupied_range() {
        let mapper = SystemMapper::base_pages_only();
        // SAFETY: floating placeholder.
        let ptr = unsafe { mapper.map(&MapRequest::placeholder(None, 8192)) }.unwrap();
        // SAFETY: FIXED_NOREPLACE never discards existing mappings.
        let clash = unsafe { mapper.map(&MapRequest::placeholder_at(ptr, 4096)) };
        assert!(clash.is_err());
        // SAFETY: we own the placeholder.
        unsafe { mapper.unmap(ptr, 8192) }.unwrap();
    }
}
