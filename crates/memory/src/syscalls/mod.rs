//! Page-mapping primitives injected into the engine
//!
//! Nothing in mosaic-memory calls `mmap`/`munmap` directly. Every region,
//! every bounded list and every pool receives a [`PageMapper`] and routes all
//! virtual-memory changes through it, so tests can substitute a recording or
//! fault-injecting mapper and hosts can route the primitives around their own
//! interception layer.
//!
//! # Architecture
//!
//! - **mod.rs** - The [`PageMapper`] strategy trait and its request types
//! - **direct.rs** - [`SystemMapper`], the libc-backed implementation
//! - **info.rs** - Huge page availability as reported by the kernel
//!
//! # Reentrancy
//!
//! A mapper must never allocate through, or otherwise re-enter, the engine
//! that called it. When the engine serves a process-wide interception hook,
//! the mapper has to reach the real system calls by a path that bypasses that
//! hook; otherwise a resize holding a pool lock deadlocks on itself. The
//! engine does not detect this, it is a precondition on every implementation.

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::ptr::NonNull;
use std::sync::Arc;

use bitflags::bitflags;

use crate::core::PageSize;

mod info;
pub use info::*;

#[cfg(target_os = "linux")]
mod direct;
#[cfg(target_os = "linux")]
pub use direct::*;

/// Memory protection flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryProtection {
    /// No access
    None,
    /// Read-only access
    ReadOnly,
    /// Read and write access
    ReadWrite,
    /// Read and execute access
    ReadExecute,
    /// Read, write, and execute access
    ReadWriteExecute,
}

impl MemoryProtection {
    /// Decode `PROT_*` bits as passed to `mmap`
    #[must_use]
    pub fn from_prot_bits(prot: i32) -> Self {
        let read = prot & libc::PROT_READ != 0;
        let write = prot & libc::PROT_WRITE != 0;
        let exec = prot & libc::PROT_EXEC != 0;
        match (read || write, write, exec) {
            (false, _, false) => Self::None,
            (_, true, true) => Self::ReadWriteExecute,
            (_, true, false) => Self::ReadWrite,
            (_, false, true) => Self::ReadExecute,
            (true, false, false) => Self::ReadOnly,
        }
    }
}

bitflags! {
    /// Memory mapping flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// Private copy-on-write mapping
        const PRIVATE = 1 << 0;
        /// Shared mapping
        const SHARED = 1 << 1;
        /// Place exactly at the hint, replacing whatever is mapped there
        const FIXED = 1 << 2;
        /// Place exactly at the hint, failing if anything is mapped there
        const FIXED_NOREPLACE = 1 << 3;
        /// Not backed by a file
        const ANONYMOUS = 1 << 4;
        /// Do not reserve swap / commit charge
        const NORESERVE = 1 << 5;
    }
}

impl MapFlags {
    /// Decode the sharing bits of `MAP_*` flags as passed to `mmap`
    #[must_use]
    pub fn from_map_bits(flags: i32) -> Self {
        let mut decoded = Self::empty();
        if flags & libc::MAP_SHARED != 0 {
            decoded |= Self::SHARED;
        }
        if flags & libc::MAP_PRIVATE != 0 {
            decoded |= Self::PRIVATE;
        }
        if flags & libc::MAP_NORESERVE != 0 {
            decoded |= Self::NORESERVE;
        }
        decoded
    }
}

/// File descriptor and offset for a file-backed mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileBacking {
    /// Open file descriptor
    pub fd: RawFd,
    /// Byte offset into the file, page aligned
    pub offset: i64,
}

/// One call to [`PageMapper::map`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    /// Placement hint, or the exact address with `FIXED`/`FIXED_NOREPLACE`
    pub addr: Option<NonNull<u8>>,
    /// Length in bytes, a multiple of `page_size`
    pub len: usize,
    /// Access protection
    pub protection: MemoryProtection,
    /// Mapping flags
    pub flags: MapFlags,
    /// Page size the range must be backed with
    pub page_size: PageSize,
    /// Backing file, `None` for anonymous memory
    pub file: Option<FileBacking>,
}

impl MapRequest {
    /// Inaccessible, non-resident mapping used to hold address space.
    ///
    /// With an address the placeholder replaces whatever is mapped there.
    #[must_use]
    pub fn placeholder(addr: Option<NonNull<u8>>, len: usize) -> Self {
        let mut flags = MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::NORESERVE;
        if addr.is_some() {
            flags |= MapFlags::FIXED;
        }
        Self {
            addr,
            len,
            protection: MemoryProtection::None,
            flags,
            page_size: PageSize::Base,
            file: None,
        }
    }

    /// Reserve address space exactly at `addr` without clobbering anything
    #[must_use]
    pub fn placeholder_at(addr: NonNull<u8>, len: usize) -> Self {
        Self {
            addr: Some(addr),
            flags: MapFlags::PRIVATE
                | MapFlags::ANONYMOUS
                | MapFlags::NORESERVE
                | MapFlags::FIXED_NOREPLACE,
            ..Self::placeholder(None, len)
        }
    }

    /// Read-write anonymous memory replacing the placeholder at `addr`
    #[must_use]
    pub fn commit(addr: NonNull<u8>, len: usize, page_size: PageSize) -> Self {
        Self {
            addr: Some(addr),
            len,
            protection: MemoryProtection::ReadWrite,
            flags: MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED,
            page_size,
            file: None,
        }
    }

    /// Read-write anonymous base pages anywhere in the address space
    #[must_use]
    pub fn anonymous(len: usize) -> Self {
        Self {
            addr: None,
            len,
            protection: MemoryProtection::ReadWrite,
            flags: MapFlags::PRIVATE | MapFlags::ANONYMOUS,
            page_size: PageSize::Base,
            file: None,
        }
    }

    /// File mapping placed exactly at `addr`
    #[must_use]
    pub fn file_at(
        addr: NonNull<u8>,
        len: usize,
        protection: MemoryProtection,
        flags: MapFlags,
        file: FileBacking,
    ) -> Self {
        Self {
            addr: Some(addr),
            len,
            protection,
            flags: (flags - MapFlags::ANONYMOUS - MapFlags::FIXED_NOREPLACE) | MapFlags::FIXED,
            page_size: PageSize::Base,
            file: Some(file),
        }
    }
}

/// Strategy for the raw page-mapping primitives.
///
/// # Safety
///
/// Implementations must return, on success, a mapping of at least
/// `request.len` bytes that honours `request.protection`, placed exactly at
/// `request.addr` whenever `FIXED` or `FIXED_NOREPLACE` is requested. Callers
/// dereference the returned memory on the strength of this contract.
///
/// Implementations must not re-enter the engine (see the module docs).
pub unsafe trait PageMapper: Send + Sync + fmt::Debug {
    /// Create or replace a mapping.
    ///
    /// # Safety
    ///
    /// With `FIXED` the caller must own `[addr, addr + len)`: whatever was
    /// mapped there is discarded.
    unsafe fn map(&self, request: &MapRequest) -> io::Result<NonNull<u8>>;

    /// Remove a mapping.
    ///
    /// # Safety
    ///
    /// The caller must own `[addr, addr + len)` and must not touch it again.
    unsafe fn unmap(&self, addr: NonNull<u8>, len: usize) -> io::Result<()>;
}

/// Mapper handle shared by every component of one engine
pub type SharedMapper = Arc<dyn PageMapper>;
