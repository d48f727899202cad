//! The allocation engine
//!
//! [`AllocationEngine`] owns three pools, each a [`HugePageRegion`] behind
//! its own lock:
//!
//! - **brk**: a single break pointer moving over the region
//! - **anon-mmap**: anonymous mappings carved by a [`FirstFitAllocator`],
//!   the region's committed prefix following the highest live allocation
//! - **file-mmap**: file mappings placed over the region's reservation
//!
//! Operations on different pools never contend. Queries spanning several
//! pools take each lock in turn and never hold two at once.
//!
//! The engine is an explicit context object: hosts create one, keep it for
//! the life of the process and route their interception hooks to it. The
//! reentrancy precondition on the injected mapper (see
//! [`syscalls`](crate::syscalls)) applies to every operation here.

mod report;

use core::fmt;
use core::ptr::NonNull;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use report::{PoolBounds, PoolUsage};

use crate::allocator::FirstFitAllocator;
use crate::config::{EngineConfig, PoolLayout};
use crate::core::PageSize;
use crate::error::{MemoryError, MemoryResult};
use crate::region::HugePageRegion;
use crate::syscalls::{FileBacking, MapFlags, MapRequest, MemoryProtection, SharedMapper};
use crate::utils::{align_up, checked_align_up};

// ============================================================================
// Pool kinds
// ============================================================================

/// The three pools of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolKind {
    /// Break-pointer pool
    Brk,
    /// Anonymous-mapping pool
    #[serde(rename = "anon-mmap")]
    Anonymous,
    /// File-backed-mapping pool
    #[serde(rename = "file-mmap")]
    FileBacked,
}

impl PoolKind {
    /// Every pool, in report order
    pub const ALL: [PoolKind; 3] = [Self::Brk, Self::Anonymous, Self::FileBacked];

    /// Name used in reports and logs
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Brk => "brk",
            Self::Anonymous => "anon-mmap",
            Self::FileBacked => "file-mmap",
        }
    }

    /// Pool type column of CSV layout files
    #[must_use]
    pub const fn csv_name(self) -> &'static str {
        match self {
            Self::Brk => "brk",
            Self::Anonymous => "mmap",
            Self::FileBacked => "file",
        }
    }

    /// Infix of the pool's `MOSAIC_*` variables
    #[must_use]
    pub const fn env_name(self) -> &'static str {
        match self {
            Self::Brk => "BRK",
            Self::Anonymous => "MMAP",
            Self::FileBacked => "FILE_BACKED",
        }
    }

    /// Whether the pool carves allocations with a first-fit list
    #[must_use]
    pub const fn has_free_list(self) -> bool {
        !matches!(self, Self::Brk)
    }

    /// Whether the pool may declare huge page windows
    #[must_use]
    pub const fn supports_huge_windows(self) -> bool {
        !matches!(self, Self::FileBacked)
    }

    /// Look up a pool by its CSV name
    #[must_use]
    pub fn from_csv_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.csv_name() == name)
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the break pool is reserved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrkPlacement {
    /// At the current program break rounded up to 1 GiB, or anywhere if
    /// that range is taken
    #[default]
    AboveProgramBreak,
    /// Exactly at this address
    Fixed(NonNull<u8>),
    /// Wherever the kernel chooses
    Anywhere,
}

// ============================================================================
// Pools
// ============================================================================

struct BreakPool {
    region: HugePageRegion,
    current_break: usize,
    peak: usize,
}

impl BreakPool {
    fn set_break(&mut self, addr: usize) -> MemoryResult<()> {
        let base = self.region.base_addr();
        let Some(new_size) = addr.checked_sub(base) else {
            return Err(MemoryError::invalid_address(addr, "below the break pool base"));
        };
        self.region.resize(new_size)?;
        self.current_break = addr;
        self.peak = self.peak.max(self.region.size());
        Ok(())
    }
}

struct MappingPool {
    region: HugePageRegion,
    free_list: FirstFitAllocator,
    peak: usize,
}

impl MappingPool {
    fn new(kind: PoolKind, layout: &PoolLayout, mapper: &SharedMapper) -> MemoryResult<Self> {
        let region = HugePageRegion::new(layout.to_region_layout(), mapper.clone(), None)?;
        let start = region.base_addr();
        let free_list = FirstFitAllocator::new(
            mapper.clone(),
            layout.free_list_capacity,
            start,
            start + layout.pool_size,
        )?;
        debug!(pool = %kind, base = format_args!("{start:#x}"), "pool ready");
        Ok(Self {
            region,
            free_list,
            peak: 0,
        })
    }

    fn offset_of(&self, addr: usize) -> usize {
        addr - self.region.base_addr()
    }

    fn top_offset(&self) -> usize {
        self.offset_of(self.free_list.top_address())
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Three huge-page pools serving break, anonymous and file mappings
pub struct AllocationEngine {
    brk: Mutex<BreakPool>,
    anonymous: Mutex<MappingPool>,
    file_backed: Mutex<MappingPool>,
    shrink_threshold: usize,
    config: EngineConfig,
    mapper: SharedMapper,
}

impl AllocationEngine {
    /// Create the pools of `config`, the break pool above the program break
    pub fn new(config: EngineConfig, mapper: SharedMapper) -> MemoryResult<Self> {
        Self::with_brk_placement(config, mapper, BrkPlacement::default())
    }

    /// Create the pools of `config` with an explicit break pool placement
    pub fn with_brk_placement(
        config: EngineConfig,
        mapper: SharedMapper,
        placement: BrkPlacement,
    ) -> MemoryResult<Self> {
        config.validate(&mapper)?;

        let anonymous = MappingPool::new(PoolKind::Anonymous, &config.anonymous, &mapper)?;
        let file_backed = MappingPool::new(PoolKind::FileBacked, &config.file_backed, &mapper)?;
        let brk_region = reserve_brk_region(&config.brk, &mapper, placement)?;
        let brk = BreakPool {
            current_break: brk_region.base_addr(),
            region: brk_region,
            peak: 0,
        };

        let engine = Self {
            brk: Mutex::new(brk),
            anonymous: Mutex::new(anonymous),
            file_backed: Mutex::new(file_backed),
            shrink_threshold: config.shrink_threshold,
            config,
            mapper,
        };

        info!(
            brk_base = format_args!("{:#x}", engine.brk_base()),
            shrink_threshold = engine.shrink_threshold,
            "allocation engine initialised"
        );
        if engine.config.analyze_pools {
            let path = engine.config.report_dir.join(report::BOUNDS_LOG_NAME);
            if let Err(error) = engine.append_bounds_log(&path) {
                warn!(path = %path.display(), %error, "failed to append pool bounds");
            }
        }
        Ok(engine)
    }

    /// Configuration the engine was built from
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Anonymous pool
    // ------------------------------------------------------------------------

    /// Allocate `len` bytes (rounded up to whole base pages) of zeroed,
    /// read-write memory from the anonymous pool.
    pub fn allocate_anonymous(&self, len: usize) -> MemoryResult<NonNull<u8>> {
        let len = page_len(len)?;
        let mut pool = self.anonymous.lock();

        let addr = pool.free_list.allocate(len).inspect_err(|error| {
            warn!(pool = %PoolKind::Anonymous, len, %error, "allocation failed");
        })?;
        let offset = pool.offset_of(addr);
        let end = offset + len;

        // Pages already mapped may hold data of earlier allocations.
        let stale_end = end.min(pool.region.mapped_len());
        if offset < stale_end {
            // SAFETY: `[offset, stale_end)` is mapped read-write memory of
            // the region that the free list just handed to us exclusively.
            unsafe {
                pool.region
                    .base()
                    .add(offset)
                    .write_bytes(0, stale_end - offset);
            }
        }

        if end > pool.region.size() {
            if let Err(error) = pool.region.resize(end) {
                if let Err(free_error) = pool.free_list.free(addr, len) {
                    warn!(%free_error, "failed to return span after a failed grow");
                }
                return Err(error);
            }
        }
        pool.peak = pool.peak.max(pool.region.size());

        // SAFETY: addresses handed out by the free list lie inside the region.
        Ok(unsafe { pool.region.base().add(offset) })
    }

    /// Return an anonymous allocation.
    ///
    /// Once the region is committed more than the shrink threshold above the
    /// highest live allocation, it is shrunk down to that allocation. A
    /// failed shrink only leaves the region larger; the span is still freed.
    pub fn deallocate_anonymous(&self, addr: NonNull<u8>, len: usize) -> MemoryResult<()> {
        let len = page_len(len)?;
        let mut pool = self.anonymous.lock();
        pool.free_list.free(addr.as_ptr() as usize, len)?;

        let top = pool.top_offset();
        let size = pool.region.size();
        if top < size && size - top > self.shrink_threshold {
            debug!(pool = %PoolKind::Anonymous, from = size, to = top, "shrinking");
            if let Err(error) = pool.region.resize(top) {
                warn!(
                    pool = %PoolKind::Anonymous,
                    from = size,
                    to = top,
                    %error,
                    "shrink failed"
                );
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // File-backed pool
    // ------------------------------------------------------------------------

    /// Map `len` bytes of `file` into the file-backed pool.
    ///
    /// Without `addr` a span is carved from the pool. With `addr` the mapping
    /// replaces part of a live file-backed span starting there.
    pub fn allocate_file_backed(
        &self,
        addr: Option<NonNull<u8>>,
        len: usize,
        protection: MemoryProtection,
        flags: MapFlags,
        file: FileBacking,
    ) -> MemoryResult<NonNull<u8>> {
        let len = page_len(len)?;
        let mut pool = self.file_backed.lock();

        let (target, carved) = match addr {
            None => (pool.free_list.allocate(len)?, true),
            Some(addr) => {
                let addr = addr.as_ptr() as usize;
                match pool.free_list.allocation_len(addr) {
                    Some(live) if len <= live => (addr, false),
                    _ => {
                        return Err(MemoryError::invalid_address(
                            addr,
                            "not the start of a live file-backed span",
                        ));
                    }
                }
            }
        };
        let offset = pool.offset_of(target);
        // SAFETY: inside the region reservation.
        let ptr = unsafe { pool.region.base().add(offset) };

        // SAFETY: `[ptr, ptr + len)` is a span of our reservation reserved
        // for this caller; nothing else lives there.
        let mapped =
            unsafe { self.mapper.map(&MapRequest::file_at(ptr, len, protection, flags, file)) };
        match mapped {
            Ok(mapped) => {
                let top = pool.top_offset();
                pool.peak = pool.peak.max(top);
                Ok(mapped)
            }
            Err(source) => {
                warn!(pool = %PoolKind::FileBacked, len, error = %source, "file mapping failed");
                self.restore_placeholder(ptr, len);
                if carved {
                    if let Err(error) = pool.free_list.free(target, len) {
                        warn!(%error, "failed to return span after a failed mapping");
                    }
                }
                Err(MemoryError::MapFailed {
                    offset,
                    len,
                    page_size: PageSize::Base,
                    source,
                })
            }
        }
    }

    /// Unmap a file-backed allocation, keeping its address range reserved
    pub fn deallocate_file_backed(&self, addr: NonNull<u8>, len: usize) -> MemoryResult<()> {
        let len = page_len(len)?;
        let mut pool = self.file_backed.lock();
        pool.free_list.free(addr.as_ptr() as usize, len)?;
        let offset = pool.offset_of(addr.as_ptr() as usize);

        // SAFETY: the span was just returned to the pool; the caller no
        // longer uses it.
        unsafe { self.mapper.map(&MapRequest::placeholder(Some(addr), len)) }
            .map(drop)
            .map_err(|source| MemoryError::UnmapFailed {
                offset,
                len,
                source,
            })
    }

    fn restore_placeholder(&self, ptr: NonNull<u8>, len: usize) {
        // SAFETY: the span belongs to the file pool reservation and holds no
        // live mapping after the failed call.
        if let Err(error) = unsafe { self.mapper.map(&MapRequest::placeholder(Some(ptr), len)) } {
            warn!(%error, "failed to restore placeholder");
        }
    }

    /// Return a mapping to whichever mapping pool owns `addr`
    pub fn deallocate(&self, addr: NonNull<u8>, len: usize) -> MemoryResult<()> {
        let raw = addr.as_ptr() as usize;
        let in_anonymous = self.anonymous.lock().free_list.contains(raw);
        let in_file = self.file_backed.lock().free_list.contains(raw);

        if in_anonymous {
            self.deallocate_anonymous(addr, len)
        } else if in_file {
            self.deallocate_file_backed(addr, len)
        } else {
            Err(MemoryError::invalid_address(raw, "not owned by a mapping pool"))
        }
    }

    // ------------------------------------------------------------------------
    // Break pool
    // ------------------------------------------------------------------------

    /// Move the program break to `addr` (`brk` semantics).
    ///
    /// Fails without effect when `addr` is below the pool base or the pool
    /// cannot be resized.
    pub fn change_program_break(&self, addr: usize) -> MemoryResult<()> {
        self.brk.lock().set_break(addr)
    }

    /// Move the program break by `increment` bytes and return the previous
    /// break (`sbrk` semantics)
    pub fn adjust_program_break(&self, increment: isize) -> MemoryResult<usize> {
        let mut pool = self.brk.lock();
        let previous = pool.current_break;
        let next = previous
            .checked_add_signed(increment)
            .ok_or_else(|| MemoryError::invalid_address(previous, "break overflows"))?;
        pool.set_break(next)?;
        Ok(previous)
    }

    /// Current program break
    #[must_use]
    pub fn program_break(&self) -> usize {
        self.brk.lock().current_break
    }

    /// Base address of the break pool
    #[must_use]
    pub fn brk_base(&self) -> usize {
        self.brk.lock().region.base_addr()
    }

    // ------------------------------------------------------------------------
    // Ownership
    // ------------------------------------------------------------------------

    /// Pool whose address range holds `addr`, committed or not
    #[must_use]
    pub fn owner(&self, addr: usize) -> Option<PoolKind> {
        if self.anonymous.lock().free_list.contains(addr) {
            return Some(PoolKind::Anonymous);
        }
        if self.file_backed.lock().free_list.contains(addr) {
            return Some(PoolKind::FileBacked);
        }
        if self.brk.lock().region.contains(addr) {
            return Some(PoolKind::Brk);
        }
        None
    }

    /// Whether any pool manages `addr`
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.owner(addr).is_some()
    }
}

impl fmt::Debug for AllocationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationEngine")
            .field("pools", &self.usage_report())
            .field("shrink_threshold", &self.shrink_threshold)
            .finish_non_exhaustive()
    }
}

impl Drop for AllocationEngine {
    fn drop(&mut self) {
        if self.config.analyze_pools {
            if let Err(error) = self.write_usage_report(&self.config.report_dir) {
                warn!(%error, "failed to write pool usage report");
            }
        }
    }
}

fn page_len(len: usize) -> MemoryResult<usize> {
    if len == 0 {
        return Err(MemoryError::InvalidLength {
            len,
            reason: "mapping length must be non-zero",
        });
    }
    checked_align_up(len, PageSize::Base.bytes()).ok_or(MemoryError::InvalidLength {
        len,
        reason: "mapping length overflows",
    })
}

fn reserve_brk_region(
    layout: &PoolLayout,
    mapper: &SharedMapper,
    placement: BrkPlacement,
) -> MemoryResult<HugePageRegion> {
    let region_layout = layout.to_region_layout();
    match placement {
        BrkPlacement::Fixed(base) => HugePageRegion::new(region_layout, mapper.clone(), Some(base)),
        BrkPlacement::Anywhere => HugePageRegion::new(region_layout, mapper.clone(), None),
        BrkPlacement::AboveProgramBreak => {
            let hint = program_break_hint();
            match hint.map(|base| HugePageRegion::new(region_layout, mapper.clone(), Some(base))) {
                Some(Ok(region)) => Ok(region),
                Some(Err(error)) => {
                    debug!(%error, "break pool hint unavailable, reserving anywhere");
                    HugePageRegion::new(region_layout, mapper.clone(), None)
                }
                None => HugePageRegion::new(region_layout, mapper.clone(), None),
            }
        }
    }
}

/// Current program break rounded up to 1 GiB
fn program_break_hint() -> Option<NonNull<u8>> {
    // SAFETY: sbrk(0) only queries the break.
    let current = unsafe { libc::sbrk(0) } as usize;
    if current == usize::MAX {
        return None;
    }
    NonNull::new(align_up(current, PageSize::HugeLarge.bytes()) as *mut u8)
}
