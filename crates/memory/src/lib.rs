//! # mosaic-memory
//!
//! Huge-page aware memory pools for workloads that want control over which
//! parts of their heap are backed by 2MB or 1GB pages.
//!
//! The crate is built from four layers:
//! - [`interval`]: bounded lists of page-size windows and the layout rules
//!   they must satisfy ([`validate`])
//! - [`region`]: a reserved virtual range that commits memory with the page
//!   size of whichever window an offset falls in ([`HugePageRegion`])
//! - [`allocator`]: a first-fit allocator with fixed-capacity bookkeeping
//!   ([`FirstFitAllocator`])
//! - [`engine`]: three pools (program break, anonymous mappings, file-backed
//!   mappings) behind the calls an interposition layer forwards
//!   ([`AllocationEngine`])
//!
//! Nothing on the allocation path touches the process heap. Bookkeeping
//! storage is obtained from the [`PageMapper`], so the engine can serve
//! `malloc`'s own `brk` and `mmap` calls.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use mosaic_memory::prelude::*;
//!
//! # fn main() -> mosaic_memory::MemoryResult<()> {
//! let config = EngineConfig::from_env()?;
//! let engine = AllocationEngine::new(config, Arc::new(SystemMapper::new()))?;
//!
//! let block = engine.allocate_anonymous(64 * size::KB)?;
//! engine.deallocate_anonymous(block, 64 * size::KB)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! Pools are described by `MOSAIC_*` environment variables (see
//! [`config::env`]) or by a CSV layout file (see [`config::csv`]).

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(unsafe_code)]
#![warn(rust_2018_idioms)]

// Error types
pub mod error;

// Building blocks
pub mod core;
pub mod interval;
pub mod syscalls;
pub mod utils;

// Regions and pools
pub mod allocator;
pub mod config;
pub mod engine;
pub mod region;

pub use crate::allocator::FirstFitAllocator;
pub use crate::config::{EngineConfig, PoolLayout};
pub use crate::core::{PageSize, size};
pub use crate::engine::{AllocationEngine, BrkPlacement, PoolBounds, PoolKind, PoolUsage};
pub use crate::error::{MemoryError, MemoryResult, Result};
pub use crate::interval::{Interval, IntervalList, LayoutViolation, validate};
pub use crate::region::{HugePageRegion, RegionLayout};
pub use crate::syscalls::{MapRequest, PageMapper, SharedMapper};
#[cfg(target_os = "linux")]
pub use crate::syscalls::SystemMapper;

// Public API exports
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::core::{PageSize, size};
    pub use crate::error::{MemoryError, MemoryResult};

    pub use crate::allocator::FirstFitAllocator;
    pub use crate::config::{EngineConfig, PoolLayout};
    pub use crate::engine::{AllocationEngine, BrkPlacement, PoolKind};
    pub use crate::interval::{Interval, IntervalList, validate};
    pub use crate::region::{HugePageRegion, RegionLayout};

    pub use crate::syscalls::{
        FileBacking, MapFlags, MapRequest, MemoryProtection, PageMapper, SharedMapper,
    };
    #[cfg(target_os = "linux")]
    pub use crate::syscalls::SystemMapper;
}
