//! Core building blocks for mosaic-memory
//!
//! - Page sizes and size constants
//! - Fixed-capacity storage carved out of the injected page mapper

pub(crate) mod storage;
pub mod types;

pub use types::{PageSize, size};

pub(crate) use storage::MappedVec;
