//! Standalone error types for mosaic-memory
//!
//! Uses thiserror for clean, idiomatic Rust error definitions.

use std::io;

use thiserror::Error;

use crate::core::PageSize;
use crate::interval::LayoutViolation;

// ============================================================================
// Main Error Types
// ============================================================================

/// Memory management errors
#[must_use = "errors should be handled"]
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum MemoryError {
    // --- Configuration Errors ---
    #[error("Invalid page-size layout: {0}")]
    InvalidLayout(#[from] LayoutViolation),

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Missing configuration variable: {key}")]
    MissingVariable { key: String },

    #[error("Malformed layout csv at line {line}: {reason}")]
    Csv { line: usize, reason: String },

    // --- Capacity Errors ---
    #[error("{what} is full (capacity: {capacity})")]
    CapacityExceeded { what: &'static str, capacity: usize },

    #[error("Pool '{pool}' has no free span of {requested} bytes")]
    OutOfSpace { pool: &'static str, requested: usize },

    // --- Resource Exhaustion ---
    #[error("Failed to map {len} bytes of {page_size} pages at offset {offset:#x}: {source}")]
    MapFailed {
        offset: usize,
        len: usize,
        page_size: PageSize,
        #[source]
        source: io::Error,
    },

    #[error("Failed to release {len} bytes at offset {offset:#x}: {source}")]
    UnmapFailed {
        offset: usize,
        len: usize,
        #[source]
        source: io::Error,
    },

    // --- Invalid Address Errors ---
    #[error("Size {size} exceeds the region maximum of {max_size} bytes")]
    ExceedsMaxSize { size: usize, max_size: usize },

    #[error("Invalid address {address:#x}: {reason}")]
    InvalidAddress { address: usize, reason: String },

    #[error("Index {index} out of range (len: {len})")]
    OutOfRange { index: usize, len: usize },

    #[error("Invalid length {len}: {reason}")]
    InvalidLength { len: usize, reason: &'static str },

    // --- I/O ---
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl MemoryError {
    /// Check if error is retryable
    ///
    /// Capacity and mapping failures are local: the engine stays usable and
    /// the caller may retry with a smaller request or fall back to another path.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. }
                | Self::OutOfSpace { .. }
                | Self::MapFailed { .. }
                | Self::UnmapFailed { .. }
        )
    }

    /// Get error code for categorization
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidLayout(_) => "MEM:CONFIG:LAYOUT",
            Self::InvalidConfig { .. } => "MEM:CONFIG:INVALID",
            Self::MissingVariable { .. } => "MEM:CONFIG:MISSING",
            Self::Csv { .. } => "MEM:CONFIG:CSV",
            Self::CapacityExceeded { .. } => "MEM:CAPACITY:FULL",
            Self::OutOfSpace { .. } => "MEM:CAPACITY:OOM",
            Self::MapFailed { .. } => "MEM:RESOURCE:MAP",
            Self::UnmapFailed { .. } => "MEM:RESOURCE:UNMAP",
            Self::ExceedsMaxSize { .. } => "MEM:ADDRESS:MAX",
            Self::InvalidAddress { .. } => "MEM:ADDRESS:INVALID",
            Self::OutOfRange { .. } => "MEM:ADDRESS:RANGE",
            Self::InvalidLength { .. } => "MEM:ADDRESS:LENGTH",
            Self::Io(_) => "MEM:IO",
        }
    }

    // ============================================================================
    // Convenience Constructors
    // ============================================================================

    /// Create invalid config error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create missing variable error
    pub fn missing_variable(key: &str) -> Self {
        Self::MissingVariable {
            key: key.to_string(),
        }
    }

    /// Create csv error
    pub fn csv(line: usize, reason: impl Into<String>) -> Self {
        Self::Csv {
            line,
            reason: reason.into(),
        }
    }

    /// Create capacity exceeded error
    pub fn capacity_exceeded(what: &'static str, capacity: usize) -> Self {
        Self::CapacityExceeded { what, capacity }
    }

    /// Create out of space error
    pub fn out_of_space(pool: &'static str, requested: usize) -> Self {
        Self::OutOfSpace { pool, requested }
    }

    /// Create invalid address error
    pub fn invalid_address(address: usize, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Result Types
// ============================================================================

/// Result type for memory operations
pub type MemoryResult<T> = core::result::Result<T, MemoryError>;

/// Generic result type alias
pub type Result<T> = MemoryResult<T>;

// ============================================================================
// Tests
// ============================================================================
