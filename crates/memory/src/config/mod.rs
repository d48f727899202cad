//! Engine configuration
//!
//! Pool layouts arrive either from `MOSAIC_*` environment variables
//! ([`EngineConfig::from_env`]) or from a CSV layout file
//! ([`csv::parse_layout_csv`] + [`PoolLayout::from_intervals`]). Either way
//! the engine only sees a [`PoolLayout`] per pool, checked before use.

pub mod csv;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::core::PageSize;
use crate::core::size::{GB, KB, MB};
use crate::engine::PoolKind;
use crate::error::{MemoryError, MemoryResult};
use crate::interval::IntervalList;
use crate::region::RegionLayout;
use crate::syscalls::SharedMapper;

/// Names of the environment variables that are not per pool
pub mod env {
    /// Prefix shared by every variable
    pub const PREFIX: &str = "MOSAIC_";
    /// Non-zero enables usage reports
    pub const ANALYZE_POOLS: &str = "MOSAIC_ANALYZE_POOLS";
    /// Log verbosity for hosts that install a subscriber
    pub const VERBOSE_LEVEL: &str = "MOSAIC_VERBOSE_LEVEL";
    /// Deallocation hysteresis in bytes
    pub const SHRINK_THRESHOLD: &str = "MOSAIC_SHRINK_THRESHOLD";
    /// Directory usage reports are written to
    pub const REPORT_DIR: &str = "MOSAIC_REPORT_DIR";
}

/// Default deallocation hysteresis: 2 MiB
pub const DEFAULT_SHRINK_THRESHOLD: usize = 2 * MB;

// ============================================================================
// Size parsing
// ============================================================================

/// Parse a byte count with an optional `KB`/`MB`/`GB` suffix.
///
/// # Examples
/// ```
/// use mosaic_memory::config::parse_size;
///
/// assert_eq!(parse_size("4096").unwrap(), 4096);
/// assert_eq!(parse_size("2MB").unwrap(), 2 * 1024 * 1024);
/// assert_eq!(parse_size(" 1gb ").unwrap(), 1 << 30);
/// assert!(parse_size("12XB").is_err());
/// ```
pub fn parse_size(value: &str) -> MemoryResult<usize> {
    let trimmed = value.trim();
    let upper = trimmed.to_ascii_uppercase();
    let (digits, unit) = [("GB", GB), ("MB", MB), ("KB", KB), ("B", 1)]
        .into_iter()
        .find_map(|(suffix, unit)| upper.strip_suffix(suffix).map(|digits| (digits, unit)))
        .unwrap_or((upper.as_str(), 1));

    digits
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|count| count.checked_mul(unit))
        .ok_or_else(|| MemoryError::invalid_config(format!("invalid size '{trimmed}'")))
}

// ============================================================================
// Pool layout
// ============================================================================

/// Size, huge-page windows and free-list capacity of one pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolLayout {
    /// Maximum size of the pool's region
    pub pool_size: usize,
    /// 1 GiB window start offset
    pub large_start: usize,
    /// 1 GiB window end offset
    pub large_end: usize,
    /// 2 MiB window start offset
    pub medium_start: usize,
    /// 2 MiB window end offset
    pub medium_end: usize,
    /// First-fit list capacity; unused by the break pool
    pub free_list_capacity: usize,
}

impl PoolLayout {
    /// Base-page-only pool of `pool_size` bytes
    #[must_use]
    pub const fn new(pool_size: usize) -> Self {
        Self {
            pool_size,
            large_start: 0,
            large_end: 0,
            medium_start: 0,
            medium_end: 0,
            free_list_capacity: 0,
        }
    }

    #[must_use]
    pub const fn with_large_window(mut self, start: usize, end: usize) -> Self {
        self.large_start = start;
        self.large_end = end;
        self
    }

    #[must_use]
    pub const fn with_medium_window(mut self, start: usize, end: usize) -> Self {
        self.medium_start = start;
        self.medium_end = end;
        self
    }

    #[must_use]
    pub const fn with_free_list_capacity(mut self, capacity: usize) -> Self {
        self.free_list_capacity = capacity;
        self
    }

    /// Region layout of this pool
    #[must_use]
    pub const fn to_region_layout(&self) -> RegionLayout {
        RegionLayout::new(self.pool_size)
            .with_large_window(self.large_start, self.large_end)
            .with_medium_window(self.medium_start, self.medium_end)
    }

    /// Whether either huge window is present
    #[must_use]
    pub fn has_huge_windows(&self) -> bool {
        self.to_region_layout().windows().next().is_some()
    }

    /// Check the windows: each must pass the layout validator and end within
    /// `pool_size`. The plan's storage comes from `mapper`.
    pub fn check(&self, mapper: &SharedMapper) -> MemoryResult<()> {
        if self.pool_size == 0 {
            return Err(MemoryError::invalid_config("pool size must be non-zero"));
        }
        self.to_region_layout().plan(mapper.clone()).map(drop)
    }

    /// Collapse a parsed interval list into the two-window form.
    ///
    /// At most one window per huge page size is allowed.
    pub fn from_intervals(
        pool_size: usize,
        intervals: &IntervalList,
        free_list_capacity: usize,
    ) -> MemoryResult<Self> {
        let mut layout = Self::new(pool_size).with_free_list_capacity(free_list_capacity);
        let mut seen_large = false;
        let mut seen_medium = false;

        for interval in intervals {
            let seen = match interval.page_size {
                PageSize::HugeLarge => &mut seen_large,
                PageSize::HugeMedium => &mut seen_medium,
                PageSize::Base => {
                    return Err(MemoryError::invalid_config(format!(
                        "interval {interval} is not a huge page window"
                    )));
                }
            };
            if std::mem::replace(seen, true) {
                return Err(MemoryError::invalid_config(format!(
                    "more than one {} window",
                    interval.page_size
                )));
            }
            layout = match interval.page_size {
                PageSize::HugeLarge => {
                    layout.with_large_window(interval.start_offset, interval.end_offset)
                }
                _ => layout.with_medium_window(interval.start_offset, interval.end_offset),
            };
        }
        Ok(layout)
    }

    fn from_lookup(kind: PoolKind, lookup: &impl Fn(&str) -> Option<String>) -> MemoryResult<Self> {
        let required = |suffix: &str| -> MemoryResult<usize> {
            let key = pool_key(kind, suffix);
            let value = lookup(&key).ok_or_else(|| MemoryError::missing_variable(&key))?;
            trace!(key = %key, value = %value, "loading pool setting");
            parse_size(&value)
        };
        let optional = |suffix: &str| -> MemoryResult<usize> {
            lookup(&pool_key(kind, suffix)).map_or(Ok(0), |value| parse_size(&value))
        };

        let mut layout = Self::new(required("POOL_SIZE")?);
        if kind.has_free_list() {
            layout.free_list_capacity = required("FIRST_FIT_LIST_SIZE")?;
        }
        if kind.supports_huge_windows() {
            layout.large_start = optional("1GB_START_OFFSET")?;
            layout.large_end = optional("1GB_END_OFFSET")?;
            layout.medium_start = optional("2MB_START_OFFSET")?;
            layout.medium_end = optional("2MB_END_OFFSET")?;
        }
        Ok(layout)
    }

    fn push_env(&self, kind: PoolKind, vars: &mut Vec<(String, String)>) {
        vars.push((pool_key(kind, "POOL_SIZE"), self.pool_size.to_string()));
        if kind.has_free_list() {
            vars.push((
                pool_key(kind, "FIRST_FIT_LIST_SIZE"),
                self.free_list_capacity.to_string(),
            ));
        }
        if kind.supports_huge_windows() {
            for (suffix, value) in [
                ("1GB_START_OFFSET", self.large_start),
                ("1GB_END_OFFSET", self.large_end),
                ("2MB_START_OFFSET", self.medium_start),
                ("2MB_END_OFFSET", self.medium_end),
            ] {
                vars.push((pool_key(kind, suffix), value.to_string()));
            }
        }
    }
}

fn pool_key(kind: PoolKind, suffix: &str) -> String {
    format!("{}{}_{suffix}", env::PREFIX, kind.env_name())
}

// ============================================================================
// Engine configuration
// ============================================================================

/// Everything [`AllocationEngine`](crate::engine::AllocationEngine) needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Break-pointer pool
    pub brk: PoolLayout,
    /// Anonymous-mapping pool
    pub anonymous: PoolLayout,
    /// File-backed-mapping pool, never huge-page backed
    pub file_backed: PoolLayout,
    /// Write usage reports when the engine is created and dropped
    pub analyze_pools: bool,
    /// Verbosity requested for the host's log output
    pub verbose_level: u64,
    /// Shrink a mapping pool only once this many bytes above the highest
    /// live allocation are committed
    pub shrink_threshold: usize,
    /// Directory usage reports are written to
    pub report_dir: PathBuf,
}

impl EngineConfig {
    /// Configuration with default general settings
    #[must_use]
    pub fn new(brk: PoolLayout, anonymous: PoolLayout, file_backed: PoolLayout) -> Self {
        Self {
            brk,
            anonymous,
            file_backed,
            analyze_pools: false,
            verbose_level: 0,
            shrink_threshold: DEFAULT_SHRINK_THRESHOLD,
            report_dir: PathBuf::from("."),
        }
    }

    /// Read the `MOSAIC_*` variables of the current process
    pub fn from_env() -> MemoryResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the `MOSAIC_*` variables through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> MemoryResult<Self> {
        let numeric = |key: &str| -> MemoryResult<Option<usize>> {
            lookup(key).map(|value| parse_size(&value)).transpose()
        };

        let mut config = Self::new(
            PoolLayout::from_lookup(PoolKind::Brk, &lookup)?,
            PoolLayout::from_lookup(PoolKind::Anonymous, &lookup)?,
            PoolLayout::from_lookup(PoolKind::FileBacked, &lookup)?,
        );
        config.analyze_pools = numeric(env::ANALYZE_POOLS)?.is_some_and(|value| value != 0);
        config.verbose_level = numeric(env::VERBOSE_LEVEL)?.unwrap_or(0) as u64;
        if let Some(threshold) = numeric(env::SHRINK_THRESHOLD)? {
            config.shrink_threshold = threshold;
        }
        if let Some(dir) = lookup(env::REPORT_DIR) {
            config.report_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    /// The variables [`from_lookup`](Self::from_lookup) reads back into `self`
    #[must_use]
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut vars = Vec::new();
        for kind in PoolKind::ALL {
            self.pool(kind).push_env(kind, &mut vars);
        }
        vars.push((
            env::ANALYZE_POOLS.to_string(),
            u8::from(self.analyze_pools).to_string(),
        ));
        vars.push((env::VERBOSE_LEVEL.to_string(), self.verbose_level.to_string()));
        vars.push((
            env::SHRINK_THRESHOLD.to_string(),
            self.shrink_threshold.to_string(),
        ));
        vars.push((
            env::REPORT_DIR.to_string(),
            self.report_dir.display().to_string(),
        ));
        vars
    }

    /// Layout of one pool
    #[must_use]
    pub fn pool(&self, kind: PoolKind) -> &PoolLayout {
        match kind {
            PoolKind::Brk => &self.brk,
            PoolKind::Anonymous => &self.anonymous,
            PoolKind::FileBacked => &self.file_backed,
        }
    }

    /// Check every pool, with plan storage taken from `mapper`
    pub fn validate(&self, mapper: &SharedMapper) -> MemoryResult<()> {
        for kind in PoolKind::ALL {
            let layout = self.pool(kind);
            layout.check(mapper).map_err(|error| match error {
                MemoryError::InvalidConfig { reason } => {
                    MemoryError::invalid_config(format!("{kind} pool: {reason}"))
                }
                other => other,
            })?;
            if kind.has_free_list() && layout.free_list_capacity == 0 {
                return Err(MemoryError::invalid_config(format!(
                    "{kind} pool: free list capacity must be non-zero"
                )));
            }
            if !kind.supports_huge_windows() && layout.has_huge_windows() {
                return Err(MemoryError::invalid_config(format!(
                    "{kind} pool cannot have huge page windows"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::syscalls::SystemMapper;
    use crate::syscalls::testing::RecordingMapper;

    fn mapper() -> SharedMapper {
        RecordingMapper::new()
    }

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn minimal_env() -> Vec<(&'static str, &'static str)> {
        vec![
            ("MOSAIC_BRK_POOL_SIZE", "4GB"),
            ("MOSAIC_MMAP_POOL_SIZE", "8GB"),
            ("MOSAIC_MMAP_FIRST_FIT_LIST_SIZE", "1MB"),
            ("MOSAIC_FILE_BACKED_POOL_SIZE", "1GB"),
            ("MOSAIC_FILE_BACKED_FIRST_FIT_LIST_SIZE", "10KB"),
        ]
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("0KB").unwrap(), 0);
        assert_eq!(parse_size("3kb").unwrap(), 3 * KB);
        assert_eq!(parse_size("16GB").unwrap(), 16 * GB);
        assert_eq!(parse_size("100B").unwrap(), 100);
        assert!(parse_size("").is_err());
        assert!(parse_size("-1").is_err());
        assert!(parse_size("99999999999999999999GB").is_err());
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = EngineConfig::from_lookup(lookup_from(&minimal_env())).unwrap();
        assert_eq!(config.brk, PoolLayout::new(4 * GB));
        assert_eq!(config.anonymous.free_list_capacity, MB);
        assert_eq!(config.file_backed.free_list_capacity, 10 * KB);
        assert!(!config.analyze_pools);
        assert_eq!(config.shrink_threshold, DEFAULT_SHRINK_THRESHOLD);
    }

    #[test]
    fn test_missing_required_variable() {
        let mut vars = minimal_env();
        vars.retain(|(key, _)| *key != "MOSAIC_MMAP_FIRST_FIT_LIST_SIZE");
        let error = EngineConfig::from_lookup(lookup_from(&vars)).unwrap_err();
        assert!(
            matches!(error, MemoryError::MissingVariable { ref key } if key == "MOSAIC_MMAP_FIRST_FIT_LIST_SIZE")
        );
    }

    #[test]
    fn test_windows_and_general_settings() {
        let mut vars = minimal_env();
        vars.extend([
            ("MOSAIC_MMAP_1GB_START_OFFSET", "1GB"),
            ("MOSAIC_MMAP_1GB_END_OFFSET", "3GB"),
            ("MOSAIC_MMAP_2MB_START_OFFSET", "0"),
            ("MOSAIC_MMAP_2MB_END_OFFSET", "64MB"),
            ("MOSAIC_ANALYZE_POOLS", "1"),
            ("MOSAIC_SHRINK_THRESHOLD", "8MB"),
        ]);
        let config = EngineConfig::from_lookup(lookup_from(&vars)).unwrap();
        assert_eq!(
            config.anonymous,
            PoolLayout::new(8 * GB)
                .with_large_window(GB, 3 * GB)
                .with_medium_window(0, 64 * MB)
                .with_free_list_capacity(MB)
        );
        assert!(config.analyze_pools);
        assert_eq!(config.shrink_threshold, 8 * MB);
        config.validate(&mapper()).unwrap();
    }

    #[test]
    fn test_to_env_round_trips() {
        let config = EngineConfig::from_lookup(lookup_from(&minimal_env())).unwrap();
        let vars = config.to_env();
        let reloaded = EngineConfig::from_lookup(|key| {
            vars.iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.clone())
        })
        .unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_validate_rejects_bad_pools() {
        let good = EngineConfig::new(
            PoolLayout::new(GB),
            PoolLayout::new(GB).with_free_list_capacity(16),
            PoolLayout::new(GB).with_free_list_capacity(16),
        );
        good.validate(&mapper()).unwrap();

        let mut no_capacity = good.clone();
        no_capacity.anonymous.free_list_capacity = 0;
        assert!(no_capacity.validate(&mapper()).is_err());

        let mut window_past_end = good.clone();
        window_past_end.brk = PoolLayout::new(GB).with_large_window(0, 2 * GB);
        let error = window_past_end.validate(&mapper()).unwrap_err();
        assert!(error.to_string().contains("brk"));

        let mut huge_file_pool = good;
        huge_file_pool.file_backed = huge_file_pool.file_backed.with_medium_window(0, 2 * MB);
        assert!(huge_file_pool.validate(&mapper()).is_err());
    }

    #[test]
    fn test_validate_maps_through_given_mapper() {
        let mapper = RecordingMapper::new();
        let config = EngineConfig::new(
            PoolLayout::new(GB).with_medium_window(0, 8 * MB),
            PoolLayout::new(GB).with_free_list_capacity(16),
            PoolLayout::new(GB).with_free_list_capacity(16),
        );
        let shared: SharedMapper = mapper.clone();
        config.validate(&shared).unwrap();

        let maps = mapper.requests.lock().len();
        assert_eq!(maps, PoolKind::ALL.len());
        assert_eq!(mapper.unmaps.lock().len(), maps);
    }

    #[test]
    fn test_from_intervals() {
        let mapper = Arc::new(SystemMapper::base_pages_only());
        let mut list = IntervalList::new(mapper.clone(), 4).unwrap();
        list.add_interval(GB, 2 * GB, PageSize::HugeLarge).unwrap();
        list.add_interval(0, 4 * MB, PageSize::HugeMedium).unwrap();
        let layout = PoolLayout::from_intervals(4 * GB, &list, 64).unwrap();
        assert_eq!(
            layout,
            PoolLayout::new(4 * GB)
                .with_large_window(GB, 2 * GB)
                .with_medium_window(0, 4 * MB)
                .with_free_list_capacity(64)
        );

        list.add_interval(8 * MB, 10 * MB, PageSize::HugeMedium).unwrap();
        assert!(PoolLayout::from_intervals(4 * GB, &list, 64).is_err());
    }
}
