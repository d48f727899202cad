//! Pool usage reports
//!
//! Post-run analysis needs to know how large each pool actually got, so that
//! the next run can size its huge-page windows. The engine records the peak
//! committed size per pool and can write it, together with the pool address
//! ranges, as CSV.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{AllocationEngine, PoolKind};
use crate::error::MemoryResult;

/// File the bounds log is appended to inside the report directory
pub(crate) const BOUNDS_LOG_NAME: &str = "pools_base_pointers.csv";

const BOUNDS_HEADER: &str =
    "pid,tid,anon-mmap-start,anon-mmap-end,brk-start,brk-end,file-mmap-start,file-mmap-end";

/// Current and peak size of one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUsage {
    /// Pool reported on
    pub pool: PoolKind,
    /// Bytes in use now: committed size, or the highest live span of the
    /// file-backed pool
    pub current_size: usize,
    /// Largest `current_size` observed
    pub max_size: usize,
}

/// Address range reserved for one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolBounds {
    /// Pool reported on
    pub pool: PoolKind,
    /// First address
    pub start: usize,
    /// One past the last address
    pub end: usize,
}

impl AllocationEngine {
    /// Usage of one pool
    #[must_use]
    pub fn usage(&self, pool: PoolKind) -> PoolUsage {
        let (current_size, max_size) = match pool {
            PoolKind::Brk => {
                let brk = self.brk.lock();
                (brk.region.size(), brk.peak)
            }
            PoolKind::Anonymous => {
                let anonymous = self.anonymous.lock();
                (anonymous.region.size(), anonymous.peak)
            }
            PoolKind::FileBacked => {
                let file = self.file_backed.lock();
                (file.top_offset(), file.peak)
            }
        };
        PoolUsage {
            pool,
            current_size,
            max_size,
        }
    }

    /// Usage of every pool, in `brk`, `anon-mmap`, `file-mmap` order
    #[must_use]
    pub fn usage_report(&self) -> Vec<PoolUsage> {
        PoolKind::ALL.into_iter().map(|pool| self.usage(pool)).collect()
    }

    /// Reserved address range of every pool
    #[must_use]
    pub fn pool_bounds(&self) -> Vec<PoolBounds> {
        PoolKind::ALL
            .into_iter()
            .map(|pool| {
                let (start, max_size) = match pool {
                    PoolKind::Brk => {
                        let brk = self.brk.lock();
                        (brk.region.base_addr(), brk.region.max_size())
                    }
                    PoolKind::Anonymous => {
                        let anonymous = self.anonymous.lock();
                        (anonymous.region.base_addr(), anonymous.region.max_size())
                    }
                    PoolKind::FileBacked => {
                        let file = self.file_backed.lock();
                        (file.region.base_addr(), file.region.max_size())
                    }
                };
                PoolBounds {
                    pool,
                    start,
                    end: start + max_size,
                }
            })
            .collect()
    }

    /// Write `pool_sizes.<pid>.csv` into `dir` and return its path
    pub fn write_usage_report(&self, dir: &Path) -> MemoryResult<PathBuf> {
        let path = dir.join(format!("pool_sizes.{}.csv", std::process::id()));
        let mut contents = String::from("region,max-size\n");
        for usage in self.usage_report() {
            contents.push_str(&format!("{},{}\n", usage.pool, usage.max_size));
        }
        fs::write(&path, contents)?;
        info!(path = %path.display(), "wrote pool usage report");
        Ok(path)
    }

    /// Append this process's pool bounds to the CSV log at `path`, writing
    /// the header first if the file is empty
    pub fn append_bounds_log(&self, path: &Path) -> MemoryResult<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() == 0 {
            writeln!(file, "{BOUNDS_HEADER}")?;
        }

        let bounds = self.pool_bounds();
        let range = |pool: PoolKind| {
            bounds
                .iter()
                .find(|b| b.pool == pool)
                .map_or((0, 0), |b| (b.start, b.end))
        };
        let (anon_start, anon_end) = range(PoolKind::Anonymous);
        let (brk_start, brk_end) = range(PoolKind::Brk);
        let (file_start, file_end) = range(PoolKind::FileBacked);

        writeln!(
            file,
            "{},{},{anon_start:#x},{anon_end:#x},{brk_start:#x},{brk_end:#x},{file_start:#x},{file_end:#x}",
            std::process::id(),
            current_tid(),
        )?;
        Ok(())
    }
}

fn current_tid() -> libc::c_long {
    // SAFETY: gettid takes no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) }
}
