//! CSV layout files
//!
//! ```text
//! type,page size,start offset,end offset
//! mmap,1073741824,0,1073741824
//! mmap,2097152,1073741824,1077936128
//! mmap,-1,0,8589934592
//! brk,2097152,0,16777216
//! ```
//!
//! The first line is a header. Each row names the pool it belongs to, a page
//! size in bytes (`2097152` or `1073741824`) and a window. A page size of
//! `-1` marks the row whose length is the pool size; a pool may have at most
//! one such row.

use std::io::BufRead;

use crate::core::PageSize;
use crate::error::{MemoryError, MemoryResult};
use crate::interval::IntervalList;
use crate::syscalls::SharedMapper;

const POOL_SIZE_MARKER: i64 = -1;

/// Windows and pool size read for one pool type
#[derive(Debug)]
pub struct CsvLayout {
    /// Windows, sorted by start offset
    pub intervals: IntervalList,
    /// Length of the `-1` row, if the file had one
    pub pool_size: Option<usize>,
}

/// Read the rows of `pool_type` from a CSV layout.
///
/// Rows of other pool types are skipped. Intervals are appended in file
/// order to a list of `capacity` entries, which is sorted before returning.
/// Line numbers in errors are 1-based and count the header.
pub fn parse_layout_csv(
    reader: impl BufRead,
    pool_type: &str,
    capacity: usize,
    mapper: SharedMapper,
) -> MemoryResult<CsvLayout> {
    let mut lines = reader.lines();
    match lines.next() {
        Some(header) => {
            header?;
        }
        None => return Err(MemoryError::csv(1, "missing header")),
    }

    let mut intervals = IntervalList::new(mapper, capacity)?;
    let mut pool_size = None;

    for (index, line) in lines.enumerate() {
        let line_number = index + 2;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let mut fields = line.split(',').map(str::trim);
        if fields.next() != Some(pool_type) {
            continue;
        }
        let mut number = |name: &str| -> MemoryResult<i64> {
            let field = fields
                .next()
                .ok_or_else(|| MemoryError::csv(line_number, format!("missing {name}")))?;
            field
                .parse()
                .map_err(|_| MemoryError::csv(line_number, format!("invalid {name} '{field}'")))
        };

        let page_size = number("page size")?;
        let start = number("start offset")?;
        let end = number("end offset")?;
        if fields.next().is_some() {
            return Err(MemoryError::csv(line_number, "too many columns"));
        }

        let start = usize::try_from(start)
            .map_err(|_| MemoryError::csv(line_number, "start offset is negative"))?;
        let end = usize::try_from(end)
            .map_err(|_| MemoryError::csv(line_number, "end offset is negative"))?;

        if page_size == POOL_SIZE_MARKER {
            if pool_size.is_some() {
                return Err(MemoryError::csv(line_number, "pool size already given"));
            }
            pool_size = Some(end.saturating_sub(start));
            continue;
        }

        let page_size = usize::try_from(page_size)
            .ok()
            .and_then(PageSize::from_bytes)
            .filter(|page| page.is_huge())
            .ok_or_else(|| {
                MemoryError::csv(line_number, format!("unknown page size {page_size}"))
            })?;
        intervals
            .add_interval(start, end, page_size)
            .map_err(|error| MemoryError::csv(line_number, error.to_string()))?;
    }

    intervals.sort();
    Ok(CsvLayout {
        intervals,
        pool_size,
    })
}
