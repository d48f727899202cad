//! Bounded first-fit allocator
//!
//! Hands out spans of a fixed address range `[start, end)`. Free spans and
//! live allocations are kept in two address-ordered tables whose capacity is
//! fixed at construction and whose storage comes from the page mapper.
//!
//! # Capacity is a hard limit
//!
//! Once the live table holds `capacity` allocations every further
//! allocation fails, even when plenty of bytes are free in aggregate. The
//! tables never grow. Callers treat [`MemoryError::CapacityExceeded`] like an
//! out-of-memory condition and fall back to another allocation path.
//!
//! Allocation always carves from the front of the first span that fits, so
//! it never adds a free entry. Free spans are the gaps between live
//! allocations, at most one more than their count, so the free table cannot
//! fill before the live table does. The bound shows up as allocation-table
//! exhaustion; the "free list full" path of [`FirstFitAllocator::free`] is
//! kept as a guard only.

use core::fmt;

use tracing::{trace, warn};

use crate::core::MappedVec;
use crate::error::{MemoryError, MemoryResult};
use crate::syscalls::SharedMapper;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    len: usize,
}

impl Span {
    const fn end(self) -> usize {
        self.start + self.len
    }
}

/// First-fit allocator over `[start, end)` with bounded bookkeeping
pub struct FirstFitAllocator {
    start: usize,
    end: usize,
    free: MappedVec<Span>,
    live: MappedVec<Span>,
}

impl FirstFitAllocator {
    /// Allocator whose whole range `[start, end)` is initially free.
    ///
    /// `capacity` bounds both the number of free spans and the number of
    /// live allocations.
    pub fn new(mapper: SharedMapper, capacity: usize, start: usize, end: usize) -> MemoryResult<Self> {
        if start >= end {
            return Err(MemoryError::invalid_config(format!(
                "empty allocator range [{start:#x}, {end:#x})"
            )));
        }
        let mut free = MappedVec::with_capacity(mapper.clone(), capacity, "free list")?;
        let live = MappedVec::with_capacity(mapper, capacity, "allocation table")?;
        free.push(Span {
            start,
            len: end - start,
        })?;
        Ok(Self {
            start,
            end,
            free,
            live,
        })
    }

    /// Allocate `len` bytes from the lowest free span large enough.
    pub fn allocate(&mut self, len: usize) -> MemoryResult<usize> {
        if len == 0 {
            return Err(MemoryError::InvalidLength {
                len,
                reason: "allocation length must be non-zero",
            });
        }
        let Some(index) = self.free.as_slice().iter().position(|span| span.len >= len) else {
            trace!(len, free_spans = self.free.len(), "no free span fits");
            return Err(MemoryError::out_of_space("first-fit", len));
        };
        if self.live.is_full() {
            warn!(capacity = self.live.capacity(), "allocation table exhausted");
            return Err(MemoryError::capacity_exceeded(
                "allocation table",
                self.live.capacity(),
            ));
        }

        let addr = self.free.as_slice()[index].start;
        let position = self.live_position(addr);
        self.live.insert(position, Span { start: addr, len })?;

        let span = &mut self.free.as_mut_slice()[index];
        if span.len == len {
            self.free.remove(index)?;
        } else {
            span.start += len;
            span.len -= len;
        }
        trace!(addr = format_args!("{addr:#x}"), len, "allocated");
        Ok(addr)
    }

    /// Return a span obtained from [`allocate`](Self::allocate).
    ///
    /// `addr` and `len` must match the allocation exactly. On error the
    /// allocator is unchanged.
    pub fn free(&mut self, addr: usize, len: usize) -> MemoryResult<()> {
        let live_index = self
            .live
            .as_slice()
            .binary_search_by_key(&addr, |span| span.start)
            .map_err(|_| MemoryError::invalid_address(addr, "not a live allocation"))?;
        if self.live.as_slice()[live_index].len != len {
            return Err(MemoryError::invalid_address(
                addr,
                format!(
                    "length {len} does not match the allocated {}",
                    self.live.as_slice()[live_index].len
                ),
            ));
        }

        self.release(Span { start: addr, len })?;
        self.live.remove(live_index)?;
        trace!(addr = format_args!("{addr:#x}"), len, "freed");
        Ok(())
    }

    /// Merge `span` into the free table, coalescing with its neighbours
    fn release(&mut self, span: Span) -> MemoryResult<()> {
        let position = self
            .free
            .as_slice()
            .partition_point(|free| free.start < span.start);
        let joins_prev = position > 0 && self.free.as_slice()[position - 1].end() == span.start;
        let joins_next = self
            .free
            .get(position)
            .is_some_and(|next| span.end() == next.start);

        match (joins_prev, joins_next) {
            (true, true) => {
                let next = self.free.remove(position)?;
                self.free.as_mut_slice()[position - 1].len += span.len + next.len;
            }
            (true, false) => self.free.as_mut_slice()[position - 1].len += span.len,
            (false, true) => {
                let next = &mut self.free.as_mut_slice()[position];
                next.start = span.start;
                next.len += span.len;
            }
            (false, false) => {
                if let Err(error) = self.free.insert(position, span) {
                    warn!(
                        capacity = self.free.capacity(),
                        "free list full, span cannot be returned"
                    );
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    fn live_position(&self, addr: usize) -> usize {
        self.live.as_slice().partition_point(|span| span.start < addr)
    }

    /// Whether `addr` lies in `[start, end)`, allocated or not
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }

    /// End of the highest live allocation, `start()` when nothing is live.
    ///
    /// Everything from here to `end()` is free, so an owning region only has
    /// to keep `[start, top_address)` committed.
    #[must_use]
    pub fn top_address(&self) -> usize {
        match self.free.as_slice().last() {
            Some(last) if last.end() == self.end => last.start,
            _ => self.end,
        }
    }

    /// Length of the live allocation starting at `addr`
    #[must_use]
    pub fn allocation_len(&self, addr: usize) -> Option<usize> {
        let live = self.live.as_slice();
        live.binary_search_by_key(&addr, |span| span.start)
            .ok()
            .map(|index| live[index].len)
    }

    /// First address managed
    #[must_use]
    pub fn start(&self) -> usize {
        self.start
    }

    /// One past the last address managed
    #[must_use]
    pub fn end(&self) -> usize {
        self.end
    }

    /// Bookkeeping capacity fixed at construction
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }

    /// Number of disjoint free spans
    #[must_use]
    pub fn free_spans(&self) -> usize {
        self.free.len()
    }

    /// Number of live allocations
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    /// Bytes currently allocated
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.live.as_slice().iter().map(|span| span.len).sum()
    }
}

impl fmt::Debug for FirstFitAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirstFitAllocator")
            .field("start", &format_args!("{:#x}", self.start))
            .field("end", &format_args!("{:#x}", self.end))
            .field("free_spans", &self.free.len())
            .field("live_allocations", &self.live.len())
            .finish()
    }
}
