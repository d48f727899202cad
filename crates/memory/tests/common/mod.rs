//! Shared helpers for the integration tests

#![allow(dead_code, unsafe_code)]

use std::io;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use mosaic_memory::core::PageSize;
use mosaic_memory::syscalls::{MapRequest, PageMapper, SystemMapper};
use mosaic_memory::{IntervalList, SharedMapper};
use parking_lot::Mutex;

/// Base-page mapper that records the page size of every request and can be
/// told to fail huge-page requests once a byte budget is spent.
#[derive(Debug, Default)]
pub struct CountingMapper {
    pub huge_maps: Mutex<Vec<(usize, PageSize)>>,
    pub maps: AtomicUsize,
    pub unmaps: AtomicUsize,
    huge_budget: Option<usize>,
    huge_spent: AtomicUsize,
}

impl CountingMapper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail any huge mapping that would push the huge total past `bytes`
    pub fn with_huge_budget(bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            huge_budget: Some(bytes),
            ..Self::default()
        })
    }

    pub fn huge_bytes(&self, page_size: PageSize) -> usize {
        self.huge_maps
            .lock()
            .iter()
            .filter(|(_, page)| *page == page_size)
            .map(|(len, _)| len)
            .sum()
    }
}

unsafe impl PageMapper for CountingMapper {
    unsafe fn map(&self, request: &MapRequest) -> io::Result<NonNull<u8>> {
        if request.page_size.is_huge() {
            let spent = self.huge_spent.fetch_add(request.len, Ordering::SeqCst) + request.len;
            if self.huge_budget.is_some_and(|budget| spent > budget) {
                self.huge_spent.fetch_sub(request.len, Ordering::SeqCst);
                return Err(io::Error::from_raw_os_error(libc::ENOMEM));
            }
            self.huge_maps.lock().push((request.len, request.page_size));
        }
        self.maps.fetch_add(1, Ordering::SeqCst);
        let request = MapRequest {
            page_size: PageSize::Base,
            ..*request
        };
        unsafe { SystemMapper::base_pages_only().map(&request) }
    }

    unsafe fn unmap(&self, addr: NonNull<u8>, len: usize) -> io::Result<()> {
        self.unmaps.fetch_add(1, Ordering::SeqCst);
        unsafe { SystemMapper::base_pages_only().unmap(addr, len) }
    }
}

pub fn base_mapper() -> SharedMapper {
    Arc::new(SystemMapper::base_pages_only())
}

pub fn interval_list(intervals: &[(usize, usize, PageSize)]) -> IntervalList {
    let mut list = IntervalList::new(base_mapper(), intervals.len().max(1)).unwrap();
    for &(start, end, page_size) in intervals {
        list.add_interval(start, end, page_size).unwrap();
    }
    list
}

/// Fill `[ptr, ptr + len)` with a byte pattern derived from each offset
pub unsafe fn fill(ptr: NonNull<u8>, from: usize, to: usize) {
    for offset in from..to {
        unsafe { ptr.add(offset).write(pattern(offset)) };
    }
}

/// Check the pattern written by [`fill`]
pub unsafe fn holds_pattern(ptr: NonNull<u8>, from: usize, to: usize) -> bool {
    (from..to).all(|offset| unsafe { ptr.add(offset).read() } == pattern(offset))
}

fn pattern(offset: usize) -> u8 {
    (offset / 4096 % 251) as u8 ^ (offset % 256) as u8
}
