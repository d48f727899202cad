//! Fixed-capacity vector whose storage comes from a [`PageMapper`]
//!
//! Interval lists and free lists must not touch the global allocator: when
//! the engine runs underneath an interception hook the global allocator may
//! itself be routed back into the engine. Their storage is instead mapped
//! once, up front, through the injected mapper and never grows.

use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ptr::NonNull;

use tracing::warn;

use crate::core::PageSize;
use crate::error::{MemoryError, MemoryResult};
use crate::syscalls::{MapRequest, SharedMapper};
use crate::utils::checked_align_up;

/// Bounded, mapper-backed vector of `Copy` records
pub(crate) struct MappedVec<T: Copy> {
    ptr: NonNull<T>,
    len: usize,
    capacity: usize,
    mapped_bytes: usize,
    what: &'static str,
    mapper: SharedMapper,
    _marker: PhantomData<T>,
}

// SAFETY: the vector exclusively owns its mapping; `T: Copy + Send` records
// move between threads like the values themselves.
unsafe impl<T: Copy + Send> Send for MappedVec<T> {}
// SAFETY: shared access only hands out `&[T]`.
unsafe impl<T: Copy + Sync> Sync for MappedVec<T> {}

impl<T: Copy> MappedVec<T> {
    /// Map storage for `capacity` records.
    ///
    /// `what` names the structure in capacity errors ("interval list",
    /// "free list", ...).
    pub(crate) fn with_capacity(
        mapper: SharedMapper,
        capacity: usize,
        what: &'static str,
    ) -> MemoryResult<Self> {
        const { assert!(mem::align_of::<T>() <= PageSize::Base.bytes()) };

        if capacity == 0 {
            return Err(MemoryError::invalid_config(format!(
                "{what} capacity must be at least 1"
            )));
        }
        let mapped_bytes = capacity
            .checked_mul(mem::size_of::<T>().max(1))
            .and_then(|bytes| checked_align_up(bytes, PageSize::Base.bytes()))
            .ok_or_else(|| {
                MemoryError::invalid_config(format!("{what} capacity {capacity} is too large"))
            })?;

        // SAFETY: a floating mapping replaces nothing.
        let raw = unsafe { mapper.map(&MapRequest::anonymous(mapped_bytes)) }.map_err(|source| {
            MemoryError::MapFailed {
                offset: 0,
                len: mapped_bytes,
                page_size: PageSize::Base,
                source,
            }
        })?;

        Ok(Self {
            ptr: raw.cast::<T>(),
            len: 0,
            capacity,
            mapped_bytes,
            what,
            mapper,
            _marker: PhantomData,
        })
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    pub(crate) fn as_slice(&self) -> &[T] {
        // SAFETY: the first `len` slots were initialised by push/insert, and
        // the mapping is page aligned, hence aligned for `T`.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: as in `as_slice`, and `&mut self` guarantees exclusivity.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub(crate) fn get(&self, index: usize) -> Option<T> {
        self.as_slice().get(index).copied()
    }

    pub(crate) fn push(&mut self, value: T) -> MemoryResult<()> {
        self.insert(self.len, value)
    }

    /// Insert at `index`, shifting later records up
    pub(crate) fn insert(&mut self, index: usize, value: T) -> MemoryResult<()> {
        if index > self.len {
            return Err(MemoryError::OutOfRange {
                index,
                len: self.len,
            });
        }
        if self.is_full() {
            return Err(MemoryError::capacity_exceeded(self.what, self.capacity));
        }
        // SAFETY: `len < capacity`, so slots `index..=len` are inside the
        // mapping; `copy` handles the overlap.
        unsafe {
            let slot = self.ptr.as_ptr().add(index);
            core::ptr::copy(slot, slot.add(1), self.len - index);
            slot.write(value);
        }
        self.len += 1;
        Ok(())
    }

    /// Remove the record at `index`, shifting later records down
    pub(crate) fn remove(&mut self, index: usize) -> MemoryResult<T> {
        if index >= self.len {
            return Err(MemoryError::OutOfRange {
                index,
                len: self.len,
            });
        }
        // SAFETY: `index < len`, every slot read or moved is initialised.
        let removed = unsafe {
            let slot = self.ptr.as_ptr().add(index);
            let removed = slot.read();
            core::ptr::copy(slot.add(1), slot, self.len - index - 1);
            removed
        };
        self.len -= 1;
        Ok(removed)
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for MappedVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedVec")
            .field("what", &self.what)
            .field("capacity", &self.capacity)
            .field("entries", &self.as_slice())
            .finish()
    }
}

impl<T: Copy> Drop for MappedVec<T> {
    fn drop(&mut self) {
        // SAFETY: the mapping was created in `with_capacity` and is owned
        // solely by this vector.
        if let Err(error) = unsafe { self.mapper.unmap(self.ptr.cast(), self.mapped_bytes) } {
            warn!(what = self.what, %error, "failed to release list storage");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscalls::testing::RecordingMapper;

    fn vec_of(capacity: usize) -> MappedVec<u64> {
        MappedVec::with_capacity(RecordingMapper::new(), capacity, "test list").unwrap()
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = MappedVec::<u64>::with_capacity(RecordingMapper::new(), 0, "test list");
        assert!(matches!(result, Err(MemoryError::InvalidConfig { .. })));
    }

    #[test]
    fn test_push_until_full() {
        let mut list = vec_of(3);
        for value in [1, 2, 3] {
            list.push(value).unwrap();
        }
        assert!(list.is_full());
        let error = list.push(4).unwrap_err();
        assert!(matches!(
            error,
            MemoryError::CapacityExceeded {
                what: "test list",
                capacity: 3
            }
        ));
        assert_eq!(list.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_insert_and_remove_shift() {
        let mut list = vec_of(4);
        list.push(10).unwrap();
        list.push(30).unwrap();
        list.insert(1, 20).unwrap();
        assert_eq!(list.as_slice(), &[10, 20, 30]);

        assert_eq!(list.remove(0).unwrap(), 10);
        assert_eq!(list.as_slice(), &[20, 30]);
        assert!(matches!(list.remove(2), Err(MemoryError::OutOfRange { index: 2, len: 2 })));
    }

    #[test]
    fn test_storage_unmapped_on_drop() {
        let mapper = RecordingMapper::new();
        let list = MappedVec::<u64>::with_capacity(mapper.clone(), 1000, "test list").unwrap();
        drop(list);
        let unmaps = mapper.unmaps.lock();
        assert_eq!(unmaps.len(), 1);
        assert_eq!(unmaps[0].1, 8192);
    }
}
