// Handles resolve to raw pointers into the arena owned by the same Pool.
#![allow(unsafe_code)]

use std::cmp::max;
use std::fmt;
use std::ptr::NonNull;

use bumpalo::Bump;


const MIN_CHUNK: usize = 64;


/// A handle to bytes allocated from a [`Pool`].
///
/// Handles stay valid until the next `Pool::reset`. Afterwards, `Pool::get`
/// refuses them instead of returning bytes of a newer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolSlice {
    epoch: u32,
    index: u32,
    len: u32,
}

impl PoolSlice {
    /// Returns the length of the allocation in bytes.
    #[inline]
    #[must_use]
    pub fn len(self) -> usize {
        self.len as usize
    }

    /// Tests whether the allocation is zero-sized.
    #[inline]
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.len == 0
    }
}


/// A bump arena owned by a single connection.
///
/// Storage comes from a [`bumpalo::Bump`] preallocated with the configured
/// chunk size. Since a [`Bump`] only lends out borrows, every allocation is
/// recorded in a table and handed out as a [`PoolSlice`] index, which a
/// [`Connection`](crate::Connection) can hold across readiness events.
/// Memory is never freed individually: `Pool::reset` invalidates every
/// outstanding [`PoolSlice`] at once and keeps only the largest chunk, and
/// dropping the [`Pool`] releases everything.
pub struct Pool {
    chunk_size: usize,
    bump: Bump,
    // Every pointer refers to memory of `bump` allocated in the current epoch
    allocs: Vec<NonNull<[u8]>>,
    allocated: usize,
    epoch: u32,
}

// SAFETY: the pointers in `allocs` refer only to memory owned by `bump`,
// which is itself `Send`, and are never shared outside a borrow of the Pool.
unsafe impl Send for Pool {}

impl Pool {
    /// Creates a new [`Pool`] and eagerly allocates its first chunk.
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = max(chunk_size, MIN_CHUNK);
        Self {
            chunk_size,
            bump: Bump::with_capacity(chunk_size),
            allocs: Vec::new(),
            allocated: 0,
            epoch: 0,
        }
    }

    /// Returns the chunk size of this [`Pool`].
    #[inline]
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Returns the number of bytes handed out since the last reset.
    #[inline]
    #[must_use]
    pub fn used(&self) -> usize {
        self.allocated
    }

    /// Returns the number of bytes currently held by the [`Pool`].
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.bump.allocated_bytes()
    }

    /// Allocates `len` zeroed bytes.
    ///
    /// # Panics
    /// Panics if `len` exceeds `u32::MAX`, if more than `u32::MAX`
    /// allocations are made between resets, or if the system allocator
    /// fails.
    pub fn alloc(&mut self, len: usize) -> PoolSlice {
        let len32 = u32::try_from(len).expect("pool allocation exceeds u32::MAX bytes");
        let index = u32::try_from(self.allocs.len()).expect("pool exceeds u32::MAX allocations");

        let before = self.bump.allocated_bytes();
        let bytes = self.bump.alloc_slice_fill_copy(len, 0u8);
        self.allocs.push(NonNull::from(bytes));
        self.allocated += len;
        if self.bump.allocated_bytes() != before {
            crate::macros::trace!(capacity = self.bump.allocated_bytes(), "pool grew by one chunk");
        }

        PoolSlice { epoch: self.epoch, index, len: len32 }
    }

    /// Allocates a copy of `data`.
    pub fn alloc_copy(&mut self, data: &[u8]) -> PoolSlice {
        let slice = self.alloc(data.len());
        if let Some(dst) = self.get_mut(slice) {
            dst.copy_from_slice(data);
        }
        slice
    }

    #[inline]
    fn lookup(&self, slice: PoolSlice) -> Option<NonNull<[u8]>> {
        if slice.epoch != self.epoch {
            return None;
        }
        self.allocs.get(slice.index as usize).copied()
    }

    /// Returns the bytes behind `slice`, or [`None`] if it predates the last
    /// `Pool::reset`.
    #[must_use]
    pub fn get(&self, slice: PoolSlice) -> Option<&[u8]> {
        let ptr = self.lookup(slice)?;
        // SAFETY: the allocation lives in `bump` until the next reset, which
        // needs `&mut self` and bumps the epoch. Allocations never overlap.
        Some(unsafe { ptr.as_ref() })
    }

    /// Mutable variant of `Pool::get`.
    #[must_use]
    pub fn get_mut(&mut self, slice: PoolSlice) -> Option<&mut [u8]> {
        let mut ptr = self.lookup(slice)?;
        // SAFETY: as in `Pool::get`, and `&mut self` rules out any other
        // borrow of the same allocation.
        Some(unsafe { ptr.as_mut() })
    }

    /// Invalidates all allocations while keeping the largest chunk for reuse.
    pub fn reset(&mut self) {
        self.allocs.clear();
        self.bump.reset();
        self.allocated = 0;
        self.epoch = self.epoch.wrapping_add(1);
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pool")
            .field("chunk_size", &self.chunk_size)
            .field("allocs", &self.allocs.len())
            .field("used", &self.allocated)
            .finish()
    }
}
