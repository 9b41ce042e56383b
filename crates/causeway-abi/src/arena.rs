//! Per-call conversion arena.
//!
//! Deep structure conversion needs scratch copies whose addresses stay valid
//! for the duration of one bridged call: converted chain nodes, filtered
//! arrays, patched attribute blocks. [`ConvArena`] owns those copies and
//! frees them together when the call returns. Allocation failure is
//! reported, not aborted on, so marshallers can surface the API's own
//! out-of-memory status.

use std::cell::{Cell, RefCell};
use std::mem::{align_of, size_of};

use thiserror::Error;

/// Allocation failure during structure conversion.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("out of memory while converting structures")]
pub struct OutOfMemory;

/// Holder for temporary copies made while marshalling one call.
///
/// Every allocation is an independent block, so addresses handed out earlier
/// stay stable as the arena grows. The arena belongs to one call on one
/// thread and never escapes it.
pub struct ConvArena {
    chunks: RefCell<Vec<Box<[u8]>>>,
    remaining: Cell<usize>,
}

impl ConvArena {
    pub fn new() -> Self {
        Self {
            chunks: RefCell::new(Vec::new()),
            remaining: Cell::new(usize::MAX),
        }
    }

    /// An arena that fails after `budget` bytes. Used to exercise
    /// out-of-memory paths deterministically.
    pub fn with_budget(budget: usize) -> Self {
        Self {
            chunks: RefCell::new(Vec::new()),
            remaining: Cell::new(budget),
        }
    }

    /// Allocates `size` zeroed bytes at the given alignment.
    pub fn alloc_bytes(&self, size: usize, align: usize) -> Result<*mut u8, OutOfMemory> {
        debug_assert!(align.is_power_of_two());
        if size == 0 {
            return Ok(align as *mut u8);
        }
        let total = size + align - 1;
        if self.remaining.get() < total {
            return Err(OutOfMemory);
        }

        let mut block: Vec<u8> = Vec::new();
        block.try_reserve_exact(total).map_err(|_| OutOfMemory)?;
        block.resize(total, 0);
        let mut block = block.into_boxed_slice();

        let base = block.as_mut_ptr();
        let offset = base.align_offset(align);
        debug_assert!(offset < align);
        let ptr = unsafe { base.add(offset) };

        self.remaining.set(self.remaining.get() - total);
        self.chunks.borrow_mut().push(block);
        Ok(ptr)
    }

    /// Copies one value into the arena.
    pub fn alloc<T: Copy>(&self, value: T) -> Result<*mut T, OutOfMemory> {
        let ptr = self.alloc_bytes(size_of::<T>(), align_of::<T>())? as *mut T;
        // alloc_bytes honors T's alignment.
        unsafe { ptr.write(value) };
        Ok(ptr)
    }

    /// Copies a slice into the arena, returning the base of the copy.
    pub fn alloc_slice<T: Copy>(&self, values: &[T]) -> Result<*mut T, OutOfMemory> {
        let bytes = values.len() * size_of::<T>();
        let ptr = self.alloc_bytes(bytes, align_of::<T>())? as *mut T;
        unsafe { std::ptr::copy_nonoverlapping(values.as_ptr(), ptr, values.len()) };
        Ok(ptr)
    }

    /// Number of blocks currently held.
    pub fn blocks(&self) -> usize {
        self.chunks.borrow().len()
    }
}

impl Default for ConvArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_addresses_stay_stable_as_arena_grows() {
        let arena = ConvArena::new();
        let first = arena.alloc(0x11223344u32).unwrap();
        let mut ptrs = Vec::new();
        for i in 0..100u64 {
            ptrs.push((arena.alloc(i).unwrap(), i));
        }
        assert_eq!(unsafe { *first }, 0x11223344);
        for (p, i) in ptrs {
            assert_eq!(unsafe { *p }, i);
        }
    }

    #[test]
    fn test_alloc_respects_alignment() {
        #[derive(Clone, Copy)]
        #[repr(C, align(16))]
        struct Wide(u128);

        let arena = ConvArena::new();
        for _ in 0..8 {
            let p = arena.alloc(Wide(9)).unwrap();
            assert_eq!(p as usize % 16, 0);
        }
    }

    #[test]
    fn test_alloc_slice_copies() {
        let arena = ConvArena::new();
        let src = [1u16, 2, 3, 4];
        let p = arena.alloc_slice(&src).unwrap();
        let copy = unsafe { std::slice::from_raw_parts(p, 4) };
        assert_eq!(copy, &src);
    }

    #[test]
    fn test_budget_exhaustion_reports_out_of_memory() {
        let arena = ConvArena::with_budget(16);
        assert!(arena.alloc_bytes(8, 1).is_ok());
        assert_eq!(arena.alloc_bytes(64, 1), Err(OutOfMemory));
        // A smaller request can still fit in what remains.
        assert!(arena.alloc_bytes(4, 1).is_ok());
    }

    #[test]
    fn test_zero_size_allocations_take_no_space() {
        let arena = ConvArena::with_budget(0);
        assert!(arena.alloc_bytes(0, 8).is_ok());
        assert_eq!(arena.blocks(), 0);
    }
}
