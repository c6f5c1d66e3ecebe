//! Call-scoped scratch arena for translated parameters.
//!
//! Submissions need a handful of short-lived arrays (unwrapped command buffers, rewritten wait and
//! signal lists). They are carved out of a fixed inline buffer first; once that is exhausted the
//! context chains heap blocks, all released together by [`ConversionContext::free_all`] or on
//! drop. The context is `!Sync` and is meant to live on one call's stack.

use std::cell::{Cell, UnsafeCell};
use std::ptr::NonNull;

use bytemuck::Pod;

use crate::error::{BridgeError, Result};

/// Default inline capacity: 512 words (4 KiB).
pub const DEFAULT_INLINE_WORDS: usize = 512;

const DEFAULT_BLOCK_BYTES: usize = 16 * 1024;

pub struct ConversionContext<const WORDS: usize = DEFAULT_INLINE_WORDS> {
    inline: UnsafeCell<[u64; WORDS]>,
    inline_used: Cell<usize>,
    blocks: UnsafeCell<Vec<NonNull<[u64]>>>,
    block_used: Cell<usize>,
    block_words: usize,
}

impl ConversionContext {
    pub fn new() -> Self {
        Self::with_block_bytes(DEFAULT_BLOCK_BYTES)
    }
}

impl Default for ConversionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl<const WORDS: usize> ConversionContext<WORDS> {
    pub fn with_block_bytes(block_bytes: usize) -> Self {
        Self {
            inline: UnsafeCell::new([0; WORDS]),
            inline_used: Cell::new(0),
            blocks: UnsafeCell::new(Vec::new()),
            block_used: Cell::new(0),
            block_words: (block_bytes / 8).max(1),
        }
    }

    /// Returns a zeroed slice of `len` elements valid until the next [`Self::free_all`].
    #[allow(clippy::mut_from_ref)]
    pub fn alloc<T: Pod>(&self, len: usize) -> Result<&mut [T]> {
        if core::mem::align_of::<T>() > core::mem::align_of::<u64>() {
            return Err(BridgeError::InvalidParameter("over-aligned conversion element"));
        }
        if len == 0 || core::mem::size_of::<T>() == 0 {
            // SAFETY: a dangling, aligned pointer is valid for empty and zero-sized slices.
            return Ok(unsafe { core::slice::from_raw_parts_mut(NonNull::<T>::dangling().as_ptr(), len) });
        }

        let bytes = len
            .checked_mul(core::mem::size_of::<T>())
            .ok_or(BridgeError::OutOfHostMemory)?;
        let words = bytes.div_ceil(8);

        let used = self.inline_used.get();
        let ptr = if WORDS - used >= words {
            self.inline_used.set(used + words);
            // SAFETY: `used + words <= WORDS`; the range was never handed out before.
            unsafe { self.inline.get().cast::<u64>().add(used) }
        } else {
            self.alloc_overflow(words)?
        };

        // SAFETY: `ptr` points at `words` exclusively owned, 8-byte aligned words; any bit pattern
        // (including zero) is a valid `T: Pod`.
        unsafe {
            core::ptr::write_bytes(ptr, 0, words);
            Ok(core::slice::from_raw_parts_mut(ptr.cast::<T>(), len))
        }
    }

    /// Copies `items` into the arena.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_copy<T: Pod>(&self, items: &[T]) -> Result<&mut [T]> {
        let out = self.alloc::<T>(items.len())?;
        out.copy_from_slice(items);
        Ok(out)
    }

    fn alloc_overflow(&self, words: usize) -> Result<*mut u64> {
        // SAFETY: the block list itself is only accessed here and through `&mut self`; callers
        // only ever hold references into the blocks, never into the list.
        let blocks = unsafe { &mut *self.blocks.get() };

        if let Some(last) = blocks.last() {
            let used = self.block_used.get();
            if last.len() - used >= words {
                self.block_used.set(used + words);
                // SAFETY: in bounds of the live block.
                return Ok(unsafe { last.as_ptr().cast::<u64>().add(used) });
            }
        }

        blocks
            .try_reserve(1)
            .map_err(|_| BridgeError::OutOfHostMemory)?;
        let block_words = words.max(self.block_words);
        let mut storage: Vec<u64> = Vec::new();
        storage
            .try_reserve_exact(block_words)
            .map_err(|_| BridgeError::OutOfHostMemory)?;
        storage.resize(block_words, 0);

        let block = NonNull::from(Box::leak(storage.into_boxed_slice()));
        blocks.push(block);
        self.block_used.set(words);
        Ok(block.as_ptr().cast::<u64>())
    }

    /// Bytes currently handed out, inline and overflow.
    pub fn bytes_in_use(&self) -> usize {
        // SAFETY: read-only look at the block list; see `alloc_overflow`.
        let blocks = unsafe { &*self.blocks.get() };
        let full: usize = blocks
            .iter()
            .rev()
            .skip(1)
            .map(|block| block.len())
            .sum();
        let tail = if blocks.is_empty() {
            0
        } else {
            self.block_used.get()
        };
        (self.inline_used.get() + full + tail) * 8
    }

    pub fn overflow_blocks(&self) -> usize {
        // SAFETY: see `bytes_in_use`.
        unsafe { &*self.blocks.get() }.len()
    }

    pub fn free_all(&mut self) {
        self.inline_used.set(0);
        self.block_used.set(0);
        for block in self.blocks.get_mut().drain(..) {
            // SAFETY: every block came from `Box::leak` in `alloc_overflow` and is freed once.
            drop(unsafe { Box::from_raw(block.as_ptr()) });
        }
    }
}

impl<const WORDS: usize> Drop for ConversionContext<WORDS> {
    fn drop(&mut self) {
        self.free_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_are_zeroed_and_disjoint() {
        let arena = ConversionContext::new();
        let a = arena.alloc::<u64>(4).unwrap();
        let b = arena.alloc::<u32>(3).unwrap();
        assert!(a.iter().all(|&v| v == 0));
        assert!(b.iter().all(|&v| v == 0));

        a.fill(u64::MAX);
        b.fill(7);
        assert!(a.iter().all(|&v| v == u64::MAX));
        assert_eq!(b, &[7, 7, 7]);
        assert_eq!(arena.bytes_in_use(), 4 * 8 + 16);
        assert_eq!(arena.overflow_blocks(), 0);
    }

    #[test]
    fn overflow_chains_heap_blocks() {
        let arena: ConversionContext<4> = ConversionContext::with_block_bytes(64);
        let inline = arena.alloc::<u64>(4).unwrap();
        let first = arena.alloc::<u64>(6).unwrap();
        let second = arena.alloc::<u64>(6).unwrap();
        let big = arena.alloc::<u64>(100).unwrap();

        inline.fill(1);
        first.fill(2);
        second.fill(3);
        big.fill(4);
        assert!(inline.iter().all(|&v| v == 1));
        assert!(first.iter().all(|&v| v == 2));
        assert!(second.iter().all(|&v| v == 3));
        assert_eq!(arena.overflow_blocks(), 3);
    }

    #[test]
    fn free_all_resets_the_arena() {
        let mut arena: ConversionContext<4> = ConversionContext::with_block_bytes(64);
        arena.alloc::<u64>(10).unwrap().fill(9);
        arena.free_all();
        assert_eq!(arena.bytes_in_use(), 0);
        assert_eq!(arena.overflow_blocks(), 0);

        // Reused storage comes back zeroed.
        assert!(arena.alloc::<u64>(4).unwrap().iter().all(|&v| v == 0));
    }

    #[test]
    fn size_overflow_is_out_of_host_memory() {
        let arena = ConversionContext::new();
        assert_eq!(
            arena.alloc::<u64>(usize::MAX).err(),
            Some(BridgeError::OutOfHostMemory)
        );
        assert!(arena.alloc::<u8>(0).unwrap().is_empty());
    }

    #[test]
    fn alloc_copy_preserves_contents() {
        let arena = ConversionContext::new();
        let out = arena.alloc_copy(&[1u16, 2, 3]).unwrap();
        assert_eq!(out, &[1, 2, 3]);
    }
}
