//! Diagnostics: structural validation and debug rendering of a region.

use core::fmt;

use crate::heap::LengthWord;
use crate::buffer::PayloadBuffer;
use crate::region::NUM_SIZE_CLASSES;
use crate::storage::Storage;

/// A structural inconsistency found by [`PayloadBuffer::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
    /// The header magic is not one of the recognised values.
    BadMagic,
    /// The free list is not in strictly ascending address order (or has a
    /// cycle).
    FreeListOrder { offset: u32 },
    /// A free block lies outside the arena or overruns the region.
    FreeListRange { offset: u32 },
    /// Two free blocks touch; free always coalesces, so this never happens
    /// in a healthy region.
    AdjacentFreeBlocks { offset: u32 },
    /// The arena walk hit a length word that cannot be valid.
    CorruptBlock { offset: u32 },
    /// Allocated plus free blocks do not tile the arena exactly.
    Accounting { expected: u32, actual: u32 },
    /// The high-water mark lies outside the region.
    HwmOutOfBounds { hwm: u32 },
}

impl<S: Storage> PayloadBuffer<S> {
    /// Validate the structural invariants of the region: free-list order,
    /// non-adjacency, block accounting and the high-water-mark bounds.
    ///
    /// Intended for tests and embedders' debug builds; the allocator itself
    /// never calls it.
    pub fn check(&self) -> Result<(), CheckError> {
        if !self.region.is_valid() {
            return Err(CheckError::BadMagic);
        }
        let full = self.region.full_size();
        let arena = self.region.arena_start();
        let hwm = self.region.hwm();
        if hwm < arena || hwm > full {
            return Err(CheckError::HwmOutOfBounds { hwm });
        }

        // pass 1: the free list itself
        let mut prev = 0_u32;
        let mut prev_end = 0_u32;
        let mut steps = 0_u32;
        let mut cur = self.region.free_list();
        while cur != 0 {
            steps += 1;
            if steps > full / 8 {
                return Err(CheckError::FreeListOrder { offset: cur });
            }
            if cur <= prev {
                return Err(CheckError::FreeListOrder { offset: cur });
            }
            let len = self.region.load(cur);
            if cur < arena || len < 8 || cur.checked_add(len).map_or(true, |end| end > full) {
                return Err(CheckError::FreeListRange { offset: cur });
            }
            if prev != 0 && prev_end == cur {
                return Err(CheckError::AdjacentFreeBlocks { offset: cur });
            }
            prev = cur;
            prev_end = cur + len;
            cur = self.region.load(cur + 4);
        }

        // pass 2: free and allocated blocks must tile the arena exactly
        let mut next_free = self.region.free_list();
        let mut pos = arena;
        while pos < full {
            if pos == next_free {
                let len = self.region.load(pos);
                next_free = self.region.load(pos + 4);
                pos += len;
            } else {
                let word = LengthWord::from_raw(self.region.load(pos));
                if word.is_small() {
                    // small blocks live inside runs, never at the top level
                    return Err(CheckError::CorruptBlock { offset: pos });
                }
                let payload = word.payload_size();
                if payload < 4 {
                    return Err(CheckError::CorruptBlock { offset: pos });
                }
                pos = match pos.checked_add(4 + payload) {
                    Some(end) if end <= full => end,
                    _ => return Err(CheckError::CorruptBlock { offset: pos }),
                };
            }
        }
        if pos != full {
            return Err(CheckError::Accounting {
                expected: full,
                actual: pos,
            });
        }
        Ok(())
    }

    /// The number of blocks currently on the free list.
    pub fn free_block_count(&self) -> u32 {
        let mut count = 0;
        let mut cur = self.region.free_list();
        while cur != 0 && count < self.region.full_size() / 8 {
            count += 1;
            cur = self.region.load(cur + 4);
        }
        count
    }

    /// The length of the largest free block, header included. This is an
    /// upper bound on what a single allocation can still get without
    /// growing the region.
    pub fn largest_free_block(&self) -> u32 {
        let mut largest = 0;
        let mut steps = 0;
        let mut cur = self.region.free_list();
        while cur != 0 && steps < self.region.full_size() / 8 {
            largest = largest.max(self.region.load(cur));
            steps += 1;
            cur = self.region.load(cur + 4);
        }
        largest
    }
}

struct FreeList<'a, S: Storage>(&'a PayloadBuffer<S>);

impl<S: Storage> fmt::Debug for FreeList<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let region = &self.0.region;
        let mut list = f.debug_list();
        let mut steps = 0;
        let mut cur = region.free_list();
        while cur != 0 && steps < region.full_size() / 8 {
            list.entry(&(cur, region.load(cur)));
            steps += 1;
            cur = region.load(cur + 4);
        }
        list.finish()
    }
}

struct Runs<'a, S: Storage>(&'a PayloadBuffer<S>);

impl<S: Storage> fmt::Debug for Runs<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let region = &self.0.region;
        let mut list = f.debug_list();
        for class in 0..NUM_SIZE_CLASSES {
            let vec_off = region.bitmap_vec(class);
            let runs = if vec_off == 0 { 0 } else { region.load(vec_off) };
            list.entry(&runs);
        }
        list.finish()
    }
}

impl<S: Storage> fmt::Debug for PayloadBuffer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadBuffer")
            .field("magic", &format_args!("{:#010x}", self.region.magic()))
            .field("moveable", &self.is_moveable())
            .field("full_size", &self.full_size())
            .field("hwm", &self.hwm())
            .field("message", &self.main_message())
            .field("free", &FreeList(self))
            .field("runs_per_class", &Runs(self))
            .finish()
    }
}
