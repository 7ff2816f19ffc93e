//! The free-list allocator and the region-growth protocol.
//!
//! Allocation walks a singly-linked list of free blocks kept in strictly
//! ascending address order, first-fit. Freeing re-inserts the block at its
//! address position and coalesces with both neighbours, so no two free
//! blocks are ever adjacent. When the list is exhausted on a moveable
//! region, the storage is grown and the new tail is spliced into the list.
//!
//! All operations work purely on offsets, so the region may relocate
//! underneath them between calls.

mod bitmap;
mod entry;

pub(crate) use entry::{round_up, LengthWord, FREE_HEADER_SIZE, LENGTH_WORD_SIZE};

use crate::buffer::PayloadBuffer;
use crate::region::OFF_FULL_SIZE;
use crate::storage::Storage;

pub(crate) use bitmap::small_block_index;

/// An error occurred when freeing a block.
///
/// These checks are advisory: they catch the mistakes that are cheap to
/// detect, not every possible corruption. The public facade ignores them,
/// turning a bad free into a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    /// The offset does not lie inside the arena of this region.
    OutOfRange,
    /// The word preceding the block cannot be a valid length word, or a
    /// small-block prefix referenced a run that does not exist.
    Corrupt,
    /// The small-block slot was already free.
    DoubleFree,
}

impl<S: Storage> PayloadBuffer<S> {
    /// Allocate `n` bytes, rounding the size up to a multiple of `round`
    /// (8 for general blocks, 4 for string cells). Returns the payload
    /// offset, or `None` when the request cannot be satisfied.
    ///
    /// `small_ok` routes eligible sizes through the bitmap tier when the
    /// region has it enabled; the tier's own bookkeeping allocations pass
    /// `false` to keep the recursion out.
    pub(crate) fn alloc_inner(
        &mut self,
        n: u32,
        round: u32,
        clear: bool,
        small_ok: bool,
    ) -> Option<u32> {
        // a zero-sized request is malformed, not an empty allocation
        if n == 0 {
            return None;
        }
        if small_ok && self.region.bitmaps_enabled() && small_block_index(n).is_some() {
            return self.small_alloc(n, clear);
        }
        let full = round_up(n, round).checked_add(LENGTH_WORD_SIZE)?;
        loop {
            if let Some(payload) = self.alloc_from_free_list(full, clear) {
                return Some(payload);
            }
            if !self.grow_region(full) {
                return None;
            }
        }
    }

    /// One first-fit pass over the free list.
    fn alloc_from_free_list(&mut self, full: u32, clear: bool) -> Option<u32> {
        let mut prev = 0_u32;
        let mut cur = self.region.free_list();
        while cur != 0 {
            let length = self.region.load(cur);
            let next = self.region.load(cur + 4);
            if length >= full {
                // Split when the remainder can hold a free-block header;
                // otherwise the whole block is handed out and the payload
                // silently grows by the leftover.
                let (block_len, successor) = if length - full >= FREE_HEADER_SIZE {
                    let rest = cur + full;
                    self.region.store(rest, length - full);
                    self.region.store(rest + 4, next);
                    (full, rest)
                } else {
                    (length, next)
                };
                if prev == 0 {
                    self.region.set_free_list(successor);
                } else {
                    self.region.store(prev + 4, successor);
                }

                let payload_len = block_len - LENGTH_WORD_SIZE;
                self.region
                    .store(cur, LengthWord::large(payload_len).as_raw());
                self.region.raise_hwm(cur + block_len);
                let payload = cur + LENGTH_WORD_SIZE;
                if clear {
                    self.region.zero(payload, payload_len);
                }
                return Some(payload);
            }
            prev = cur;
            cur = next;
        }
        None
    }

    /// Grow a moveable region so that a block of `required_full` bytes
    /// (length word included) fits, and splice the new tail into the free
    /// list. Returns `false` when the region cannot grow.
    fn grow_region(&mut self, required_full: u32) -> bool {
        if !self.region.is_moveable() {
            return false;
        }
        let old = self.region.full_size();
        let new = match old
            .checked_mul(2)
            .and_then(|d| old.checked_add(required_full).map(|r| d.max(r)))
        {
            Some(new) => new,
            None => return false,
        };
        if !self.region.storage_mut().grow(old as usize, new as usize) {
            return false;
        }
        self.region.set_header_u32(OFF_FULL_SIZE, new);

        // locate the free-list tail; the list is address-ordered, so the
        // tail is the block closest to the old end
        let mut tail = 0_u32;
        let mut cur = self.region.free_list();
        while cur != 0 {
            tail = cur;
            cur = self.region.load(cur + 4);
        }
        if tail != 0 && tail + self.region.load(tail) == old {
            // the usual case: the last free block touched the old end
            let extended = self.region.load(tail) + (new - old);
            self.region.store(tail, extended);
        } else {
            self.region.store(old, new - old);
            self.region.store(old + 4, 0);
            if tail == 0 {
                self.region.set_free_list(old);
            } else {
                self.region.store(tail + 4, old);
            }
        }
        true
    }

    /// Return the block at payload offset `offset` to the allocator.
    pub(crate) fn free_inner(&mut self, offset: u32) -> Result<(), FreeError> {
        let arena = self.region.arena_start();
        if offset < arena + LENGTH_WORD_SIZE || offset % 4 != 0 {
            return Err(FreeError::OutOfRange);
        }
        let base = offset - LENGTH_WORD_SIZE;
        let word = LengthWord::from_raw(self.region.load(base));
        if let Some(small) = word.small_ref() {
            return self.small_free(small);
        }
        let payload = word.payload_size();
        let length = payload.checked_add(LENGTH_WORD_SIZE).ok_or(FreeError::Corrupt)?;
        if payload < 4 || self.region.validate(base, length).is_none() {
            return Err(FreeError::Corrupt);
        }
        self.insert_free_block(base, length);
        Ok(())
    }

    /// Insert a block into the free list at its address position and
    /// coalesce with the successor and predecessor where they touch. Shared
    /// by free, realloc-shrink and realloc residuals.
    pub(crate) fn insert_free_block(&mut self, base: u32, mut length: u32) {
        let mut prev = 0_u32;
        let mut cur = self.region.free_list();
        while cur != 0 && cur < base {
            prev = cur;
            cur = self.region.load(cur + 4);
        }
        self.region.store(base, length);
        self.region.store(base + 4, cur);
        if prev == 0 {
            self.region.set_free_list(base);
        } else {
            self.region.store(prev + 4, base);
        }

        // coalesce-up: absorb a touching successor
        if cur != 0 && base + length == cur {
            length += self.region.load(cur);
            let after = self.region.load(cur + 4);
            self.region.store(base, length);
            self.region.store(base + 4, after);
        }
        // coalesce-down: let a touching predecessor absorb us
        if prev != 0 {
            let prev_len = self.region.load(prev);
            if prev + prev_len == base {
                self.region.store(prev, prev_len + length);
                let after = self.region.load(base + 4);
                self.region.store(prev + 4, after);
            }
        }
    }

    /// Resize the block at payload offset `offset` to `n` bytes, moving it
    /// only when it cannot grow in place. Returns the (possibly new)
    /// payload offset, or `None` when the request cannot be satisfied, in
    /// which case the old block is left untouched.
    pub(crate) fn realloc_inner(
        &mut self,
        offset: u32,
        n: u32,
        round: u32,
        small_ok: bool,
    ) -> Option<u32> {
        if n == 0 {
            return None;
        }
        let arena = self.region.arena_start();
        if offset < arena + LENGTH_WORD_SIZE {
            return None;
        }
        let base = offset - LENGTH_WORD_SIZE;
        let word = LengthWord::from_raw(self.region.load(base));
        if let Some(small) = word.small_ref() {
            return self.small_realloc(offset, small, n, small_ok);
        }
        let old_n = word.payload_size();
        if old_n < 4 || self.region.validate(offset, old_n).is_none() {
            return None;
        }
        let new_n = round_up(n, round);

        if new_n == old_n {
            return Some(offset);
        }
        if new_n < old_n {
            // trim the tail when it can become a free block, otherwise keep
            // the oversize block as-is
            if old_n - new_n >= FREE_HEADER_SIZE {
                self.region.store(base, LengthWord::large(new_n).as_raw());
                self.insert_free_block(offset + new_n, old_n - new_n);
            }
            return Some(offset);
        }

        let need = new_n - old_n;
        let succ_base = offset + old_n;

        // one ascending walk finds both adjacency candidates: a free block
        // starting exactly at our end, and one ending exactly at our start
        let mut prev = 0_u32;
        let mut cur = self.region.free_list();
        let mut pred: Option<(u32, u32)> = None; // (prev-of-pred, pred)
        let mut succ: Option<(u32, u32, u32)> = None; // (prev, len, next)
        while cur != 0 && cur <= succ_base {
            let len = self.region.load(cur);
            let next = self.region.load(cur + 4);
            if cur + len == base {
                pred = Some((prev, cur));
            }
            if cur == succ_base {
                succ = Some((prev, len, next));
                break;
            }
            prev = cur;
            cur = next;
        }

        // grow up into the successor
        if let Some((sprev, slen, snext)) = succ {
            if slen >= need {
                let residual = slen - need;
                let (final_n, link_to) = if residual >= FREE_HEADER_SIZE {
                    let rest = offset + new_n;
                    self.region.store(rest, residual);
                    self.region.store(rest + 4, snext);
                    (new_n, rest)
                } else {
                    (old_n + slen, snext)
                };
                if sprev == 0 {
                    self.region.set_free_list(link_to);
                } else {
                    self.region.store(sprev + 4, link_to);
                }
                self.region.store(base, LengthWord::large(final_n).as_raw());
                self.region.raise_hwm(offset + final_n);
                return Some(offset);
            }
        }

        // grow down into the predecessor, moving the payload
        if let Some((pprev, pbase)) = pred {
            let plen = self.region.load(pbase);
            if plen + old_n >= new_n {
                let pnext = self.region.load(pbase + 4);
                if pprev == 0 {
                    self.region.set_free_list(pnext);
                } else {
                    self.region.store(pprev + 4, pnext);
                }
                let new_off = pbase + LENGTH_WORD_SIZE;
                self.region.copy_within(offset, new_off, old_n);
                let avail = plen + old_n;
                let residual = avail - new_n;
                let final_n = if residual >= FREE_HEADER_SIZE {
                    new_n
                } else {
                    avail
                };
                self.region
                    .store(pbase, LengthWord::large(final_n).as_raw());
                if residual >= FREE_HEADER_SIZE {
                    self.insert_free_block(new_off + final_n, residual);
                }
                self.region.raise_hwm(new_off + final_n);
                return Some(new_off);
            }
        }

        // no adjacent room: allocate elsewhere, copy, free
        let new_off = self.alloc_inner(n, round, false, small_ok)?;
        self.region.copy_within(offset, new_off, old_n);
        let _ = self.free_inner(offset);
        Some(new_off)
    }

    /// The usable size of the block at payload offset `offset`, decoding
    /// either length-word variant. For a small block this is the logical
    /// (requested) size; for a free-list block the rounded payload size.
    pub(crate) fn block_size_inner(&self, offset: u32) -> u32 {
        if offset < LENGTH_WORD_SIZE {
            return 0;
        }
        let word = LengthWord::from_raw(self.region.load(offset - LENGTH_WORD_SIZE));
        match word.small_ref() {
            Some(small) => small.size,
            None => word.payload_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::buffer::{BufferOptions, PayloadBuffer};
    use crate::storage::SliceStorage;

    use super::FreeError;

    const PLAIN: BufferOptions = BufferOptions {
        bitmaps: false,
        prime: false,
    };

    fn fixed(memory: &mut [u8]) -> PayloadBuffer<SliceStorage<'_>> {
        PayloadBuffer::init_fixed(SliceStorage::new(memory), PLAIN)
    }

    #[test]
    fn zero_sized_allocation_fails() {
        let mut memory = [0_u8; 256];
        let mut buffer = fixed(&mut memory);
        assert_eq!(buffer.allocate(0, true), None);
    }

    #[test]
    fn allocation_splits_the_free_block() {
        let mut memory = [0_u8; 256];
        let mut buffer = fixed(&mut memory);

        let a = buffer.allocate(16, true).unwrap();
        let b = buffer.allocate(16, true).unwrap();
        // blocks are carved front to back: payload, length word, payload
        assert_eq!(b.get(), a.get() + 16 + 4);
        assert_eq!(buffer.block_size(a), 16);
        buffer.check().unwrap();
    }

    #[test]
    fn sizes_round_to_eight() {
        let mut memory = [0_u8; 256];
        let mut buffer = fixed(&mut memory);
        let a = buffer.allocate(1, true).unwrap();
        assert_eq!(buffer.block_size(a), 8);
        let b = buffer.allocate(9, true).unwrap();
        assert_eq!(buffer.block_size(b), 16);
    }

    #[test]
    fn exhaustion_returns_none_on_fixed_regions() {
        let mut memory = [0_u8; 128];
        let mut buffer = fixed(&mut memory);
        assert!(buffer.allocate(64, true).is_some());
        assert_eq!(buffer.allocate(64, true), None);
    }

    #[test]
    fn whole_block_takeover_grows_the_payload() {
        let mut memory = [0_u8; 128];
        let mut buffer = fixed(&mut memory);
        let arena = buffer.arena_size();
        // the entire arena minus the length word, rounded down to 8
        let n = (arena - 4) & !7;
        let p = buffer.allocate(n, true).unwrap();
        // the leftover was too small to split off, so the payload absorbed it
        assert_eq!(buffer.block_size(p), arena - 4);
        buffer.check().unwrap();
    }

    #[test]
    fn free_coalesces_with_the_successor() {
        let mut memory = [0_u8; 256];
        let mut buffer = fixed(&mut memory);
        let a = buffer.allocate(16, true).unwrap();
        let b = buffer.allocate(16, true).unwrap();
        buffer.free(b);
        buffer.free(a);
        buffer.check().unwrap();
        // everything coalesced back into one block
        assert_eq!(buffer.free_block_count(), 1);
    }

    #[test]
    fn free_coalesces_with_the_predecessor() {
        let mut memory = [0_u8; 256];
        let mut buffer = fixed(&mut memory);
        let a = buffer.allocate(16, true).unwrap();
        let b = buffer.allocate(16, true).unwrap();
        let _c = buffer.allocate(16, true).unwrap();
        buffer.free(a);
        buffer.free(b);
        buffer.check().unwrap();
        assert_eq!(buffer.free_block_count(), 2);
    }

    #[test]
    fn reverse_free_reconstitutes_the_initial_block() {
        let mut memory = [0_u8; 512];
        let mut buffer = fixed(&mut memory);
        let initial = buffer.arena_size();

        let a = buffer.allocate(32, true).unwrap();
        let b = buffer.allocate(64, true).unwrap();
        let c = buffer.allocate(96, true).unwrap();
        for p in [c, b, a] {
            buffer.free(p);
        }
        buffer.check().unwrap();
        assert_eq!(buffer.free_block_count(), 1);
        assert_eq!(buffer.largest_free_block(), initial);
    }

    #[test]
    fn free_of_garbage_is_detected() {
        let mut memory = [0_u8; 256];
        let mut buffer = fixed(&mut memory);
        let _ = buffer.allocate(16, true).unwrap();
        assert_eq!(buffer.free_inner(2), Err(FreeError::OutOfRange));
        assert_eq!(buffer.free_inner(10_000), Err(FreeError::Corrupt));
    }

    #[test]
    fn realloc_same_rounded_size_is_a_no_op() {
        let mut memory = [0_u8; 256];
        let mut buffer = fixed(&mut memory);
        let a = buffer.allocate(16, true).unwrap();
        assert_eq!(buffer.realloc(Some(a), 13), Some(a));
        assert_eq!(buffer.block_size(a), 16);
    }

    #[test]
    fn realloc_shrink_returns_the_tail() {
        let mut memory = [0_u8; 256];
        let mut buffer = fixed(&mut memory);
        let a = buffer.allocate(64, true).unwrap();
        let _b = buffer.allocate(16, true).unwrap();
        assert_eq!(buffer.realloc(Some(a), 16), Some(a));
        assert_eq!(buffer.block_size(a), 16);
        buffer.check().unwrap();
        // the trimmed 48 bytes are available again
        assert!(buffer.allocate(44, true).is_some());
    }

    #[test]
    fn realloc_grows_up_in_place() {
        let mut memory = [0_u8; 256];
        let mut buffer = fixed(&mut memory);
        let a = buffer.allocate(16, false).unwrap();
        buffer
            .bytes_mut(a, 16)
            .unwrap()
            .copy_from_slice(&[7_u8; 16]);
        // the free block after `a` allows in-place growth
        let grown = buffer.realloc(Some(a), 32).unwrap();
        assert_eq!(grown, a);
        assert_eq!(buffer.bytes(a, 16).unwrap(), &[7_u8; 16][..]);
        buffer.check().unwrap();
    }

    #[test]
    fn realloc_grows_down_with_a_move() {
        let mut memory = [0_u8; 256];
        let mut buffer = fixed(&mut memory);
        let a = buffer.allocate(32, true).unwrap();
        let b = buffer.allocate(16, false).unwrap();
        // pin the tail so `b` cannot grow upward
        let tail = buffer.arena_size() - (32 + 4) - (16 + 4) - 4;
        let _c = buffer.allocate(tail, true).unwrap();
        buffer.bytes_mut(b, 16).unwrap().copy_from_slice(&[9_u8; 16]);

        buffer.free(a);
        let moved = buffer.realloc(Some(b), 40).unwrap();
        assert!(moved.get() < b.get());
        assert_eq!(buffer.bytes(moved, 16).unwrap(), &[9_u8; 16][..]);
        buffer.check().unwrap();
    }

    #[test]
    fn realloc_moves_when_no_neighbour_fits() {
        let mut memory = [0_u8; 512];
        let mut buffer = fixed(&mut memory);
        let a = buffer.allocate(16, false).unwrap();
        let _pin = buffer.allocate(16, true).unwrap();
        buffer.bytes_mut(a, 16).unwrap().copy_from_slice(&[3_u8; 16]);

        let moved = buffer.realloc(Some(a), 64).unwrap();
        assert_ne!(moved, a);
        assert_eq!(buffer.bytes(moved, 16).unwrap(), &[3_u8; 16][..]);
        buffer.check().unwrap();
    }

    #[test]
    fn realloc_of_null_allocates() {
        let mut memory = [0_u8; 256];
        let mut buffer = fixed(&mut memory);
        let a = buffer.realloc(None, 24).unwrap();
        assert_eq!(buffer.block_size(a), 24);
    }

    #[test]
    fn failed_realloc_leaves_the_block_alone() {
        let mut memory = [0_u8; 128];
        let mut buffer = fixed(&mut memory);
        let a = buffer.allocate(16, false).unwrap();
        buffer.bytes_mut(a, 16).unwrap().copy_from_slice(&[5_u8; 16]);
        assert_eq!(buffer.realloc(Some(a), 4096), None);
        assert_eq!(buffer.bytes(a, 16).unwrap(), &[5_u8; 16][..]);
        buffer.check().unwrap();
    }

    #[cfg(feature = "alloc")]
    mod moveable {
        use super::PLAIN;
        use crate::buffer::PayloadBuffer;
        use crate::storage::HeapStorage;

        #[test]
        fn exhaustion_grows_the_region() {
            let mut buffer = PayloadBuffer::init_moveable(HeapStorage::with_size(256), PLAIN);
            let a = buffer.allocate(130, false).unwrap();
            buffer
                .bytes_mut(a, 130)
                .unwrap()
                .copy_from_slice(&[0xaa_u8; 130]);

            // no room left: this one triggers the resize protocol
            let b = buffer.allocate(130, false).unwrap();
            buffer
                .bytes_mut(b, 130)
                .unwrap()
                .copy_from_slice(&[0xbb_u8; 130]);

            assert!(buffer.full_size() >= 512);
            assert_eq!(buffer.bytes(a, 130).unwrap(), &[0xaa_u8; 130][..]);
            assert_eq!(buffer.bytes(b, 130).unwrap(), &[0xbb_u8; 130][..]);
            buffer.check().unwrap();
        }

        #[test]
        fn growth_extends_the_tail_block() {
            let mut buffer = PayloadBuffer::init_moveable(HeapStorage::with_size(256), PLAIN);
            let initial = buffer.arena_size();
            let _a = buffer.allocate(64, true).unwrap();
            let _b = buffer.allocate(200, true).unwrap();
            buffer.check().unwrap();
            // after doubling, the arena is one free tail plus the two blocks
            assert!(buffer.arena_size() > initial);
            assert_eq!(buffer.free_block_count(), 1);
        }
    }
}
