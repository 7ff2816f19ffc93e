//! The small-block bitmap tier.
//!
//! Requests up to 128 bytes are served from *runs*: fixed groups of
//! equally-sized slots tracked by a per-run occupancy bitmap. A run belongs
//! to one of four size classes and is itself an ordinary free-list block, so
//! the tier nests cleanly inside the arena. The runs of a class are listed
//! in a vector hanging off the region header, created lazily on the first
//! allocation of that class.
//!
//! Allocation scans the runs newest-first (the most recently created run is
//! the most likely to have capacity) and takes the lowest clear bit. The
//! slot's 4-byte prefix encodes exactly where the slot lives, which makes
//! freeing O(1): decode, clear the bit, done. No search.
//!
//! Runs and the run vectors are allocated with the small-block path
//! disabled, so the tier never recurses into itself.

use crate::buffer::PayloadBuffer;
use crate::storage::Storage;

use super::entry::{LengthWord, SmallRef, LENGTH_WORD_SIZE};
use super::FreeError;

/// The four slot sizes served by the tier.
pub(crate) const SIZE_CLASSES: [u32; 4] = [16, 32, 64, 128];
/// Slots per run, per class. Sized so a run fits comfortably in one
/// free-list block of a small region.
const RUN_SLOTS: [u32; 4] = [20, 10, 6, 2];
/// Run header: `bits: u32, size: u8, num: u8, free: u8` plus one pad byte.
const RUN_HEADER_SIZE: u32 = 8;

const RUN_BITS: u32 = 0;
const RUN_SIZE: u32 = 4;
const RUN_NUM: u32 = 5;
const RUN_FREE: u32 = 6;

/// The smallest class whose slots hold `n` bytes, or `None` when `n`
/// exceeds the largest class.
pub(crate) fn small_block_index(n: u32) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&class| n <= class)
}

impl<S: Storage> PayloadBuffer<S> {
    /// Serve an allocation of `n` bytes (`n ≤ 128`) from the bitmap tier.
    pub(crate) fn small_alloc(&mut self, n: u32, clear: bool) -> Option<u32> {
        let class = small_block_index(n)?;
        let vec_off = self.class_vector(class)?;

        // newest runs first
        let mut picked: Option<(u32, u32)> = None;
        let count = self.region.load(vec_off);
        let data = self.region.load(vec_off + 4);
        if data != 0 {
            for index in (0..count).rev() {
                let run = self.region.load(data + 4 * index);
                if run != 0 && self.region.load_u8(run + RUN_FREE) > 0 {
                    picked = Some((run, index));
                    break;
                }
            }
        }
        let (run, index) = match picked {
            Some(found) => found,
            None => {
                let run = self.new_run(class)?;
                let index = self.region.load(vec_off);
                if !self.vector_push_raw(vec_off, run, false) {
                    let _ = self.free_inner(run);
                    return None;
                }
                (run, index)
            }
        };

        let bits = self.region.load(run + RUN_BITS);
        let num = u32::from(self.region.load_u8(run + RUN_NUM));
        let bit = (!bits).trailing_zeros();
        if bit >= num {
            // free count and bitmap disagree: corrupt run, fail the request
            return None;
        }
        self.region.store(run + RUN_BITS, bits | (1 << bit));
        let free = self.region.load_u8(run + RUN_FREE);
        self.region.store_u8(run + RUN_FREE, free - 1);

        let size = u32::from(self.region.load_u8(run + RUN_SIZE));
        let slot = run + RUN_HEADER_SIZE + bit * (LENGTH_WORD_SIZE + size);
        let word = LengthWord::small(SmallRef {
            bit,
            run: index,
            size: n,
        });
        self.region.store(slot, word.as_raw());
        let payload = slot + LENGTH_WORD_SIZE;
        if clear {
            self.region.zero(payload, n);
        }
        Some(payload)
    }

    /// Release the slot described by a decoded small-block prefix.
    pub(crate) fn small_free(&mut self, small: SmallRef) -> Result<(), FreeError> {
        let run = self.find_run(small).ok_or(FreeError::Corrupt)?;
        let bits = self.region.load(run + RUN_BITS);
        let mask = 1_u32 << small.bit;
        if bits & mask == 0 {
            return Err(FreeError::DoubleFree);
        }
        self.region.store(run + RUN_BITS, bits & !mask);
        let free = self.region.load_u8(run + RUN_FREE);
        self.region.store_u8(run + RUN_FREE, free + 1);
        Ok(())
    }

    /// Resize a small block. The slot is retained whenever the new size
    /// still maps to the same size class (the encoded logical size is
    /// simply rewritten); otherwise the payload moves.
    pub(crate) fn small_realloc(
        &mut self,
        offset: u32,
        small: SmallRef,
        n: u32,
        small_ok: bool,
    ) -> Option<u32> {
        if n == 0 {
            return None;
        }
        let class = small_block_index(small.size)?;
        if small_block_index(n) == Some(class) {
            let word = LengthWord::small(SmallRef { size: n, ..small });
            self.region.store(offset - LENGTH_WORD_SIZE, word.as_raw());
            return Some(offset);
        }
        let new_off = self.alloc_inner(n, 8, false, small_ok)?;
        self.region.copy_within(offset, new_off, small.size.min(n));
        let _ = self.small_free(small);
        Some(new_off)
    }

    /// Pre-allocate one empty run per size class, so the first allocation
    /// in each class pays no growth cost. Returns `false` when the region
    /// ran out of space (or has the tier disabled) before all classes were
    /// primed.
    pub fn prime(&mut self) -> bool {
        if !self.region.bitmaps_enabled() {
            return false;
        }
        for class in 0..SIZE_CLASSES.len() {
            let vec_off = match self.class_vector(class) {
                Some(offset) => offset,
                None => return false,
            };
            if self.region.load(vec_off) != 0 {
                continue;
            }
            let run = match self.new_run(class) {
                Some(run) => run,
                None => return false,
            };
            if !self.vector_push_raw(vec_off, run, false) {
                let _ = self.free_inner(run);
                return false;
            }
        }
        true
    }

    /// The run vector of a class, created lazily.
    fn class_vector(&mut self, class: usize) -> Option<u32> {
        let current = self.region.bitmap_vec(class);
        if current != 0 {
            return Some(current);
        }
        let offset = self.alloc_inner(8, 8, true, false)?;
        self.region.set_bitmap_vec(class, offset);
        Some(offset)
    }

    /// Carve and initialize a fresh run for a class. Goes through the
    /// general allocator with the small-block path disabled.
    fn new_run(&mut self, class: usize) -> Option<u32> {
        let size = SIZE_CLASSES[class];
        let num = RUN_SLOTS[class];
        let bytes = RUN_HEADER_SIZE + num * (LENGTH_WORD_SIZE + size);
        let run = self.alloc_inner(bytes, 8, true, false)?;
        self.region.store_u8(run + RUN_SIZE, size as u8);
        self.region.store_u8(run + RUN_NUM, num as u8);
        self.region.store_u8(run + RUN_FREE, num as u8);
        Some(run)
    }

    /// Resolve a decoded prefix back to its run offset.
    fn find_run(&self, small: SmallRef) -> Option<u32> {
        let class = small_block_index(small.size)?;
        let vec_off = self.region.bitmap_vec(class);
        if vec_off == 0 {
            return None;
        }
        let count = self.region.load(vec_off);
        if small.run >= count {
            return None;
        }
        let data = self.region.load(vec_off + 4);
        let run = self.region.load(data + 4 * small.run);
        let num = u32::from(self.region.load_u8(run + RUN_NUM));
        (run != 0 && small.bit < num).then_some(run)
    }
}

#[cfg(test)]
mod tests {
    use crate::buffer::{BufferOptions, PayloadBuffer};
    use crate::storage::SliceStorage;

    use super::small_block_index;

    const WITH_TIER: BufferOptions = BufferOptions {
        bitmaps: true,
        prime: false,
    };

    fn tiered(memory: &mut [u8]) -> PayloadBuffer<SliceStorage<'_>> {
        PayloadBuffer::init_fixed(SliceStorage::new(memory), WITH_TIER)
    }

    #[test]
    fn class_lookup() {
        assert_eq!(small_block_index(1), Some(0));
        assert_eq!(small_block_index(16), Some(0));
        assert_eq!(small_block_index(17), Some(1));
        assert_eq!(small_block_index(64), Some(2));
        assert_eq!(small_block_index(128), Some(3));
        assert_eq!(small_block_index(129), None);
    }

    #[test]
    fn freed_slot_is_reused() {
        let mut memory = [0_u8; 4096];
        let mut buffer = tiered(&mut memory);

        let first = buffer.allocate(10, true).unwrap();
        buffer.free(first);
        let second = buffer.allocate(10, true).unwrap();
        assert_eq!(second, first);
    }

    #[test]
    fn block_size_reports_the_logical_size() {
        let mut memory = [0_u8; 4096];
        let mut buffer = tiered(&mut memory);
        let p = buffer.allocate(10, true).unwrap();
        assert_eq!(buffer.block_size(p), 10);
    }

    #[test]
    fn slots_fill_before_a_new_run_is_added() {
        let mut memory = [0_u8; 4096];
        let mut buffer = tiered(&mut memory);

        // the 128-byte class has two slots per run
        let a = buffer.allocate(100, true).unwrap();
        let b = buffer.allocate(100, true).unwrap();
        let c = buffer.allocate(100, true).unwrap();
        // a and b share one run; c opened a second one
        assert_eq!(b.get() - a.get(), 128 + 4);
        assert!(c.get() > b.get() + 128);
        buffer.check().unwrap();
    }

    #[test]
    fn double_free_is_detected() {
        use crate::heap::FreeError;

        let mut memory = [0_u8; 4096];
        let mut buffer = tiered(&mut memory);
        let p = buffer.allocate(10, true).unwrap();
        assert_eq!(buffer.free_inner(p.get()), Ok(()));
        assert_eq!(buffer.free_inner(p.get()), Err(FreeError::DoubleFree));
    }

    #[test]
    fn oversized_requests_bypass_the_tier() {
        let mut memory = [0_u8; 4096];
        let mut buffer = tiered(&mut memory);
        let p = buffer.allocate(129, true).unwrap();
        // a free-list block records the rounded size
        assert_eq!(buffer.block_size(p), 136);
    }

    #[test]
    fn realloc_within_the_class_keeps_the_slot() {
        let mut memory = [0_u8; 4096];
        let mut buffer = tiered(&mut memory);
        let p = buffer.allocate(10, false).unwrap();
        buffer.bytes_mut(p, 10).unwrap().copy_from_slice(&[4_u8; 10]);
        let q = buffer.realloc(Some(p), 16).unwrap();
        assert_eq!(q, p);
        assert_eq!(buffer.block_size(p), 16);
        assert_eq!(buffer.bytes(p, 10).unwrap(), &[4_u8; 10][..]);
    }

    #[test]
    fn realloc_across_classes_moves_the_payload() {
        let mut memory = [0_u8; 4096];
        let mut buffer = tiered(&mut memory);
        let p = buffer.allocate(16, false).unwrap();
        buffer.bytes_mut(p, 16).unwrap().copy_from_slice(&[8_u8; 16]);
        let q = buffer.realloc(Some(p), 17).unwrap();
        assert_ne!(q, p);
        assert_eq!(buffer.block_size(q), 17);
        assert_eq!(buffer.bytes(q, 16).unwrap(), &[8_u8; 16][..]);
    }

    #[test]
    fn priming_creates_one_run_per_class() {
        let mut memory = [0_u8; 4096];
        let mut primed = PayloadBuffer::init_fixed(
            SliceStorage::new(&mut memory),
            BufferOptions {
                bitmaps: true,
                prime: true,
            },
        );
        let before = primed.hwm();
        // the first allocation of every class finds a run already waiting
        let _ = primed.allocate(10, true).unwrap();
        let _ = primed.allocate(30, true).unwrap();
        let _ = primed.allocate(60, true).unwrap();
        let _ = primed.allocate(120, true).unwrap();
        assert_eq!(primed.hwm(), before);
        primed.check().unwrap();
    }
}
