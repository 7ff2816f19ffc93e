//! The 32-bit words the allocator stores inside the arena.
//!
//! Every allocated block is preceded by a *length word* in the four bytes
//! before its payload. The word has two variants, discriminated by the top
//! bit: a free-list block records its payload size directly (the top bit can
//! never be set there, since sizes are bounded by the 32-bit region size),
//! while a small block from the bitmap tier records where in which run it
//! lives, so freeing it is O(1) with no search.
//!
//! A *free* block instead starts with two words, `{length, next}`: its total
//! length including this header, and the offset of the next free block in
//! ascending address order (0 terminates the list).

/// Byte size of a free-block header (`{length, next}`).
pub(crate) const FREE_HEADER_SIZE: u32 = 8;
/// Byte size of the length word preceding every allocated payload.
pub(crate) const LENGTH_WORD_SIZE: u32 = 4;

const SMALL_FLAG: u32 = 1 << 31;
const BIT_SHIFT: u32 = 26;
const BIT_MASK: u32 = 0x1f;
const RUN_SHIFT: u32 = 8;
const RUN_MASK: u32 = 0x3_ffff;
const SIZE_MASK: u32 = 0xff;

/// The decoded form of a small-block length word: which bit of which run of
/// the size class holds the slot, and the logical (requested) size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SmallRef {
    /// Bit number within the run's bitmap.
    pub(crate) bit: u32,
    /// Index into the size class's run vector.
    pub(crate) run: u32,
    /// Logical block size in bytes; also identifies the size class.
    pub(crate) size: u32,
}

/// A length word in either of its two encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LengthWord(u32);

impl LengthWord {
    /// A free-list block's length word, recording the payload size.
    pub(crate) fn large(payload_size: u32) -> Self {
        debug_assert!(payload_size & SMALL_FLAG == 0);
        Self(payload_size)
    }

    /// A small block's length word. `bit` must fit 5 bits, `run` 18 bits
    /// and `size` 8 bits; the size classes and run limits guarantee all
    /// three.
    pub(crate) fn small(small: SmallRef) -> Self {
        debug_assert!(small.bit <= BIT_MASK);
        debug_assert!(small.run <= RUN_MASK);
        debug_assert!(small.size <= SIZE_MASK && small.size > 0);
        Self(SMALL_FLAG | (small.bit << BIT_SHIFT) | (small.run << RUN_SHIFT) | small.size)
    }

    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub(crate) fn as_raw(self) -> u32 {
        self.0
    }

    pub(crate) fn is_small(self) -> bool {
        self.0 & SMALL_FLAG != 0
    }

    /// The payload size of a free-list block. Meaningless for small blocks.
    pub(crate) fn payload_size(self) -> u32 {
        debug_assert!(!self.is_small());
        self.0
    }

    /// Decode the small-block fields, or `None` for a free-list word.
    pub(crate) fn small_ref(self) -> Option<SmallRef> {
        self.is_small().then(|| SmallRef {
            bit: (self.0 >> BIT_SHIFT) & BIT_MASK,
            run: (self.0 >> RUN_SHIFT) & RUN_MASK,
            size: self.0 & SIZE_MASK,
        })
    }
}

/// Round `n` up to the next multiple of `to` (a power of two).
pub(crate) fn round_up(n: u32, to: u32) -> u32 {
    debug_assert!(to.is_power_of_two());
    (n + to - 1) & !(to - 1)
}
