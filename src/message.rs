//! Top-level framing: the main message, the metadata blob and presence
//! bits.
//!
//! The region header reserves two well-known slots. `message` points at the
//! root payload of the region (the message a sender builds and a receiver
//! reads) and `metadata` at an opaque blob describing it (a type id, a
//! schema hash, whatever the embedding protocol needs). Presence bits are a
//! caller-chosen bitmap inside some allocated block, used by messages to
//! mark optional fields as set.

use crate::buffer::PayloadBuffer;
use crate::region::{OFF_MESSAGE, OFF_METADATA};
use crate::storage::Storage;
use crate::Offset;

impl<S: Storage> PayloadBuffer<S> {
    /// Allocate the main message payload (zeroed, 8-aligned size) and
    /// record it in the header's `message` slot. A previously allocated
    /// main message is released first; on out-of-memory the slot is left
    /// untouched and `None` is returned.
    pub fn allocate_main_message(&mut self, size: u32) -> Option<Offset> {
        let offset = self.alloc_inner(size, 8, true, true)?;
        if let Some(old) = Offset::new(self.region.header_u32(OFF_MESSAGE)) {
            let _ = self.free_inner(old.get());
        }
        self.region.set_header_u32(OFF_MESSAGE, offset);
        Offset::new(offset)
    }

    /// The main message payload, or `None` while unset.
    pub fn main_message(&self) -> Option<Offset> {
        Offset::new(self.region.header_u32(OFF_MESSAGE))
    }

    /// Copy `bytes` into the region and record them in the header's
    /// `metadata` slot, releasing any previous blob. The blob itself has no
    /// alignment requirement; it is stored as a length-prefixed cell (the
    /// string cell format) so it reads back at its exact size regardless of
    /// the allocator's block granularity.
    pub fn allocate_metadata(&mut self, bytes: &[u8]) -> Option<Offset> {
        let len = u32::try_from(bytes.len()).ok()?;
        let needed = len.checked_add(4)?;
        let offset = self.alloc_inner(needed, 4, false, true)?;
        self.region.get_mut(offset, 4)?.copy_from_slice(&len.to_le_bytes());
        if len > 0 {
            self.region.get_mut(offset + 4, len)?.copy_from_slice(bytes);
        }
        if let Some(old) = Offset::new(self.region.header_u32(OFF_METADATA)) {
            let _ = self.free_inner(old.get());
        }
        self.region.set_header_u32(OFF_METADATA, offset);
        Offset::new(offset)
    }

    /// The metadata blob, exactly as stored, or `None` while unset.
    pub fn metadata(&self) -> Option<&[u8]> {
        let offset = Offset::new(self.region.header_u32(OFF_METADATA))?;
        let len = self.string_cell_len(offset.get());
        self.region.get(offset.get() + 4, len)
    }

    /// Set presence bit `bit` of the bitmap starting at `base`.
    pub fn set_presence_bit(&mut self, base: Offset, bit: u32) -> bool {
        let word = base.get() + 4 * (bit / 32);
        let mask = 1_u32 << (bit % 32);
        let value = self.region.load(word);
        self.region.store(word, value | mask)
    }

    /// Clear presence bit `bit` of the bitmap starting at `base`.
    pub fn clear_presence_bit(&mut self, base: Offset, bit: u32) -> bool {
        let word = base.get() + 4 * (bit / 32);
        let mask = 1_u32 << (bit % 32);
        let value = self.region.load(word);
        self.region.store(word, value & !mask)
    }

    /// Test presence bit `bit` of the bitmap starting at `base`.
    pub fn test_presence_bit(&self, base: Offset, bit: u32) -> bool {
        let word = base.get() + 4 * (bit / 32);
        self.region.load(word) & (1 << (bit % 32)) != 0
    }
}
