//! Variable-length byte strings stored inside the region.
//!
//! A string is a *cell* (a little-endian u32 length followed by the raw
//! bytes) addressed through a *header*: a single offset slot somewhere in
//! the region (typically a field of a message). A zero header means
//! "unset" and reads as the empty string. Cells are allocated with 4-byte
//! granularity instead of the general 8.

use crate::buffer::PayloadBuffer;
use crate::storage::Storage;
use crate::Offset;

impl<S: Storage> PayloadBuffer<S> {
    /// Store `value` in the string addressed by the header slot at
    /// `header`, reallocating the existing cell in place where possible.
    /// Returns the cell offset, or `None` on out-of-memory, in which case
    /// the header keeps pointing at its prior value.
    pub fn set_string(&mut self, header: Offset, value: &[u8]) -> Option<Offset> {
        let len = u32::try_from(value.len()).ok()?;
        let needed = len.checked_add(4)?;
        let current = self.region.load(header.get());
        let cell = if current != 0 {
            self.realloc_inner(current, needed, 4, true)?
        } else {
            self.alloc_inner(needed, 4, false, true)?
        };
        self.region.get_mut(cell, 4)?.copy_from_slice(&len.to_le_bytes());
        if len > 0 {
            self.region.get_mut(cell + 4, len)?.copy_from_slice(value);
        }
        self.region.store(header.get(), cell);
        Offset::new(cell)
    }

    /// The string bytes behind the header slot at `header`. A zero header
    /// (and any corrupt state) reads as the empty string.
    pub fn string_bytes(&self, header: Offset) -> &[u8] {
        let cell = self.region.load(header.get());
        if cell == 0 {
            return &[];
        }
        let len = self.string_cell_len(cell);
        self.region.get(cell + 4, len).unwrap_or(&[])
    }

    /// The length in bytes of the string behind the header slot.
    pub fn string_size(&self, header: Offset) -> u32 {
        let cell = self.region.load(header.get());
        if cell == 0 {
            return 0;
        }
        self.string_cell_len(cell)
    }

    /// The string bytes as an owned copy.
    #[cfg(feature = "alloc")]
    pub fn get_string(&self, header: Offset) -> alloc::vec::Vec<u8> {
        self.string_bytes(header).to_vec()
    }

    /// Size the string to `len` bytes and return the (uninitialized) cell
    /// payload for direct fill-in, avoiding the copy of
    /// [`set_string`](Self::set_string). The previous cell is released once
    /// the new one exists; on out-of-memory the header keeps pointing at
    /// its prior value.
    pub fn allocate_string(&mut self, header: Offset, len: u32) -> Option<&mut [u8]> {
        let needed = len.checked_add(4)?;
        let cell = self.alloc_inner(needed, 4, false, true)?;
        let current = self.region.load(header.get());
        if current != 0 {
            let _ = self.free_inner(current);
        }
        self.region.get_mut(cell, 4)?.copy_from_slice(&len.to_le_bytes());
        self.region.store(header.get(), cell);
        self.region.get_mut(cell + 4, len)
    }

    /// Release the string cell and reset the header slot to "unset".
    pub fn clear_string(&mut self, header: Offset) {
        let cell = self.region.load(header.get());
        if let Some(cell) = Offset::new(cell) {
            self.free(cell);
        }
        self.region.store(header.get(), 0);
    }

    /// The u32 LE length prefix of a cell. Shared with the metadata blob,
    /// which uses the same cell format.
    pub(crate) fn string_cell_len(&self, cell: u32) -> u32 {
        match self.region.get(cell, 4) {
            Some(bytes) => {
                let mut raw = [0_u8; 4];
                raw.copy_from_slice(bytes);
                u32::from_le_bytes(raw)
            }
            None => 0,
        }
    }
}
