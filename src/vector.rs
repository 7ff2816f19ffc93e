//! Growable arrays of homogeneous elements stored inside the region.
//!
//! A vector is an 8-byte cell `(num_elements, data_offset)` living anywhere
//! in the region, typically inside a message, with an out-of-line data
//! block that starts at two elements and doubles on demand. The current
//! capacity is not stored anywhere: it is recovered by decoding the length
//! word in front of the data block, which handles both the free-list and
//! the small-block encoding.

use crate::buffer::PayloadBuffer;
use crate::storage::Storage;
use crate::Offset;

/// A fixed-width element type that can live inside a region.
///
/// Elements are stored host-endian, like every other multi-byte field of
/// the region. Implementations exist for the primitive integers and
/// floats; implement it for your own `#[repr(C)]` scalars by delegating to
/// their byte representation.
pub trait Plain: Copy {
    /// Element size in bytes.
    const SIZE: u32;

    /// Decode an element from exactly `SIZE` bytes.
    fn read(bytes: &[u8]) -> Self;

    /// Encode the element into exactly `SIZE` bytes.
    fn write(self, out: &mut [u8]);
}

macro_rules! impl_plain {
    ($($ty:ty),* $(,)?) => {$(
        impl Plain for $ty {
            const SIZE: u32 = core::mem::size_of::<$ty>() as u32;

            #[inline]
            fn read(bytes: &[u8]) -> Self {
                let mut raw = [0_u8; core::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_ne_bytes(raw)
            }

            #[inline]
            fn write(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_ne_bytes());
            }
        }
    )*};
}

impl_plain!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl<S: Storage> PayloadBuffer<S> {
    /// The number of elements currently in the vector at `header`.
    pub fn vector_len(&self, header: Offset) -> u32 {
        self.region.load(header.get())
    }

    /// Read element `index`, or `None` when the index is out of range (or
    /// the region is invalid).
    pub fn vector_get<T: Plain>(&self, header: Offset, index: u32) -> Option<T> {
        let num = self.region.load(header.get());
        if index >= num {
            return None;
        }
        let data = self.region.load(header.get() + 4);
        let bytes = self.region.get(data + index * T::SIZE, T::SIZE)?;
        Some(T::read(bytes))
    }

    /// Append an element, doubling the data block when it is full. Returns
    /// `false`, leaving the vector unchanged, when the region is out of
    /// memory.
    pub fn vector_push<T: Plain>(&mut self, header: Offset, value: T) -> bool {
        self.vector_push_raw(header.get(), value, true)
    }

    /// `vector_push` with the small-block routing under caller control; the
    /// bitmap tier uses this for its own run vectors.
    pub(crate) fn vector_push_raw<T: Plain>(&mut self, header: u32, value: T, small_ok: bool) -> bool {
        let num = self.region.load(header);
        let mut data = self.region.load(header + 4);
        if data == 0 {
            data = match self.alloc_inner(2 * T::SIZE, 8, false, small_ok) {
                Some(data) => data,
                None => return false,
            };
            self.region.store(header + 4, data);
        } else {
            let capacity = self.block_size_inner(data);
            if (num + 1) * T::SIZE > capacity {
                data = match self.realloc_inner(data, capacity * 2, 8, small_ok) {
                    Some(data) => data,
                    None => return false,
                };
                self.region.store(header + 4, data);
            }
        }
        match self.region.get_mut(data + num * T::SIZE, T::SIZE) {
            Some(bytes) => value.write(bytes),
            None => return false,
        }
        self.region.store(header, num + 1);
        true
    }

    /// Ensure the data block can hold at least `n` elements. Grow-only;
    /// never changes the element count.
    pub fn vector_reserve<T: Plain>(&mut self, header: Offset, n: u32) -> bool {
        self.vector_reserve_raw::<T>(header.get(), n, true)
    }

    pub(crate) fn vector_reserve_raw<T: Plain>(&mut self, header: u32, n: u32, small_ok: bool) -> bool {
        if n == 0 {
            return true;
        }
        let needed = n * T::SIZE;
        let data = self.region.load(header + 4);
        if data == 0 {
            match self.alloc_inner(needed, 8, false, small_ok) {
                Some(fresh) => self.region.store(header + 4, fresh),
                None => return false,
            };
        } else if needed > self.block_size_inner(data) {
            match self.realloc_inner(data, needed, 8, small_ok) {
                Some(moved) => self.region.store(header + 4, moved),
                None => return false,
            };
        }
        true
    }

    /// Set the element count to `n`, growing the data block if needed.
    /// Newly exposed elements read as zero.
    pub fn vector_resize<T: Plain>(&mut self, header: Offset, n: u32) -> bool {
        if !self.vector_reserve::<T>(header, n) {
            return false;
        }
        let num = self.region.load(header.get());
        if n > num {
            let data = self.region.load(header.get() + 4);
            self.region.zero(data + num * T::SIZE, (n - num) * T::SIZE);
        }
        self.region.store(header.get(), n);
        true
    }

    /// Free the data block and reset the vector to its empty state.
    pub fn vector_clear(&mut self, header: Offset) {
        let data = self.region.load(header.get() + 4);
        if let Some(data) = Offset::new(data) {
            self.free(data);
        }
        self.region.store(header.get(), 0);
        self.region.store(header.get() + 4, 0);
    }
}
