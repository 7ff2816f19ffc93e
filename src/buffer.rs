//! The payload buffer: public construction and the allocation facade.

use crate::region::{
    Region, HEADER_SIZE, MAGIC_BITMAPS, MAGIC_FIXED, MAGIC_MOVEABLE, OFF_FREE_LIST, OFF_FULL_SIZE,
    OFF_HWM, OFF_MAGIC, RESIZER_SLOT_SIZE,
};
use crate::storage::Storage;
use crate::Offset;

/// Region-level options chosen at initialization time.
#[derive(Debug, Clone, Copy)]
pub struct BufferOptions {
    /// Enable the small-block bitmap tier for requests up to 128 bytes.
    pub bitmaps: bool,
    /// Pre-allocate one empty run per size class, so the first small
    /// allocation of each class pays no growth cost. Only meaningful
    /// together with `bitmaps`.
    pub prime: bool,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            bitmaps: true,
            prime: false,
        }
    }
}

/// An error occurred when mounting an existing region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenError {
    /// The header magic is not one of the recognised values. The region is
    /// corrupt or was never initialised; there is no recovery path.
    BadMagic,
    /// The recorded region size does not fit the provided bytes.
    Truncated,
}

/// A self-describing, relocatable heap inside a flat byte region.
///
/// Every reference inside the region is a 32-bit [`Offset`] from the region
/// base, never a native pointer, which keeps the whole region
/// position-independent: a moveable region may be relocated by its storage
/// on growth and every offset held by the client stays valid. Borrows
/// handed out by [`bytes`](Self::bytes)/[`bytes_mut`](Self::bytes_mut) are
/// scoped to a single call, so the type system rules out the stale-pointer
/// mistakes the offset discipline exists to prevent.
///
/// The buffer is a single-owner structure: all mutation goes through
/// `&mut self` and there is no internal locking. Embeddings that share one
/// region across threads wrap it in a [`SharedBuffer`](crate::SharedBuffer).
pub struct PayloadBuffer<S: Storage> {
    pub(crate) region: Region<S>,
}

impl<S: Storage> PayloadBuffer<S> {
    /// Initialize a fixed region in the given storage.
    ///
    /// A fixed region never grows: exhausting its arena makes allocation
    /// return `None`. The whole storage becomes the region.
    ///
    /// # Panics
    /// This function panics if the storage is smaller than 64 bytes, not a
    /// multiple of 4 in size, or larger than 4 GiB.
    pub fn init_fixed(storage: S, options: BufferOptions) -> Self {
        Self::init(storage, MAGIC_FIXED, options)
    }

    /// Initialize a moveable region in the given storage.
    ///
    /// A moveable region grows through its storage's resizer when the free
    /// list is exhausted; the bytes may relocate, offsets stay valid. The
    /// byte layout reserves the machine-word slot after the header for an
    /// embedder's resizer handle.
    ///
    /// # Panics
    /// This function panics if the storage is smaller than 64 bytes, not a
    /// multiple of 4 in size, or larger than 4 GiB.
    pub fn init_moveable(storage: S, options: BufferOptions) -> Self {
        Self::init(storage, MAGIC_MOVEABLE, options)
    }

    fn init(storage: S, magic: u32, options: BufferOptions) -> Self {
        let len = storage.bytes().len();
        assert!(len >= 64, "too small payload region: minimum size is 64");
        assert!(len % 4 == 0, "region size has to be divisible by 4");
        assert!(
            u32::try_from(len).is_ok(),
            "region size has to fit a 32-bit offset"
        );
        let full_size = len as u32;
        let arena = if magic == MAGIC_MOVEABLE {
            HEADER_SIZE + RESIZER_SLOT_SIZE
        } else {
            HEADER_SIZE
        };

        let mut region = Region::new(storage);
        region.storage_mut().bytes_mut()[..arena as usize].fill(0);
        let magic = if options.bitmaps {
            magic | MAGIC_BITMAPS
        } else {
            magic
        };
        region.set_header_u32(OFF_MAGIC, magic);
        region.set_header_u32(OFF_FULL_SIZE, full_size);
        region.set_header_u32(OFF_HWM, arena);
        region.set_header_u32(OFF_FREE_LIST, arena);
        // the initial state is one free block spanning the whole arena
        region.store(arena, full_size - arena);
        region.store(arena + 4, 0);

        let mut buffer = Self { region };
        if options.bitmaps && options.prime {
            buffer.prime();
        }
        buffer
    }

    /// Mount a region that already lives in the storage, e.g. one received
    /// from a transport. The header is validated; nothing is modified.
    pub fn open(storage: S) -> Result<Self, OpenError> {
        if storage.bytes().len() < HEADER_SIZE as usize {
            return Err(OpenError::Truncated);
        }
        let region = Region::new(storage);
        if !region.is_valid() {
            return Err(OpenError::BadMagic);
        }
        let full_size = region.full_size();
        if full_size as usize > region.bytes().len() || full_size < region.arena_start() + 8 {
            return Err(OpenError::Truncated);
        }
        Ok(Self { region })
    }

    /// Allocate `n` bytes and return the payload offset, or `None` when the
    /// request cannot be satisfied. Sizes are rounded up to a multiple of 8;
    /// requests up to 128 bytes are served by the bitmap tier when the
    /// region has it enabled. With `clear` the payload is zeroed.
    ///
    /// The returned offset stays valid across relocation; bytes are
    /// accessed through [`bytes`](Self::bytes)/[`bytes_mut`](Self::bytes_mut).
    pub fn allocate(&mut self, n: u32, clear: bool) -> Option<Offset> {
        self.alloc_inner(n, 8, clear, true).and_then(Offset::new)
    }

    /// Return a block to the allocator.
    ///
    /// Freeing detects some mistakes (out-of-range offsets, double frees of
    /// small blocks), but those cannot be reported meaningfully here, so
    /// they turn the call into a no-op. The checks are advisory; freeing an
    /// offset that was never allocated from this region corrupts it.
    pub fn free(&mut self, offset: Offset) {
        let _maybe_error = self.free_inner(offset.get()).ok();
        // errors are ignored
    }

    /// Resize a block, moving it only when it cannot grow in place.
    /// `realloc(None, n)` is equivalent to an (uncleared) allocation. On
    /// failure the old block is left untouched and `None` is returned.
    pub fn realloc(&mut self, offset: Option<Offset>, n: u32) -> Option<Offset> {
        match offset {
            Some(offset) => self.realloc_inner(offset.get(), n, 8, true),
            None => self.alloc_inner(n, 8, false, true),
        }
        .and_then(Offset::new)
    }

    /// The usable size of an allocated block: the logical size for a small
    /// block, the rounded payload size for a free-list block.
    pub fn block_size(&self, offset: Offset) -> u32 {
        self.block_size_inner(offset.get())
    }

    /// Borrow `len` bytes at `offset`. Validates the region magic and the
    /// range on every call and returns `None` for anything invalid.
    pub fn bytes(&self, offset: Offset, len: u32) -> Option<&[u8]> {
        self.region.get(offset.get(), len)
    }

    /// Borrow `len` bytes at `offset` mutably. See [`bytes`](Self::bytes).
    pub fn bytes_mut(&mut self, offset: Offset, len: u32) -> Option<&mut [u8]> {
        self.region.get_mut(offset.get(), len)
    }

    /// Total region size in bytes, header included.
    pub fn full_size(&self) -> u32 {
        self.region.full_size()
    }

    /// Arena size in bytes: the allocatable span after the header (and the
    /// resizer slot of a moveable region).
    pub fn arena_size(&self) -> u32 {
        self.region.full_size() - self.region.arena_start()
    }

    /// The high-water mark: the largest offset the allocator has ever
    /// touched. Never decreases within a region lifetime.
    pub fn hwm(&self) -> u32 {
        self.region.hwm()
    }

    /// Whether this region may relocate on growth.
    pub fn is_moveable(&self) -> bool {
        self.region.is_moveable()
    }

    /// Whether the small-block bitmap tier is enabled for this region.
    pub fn bitmaps_enabled(&self) -> bool {
        self.region.bitmaps_enabled()
    }

    /// The region as raw bytes, ready to hand to a transport. The region is
    /// self-describing: the receiver mounts it with [`open`](Self::open).
    pub fn as_bytes(&self) -> &[u8] {
        &self.region.bytes()[..self.region.full_size() as usize]
    }

    /// Unwrap into the backing storage.
    pub fn into_storage(self) -> S {
        self.region.into_storage()
    }
}

#[cfg(feature = "alloc")]
impl PayloadBuffer<crate::HeapStorage> {
    /// Initialize a moveable region on the host heap, the common way to
    /// build an outgoing message.
    ///
    /// # Panics
    /// Panics under the same conditions as [`init_moveable`](Self::init_moveable).
    pub fn heap(initial_size: usize, options: BufferOptions) -> Self {
        Self::init_moveable(crate::HeapStorage::with_size(initial_size), options)
    }
}
