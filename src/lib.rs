//! Self-describing, relocatable payload buffers for zero-copy messages
//!
//! This crate provides a heap that lives *inside* a flat byte region. The
//! region starts with a small header and is followed by a single arena from
//! which strings, vectors and message payloads are allocated. Every
//! reference inside the region is a 32-bit offset from the region base,
//! never a native pointer, which makes the whole region position
//! independent: it can be handed to a transport as-is, mounted in place on
//! the receiving side, or moved to a larger backing buffer without
//! invalidating a single reference inside it.
//!
//! ```text
//! 0        40 (48)                                        full_size
//! +--------+-+---------------------------------------------------+
//! | header |·| arena: allocated and free blocks                  |
//! +--------+-+---------------------------------------------------+
//!            `- resizer-handle slot (moveable regions only)
//! ```
//!
//! # Usage
//! Build a message in a moveable, heap-backed region, then ship the bytes:
//! ```
//! use paybuf::{BufferOptions, PayloadBuffer, SliceStorage};
//!
//! let mut buffer = PayloadBuffer::heap(4096, BufferOptions::default());
//! let message = buffer.allocate_main_message(32).unwrap();
//! buffer.set_string(message, b"hello").unwrap();
//!
//! // the region is self-describing: send the raw bytes...
//! let mut wire = buffer.as_bytes().to_vec();
//!
//! // ...and mount them in place on the other side, zero-copy
//! let view = PayloadBuffer::open(SliceStorage::new(&mut wire)).unwrap();
//! let message = view.main_message().unwrap();
//! assert_eq!(view.string_bytes(message), b"hello");
//! ```
//! A fixed region works the same way but lives in caller-provided memory
//! and fails allocation instead of growing; useful for shared-memory
//! segments and embedded targets.
//!
//! # Implementation
//! The arena is managed by a first-fit allocator over a singly-linked list
//! of free blocks kept in ascending address order. Every allocated block is
//! preceded by a 4-byte *length word*; every free block starts with a
//! `{length, next}` header. The basic life of the arena:
//! 1.  A fresh region has one free block spanning the whole arena.
//!     ```text
//!     LLLL NNNN 0000 0000 0000 0000 0000 0000
//!     ^-------- ^----------------------------
//!     FREE      length = 32, next = 0
//!     ```
//! 2.  Allocating 8 bytes carves the front of that block. The allocation is
//!     preceded by its length word; the free block shrinks and moves up.
//!     ```text
//!     xxxx aaaa aaaa LLLL NNNN 0000 0000 0000
//!     ^--- ^-------- ^-------- ^-------------
//!     len  payload   FREE      length = 20
//!     ```
//! 3.  Freeing that block walks the (address-ordered) free list, inserts
//!     the block at its position and merges it with any touching
//!     neighbour, restoring the picture of step 1. Because merging happens
//!     on every free, no two free blocks are ever adjacent.
//! 4.  When no free block fits, a *moveable* region asks its storage to
//!     grow, splices the new tail onto the free list and retries. The
//!     storage may relocate the bytes; that is fine, offsets survive. A
//!     *fixed* region simply returns `None`.
//!
//! Requests of up to 128 bytes can take a different path: the *bitmap
//! tier*. Four size classes (16, 32, 64 and 128 bytes) each keep a list of
//! *runs*, fixed groups of slots tracked by an occupancy bitmap, and serve
//! allocations by setting the lowest clear bit. The 4-byte prefix of a slot
//! encodes its exact position, so freeing a small block is O(1) with no
//! list walk. Small, frequently recycled allocations (string cells, the
//! spines of growing vectors) stay out of the free list entirely, which
//! keeps both allocation cost and the region's high-water mark down.
//!
//! On top of the allocator sit the message-building layers: length-prefixed
//! [strings](PayloadBuffer::set_string), capacity-doubling
//! [vectors](PayloadBuffer::vector_push) of [`Plain`] elements, the
//! [main-message and metadata slots](PayloadBuffer::allocate_main_message)
//! and presence bits. All of them speak offsets, and all of their
//! allocations may relocate a moveable region, which is why byte access
//! goes through [`bytes`](PayloadBuffer::bytes)/
//! [`bytes_mut`](PayloadBuffer::bytes_mut) and borrows are scoped to a
//! single call.
//!
//! The allocator is single-owner by design: mutation requires `&mut self`
//! and there is no internal locking. [`SharedBuffer`] packages the external
//! synchronisation for embeddings that share one region across threads.
#![cfg_attr(not(test), no_std)]
#![warn(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

#[cfg(feature = "alloc")]
extern crate alloc;

mod buffer;
mod heap;
mod inspect;
mod message;
mod region;
mod shared;
mod storage;
mod string;
mod vector;

pub use crate::buffer::{BufferOptions, OpenError, PayloadBuffer};
pub use crate::heap::FreeError;
pub use crate::inspect::CheckError;
pub use crate::region::Offset;
pub use crate::shared::SharedBuffer;
#[cfg(feature = "alloc")]
pub use crate::storage::HeapStorage;
pub use crate::storage::{SliceStorage, Storage};
pub use crate::vector::Plain;
