//! Sharing one region between threads.
//!
//! The payload buffer itself is a single-owner structure: every mutator
//! takes `&mut self` and there is no internal locking, because a region has
//! exactly one logical owner at a time. Embeddings that nevertheless need
//! to reach one region from several threads provide the synchronisation
//! externally, and this wrapper is that external synchronisation, packaged.

use crate::buffer::PayloadBuffer;
use crate::storage::Storage;

/// A [`PayloadBuffer`] behind a lock, usable through shared references.
///
/// The buffer is protected by a `spin::Mutex`, so the wrapper works on
/// `no_std` targets without an operating system. Lock scope is up to the
/// caller: hold the guard across a whole message construction, not per
/// call, so offsets observed under the lock stay meaningful.
pub struct SharedBuffer<S: Storage> {
    /// The wrapped buffer.
    ///
    /// All mutation of a payload buffer requires exclusive access; the
    /// mutex turns the shared reference of a multi-threaded embedding back
    /// into the `&mut` the buffer's API demands.
    raw: spin::Mutex<PayloadBuffer<S>>,
}

impl<S: Storage> SharedBuffer<S> {
    /// Wrap a buffer for shared access.
    pub const fn new(buffer: PayloadBuffer<S>) -> Self {
        Self {
            raw: spin::Mutex::new(buffer),
        }
    }

    /// Lock the buffer for a batch of operations.
    pub fn lock(&self) -> spin::MutexGuard<'_, PayloadBuffer<S>> {
        self.raw.lock()
    }

    /// Unwrap into the single-owner buffer.
    pub fn into_inner(self) -> PayloadBuffer<S> {
        self.raw.into_inner()
    }
}
