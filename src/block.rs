//! Segment block storage shared by the concurrent and sequential buffers.

use std::cell::UnsafeCell;

/// A segment's backing storage. `UnsafeCell` because the written-but-
/// unpublished region and the readable region of the same block may be
/// touched through shared references on different sides.
pub(crate) type Block = Box<[UnsafeCell<u8>]>;

pub(crate) fn alloc_block(size: usize) -> Block {
    (0..size).map(|_| UnsafeCell::new(0u8)).collect()
}
