//! # Heap Diagnostics
//!
//! Walks the managed range block by block to verify the heap's invariants and
//! to log its layout. Meant for debugging and tests; every walk is linear in the
//! number of blocks and each free block costs an index lookup on top.

use crate::error::HeapError;
use crate::heap::{Heap, corrupted};
use crate::region::{Block, BlockError};
use log::debug;

/// Summary of a heap walk.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct HeapStats {
    pub blocks: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    /// Bytes in allocated blocks, metadata included.
    pub used_bytes: usize,
    /// Bytes in holes, metadata included.
    pub free_bytes: usize,
    /// Size of the largest hole, metadata included.
    pub largest_hole: usize,
}

/// Iterator over the blocks of a heap in address order.
///
/// Stops after yielding the first error.
pub struct Blocks<'h> {
    heap: &'h Heap,
    next: usize,
    failed: bool,
}

impl Iterator for Blocks<'_> {
    type Item = Result<Block, HeapError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next >= self.heap.view.end() {
            return None;
        }
        match self.heap.view.block(self.next) {
            Ok(block) => {
                self.next = block.end();
                Some(Ok(block))
            }
            Err(reason) => {
                self.failed = true;
                Some(Err(corrupted(self.next, reason)))
            }
        }
    }
}

impl Heap {
    /// All blocks from [`start_address`](Self::start_address) to
    /// [`end_address`](Self::end_address).
    #[must_use]
    pub const fn blocks(&self) -> Blocks<'_> {
        Blocks {
            heap: self,
            next: self.view.start(),
            failed: false,
        }
    }

    /// Verifies the heap's invariants:
    ///
    /// - blocks tile `[start_address, end_address)` with consistent headers
    ///   and footers,
    /// - a block is free exactly when it is in the free-region index,
    /// - no two free blocks are adjacent,
    /// - the index is ordered by ascending size.
    ///
    /// # Errors
    /// [`HeapError::Corrupted`] naming the first offending address.
    pub fn check(&self) -> Result<HeapStats, HeapError> {
        let mut stats = HeapStats::default();
        let mut previous_free = false;

        for block in self.blocks() {
            let block = block?;
            stats.blocks += 1;

            if block.allocated {
                stats.used_blocks += 1;
                stats.used_bytes += block.size;
                previous_free = false;
                continue;
            }

            if previous_free {
                return Err(corrupted(block.at.addr(), BlockError::Uncoalesced));
            }
            if self.index.position(|&entry| entry == block.at).is_none() {
                return Err(corrupted(block.at.addr(), BlockError::NotIndexed));
            }

            stats.free_blocks += 1;
            stats.free_bytes += block.size;
            stats.largest_hole = stats.largest_hole.max(block.size);
            previous_free = true;
        }

        // Every free block was found in the index; equal counts rule out
        // entries that do not name a free block.
        if self.index.len() != stats.free_blocks {
            let stale = self
                .index
                .iter()
                .find(|entry| !matches!(self.view.block(entry.addr()), Ok(block) if !block.allocated))
                .map_or(self.view.start(), |entry| entry.addr());
            return Err(corrupted(stale, BlockError::StaleIndexEntry));
        }

        if !self.index.is_sorted() {
            return Err(corrupted(self.view.start(), BlockError::Unsorted));
        }

        Ok(stats)
    }

    /// Logs every block at `debug` level.
    pub fn dump(&self) {
        debug!(
            "heap: 0x{:016X}..0x{:016X} (max 0x{:016X}), {} holes indexed",
            self.start_address(),
            self.end_address(),
            self.max_address(),
            self.hole_count()
        );
        for block in self.blocks() {
            match block {
                Ok(block) => debug!(
                    "  {:?} size={:#x} {}",
                    block.at,
                    block.size,
                    if block.allocated { "used" } else { "free" }
                ),
                Err(e) => debug!("  walk stopped: {e}"),
            }
        }
    }
}
