//! # Heap Engine
//!
//! Variable-sized allocation over a flat, pre-mapped address range.
//!
//! ```text
//! start                data_start                                  end        max
//! ┌─────────────────────┬───────┬──────┬────────────┬──────────────┬──────────┐
//! │ free-region index   │ block │ hole │ block      │ hole         │ (growth) │
//! └─────────────────────┴───────┴──────┴────────────┴──────────────┴──────────┘
//!                       ◄──────────── managed range ───────────────►
//! ```
//!
//! Every byte of `[data_start, end)` belongs to exactly one block. Free blocks
//! ("holes") are listed in the free-region index, smallest first, so the first
//! hole that fits a request is also the best fit by size.

use crate::align::{align_down, align_up, checked_align_up, is_aligned, page_padding};
use crate::config::{HeapConfig, PAGE_SIZE};
use crate::error::HeapError;
use crate::region::{
    BLOCK_ALIGN, Block, BlockError, BlockRef, FreeIndex, HEADER_SIZE, MIN_BLOCK_SIZE, RegionView,
    place_index,
};
use core::cmp::Ordering;
use core::ptr::NonNull;
use log::{debug, trace, warn};

/// A heap over a caller-provided address range.
///
/// Not synchronized: callers sharing a heap across execution contexts must
/// serialize every call, since block metadata is rewritten in place.
#[derive(Debug)]
pub struct Heap {
    pub(crate) view: RegionView,
    pub(crate) index: FreeIndex,
    /// Contraction on free stops at this many bytes past the start.
    min_size: usize,
}

impl Heap {
    /// Creates a heap over `[start, end)` that may grow up to `max`, using the
    /// default [`HeapConfig`].
    ///
    /// # Safety
    /// See [`Heap::with_config`].
    #[must_use]
    pub unsafe fn create(start: usize, end: usize, max: usize) -> Self {
        unsafe { Self::with_config(start, end, max, HeapConfig::default()) }
    }

    /// Creates a heap over `[start, end)` that may grow up to `max`.
    ///
    /// The free-region index is placed at `start`; managed data begins at the
    /// first page boundary after it. Unaligned bounds only cost space: `end` and
    /// `max` are rounded down to a page boundary, never up.
    ///
    /// # Safety
    /// - `[start, max)` must be readable, writable, and owned by the heap for
    ///   as long as the heap is used. Nothing else may touch it.
    /// - The range must hold the index: the page-aligned data start must not
    ///   lie past the page-aligned `end`, and `end <= max`.
    /// - `config.index_capacity` must be non-zero.
    ///
    /// Violating the range requirements is not detected at runtime.
    #[must_use]
    pub unsafe fn with_config(start: usize, end: usize, max: usize, config: HeapConfig) -> Self {
        debug_assert!(config.index_capacity > 0);

        let index_start = align_up(start, align_of::<BlockRef>());
        let index_end = index_start + config.index_capacity * size_of::<BlockRef>();
        let data_start = align_up(index_end, PAGE_SIZE);
        let max = align_down(max, PAGE_SIZE);
        let end = align_down(end, PAGE_SIZE).min(max);
        debug_assert!(data_start <= end, "heap range too small for its index");

        let mut heap = Self {
            view: unsafe { RegionView::new(data_start, end, max) },
            index: unsafe { place_index(index_start, config.index_capacity) },
            min_size: config.min_size.unwrap_or(end - data_start),
        };

        debug!(
            "heap: created data=0x{data_start:016X}..0x{end:016X} max=0x{max:016X} index={} entries",
            config.index_capacity
        );

        if end > data_start
            && let Err(e) = heap.insert_hole(data_start, end - data_start)
        {
            warn!("heap: failed to register the initial hole: {e}");
        }
        heap
    }

    /// First address of the managed range (page aligned).
    #[inline]
    #[must_use]
    pub const fn start_address(&self) -> usize {
        self.view.start()
    }

    /// Current end of the managed range (page aligned, exclusive).
    #[inline]
    #[must_use]
    pub const fn end_address(&self) -> usize {
        self.view.end()
    }

    /// Address the heap may never grow past.
    #[inline]
    #[must_use]
    pub const fn max_address(&self) -> usize {
        self.view.max()
    }

    /// Bytes currently managed, `end_address - start_address`.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.view.end() - self.view.start()
    }

    /// Number of holes in the free-region index.
    #[inline]
    #[must_use]
    pub const fn hole_count(&self) -> usize {
        self.index.len()
    }

    /// The indexed holes, smallest first.
    pub fn holes(&self) -> impl Iterator<Item = Block> + '_ {
        self.index
            .iter()
            .filter_map(|hole| self.view.header(hole.addr()).ok())
    }

    /// Total bytes (including metadata) held by holes.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.holes().map(|hole| hole.size).sum()
    }

    /// Grows or shrinks the managed range to `new_size` bytes past
    /// [`start_address`](Self::start_address), rounded up to a page.
    ///
    /// Growing hands the new space to the hole at the end of the heap, or to a
    /// new hole if the last block is allocated. Shrinking trims the trailing
    /// hole; it cannot cut into an allocated block, and the part of the hole
    /// that stays must be large enough to remain a hole.
    ///
    /// # Errors
    /// - [`HeapError::OutOfRange`] if the new end would exceed
    ///   [`max_address`](Self::max_address).
    /// - [`HeapError::InUse`] if shrinking would cut into an allocated block or
    ///   leave a hole too small for its own metadata.
    /// - [`HeapError::IndexFull`] if growth needs a new hole and the index has
    ///   no room for it.
    /// - [`HeapError::Corrupted`] if an indexed header fails validation.
    ///
    /// On error, the heap is unchanged.
    pub fn resize(&mut self, new_size: usize) -> Result<(), HeapError> {
        let new_end = self.end_for(new_size)?;
        let old_end = self.view.end();

        match new_end.cmp(&old_end) {
            Ordering::Equal => Ok(()),
            Ordering::Greater => {
                let trailing = self.trailing_hole()?;
                if trailing.is_none() && self.index.is_full() {
                    return Err(HeapError::IndexFull {
                        capacity: self.index.capacity(),
                    });
                }
                self.extend_to(new_end, trailing)
            }
            Ordering::Less => self.truncate_to(new_end),
        }
    }

    /// Finds the smallest indexed hole that can hold a block of `size` bytes
    /// (metadata included) and returns its position in the index.
    ///
    /// With `page_align`, the padding needed to move the hole's payload onto a
    /// page boundary is subtracted from its size first. Because the index is
    /// ordered by raw size, the result is the best fit by size, not
    /// necessarily the best fit after padding.
    ///
    /// # Errors
    /// - [`HeapError::NotFound`] if no hole is large enough.
    /// - [`HeapError::Corrupted`] if an indexed header fails validation.
    pub fn find_smallest_hole(&self, size: usize, page_align: bool) -> Result<usize, HeapError> {
        for (position, hole) in self.index.iter().enumerate() {
            let block = self
                .view
                .header(hole.addr())
                .map_err(|reason| corrupted(hole.addr(), reason))?;

            let usable = if page_align {
                block.size.saturating_sub(alignment_padding(hole.addr()))
            } else {
                block.size
            };

            if usable >= size {
                trace!("heap: hole {hole:?} ({:#x} bytes) fits {size:#x}", block.size);
                return Ok(position);
            }
        }
        Err(HeapError::NotFound)
    }

    /// Allocates `size` bytes and returns a pointer to the first of them.
    ///
    /// With `page_align`, the returned pointer is aligned to [`PAGE_SIZE`];
    /// otherwise it is aligned to [`BLOCK_ALIGN`]. If no hole fits, the heap
    /// grows once by what the request needs and the search is retried.
    ///
    /// # Errors
    /// - [`HeapError::OutOfRange`] if the heap cannot grow enough within
    ///   [`max_address`](Self::max_address). No block is modified.
    /// - [`HeapError::IndexFull`] if the split would need more index entries
    ///   than are left. No block is modified.
    /// - [`HeapError::Corrupted`] if block metadata fails validation.
    pub fn allocate(&mut self, size: usize, page_align: bool) -> Result<NonNull<u8>, HeapError> {
        let limit = self.view.max() - self.view.start();
        let Some(needed) = size
            .max(1)
            .checked_add(MIN_BLOCK_SIZE)
            .and_then(|n| checked_align_up(n, BLOCK_ALIGN))
            .filter(|&n| n <= limit)
        else {
            return Err(HeapError::OutOfRange {
                requested: self.view.start().saturating_add(size),
                max: self.view.max(),
            });
        };

        let mut grown = false;
        let position = loop {
            match self.find_smallest_hole(needed, page_align) {
                Ok(position) => break position,
                Err(HeapError::NotFound) if !grown => {
                    self.grow_for(needed, page_align)?;
                    grown = true;
                }
                Err(HeapError::NotFound) => {
                    return Err(HeapError::OutOfRange {
                        requested: self.view.end().saturating_add(needed),
                        max: self.view.max(),
                    });
                }
                Err(e) => return Err(e),
            }
        };

        let hole = self.index.get(position).ok_or(HeapError::NotFound)?;
        let block = self
            .view
            .header(hole.addr())
            .map_err(|reason| corrupted(hole.addr(), reason))?;

        let padding = if page_align {
            alignment_padding(hole.addr())
        } else {
            0
        };
        let available = block.size - padding;

        let (alloc_size, remainder) = carve(available, needed);

        let new_holes = usize::from(padding > 0) + usize::from(remainder > 0);
        if new_holes > self.index.remaining() + 1 {
            return Err(HeapError::IndexFull {
                capacity: self.index.capacity(),
            });
        }

        self.index.remove(position);
        if padding > 0 {
            self.insert_hole(hole.addr(), padding)?;
        }

        let allocation = Block::allocated(BlockRef::new(hole.addr() + padding), alloc_size);
        self.view
            .write(allocation)
            .map_err(|reason| corrupted(allocation.at.addr(), reason))?;

        if remainder > 0 {
            self.insert_hole(allocation.end(), remainder)?;
        }

        trace!(
            "heap: allocated {:?} ({alloc_size:#x} bytes, lead {padding:#x}, tail {remainder:#x})",
            allocation.at
        );
        Ok(allocation.at.data_ptr())
    }

    /// Releases the allocation at `ptr` and merges it with free neighbors.
    ///
    /// A null pointer is ignored. If the merged hole ends at
    /// [`end_address`](Self::end_address), the heap shrinks behind it, but not
    /// below the configured minimum size.
    ///
    /// # Errors
    /// - [`HeapError::InvalidFree`] if `ptr` does not designate a live
    ///   allocation of this heap (including double frees).
    /// - [`HeapError::Corrupted`] if the block's footer or a neighbor's index
    ///   entry is inconsistent.
    /// - [`HeapError::IndexFull`] if the freed block would need a new index
    ///   entry and none is left.
    ///
    /// On error, no metadata has been modified.
    pub fn free(&mut self, ptr: *mut u8) -> Result<(), HeapError> {
        if ptr.is_null() {
            return Ok(());
        }
        let block = self.live_block(ptr)?;

        let left = self
            .view
            .preceding(block.at.addr())
            .filter(|neighbor| !neighbor.allocated);
        let right = self
            .view
            .following(block.end())
            .filter(|neighbor| !neighbor.allocated);

        let left_position = left.map(|hole| self.index_position(hole.at)).transpose()?;
        let right_position = right.map(|hole| self.index_position(hole.at)).transpose()?;

        let mut merged = Block::free(
            left.map_or(block.at, |hole| hole.at),
            left.map_or(0, |hole| hole.size) + block.size + right.map_or(0, |hole| hole.size),
        );

        let shrink_to = (merged.end() == self.view.end()).then(|| self.contraction_target(&merged));
        let vanishes = shrink_to.is_some_and(|size| self.view.start() + size <= merged.at.addr());
        if left.is_none() && right.is_none() && !vanishes && self.index.is_full() {
            return Err(HeapError::IndexFull {
                capacity: self.index.capacity(),
            });
        }

        // Mark the block itself free so a stale pointer to it is rejected later.
        self.view
            .write(Block::free(block.at, block.size))
            .map_err(|reason| corrupted(block.at.addr(), reason))?;

        match (left_position, right_position) {
            (Some(a), Some(b)) => {
                self.index.remove(a.max(b));
                self.index.remove(a.min(b));
            }
            (Some(position), None) | (None, Some(position)) => {
                self.index.remove(position);
            }
            (None, None) => {}
        }

        if let Some(size) = shrink_to {
            self.set_end(self.view.start() + size);
            if vanishes {
                debug!("heap: released trailing hole {:?}", merged.at);
                return Ok(());
            }
            merged.size = self.view.end() - merged.at.addr();
        }

        self.view
            .write(merged)
            .map_err(|reason| corrupted(merged.at.addr(), reason))?;
        self.index.insert(merged.at)?;

        trace!(
            "heap: freed {:?} into hole {:?} ({:#x} bytes)",
            block.at, merged.at, merged.size
        );
        Ok(())
    }

    /// Payload bytes usable behind `ptr`, which may exceed what was requested.
    ///
    /// # Errors
    /// The same validation errors as [`Heap::free`].
    pub fn usable_size(&self, ptr: *const u8) -> Result<usize, HeapError> {
        Ok(self.live_block(ptr)?.payload_size())
    }

    /// Validates that `ptr` is the payload pointer of an allocated block.
    fn live_block(&self, ptr: *const u8) -> Result<Block, HeapError> {
        let address = ptr.expose_provenance();
        let invalid = |reason: BlockError| {
            warn!("heap: rejecting pointer 0x{address:016X}: {reason}");
            HeapError::InvalidFree { address, reason }
        };

        let at = BlockRef::from_data(address).ok_or_else(|| invalid(BlockError::OutOfBounds))?;
        let block = self.view.header(at.addr()).map_err(invalid)?;
        if !block.allocated {
            return Err(invalid(BlockError::NotAllocated));
        }
        self.view
            .check_footer(&block)
            .map_err(|reason| corrupted(block.footer_addr(), reason))?;
        Ok(block)
    }

    /// Page-aligned heap size left after releasing the tail of `hole`, which
    /// ends at the current end of the heap.
    ///
    /// The hole either disappears completely or keeps at least one minimal
    /// block, and the heap never drops below its minimum size.
    fn contraction_target(&self, hole: &Block) -> usize {
        let offset = hole.at.addr() - self.view.start();
        let keep = if is_aligned(hole.at.addr(), PAGE_SIZE) {
            offset
        } else {
            offset + MIN_BLOCK_SIZE
        };
        align_up(keep.max(self.min_size), PAGE_SIZE).min(self.size())
    }

    /// Makes room for a block of `needed` bytes at the end of the heap.
    ///
    /// Extends the hole bordering the end if there is one, or appends a new
    /// hole otherwise. Fails without growing if carving the block out of the
    /// grown hole would need more index entries than are left.
    fn grow_for(&mut self, needed: usize, page_align: bool) -> Result<(), HeapError> {
        let old_end = self.view.end();
        let trailing = self.trailing_hole()?;

        let (at, existing) = trailing.map_or((old_end, 0), |(_, hole)| (hole.at.addr(), hole.size));
        let padding = if page_align {
            alignment_padding(at)
        } else {
            0
        };

        let extra = (needed + padding).saturating_sub(existing);
        let new_end = self.end_for(self.size().saturating_add(extra))?;

        // The grown hole is the only one that fits, so the carve will take it.
        let grown = existing + (new_end - old_end);
        let (_, remainder) = carve(grown - padding, needed);
        let new_holes = usize::from(padding > 0) + usize::from(remainder > 0);
        let slots = self.index.remaining() + usize::from(trailing.is_some());
        if (trailing.is_none() && self.index.is_full()) || new_holes > slots {
            return Err(HeapError::IndexFull {
                capacity: self.index.capacity(),
            });
        }

        self.extend_to(new_end, trailing)?;
        debug!(
            "heap: grew by {:#x} bytes for a {needed:#x} byte block",
            new_end - old_end
        );
        Ok(())
    }

    /// Validated, page-aligned end address for a heap of `new_size` bytes.
    fn end_for(&self, new_size: usize) -> Result<usize, HeapError> {
        let start = self.view.start();
        let max = self.view.max();
        checked_align_up(new_size, PAGE_SIZE)
            .and_then(|size| start.checked_add(size))
            .filter(|&end| end <= max)
            .ok_or(HeapError::OutOfRange {
                requested: start.saturating_add(new_size),
                max,
            })
    }

    /// Moves the end of the heap without touching any block.
    fn set_end(&mut self, new_end: usize) {
        let old_end = self.view.end();
        debug!(
            "heap: {} 0x{old_end:016X} -> 0x{new_end:016X}",
            if new_end > old_end { "grow" } else { "shrink" }
        );
        self.view.set_end(new_end);
    }

    /// Moves the end up to `new_end` and hands the new space to `trailing`,
    /// or to a new hole if there is none.
    ///
    /// The caller has made sure a new hole fits in the index.
    fn extend_to(
        &mut self,
        new_end: usize,
        trailing: Option<(usize, Block)>,
    ) -> Result<(), HeapError> {
        let old_end = self.view.end();
        self.set_end(new_end);
        match trailing {
            Some((position, hole)) => {
                self.index.remove(position);
                self.insert_hole(hole.at.addr(), hole.size + (new_end - old_end))
            }
            None => self.insert_hole(old_end, new_end - old_end),
        }
    }

    /// Moves the end down to `new_end`, trimming or releasing the trailing hole.
    fn truncate_to(&mut self, new_end: usize) -> Result<(), HeapError> {
        let in_use = HeapError::InUse { address: new_end };
        let Some((position, hole)) = self.trailing_hole()? else {
            return Err(in_use);
        };
        let Some(keep) = new_end.checked_sub(hole.at.addr()) else {
            return Err(in_use);
        };
        if keep != 0 && keep < MIN_BLOCK_SIZE {
            return Err(in_use);
        }

        self.index.remove(position);
        self.set_end(new_end);
        if keep > 0 {
            self.insert_hole(hole.at.addr(), keep)?;
        }
        Ok(())
    }

    /// The indexed hole ending at the current end of the heap, with its position.
    fn trailing_hole(&self) -> Result<Option<(usize, Block)>, HeapError> {
        let end = self.view.end();
        for (position, hole) in self.index.iter().enumerate() {
            let block = self
                .view
                .header(hole.addr())
                .map_err(|reason| corrupted(hole.addr(), reason))?;
            if block.end() == end {
                return Ok(Some((position, block)));
            }
        }
        Ok(None)
    }

    /// Writes a hole over `[at, at + size)` and indexes it.
    fn insert_hole(&mut self, at: usize, size: usize) -> Result<(), HeapError> {
        if self.index.is_full() {
            return Err(HeapError::IndexFull {
                capacity: self.index.capacity(),
            });
        }
        let hole = Block::free(BlockRef::new(at), size);
        self.view
            .write(hole)
            .map_err(|reason| corrupted(at, reason))?;
        self.index.insert(hole.at)?;
        Ok(())
    }

    /// Position of `hole` in the index, found by identity.
    fn index_position(&self, hole: BlockRef) -> Result<usize, HeapError> {
        self.index
            .position(|&entry| entry == hole)
            .ok_or_else(|| corrupted(hole.addr(), BlockError::NotIndexed))
    }
}

/// Splits `available` bytes into a block of at least `needed` bytes and the
/// remainder left as a hole.
///
/// A remainder too small for its own header and footer stays with the block.
const fn carve(available: usize, needed: usize) -> (usize, usize) {
    match available - needed {
        rest if rest < MIN_BLOCK_SIZE => (available, 0),
        rest => (needed, rest),
    }
}

/// Bytes to skip at the start of the hole at `at` so that the payload of the
/// block placed after them starts on a page boundary.
///
/// Padding too small to hold a hole of its own moves on to the next page.
const fn alignment_padding(at: usize) -> usize {
    let padding = page_padding(at + HEADER_SIZE);
    if padding != 0 && padding < MIN_BLOCK_SIZE {
        padding + PAGE_SIZE
    } else {
        padding
    }
}

pub(crate) fn corrupted(address: usize, reason: BlockError) -> HeapError {
    warn!("heap: corrupted metadata at 0x{address:016X}: {reason}");
    HeapError::Corrupted { address, reason }
}
