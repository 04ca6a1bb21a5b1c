//! # Region View
//!
//! Every block in the managed range is bracketed by a [`Header`] and a
//! [`Footer`] stored in the heap memory itself:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┬──────────────┐
//! │ Header       │ payload                      │ Footer       │
//! │ magic        │                              │ magic        │
//! │ state        │                              │ header ──────┼──► header address
//! │ size         │                              │              │
//! └──────────────┴──────────────────────────────┴──────────────┘
//! ^ at           ^ at + HEADER_SIZE             ^ at + size - FOOTER_SIZE
//! ◄───────────────────────────── size ─────────────────────────►
//! ```
//!
//! This module is the only place that turns raw addresses into headers and
//! footers. A `RegionView` is created once over memory the caller vouches for;
//! afterwards every read is bounds checked against the current heap range and
//! validated against [`HEAP_MAGIC`] before a typed [`Block`] is handed out.

use crate::align::is_aligned;
use crate::config::HEAP_MAGIC;
use core::fmt;
use core::ptr::{self, NonNull};
use kernel_sorted_array::{Order, SortedArray};

/// Metadata at the start of every block.
#[repr(C)]
#[derive(Copy, Clone)]
struct Header {
    magic: u32,
    /// [`STATE_FREE`] or [`STATE_ALLOCATED`].
    state: u32,
    /// Total block size including header and footer.
    size: usize,
}

/// Metadata at the end of every block.
#[repr(C)]
#[derive(Copy, Clone)]
struct Footer {
    magic: u32,
    _reserved: u32,
    /// Address of the header of the same block.
    header: usize,
}

const STATE_FREE: u32 = 0;
const STATE_ALLOCATED: u32 = 1;

pub const HEADER_SIZE: usize = size_of::<Header>();
pub const FOOTER_SIZE: usize = size_of::<Footer>();

/// Granularity of block addresses and sizes.
pub const BLOCK_ALIGN: usize = if align_of::<Header>() > align_of::<Footer>() {
    align_of::<Header>()
} else {
    align_of::<Footer>()
};

/// Smallest possible block: a header and a footer with no payload.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE + FOOTER_SIZE;

const _: () = {
    assert!(HEADER_SIZE.is_multiple_of(BLOCK_ALIGN));
    assert!(FOOTER_SIZE.is_multiple_of(BLOCK_ALIGN));
};

/// Reasons a location fails to describe a well-formed block.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("address outside the managed range")]
    OutOfBounds,
    #[error("address not aligned to a block boundary")]
    Misaligned,
    #[error("magic mismatch")]
    BadMagic,
    #[error("unknown block state {0:#x}")]
    BadState(u32),
    #[error("implausible block size {0:#x}")]
    BadSize(usize),
    #[error("footer does not point back at its header")]
    FooterMismatch,
    #[error("block is not allocated")]
    NotAllocated,
    #[error("free block missing from the free-region index")]
    NotIndexed,
    #[error("index entry does not refer to a free block")]
    StaleIndexEntry,
    #[error("adjacent free blocks were not coalesced")]
    Uncoalesced,
    #[error("free-region index is out of order")]
    Unsorted,
}

/// Opaque handle to a block: the address of its header.
///
/// This is what the free-region index stores.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockRef(usize);

impl BlockRef {
    #[inline]
    #[must_use]
    pub(crate) const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// The block whose payload starts at `data`.
    #[inline]
    #[must_use]
    pub(crate) const fn from_data(data: usize) -> Option<Self> {
        match data.checked_sub(HEADER_SIZE) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Address of the header.
    #[inline]
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0
    }

    /// Address of the first payload byte.
    #[inline]
    #[must_use]
    pub const fn data(self) -> usize {
        self.0 + HEADER_SIZE
    }

    /// The payload address as a pointer.
    #[inline]
    #[must_use]
    pub(crate) fn data_ptr(self) -> NonNull<u8> {
        // SAFETY: `data()` is at least `HEADER_SIZE` and therefore never null.
        unsafe { NonNull::new_unchecked(ptr::with_exposed_provenance_mut(self.data())) }
    }

    /// Reads the size field without any validation.
    ///
    /// # Safety
    /// `self` must refer to a header previously written by a [`RegionView`]
    /// whose memory is still valid.
    #[inline]
    unsafe fn size_unchecked(self) -> usize {
        unsafe { ptr::read(ptr::with_exposed_provenance::<Header>(self.0)).size }
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockRef(0x{:016X})", self.0)
    }
}

/// Orders block handles by ascending block size.
#[derive(Debug, Copy, Clone, Default)]
pub struct BySize;

impl Order<BlockRef> for BySize {
    #[inline]
    fn less(&self, a: &BlockRef, b: &BlockRef) -> bool {
        // SAFETY: only headers written through the heap's view are indexed, and
        // entries are removed before their header is rewritten or released.
        unsafe { a.size_unchecked() < b.size_unchecked() }
    }
}

/// The free-region index: handles of all free blocks, smallest first.
pub(crate) type FreeIndex = SortedArray<'static, BlockRef, BySize>;

/// Places an empty [`FreeIndex`] of `capacity` entries at `addr`.
///
/// # Safety
/// `[addr, addr + capacity * size_of::<BlockRef>())` must be aligned for
/// [`BlockRef`], writable, and reserved for the index for as long as it lives.
pub(crate) unsafe fn place_index(addr: usize, capacity: usize) -> FreeIndex {
    unsafe { SortedArray::place(ptr::with_exposed_provenance_mut(addr), capacity, BySize) }
}

/// A validated snapshot of one block.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Block {
    pub at: BlockRef,
    /// Total size including header and footer.
    pub size: usize,
    pub allocated: bool,
}

impl Block {
    #[inline]
    #[must_use]
    pub const fn free(at: BlockRef, size: usize) -> Self {
        Self {
            at,
            size,
            allocated: false,
        }
    }

    #[inline]
    #[must_use]
    pub const fn allocated(at: BlockRef, size: usize) -> Self {
        Self {
            at,
            size,
            allocated: true,
        }
    }

    /// First address past the block (the next block's header).
    #[inline]
    #[must_use]
    pub const fn end(&self) -> usize {
        self.at.addr() + self.size
    }

    #[inline]
    #[must_use]
    pub const fn footer_addr(&self) -> usize {
        self.end() - FOOTER_SIZE
    }

    /// Payload bytes between header and footer.
    #[inline]
    #[must_use]
    pub const fn payload_size(&self) -> usize {
        self.size - MIN_BLOCK_SIZE
    }
}

/// Bounds-checked access to the block metadata of one heap.
///
/// # Invariants
/// - `start <= end <= max`.
/// - `[start, max)` is readable and writable for as long as the view exists.
pub(crate) struct RegionView {
    start: usize,
    end: usize,
    max: usize,
}

impl RegionView {
    /// # Safety
    /// - `start <= end <= max` and `start` is aligned to [`BLOCK_ALIGN`].
    /// - `[start, max)` must be valid for reads and writes for the lifetime of
    ///   the view and must not be accessed by anything else meanwhile.
    #[must_use]
    pub const unsafe fn new(start: usize, end: usize, max: usize) -> Self {
        debug_assert!(start <= end && end <= max);
        debug_assert!(is_aligned(start, BLOCK_ALIGN));
        Self { start, end, max }
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> usize {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn max(&self) -> usize {
        self.max
    }

    /// Moves the end of the readable range; `end` must lie in `[start, max]`.
    pub(crate) fn set_end(&mut self, end: usize) {
        debug_assert!(self.start <= end && end <= self.max);
        self.end = end.clamp(self.start, self.max);
    }

    /// Checks that `[addr, addr + len)` lies within the range and `addr` is aligned.
    fn check_span(&self, addr: usize, len: usize) -> Result<(), BlockError> {
        if addr < self.start || addr.checked_add(len).is_none_or(|end| end > self.end) {
            return Err(BlockError::OutOfBounds);
        }
        if !is_aligned(addr, BLOCK_ALIGN) {
            return Err(BlockError::Misaligned);
        }
        Ok(())
    }

    /// Reads and validates the header at `at`, without consulting the footer.
    pub fn header(&self, at: usize) -> Result<Block, BlockError> {
        self.check_span(at, MIN_BLOCK_SIZE)?;

        // SAFETY: the span is inside `[start, end)` and aligned.
        let header = unsafe { ptr::read(ptr::with_exposed_provenance::<Header>(at)) };
        if header.magic != HEAP_MAGIC {
            return Err(BlockError::BadMagic);
        }
        let allocated = match header.state {
            STATE_FREE => false,
            STATE_ALLOCATED => true,
            other => return Err(BlockError::BadState(other)),
        };
        if header.size < MIN_BLOCK_SIZE || !is_aligned(header.size, BLOCK_ALIGN) {
            return Err(BlockError::BadSize(header.size));
        }
        if at.checked_add(header.size).is_none_or(|end| end > self.end) {
            return Err(BlockError::BadSize(header.size));
        }

        Ok(Block {
            at: BlockRef(at),
            size: header.size,
            allocated,
        })
    }

    /// Reads and validates the footer at `addr`, returning the header it
    /// refers to.
    pub fn footer(&self, addr: usize) -> Result<BlockRef, BlockError> {
        self.check_span(addr, FOOTER_SIZE)?;

        // SAFETY: the span is inside `[start, end)` and aligned.
        let footer = unsafe { ptr::read(ptr::with_exposed_provenance::<Footer>(addr)) };
        if footer.magic != HEAP_MAGIC {
            return Err(BlockError::BadMagic);
        }
        if footer.header >= addr {
            return Err(BlockError::FooterMismatch);
        }
        Ok(BlockRef(footer.header))
    }

    /// Reads the header at `at` and checks that its footer points back at it.
    pub fn block(&self, at: usize) -> Result<Block, BlockError> {
        let block = self.header(at)?;
        self.check_footer(&block)?;
        Ok(block)
    }

    /// Checks that the footer of an already validated header is consistent.
    pub fn check_footer(&self, block: &Block) -> Result<(), BlockError> {
        if self.footer(block.footer_addr())? == block.at {
            Ok(())
        } else {
            Err(BlockError::FooterMismatch)
        }
    }

    /// The block ending right before `at`, if a well-formed one is there.
    pub fn preceding(&self, at: usize) -> Option<Block> {
        let footer_addr = at.checked_sub(FOOTER_SIZE)?;
        if footer_addr < self.start {
            return None;
        }
        let header = self.footer(footer_addr).ok()?;
        self.block(header.addr())
            .ok()
            .filter(|block| block.end() == at)
    }

    /// The block starting at `at`, if `at` is inside the range and holds one.
    pub fn following(&self, at: usize) -> Option<Block> {
        if at >= self.end {
            return None;
        }
        self.block(at).ok()
    }

    /// Writes header and footer for `block`.
    ///
    /// The block must lie within the current range; a block that does not is
    /// rejected without touching memory.
    pub fn write(&mut self, block: Block) -> Result<(), BlockError> {
        if block.size < MIN_BLOCK_SIZE || !is_aligned(block.size, BLOCK_ALIGN) {
            return Err(BlockError::BadSize(block.size));
        }
        self.check_span(block.at.addr(), block.size)?;

        let header = Header {
            magic: HEAP_MAGIC,
            state: if block.allocated {
                STATE_ALLOCATED
            } else {
                STATE_FREE
            },
            size: block.size,
        };
        let footer = Footer {
            magic: HEAP_MAGIC,
            _reserved: 0,
            header: block.at.addr(),
        };

        // SAFETY: the whole block is inside `[start, end)` and aligned.
        unsafe {
            ptr::write(ptr::with_exposed_provenance_mut::<Header>(block.at.addr()), header);
            ptr::write(ptr::with_exposed_provenance_mut::<Footer>(block.footer_addr()), footer);
        }
        Ok(())
    }
}

impl fmt::Debug for RegionView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionView")
            .field("start", &format_args!("0x{:016X}", self.start))
            .field("end", &format_args!("0x{:016X}", self.end))
            .field("max", &format_args!("0x{:016X}", self.max))
            .finish()
    }
}
