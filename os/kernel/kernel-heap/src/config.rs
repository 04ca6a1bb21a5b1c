//! # Heap Configuration
//!
//! Compile-time constants shared by every heap, plus the per-heap
//! [`HeapConfig`] chosen at construction time.

/// Page granularity used for the heap bounds, growth, and aligned allocations.
pub const PAGE_SIZE: usize = 4096;

/// Sentinel stored in every block header and footer.
///
/// Only used to tell block boundaries apart from arbitrary bytes; it is not a
/// security measure.
pub const HEAP_MAGIC: u32 = 0x1238_90AB;

/// Number of free-region index entries reserved when no explicit
/// configuration is given.
pub const DEFAULT_INDEX_CAPACITY: usize = 256;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(DEFAULT_INDEX_CAPACITY > 0);
};

/// Per-heap settings.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    /// Maximum number of free holes the heap can track at once.
    ///
    /// The index storage occupies `index_capacity * size_of::<BlockRef>()` bytes
    /// at the `start` address given at creation. Managed data, and with it
    /// [`Heap::start_address`](crate::Heap::start_address), begins at the
    /// first page boundary after it.
    pub index_capacity: usize,
    /// Size the heap never shrinks below when freeing blocks at its end.
    ///
    /// `None` keeps at least the size the heap was created with.
    pub min_size: Option<usize>,
}

impl HeapConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            index_capacity: DEFAULT_INDEX_CAPACITY,
            min_size: None,
        }
    }

    #[must_use]
    pub const fn with_index_capacity(mut self, index_capacity: usize) -> Self {
        self.index_capacity = index_capacity;
        self
    }

    #[must_use]
    pub const fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = Some(min_size);
        self
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}
