use crate::region::BlockError;
use kernel_sorted_array::SortedArrayError;

/// Errors reported by the [`Heap`](crate::Heap).
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    /// Growing the heap would move its end past the maximum address.
    #[error("heap growth to {requested:#x} exceeds the maximum address {max:#x}")]
    OutOfRange { requested: usize, max: usize },
    /// Shrinking the heap to `address` would cut into an allocated block, or
    /// leave a hole too small to hold its own metadata.
    #[error("cannot shrink the heap to {address:#x}: the space is in use")]
    InUse { address: usize },
    /// Block metadata the heap had to rely on is inconsistent.
    #[error("corrupted heap metadata at {address:#x}: {reason}")]
    Corrupted { address: usize, reason: BlockError },
    /// The pointer handed to `free` does not designate a live allocation.
    #[error("invalid free of {address:#x}: {reason}")]
    InvalidFree { address: usize, reason: BlockError },
    /// The free-region index has no room for another hole.
    #[error("free-region index is full ({capacity} entries)")]
    IndexFull { capacity: usize },
    /// No free hole satisfies the request.
    #[error("no suitable hole found")]
    NotFound,
}

impl From<SortedArrayError> for HeapError {
    fn from(value: SortedArrayError) -> Self {
        match value {
            SortedArrayError::Full { capacity } => Self::IndexFull { capacity },
        }
    }
}
