//! # Kernel Heap
//!
//! A general-purpose dynamic memory allocator for a flat, pre-mapped address
//! range, meant to run where no other allocator exists yet: inside the kernel
//! or a freestanding runtime.
//!
//! ## Overview
//!
//! The heap is built from two parts:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Heap Engine                       │
//! │    • best-fit hole search, block splitting          │
//! │    • page-aligned allocations                       │
//! │    • coalescing with both neighbors on free         │
//! │    • growth up to a hard ceiling, contraction       │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │            Free-Region Index                        │
//! │    • holes sorted by ascending size                 │
//! │    • fixed capacity, stored inside the heap range   │
//! │    • provided by `kernel-sorted-array`              │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Block metadata lives in the managed memory itself: every block starts with a
//! header (magic, state, size) and ends with a footer (magic, back reference to
//! the header). All raw address handling is confined to the [`region`] module,
//! which validates the magic values on every read.
//!
//! ## Growth and Contraction
//!
//! When no hole fits a request, the heap grows once by what the request needs:
//! the hole touching the current end is extended, or a new hole is appended.
//! Growth never moves the end past the maximum address given at creation; a
//! request that would need it fails with [`HeapError::OutOfRange`].
//! Conversely, freeing the last block in the range shrinks the heap, though
//! never below [`HeapConfig::min_size`], which defaults to the size the heap
//! was created with.
//!
//! The heap only moves its bounds. Mapping and unmapping the pages behind them
//! is left to the embedding kernel; the whole range up to the maximum address
//! must be usable.
//!
//! ## Usage
//!
//! ```rust
//! # use std::alloc::{alloc_zeroed, dealloc, Layout};
//! use kernel_heap::{Heap, PAGE_SIZE};
//!
//! let layout = Layout::from_size_align(64 * 1024, PAGE_SIZE).unwrap();
//! let base = unsafe { alloc_zeroed(layout) };
//! let start = base.expose_provenance();
//!
//! let mut heap = unsafe { Heap::create(start, start + 16 * 1024, start + 64 * 1024) };
//!
//! let p = heap.allocate(100, false).unwrap();
//! let q = heap.allocate(100, true).unwrap();
//! assert_eq!(q.as_ptr().addr() % PAGE_SIZE, 0);
//!
//! heap.free(p.as_ptr()).unwrap();
//! heap.free(q.as_ptr()).unwrap();
//! heap.check().unwrap();
//! # drop(heap);
//! # unsafe { dealloc(base, layout) };
//! ```
//!
//! ## Concurrency
//!
//! The heap performs no synchronization. Sharing it requires a lock around
//! every call, since headers and footers are rewritten in place.
//!
//! ## Error Handling
//!
//! Nothing here panics on bad metadata. Corruption is reported as
//! [`HeapError::Corrupted`], and pointers that do not designate a live
//! allocation are rejected with [`HeapError::InvalidFree`] before any metadata
//! is touched. Whether either is fatal is up to the caller.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod align;
pub mod config;
mod diagnostics;
mod error;
mod heap;
pub mod region;

pub use config::{DEFAULT_INDEX_CAPACITY, HEAP_MAGIC, HeapConfig, PAGE_SIZE};
pub use diagnostics::{Blocks, HeapStats};
pub use error::HeapError;
pub use heap::Heap;
pub use region::{BLOCK_ALIGN, Block, BlockError, BlockRef, FOOTER_SIZE, HEADER_SIZE, MIN_BLOCK_SIZE};
