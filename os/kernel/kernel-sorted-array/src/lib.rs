//! # Fixed-Capacity Sorted Array
//!
//! An insertion-sorted sequence of `Copy` values living in storage that the
//! caller provides up front. Nothing is ever allocated: the array is meant to be
//! placed into memory that exists before any allocator does, e.g. the first few
//! pages of a kernel heap that then uses the array to index its own free holes.
//!
//! ```text
//! storage: ┌────┬────┬────┬────┬────┬──────────────────┐
//!          │ a0 │ a1 │ a2 │ a3 │ a4 │   uninitialized  │
//!          └────┴────┴────┴────┴────┴──────────────────┘
//!          ◄──────── len ─────────►
//!          ◄─────────────────── capacity ─────────────►
//! ```
//!
//! ## Ordering
//!
//! The order is supplied as a value implementing [`Order`]. Any
//! `Fn(&T, &T) -> bool` closure works as a strict "less than" predicate, and
//! dedicated zero-sized types can implement the trait directly when the order
//! needs to be named in a type signature.
//!
//! Elements comparing equal keep their insertion order: a new element is placed
//! after every element it is not less than.
//!
//! ## Example
//!
//! ```rust
//! # use core::mem::MaybeUninit;
//! # use kernel_sorted_array::SortedArray;
//! let mut storage = [MaybeUninit::<u32>::uninit(); 8];
//! let mut array = SortedArray::new(&mut storage, |a: &u32, b: &u32| a < b);
//!
//! array.insert(30).unwrap();
//! array.insert(10).unwrap();
//! array.insert(20).unwrap();
//!
//! assert_eq!(array.as_slice(), &[10, 20, 30]);
//! assert_eq!(array.remove(1), Some(20));
//! assert_eq!(array.get(1), Some(30));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

use core::fmt;
use core::mem::MaybeUninit;
use core::slice;

/// A strict weak ordering over `T`.
pub trait Order<T> {
    /// Returns `true` if `a` must be placed before `b`.
    fn less(&self, a: &T, b: &T) -> bool;
}

impl<T, F> Order<T> for F
where
    F: Fn(&T, &T) -> bool,
{
    #[inline]
    fn less(&self, a: &T, b: &T) -> bool {
        self(a, b)
    }
}

/// Errors reported by [`SortedArray`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SortedArrayError {
    /// Every slot of the backing storage is in use.
    #[error("sorted array is full (capacity {capacity})")]
    Full { capacity: usize },
}

/// Insertion-sorted array over caller-provided storage.
///
/// # Invariants
/// - The first `len` slots of `storage` are initialized.
/// - For all `i < j < len`, `!order.less(storage[j], storage[i])`.
pub struct SortedArray<'a, T: Copy, O: Order<T>> {
    storage: &'a mut [MaybeUninit<T>],
    len: usize,
    order: O,
}

impl<'a, T: Copy, O: Order<T>> SortedArray<'a, T, O> {
    /// Create an empty array over `storage`; the capacity is `storage.len()`.
    #[must_use]
    pub const fn new(storage: &'a mut [MaybeUninit<T>], order: O) -> Self {
        Self {
            storage,
            len: 0,
            order,
        }
    }

    /// Create an empty array over `capacity` slots starting at `ptr`.
    ///
    /// # Safety
    /// - `ptr` must be non-null, aligned for `T`, and valid for reads and
    ///   writes of `capacity * size_of::<T>()` bytes for the lifetime `'a`.
    /// - Nothing else may access that memory while the array exists.
    #[must_use]
    pub unsafe fn place(ptr: *mut T, capacity: usize, order: O) -> Self {
        let storage = unsafe { slice::from_raw_parts_mut(ptr.cast::<MaybeUninit<T>>(), capacity) };
        Self::new(storage, order)
    }

    /// Number of elements currently stored.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of elements the storage can hold.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.storage.len()
    }

    #[inline]
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.len == self.storage.len()
    }

    /// Slots still available for insertion.
    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.storage.len() - self.len
    }

    /// The initialized, sorted prefix of the storage.
    #[inline]
    #[must_use]
    pub const fn as_slice(&self) -> &[T] {
        // SAFETY: the first `len` slots are initialized.
        unsafe { slice::from_raw_parts(self.storage.as_ptr().cast::<T>(), self.len) }
    }

    #[inline]
    pub fn iter(&self) -> slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    /// Element at `position`, if any.
    #[inline]
    #[must_use]
    pub fn get(&self, position: usize) -> Option<T> {
        self.as_slice().get(position).copied()
    }

    /// Position of the first element matching `predicate`.
    ///
    /// This is a linear scan; use it for identity lookups where the ordering
    /// key alone does not identify an element.
    #[inline]
    pub fn position(&self, predicate: impl FnMut(&T) -> bool) -> Option<usize> {
        self.as_slice().iter().position(predicate)
    }

    /// Insert `value`, keeping the array sorted. Returns the position it was
    /// written to.
    ///
    /// # Errors
    /// [`SortedArrayError::Full`] if no slot is left; the array is unchanged.
    pub fn insert(&mut self, value: T) -> Result<usize, SortedArrayError> {
        if self.is_full() {
            return Err(SortedArrayError::Full {
                capacity: self.capacity(),
            });
        }

        let order = &self.order;
        let position = self
            .as_slice()
            .partition_point(|existing| !order.less(&value, existing));

        // Shift [position, len) one slot up; the slot at `len` is free.
        self.storage.copy_within(position..self.len, position + 1);
        self.storage[position] = MaybeUninit::new(value);
        self.len += 1;
        Ok(position)
    }

    /// Remove and return the element at `position`, shifting the tail down.
    pub fn remove(&mut self, position: usize) -> Option<T> {
        if position >= self.len {
            return None;
        }

        // SAFETY: `position < len`, so the slot is initialized.
        let value = unsafe { self.storage[position].assume_init() };
        self.storage.copy_within(position + 1..self.len, position);
        self.len -= 1;
        Some(value)
    }

    /// Remove every element.
    #[inline]
    pub const fn clear(&mut self) {
        self.len = 0;
    }

    /// Checks the sort invariant over all adjacent pairs.
    #[must_use]
    pub fn is_sorted(&self) -> bool {
        self.as_slice()
            .windows(2)
            .all(|pair| !self.order.less(&pair[1], &pair[0]))
    }
}

impl<'s, 'a, T: Copy, O: Order<T>> IntoIterator for &'s SortedArray<'a, T, O> {
    type Item = &'s T;
    type IntoIter = slice::Iter<'s, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T: Copy + fmt::Debug, O: Order<T>> fmt::Debug for SortedArray<'_, T, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortedArray")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("items", &self.as_slice())
            .finish_non_exhaustive()
    }
}
