//! Tagged atomic list heads
//!
//! A lock-free stack head that only compares the address is exposed to ABA:
//! thread 1 reads head `A` and its successor `B`, thread 2 pops `A`, pops `B`,
//! pushes `A` back, and thread 1's CAS then succeeds with a stale `B`. Packing
//! a stamp next to the address and bumping it on every successful swap makes
//! the stale CAS fail.
//!
//! Layout of the 64-bit word: the low [`ADDR_BITS`] bits hold the address,
//! the remaining high bits hold the stamp. User-space addresses on the
//! supported 64-bit targets fit in 48 bits.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(target_pointer_width = "64")]
pub const ADDR_BITS: u32 = 48;
#[cfg(not(target_pointer_width = "64"))]
pub const ADDR_BITS: u32 = 32;

const ADDR_MASK: u64 = (1 << ADDR_BITS) - 1;
const STAMP_MASK: u64 = u64::MAX >> ADDR_BITS;

/// Snapshot of a [`TaggedHead`]
pub struct Tagged<T> {
    bits: u64,
    _marker: PhantomData<*mut T>,
}

impl<T> Clone for Tagged<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Tagged<T> {}

impl<T> fmt::Debug for Tagged<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tagged")
            .field("ptr", &self.ptr())
            .field("stamp", &self.stamp())
            .finish()
    }
}

impl<T> Tagged<T> {
    fn pack(ptr: *mut T, stamp: u64) -> Self {
        let addr = ptr as usize as u64;
        debug_assert_eq!(addr & !ADDR_MASK, 0, "address does not fit the tagged layout");
        Self {
            bits: (addr & ADDR_MASK) | ((stamp & STAMP_MASK) << ADDR_BITS),
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn ptr(self) -> *mut T {
        #[allow(clippy::cast_possible_truncation)]
        let addr = (self.bits & ADDR_MASK) as usize;
        addr as *mut T
    }

    #[must_use]
    pub fn stamp(self) -> u64 {
        self.bits >> ADDR_BITS
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        self.ptr().is_null()
    }
}

/// Atomic list head holding a pointer and a wrapping stamp
pub struct TaggedHead<T> {
    bits: AtomicU64,
    _marker: PhantomData<*mut T>,
}

// The head is a plain atomic word; handing out `T` pointers across threads
// only requires `T: Send`.
#[allow(unsafe_code)]
unsafe impl<T: Send> Send for TaggedHead<T> {}
#[allow(unsafe_code)]
unsafe impl<T: Send> Sync for TaggedHead<T> {}

impl<T> Default for TaggedHead<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> TaggedHead<T> {
    #[must_use]
    pub fn null() -> Self {
        Self {
            bits: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }

    pub fn load(&self, order: Ordering) -> Tagged<T> {
        Tagged {
            bits: self.bits.load(order),
            _marker: PhantomData,
        }
    }

    /// Replace `current` with `new_ptr`, bumping the stamp
    ///
    /// # Errors
    ///
    /// Returns the observed head when another thread swapped it first.
    pub fn compare_exchange(
        &self,
        current: Tagged<T>,
        new_ptr: *mut T,
        success: Ordering,
        failure: Ordering,
    ) -> Result<(), Tagged<T>> {
        let next = Tagged::pack(new_ptr, current.stamp().wrapping_add(1));
        self.bits
            .compare_exchange(current.bits, next.bits, success, failure)
            .map(|_| ())
            .map_err(|bits| Tagged {
                bits,
                _marker: PhantomData,
            })
    }

    /// Detach the whole list, leaving the head null
    pub fn take(&self, order: Ordering) -> *mut T {
        let bits = self.bits.swap(0, order);
        Tagged::<T> {
            bits,
            _marker: PhantomData,
        }
        .ptr()
    }
}
