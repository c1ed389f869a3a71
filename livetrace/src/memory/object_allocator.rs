//! Lock-free object pool
//!
//! Objects are boxed once and recycled through an intrusive free list; the
//! pool never returns memory to the system until it is dropped. Objects in
//! use are plain `NonNull<T>` handed to the caller, who gives them back with
//! [`ObjectAllocator::free`] or, for a pre-linked chain of objects,
//! [`ObjectAllocator::free_chain`] in a single push.
//!
//! Because pooled objects stay allocated for the pool's whole life, a popping
//! thread may read the link of a node that another thread just claimed
//! without touching freed memory. The tagged head then rejects the stale
//! swap.

#![allow(unsafe_code)] // Intrusive free list over raw boxed objects

use super::tagged_ptr::TaggedHead;
use crate::domain::ProfilerError;
use log::warn;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Objects that carry their own free-list link
pub trait FreeLink: Sized {
    fn free_link(&self) -> &AtomicPtr<Self>;
}

type Constructor<T> = Box<dyn Fn() -> Result<T, ProfilerError> + Send + Sync>;

pub struct ObjectAllocator<T: FreeLink> {
    constructor: Constructor<T>,
    free_list: TaggedHead<T>,
    nb_free: AtomicUsize,
    nb_inuse: AtomicUsize,
    nb_allocated: AtomicUsize,
}

impl<T: FreeLink> ObjectAllocator<T> {
    pub fn new<F>(constructor: F) -> Self
    where
        F: Fn() -> Result<T, ProfilerError> + Send + Sync + 'static,
    {
        Self {
            constructor: Box::new(constructor),
            free_list: TaggedHead::null(),
            nb_free: AtomicUsize::new(0),
            nb_inuse: AtomicUsize::new(0),
            nb_allocated: AtomicUsize::new(0),
        }
    }

    /// Take an object from the free list, constructing a new one if it is empty
    ///
    /// Recycled objects keep whatever state they had when freed.
    ///
    /// # Errors
    ///
    /// Propagates constructor failures (e.g. a GPU timer that cannot be
    /// created).
    pub fn alloc(&self) -> Result<NonNull<T>, ProfilerError> {
        if let Some(obj) = self.pop() {
            self.nb_free.fetch_sub(1, Ordering::Relaxed);
            self.nb_inuse.fetch_add(1, Ordering::Relaxed);
            return Ok(obj);
        }

        let obj = Box::new((self.constructor)()?);
        self.nb_allocated.fetch_add(1, Ordering::Relaxed);
        self.nb_inuse.fetch_add(1, Ordering::Relaxed);
        Ok(NonNull::from(Box::leak(obj)))
    }

    /// Return one object to the pool
    ///
    /// # Safety
    ///
    /// `obj` must come from [`alloc`](Self::alloc) on this allocator and must
    /// not be used after this call.
    pub unsafe fn free(&self, obj: NonNull<T>) {
        unsafe { self.free_chain(obj, obj, 1) };
    }

    /// Return `count` objects already linked head to tail through their free
    /// links
    ///
    /// # Safety
    ///
    /// Every object of the chain must come from this allocator, be in use, and
    /// be reachable from `head` through [`FreeLink::free_link`] ending at
    /// `tail`.
    pub unsafe fn free_chain(&self, head: NonNull<T>, tail: NonNull<T>, count: usize) {
        let tail_link = unsafe { tail.as_ref() }.free_link();
        let mut current = self.free_list.load(Ordering::Acquire);
        loop {
            tail_link.store(current.ptr(), Ordering::Relaxed);
            match self.free_list.compare_exchange(
                current,
                head.as_ptr(),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(()) => break,
                Err(observed) => current = observed,
            }
        }
        self.nb_inuse.fetch_sub(count, Ordering::Relaxed);
        self.nb_free.fetch_add(count, Ordering::Relaxed);
    }

    fn pop(&self) -> Option<NonNull<T>> {
        let mut current = self.free_list.load(Ordering::Acquire);
        loop {
            let top = NonNull::new(current.ptr())?;
            let next = unsafe { top.as_ref() }.free_link().load(Ordering::Relaxed);
            match self
                .free_list
                .compare_exchange(current, next, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(()) => return Some(top),
                Err(observed) => current = observed,
            }
        }
    }

    #[must_use]
    pub fn nb_free(&self) -> usize {
        self.nb_free.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn nb_inuse(&self) -> usize {
        self.nb_inuse.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn nb_allocated(&self) -> usize {
        self.nb_allocated.load(Ordering::Relaxed)
    }
}

impl<T: FreeLink> Drop for ObjectAllocator<T> {
    fn drop(&mut self) {
        let in_use = self.nb_inuse();
        if in_use != 0 {
            warn!("Object allocator dropped with {in_use} object(s) still in use; leaking them");
        }

        let mut node = self.free_list.take(Ordering::Acquire);
        while let Some(obj) = NonNull::new(node) {
            node = unsafe { obj.as_ref() }.free_link().load(Ordering::Relaxed);
            drop(unsafe { Box::from_raw(obj.as_ptr()) });
        }
    }
}
