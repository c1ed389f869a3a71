//! A single timed region
//!
//! Samples are pooled by an [`ObjectAllocator`](crate::memory::ObjectAllocator)
//! and linked into trees through raw intrusive pointers: each node knows its
//! parent, its first and last child, and its next sibling. There is no
//! per-node child array, so pushing a sample never allocates beyond the pool.

#![allow(unsafe_code)] // Intrusive tree links are followed through raw pointers

use super::gpu::GpuTimer;
use crate::domain::{NameHash, SampleId};
use crate::memory::FreeLink;
use livetrace_common::SampleType;
use std::ptr;
use std::sync::atomic::AtomicPtr;

/// Name given to the permanent root of every tree
pub const ROOT_SAMPLE_NAME: &str = "<Root Sample>";

pub struct Sample {
    pub(crate) name: &'static str,
    pub(crate) name_hash: NameHash,
    pub(crate) unique_id: SampleId,
    pub(crate) sample_type: SampleType,

    pub(crate) parent: *mut Sample,
    pub(crate) first_child: *mut Sample,
    pub(crate) last_child: *mut Sample,
    pub(crate) next_sibling: *mut Sample,
    pub(crate) nb_children: u32,

    pub(crate) us_start: u64,
    pub(crate) us_end: u64,

    free_link: AtomicPtr<Sample>,

    /// Device markers, kept across reuse of the pooled sample
    pub(crate) gpu_timer: Option<Box<dyn GpuTimer>>,
}

// Links are only followed by the thread that currently owns the tree the
// sample belongs to: the producing thread while the sample is open, the
// orchestrator once the tree has been queued.
unsafe impl Send for Sample {}

impl FreeLink for Sample {
    fn free_link(&self) -> &AtomicPtr<Self> {
        &self.free_link
    }
}

impl Sample {
    #[must_use]
    pub fn new(sample_type: SampleType, gpu_timer: Option<Box<dyn GpuTimer>>) -> Self {
        Self {
            name: "",
            name_hash: NameHash::default(),
            unique_id: SampleId::default(),
            sample_type,
            parent: ptr::null_mut(),
            first_child: ptr::null_mut(),
            last_child: ptr::null_mut(),
            next_sibling: ptr::null_mut(),
            nb_children: 0,
            us_start: 0,
            us_end: 0,
            free_link: AtomicPtr::new(ptr::null_mut()),
            gpu_timer,
        }
    }

    /// Reset a pooled sample before linking it under `parent`
    pub(crate) fn prepare(&mut self, name: &'static str, name_hash: NameHash, parent: *mut Sample) {
        self.name = name;
        self.name_hash = name_hash;
        self.unique_id = SampleId::ROOT;
        self.parent = parent;
        self.first_child = ptr::null_mut();
        self.last_child = ptr::null_mut();
        self.next_sibling = ptr::null_mut();
        self.nb_children = 0;
        self.us_start = 0;
        self.us_end = 0;
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn name_hash(&self) -> NameHash {
        self.name_hash
    }

    #[must_use]
    pub fn unique_id(&self) -> SampleId {
        self.unique_id
    }

    #[must_use]
    pub fn sample_type(&self) -> SampleType {
        self.sample_type
    }

    #[must_use]
    pub fn us_start(&self) -> u64 {
        self.us_start
    }

    #[must_use]
    pub fn us_end(&self) -> u64 {
        self.us_end
    }

    /// Duration in microseconds, zero if the end precedes the start
    #[must_use]
    pub fn us_length(&self) -> u64 {
        self.us_end.saturating_sub(self.us_start)
    }

    #[must_use]
    pub fn nb_children(&self) -> u32 {
        self.nb_children
    }

    /// Children in insertion order
    #[must_use]
    pub fn children(&self) -> Children<'_> {
        Children {
            next: self.first_child,
            _tree: std::marker::PhantomData,
        }
    }

    /// Number of samples in this subtree, self included
    #[must_use]
    pub fn subtree_len(&self) -> usize {
        1 + self.children().map(Sample::subtree_len).sum::<usize>()
    }
}

/// Iterator over the direct children of a sample
pub struct Children<'a> {
    next: *mut Sample,
    _tree: std::marker::PhantomData<&'a Sample>,
}

impl<'a> Iterator for Children<'a> {
    type Item = &'a Sample;

    fn next(&mut self) -> Option<Self::Item> {
        // Children are kept alive by the tree borrowed for 'a
        let child = unsafe { self.next.as_ref() }?;
        self.next = child.next_sibling;
        Some(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_resets_links_and_times() {
        let mut parent = Sample::new(SampleType::Cpu, None);
        let mut sample = Sample::new(SampleType::Cpu, None);
        sample.us_start = 5;
        sample.us_end = 9;
        sample.nb_children = 3;

        sample.prepare("Update", NameHash(7), &mut parent);
        assert_eq!(sample.name(), "Update");
        assert_eq!(sample.name_hash(), NameHash(7));
        assert_eq!(sample.nb_children(), 0);
        assert_eq!(sample.us_length(), 0);
        assert!(sample.children().next().is_none());
    }

    #[test]
    fn test_length_saturates() {
        let mut sample = Sample::new(SampleType::Cpu, None);
        sample.us_start = 10;
        sample.us_end = 4;
        assert_eq!(sample.us_length(), 0);
    }
}
