//! Per-thread sample trees
//!
//! A [`SampleTree`] owns a permanent root and a cursor to the innermost open
//! sample. Pushing links a new sample as the last child of the cursor;
//! popping moves the cursor back up. When the cursor returns to the root the
//! finished top-level sample is detached and handed out as a
//! [`CompletedTree`], which can cross to the orchestrator thread through the
//! message queue.
//!
//! ## Path ids
//!
//! ```text
//! id(child) = combine(combine(id(parent), name_hash), parent.nb_children)
//! ```
//!
//! `nb_children` is read before the increment, so the same call path in two
//! frames always yields the same id while repeated calls under one parent are
//! told apart by their position.

#![allow(unsafe_code)] // Intrusive tree links are followed through raw pointers

use super::gpu::GpuTimer;
use super::hash::hash_combine;
use super::sample::{Sample, ROOT_SAMPLE_NAME};
use crate::domain::{NameHash, ProfilerError, SampleId};
use crate::memory::{FreeLink, ObjectAllocator};
use livetrace_common::SampleType;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub type SampleAllocator = ObjectAllocator<Sample>;

pub struct SampleTree {
    allocator: Arc<SampleAllocator>,
    root: NonNull<Sample>,
    current_parent: NonNull<Sample>,
    sample_type: SampleType,
}

impl SampleTree {
    /// Create a tree with its permanent root
    ///
    /// # Errors
    ///
    /// Fails if the allocator cannot construct the root sample.
    pub fn new(sample_type: SampleType, allocator: Arc<SampleAllocator>) -> Result<Self, ProfilerError> {
        let mut root = allocator.alloc()?;
        unsafe { root.as_mut() }.prepare(ROOT_SAMPLE_NAME, NameHash(0), std::ptr::null_mut());
        Ok(Self {
            allocator,
            root,
            current_parent: root,
            sample_type,
        })
    }

    /// Tree of plain CPU samples
    ///
    /// # Errors
    ///
    /// Propagates root allocation failures.
    pub fn cpu() -> Result<Self, ProfilerError> {
        let allocator = Arc::new(SampleAllocator::new(|| Ok(Sample::new(SampleType::Cpu, None))));
        Self::new(SampleType::Cpu, allocator)
    }

    #[must_use]
    pub fn sample_type(&self) -> SampleType {
        self.sample_type
    }

    #[must_use]
    pub fn allocator(&self) -> &Arc<SampleAllocator> {
        &self.allocator
    }

    #[must_use]
    pub fn root(&self) -> &Sample {
        unsafe { self.root.as_ref() }
    }

    /// Innermost open sample, or `None` when only the root is open
    pub fn current_mut(&mut self) -> Option<&mut Sample> {
        if self.current_parent == self.root {
            return None;
        }
        Some(unsafe { self.current_parent.as_mut() })
    }

    #[must_use]
    pub fn is_at_root(&self) -> bool {
        self.current_parent == self.root
    }

    /// Open a sample under the cursor and make it the new cursor
    ///
    /// # Errors
    ///
    /// Fails if the allocator cannot construct a new sample.
    pub fn push(&mut self, name: &'static str, name_hash: NameHash) -> Result<&mut Sample, ProfilerError> {
        let sample_ptr = self.allocator.alloc()?;
        let parent_ptr = self.current_parent.as_ptr();
        let parent = unsafe { &mut *parent_ptr };
        let sample = unsafe { &mut *sample_ptr.as_ptr() };
        sample.prepare(name, name_hash, parent_ptr);

        let id = hash_combine(parent.unique_id.0, name_hash.0);
        sample.unique_id = SampleId(hash_combine(id, parent.nb_children));

        parent.nb_children += 1;
        if parent.first_child.is_null() {
            parent.first_child = sample_ptr.as_ptr();
        } else {
            unsafe { (*parent.last_child).next_sibling = sample_ptr.as_ptr() };
        }
        parent.last_child = sample_ptr.as_ptr();

        self.current_parent = sample_ptr;
        Ok(sample)
    }

    /// Close the cursor sample
    ///
    /// Returns the finished top-level sample once the cursor is back at the
    /// root; the root is left without children.
    ///
    /// # Errors
    ///
    /// [`ProfilerError::UnbalancedEndSample`] when no sample is open.
    pub fn pop(&mut self) -> Result<Option<CompletedTree>, ProfilerError> {
        if self.is_at_root() {
            return Err(ProfilerError::UnbalancedEndSample);
        }

        let sample = self.current_parent;
        let parent = unsafe { sample.as_ref() }.parent;
        self.current_parent = NonNull::new(parent).ok_or(ProfilerError::UnbalancedEndSample)?;
        if !self.is_at_root() {
            return Ok(None);
        }

        let root = unsafe { self.root.as_mut() };
        root.first_child = std::ptr::null_mut();
        root.last_child = std::ptr::null_mut();
        root.nb_children = 0;

        let gpu_root = root.gpu_timer.as_deref().map(NonNull::from);
        Ok(Some(CompletedTree {
            root: sample,
            allocator: Arc::clone(&self.allocator),
            gpu_root,
        }))
    }

    /// Start marker of a GPU tree's root
    ///
    /// # Errors
    ///
    /// Propagates the backend's recording failure.
    pub fn begin_root_timer(&mut self) -> Result<(), ProfilerError> {
        let root = unsafe { self.root.as_mut() };
        match root.gpu_timer.as_mut() {
            Some(timer) => timer.begin(),
            None => Ok(()),
        }
    }
}

impl Drop for SampleTree {
    fn drop(&mut self) {
        // Releases the root together with any samples still open
        unsafe { release_subtree(self.root, &self.allocator) };
    }
}

/// A finished top-level sample and everything under it
///
/// Dropping the handle returns every sample of the tree to its allocator in a
/// single push.
pub struct CompletedTree {
    root: NonNull<Sample>,
    allocator: Arc<SampleAllocator>,
    gpu_root: Option<NonNull<dyn GpuTimer>>,
}

// The handle exclusively owns its samples; the GPU root timer is only read,
// and is kept alive by the allocator this handle holds.
unsafe impl Send for CompletedTree {}

impl CompletedTree {
    #[must_use]
    pub fn root(&self) -> &Sample {
        unsafe { self.root.as_ref() }
    }

    #[must_use]
    pub fn sample_type(&self) -> SampleType {
        self.root().sample_type
    }

    #[must_use]
    pub fn nb_samples(&self) -> usize {
        self.root().subtree_len()
    }

    /// Whether every device marker in the tree has been reached
    ///
    /// Always true for CPU trees.
    #[must_use]
    pub fn is_gpu_ready(&self) -> bool {
        fn ready(sample: &Sample) -> bool {
            sample.gpu_timer.as_ref().map_or(true, |t| t.is_ready()) && sample.children().all(ready)
        }
        ready(self.root())
    }

    /// Copy device timings into the samples, relative to the tree's root marker
    ///
    /// # Errors
    ///
    /// Propagates the first backend query failure.
    pub fn resolve_gpu_times(&mut self) -> Result<(), ProfilerError> {
        fn resolve(sample: NonNull<Sample>, root_timer: &dyn GpuTimer) -> Result<(), ProfilerError> {
            let sample = unsafe { &mut *sample.as_ptr() };
            if let Some(timer) = sample.gpu_timer.as_ref() {
                let (start, end) = timer.times_since(root_timer)?;
                sample.us_start = start;
                sample.us_end = end;
            }
            let mut child = sample.first_child;
            while let Some(c) = NonNull::new(child) {
                resolve(c, root_timer)?;
                child = unsafe { c.as_ref() }.next_sibling;
            }
            Ok(())
        }

        let Some(root_timer) = self.gpu_root else {
            return Ok(());
        };
        resolve(self.root, unsafe { root_timer.as_ref() })
    }
}

impl Drop for CompletedTree {
    fn drop(&mut self) {
        unsafe { release_subtree(self.root, &self.allocator) };
    }
}

/// Link every sample of the subtree into one chain through the free links,
/// clearing child info on the way, and return the chain's last sample
unsafe fn flatten(sample: NonNull<Sample>, count: &mut usize) -> NonNull<Sample> {
    let s = unsafe { &mut *sample.as_ptr() };
    *count += 1;
    s.free_link().store(s.first_child, Ordering::Relaxed);

    let mut last = sample;
    let mut child = s.first_child;
    while let Some(c) = NonNull::new(child) {
        let child_last = unsafe { flatten(c, count) };
        let next = unsafe { c.as_ref() }.next_sibling;
        unsafe { child_last.as_ref() }.free_link().store(next, Ordering::Relaxed);
        last = child_last;
        child = next;
    }

    s.first_child = std::ptr::null_mut();
    s.last_child = std::ptr::null_mut();
    s.nb_children = 0;
    last
}

unsafe fn release_subtree(root: NonNull<Sample>, allocator: &SampleAllocator) {
    let mut count = 0;
    let tail = unsafe { flatten(root, &mut count) };
    unsafe { allocator.free_chain(root, tail, count) };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_ids(sample: &Sample, out: &mut Vec<(&'static str, SampleId)>) {
        out.push((sample.name(), sample.unique_id()));
        for child in sample.children() {
            collect_ids(child, out);
        }
    }

    fn build_a_bb(tree: &mut SampleTree) -> CompletedTree {
        tree.push("A", NameHash(1)).unwrap();
        tree.push("B", NameHash(2)).unwrap();
        assert!(tree.pop().unwrap().is_none());
        tree.push("B", NameHash(2)).unwrap();
        assert!(tree.pop().unwrap().is_none());
        tree.pop().unwrap().unwrap()
    }

    #[test]
    fn test_root_is_permanent_and_id_zero() {
        let tree = SampleTree::cpu().unwrap();
        assert_eq!(tree.root().name(), ROOT_SAMPLE_NAME);
        assert_eq!(tree.root().unique_id(), SampleId::ROOT);
        assert!(tree.is_at_root());
        assert_eq!(tree.allocator().nb_inuse(), 1);
    }

    #[test]
    fn test_pop_at_root_is_rejected() {
        let mut tree = SampleTree::cpu().unwrap();
        assert!(matches!(tree.pop(), Err(ProfilerError::UnbalancedEndSample)));
        assert!(tree.is_at_root());
    }

    #[test]
    fn test_ids_follow_path_and_position() {
        let mut tree = SampleTree::cpu().unwrap();
        let completed = build_a_bb(&mut tree);

        let mut ids = Vec::new();
        collect_ids(completed.root(), &mut ids);
        assert_eq!(ids.len(), 3);

        let a = hash_combine(hash_combine(0, 1), 0);
        let b0 = hash_combine(hash_combine(a, 2), 0);
        let b1 = hash_combine(hash_combine(a, 2), 1);
        assert_eq!(ids[0], ("A", SampleId(a)));
        assert_eq!(ids[1], ("B", SampleId(b0)));
        assert_eq!(ids[2], ("B", SampleId(b1)));
        assert_ne!(b0, b1);
    }

    #[test]
    fn test_ids_are_stable_across_frames() {
        let mut tree = SampleTree::cpu().unwrap();
        let mut first = Vec::new();
        collect_ids(build_a_bb(&mut tree).root(), &mut first);
        let mut second = Vec::new();
        collect_ids(build_a_bb(&mut tree).root(), &mut second);
        assert_eq!(first, second);
    }

    #[test]
    fn test_root_is_detached_on_completion() {
        let mut tree = SampleTree::cpu().unwrap();
        let completed = build_a_bb(&mut tree);
        assert_eq!(tree.root().nb_children(), 0);
        assert!(tree.root().children().next().is_none());
        assert_eq!(completed.nb_samples(), 3);
        assert_eq!(completed.root().nb_children(), 2);
    }

    #[test]
    fn test_dropping_completed_tree_recycles_samples() {
        let mut tree = SampleTree::cpu().unwrap();
        let completed = build_a_bb(&mut tree);
        let allocator = Arc::clone(tree.allocator());
        assert_eq!(allocator.nb_inuse(), 4);

        drop(completed);
        assert_eq!(allocator.nb_inuse(), 1);
        assert_eq!(allocator.nb_free(), 3);
        assert_eq!(allocator.nb_allocated(), 4);

        // The next frame is served from the pool
        let again = build_a_bb(&mut tree);
        assert_eq!(allocator.nb_allocated(), 4);
        drop(again);
    }

    #[test]
    fn test_dropping_tree_with_open_samples_releases_them() {
        let mut tree = SampleTree::cpu().unwrap();
        tree.push("Outer", NameHash(1)).unwrap();
        tree.push("Inner", NameHash(2)).unwrap();
        let allocator = Arc::clone(tree.allocator());
        drop(tree);
        assert_eq!(allocator.nb_inuse(), 0);
        assert_eq!(allocator.nb_free(), 3);
    }

    #[test]
    fn test_gpu_tree_waits_for_markers() {
        use crate::sampling::gpu::fake::FakeBackend;
        use crate::sampling::gpu::GpuBackend;

        let backend = Arc::new(FakeBackend::new(SampleType::Cuda));
        let factory = Arc::clone(&backend);
        let allocator = Arc::new(SampleAllocator::new(move || {
            Ok(Sample::new(SampleType::Cuda, Some(factory.create_timer()?)))
        }));
        let mut tree = SampleTree::new(SampleType::Cuda, allocator).unwrap();
        tree.begin_root_timer().unwrap();

        let sample = tree.push("Kernel", NameHash(3)).unwrap();
        sample.gpu_timer.as_mut().unwrap().begin().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1));
        tree.current_mut().unwrap().gpu_timer.as_mut().unwrap().end().unwrap();
        let mut completed = tree.pop().unwrap().unwrap();

        assert_eq!(completed.sample_type(), SampleType::Cuda);
        assert!(!completed.is_gpu_ready());
        backend.ready.store(true, Ordering::Release);
        assert!(completed.is_gpu_ready());

        completed.resolve_gpu_times().unwrap();
        assert!(completed.root().us_end() > completed.root().us_start());
    }
}
