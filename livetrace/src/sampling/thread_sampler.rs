//! Per-thread sampling state
//!
//! Each instrumented thread owns one [`ThreadSampler`]: its display name, one
//! sample tree per [`SampleType`], and the timer CPU samples are stamped
//! with. The sampler is heap-allocated once, registered with the profiler and
//! then only touched from its own thread, except for the name, which the
//! orchestrator reads when serializing.

#![allow(unsafe_code)] // Trees are mutated through UnsafeCell by the owning thread only

use super::gpu::GpuBackend;
use super::sample::Sample;
use super::sample_tree::{CompletedTree, SampleAllocator, SampleTree};
use super::timer::UsTimer;
use crate::config::MAX_THREAD_NAME_BYTES;
use crate::domain::{NameHash, ProfilerError};
use crate::queue::MessageQueue;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use livetrace_common::{MessageId, SampleType};
use log::trace;
use std::cell::UnsafeCell;
use std::mem::size_of;
use std::sync::atomic::AtomicPtr;
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

/// What happened to the tree after an end-sample call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeDelivery {
    /// The closed sample still has an open parent
    Pending,
    /// The finished tree was queued for the viewer
    Queued,
    /// The queue was full and the finished tree was released
    Dropped,
}

pub struct ThreadSampler {
    name: Mutex<String>,
    trees: [UnsafeCell<Option<SampleTree>>; SampleType::COUNT],
    timer: UsTimer,
    owner: ThreadId,

    /// Next sampler in the profiler's registry
    pub(crate) next: AtomicPtr<ThreadSampler>,
}

// Trees are only reached through `tree_slot`, from the owning thread; the
// name is behind a mutex.
unsafe impl Send for ThreadSampler {}
unsafe impl Sync for ThreadSampler {}

/// Cut a name to the display limit without splitting a character
fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_THREAD_NAME_BYTES {
        return name;
    }
    let mut end = MAX_THREAD_NAME_BYTES;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

impl ThreadSampler {
    /// Create the sampler for the calling thread, with its CPU tree
    ///
    /// The initial name is the OS thread name, or a base64 rendering of the
    /// sampler's address when the thread is unnamed.
    ///
    /// # Errors
    ///
    /// Propagates CPU tree creation failures.
    pub fn new() -> Result<Box<Self>, ProfilerError> {
        let current = std::thread::current();
        let sampler = Box::new(Self {
            name: Mutex::new(String::new()),
            trees: [
                UnsafeCell::new(Some(SampleTree::cpu()?)),
                UnsafeCell::new(None),
                UnsafeCell::new(None),
            ],
            timer: UsTimer::new(),
            owner: current.id(),
            next: AtomicPtr::new(std::ptr::null_mut()),
        });

        let name = match current.name() {
            Some(name) => name.to_string(),
            None => {
                let addr = std::ptr::from_ref::<ThreadSampler>(&sampler) as usize;
                STANDARD.encode(addr.to_le_bytes())
            }
        };
        sampler.set_name(&name);
        Ok(sampler)
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.name.lock().map(|n| n.clone()).unwrap_or_default()
    }

    /// Rename the thread in the viewer; longer names are truncated
    pub fn set_name(&self, name: &str) {
        if let Ok(mut current) = self.name.lock() {
            current.clear();
            current.push_str(truncate_name(name));
        }
    }

    #[must_use]
    pub fn now_us(&self) -> u64 {
        self.timer.now_us()
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn tree_slot(&self, sample_type: SampleType) -> &mut Option<SampleTree> {
        debug_assert_eq!(std::thread::current().id(), self.owner);
        unsafe { &mut *self.trees[sample_type.index()].get() }
    }

    /// Allocator of the tree for `sample_type`, if that tree exists
    #[must_use]
    pub fn allocator(&self, sample_type: SampleType) -> Option<Arc<SampleAllocator>> {
        unsafe { self.tree_slot(sample_type) }
            .as_ref()
            .map(|tree| Arc::clone(tree.allocator()))
    }

    /// Open a CPU sample and stamp its start
    ///
    /// # Errors
    ///
    /// Fails if no sample can be allocated.
    pub fn begin_sample(&self, name: &'static str, name_hash: NameHash) -> Result<(), ProfilerError> {
        let tree = unsafe { self.tree_slot(SampleType::Cpu) }
            .as_mut()
            .ok_or(ProfilerError::UnbalancedEndSample)?;
        let now = self.timer.now_us();
        tree.push(name, name_hash)?.us_start = now;
        Ok(())
    }

    /// Stamp and close the innermost CPU sample, queueing the tree when it is
    /// finished
    ///
    /// # Errors
    ///
    /// [`ProfilerError::UnbalancedEndSample`] when no CPU sample is open.
    pub fn end_sample(&self, queue: &MessageQueue) -> Result<TreeDelivery, ProfilerError> {
        let now = self.timer.now_us();
        let tree = unsafe { self.tree_slot(SampleType::Cpu) }
            .as_mut()
            .ok_or(ProfilerError::UnbalancedEndSample)?;
        tree.current_mut()
            .ok_or(ProfilerError::UnbalancedEndSample)?
            .us_end = now;
        Ok(match tree.pop()? {
            Some(completed) => enqueue_tree(queue, completed, self),
            None => TreeDelivery::Pending,
        })
    }

    /// Open a GPU sample, creating the tree for the backend's type on first use
    ///
    /// # Errors
    ///
    /// Backend failures creating or recording timers, or a backend that
    /// reports the CPU sample type.
    pub fn begin_gpu_sample(
        &self,
        backend: &Arc<dyn GpuBackend>,
        name: &'static str,
        name_hash: NameHash,
    ) -> Result<(), ProfilerError> {
        let sample_type = backend.sample_type();
        if !sample_type.is_gpu() {
            return Err(ProfilerError::GpuTimer(format!(
                "backend reports non-GPU sample type {sample_type:?}"
            )));
        }

        let slot = unsafe { self.tree_slot(sample_type) };
        if slot.is_none() {
            let factory = Arc::clone(backend);
            let allocator = Arc::new(SampleAllocator::new(move || {
                Ok(Sample::new(sample_type, Some(factory.create_timer()?)))
            }));
            let mut tree = SampleTree::new(sample_type, allocator)?;
            // Every sample of this tree is timed relative to this marker
            tree.begin_root_timer()?;
            trace!("Created {sample_type:?} sample tree");
            *slot = Some(tree);
        }

        let Some(tree) = slot.as_mut() else {
            return Err(ProfilerError::NoGpuBackend(sample_type));
        };
        let sample = tree.push(name, name_hash)?;
        match sample.gpu_timer.as_mut() {
            Some(timer) => timer.begin(),
            None => Ok(()),
        }
    }

    /// Record the end marker of the innermost GPU sample and close it
    ///
    /// # Errors
    ///
    /// [`ProfilerError::UnbalancedEndSample`] when no sample of this type is
    /// open, or the backend's recording failure.
    pub fn end_gpu_sample(
        &self,
        sample_type: SampleType,
        queue: &MessageQueue,
    ) -> Result<TreeDelivery, ProfilerError> {
        let tree = unsafe { self.tree_slot(sample_type) }
            .as_mut()
            .ok_or(ProfilerError::UnbalancedEndSample)?;
        let sample = tree.current_mut().ok_or(ProfilerError::UnbalancedEndSample)?;
        let recorded = match sample.gpu_timer.as_mut() {
            Some(timer) => timer.end(),
            None => Ok(()),
        };

        // The sample is closed even when the marker failed, keeping the tree balanced
        let delivery = match tree.pop()? {
            Some(completed) => enqueue_tree(queue, completed, self),
            None => TreeDelivery::Pending,
        };
        recorded.map(|()| delivery)
    }
}

/// Hand a finished tree to the orchestrator, releasing it if the queue is full
pub fn enqueue_tree(
    queue: &MessageQueue,
    tree: CompletedTree,
    thread_sampler: *const ThreadSampler,
) -> TreeDelivery {
    let Some(mut message) = queue.alloc_message(size_of::<CompletedTree>(), thread_sampler) else {
        trace!("Message queue full, dropping tree of {} samples", tree.nb_samples());
        return TreeDelivery::Dropped;
    };
    unsafe { message.write_payload(tree) };
    queue.commit_message(message, MessageId::SampleTree);
    TreeDelivery::Queued
}
