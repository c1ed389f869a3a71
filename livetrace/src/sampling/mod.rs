//! Sample collection on instrumented threads
//!
//! - [`sample`] / [`sample_tree`]: intrusive call trees and their completion
//! - [`thread_sampler`]: per-thread state behind the instrumentation API
//! - [`gpu`]: contract for device-timed samples
//! - [`hash`] / [`timer`]: name hashing, path ids and timestamps

pub mod gpu;
pub mod hash;
pub mod sample;
pub mod sample_tree;
pub mod thread_sampler;
pub mod timer;

pub use gpu::{GpuBackend, GpuTimer};
pub use sample::Sample;
pub use sample_tree::{CompletedTree, SampleAllocator, SampleTree};
pub use thread_sampler::{enqueue_tree, ThreadSampler, TreeDelivery};
