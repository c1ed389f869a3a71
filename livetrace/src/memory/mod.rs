//! Memory primitives behind the hot path
//!
//! - [`mirror_buffer`]: a ring buffer mapped twice back to back, so any
//!   message can be read or written as one contiguous slice across the wrap
//! - [`object_allocator`]: lock-free pooled allocator for samples
//! - [`tagged_ptr`]: pointer + stamp packed in one atomic word, used for
//!   lock-free list heads

pub mod mirror_buffer;
pub mod object_allocator;
pub mod tagged_ptr;

pub use mirror_buffer::VirtualMirrorBuffer;
pub use object_allocator::{FreeLink, ObjectAllocator};
pub use tagged_ptr::{Tagged, TaggedHead};
