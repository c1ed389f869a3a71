//! Lock-free MPSC message queue over a mirror buffer
//!
//! ## Protocol
//!
//! ```text
//!            read_pos                       write_pos
//!               │                               │
//!   ... ────────┼──────────┬──────────┬─────────┼──────── ...
//!               │ msg (2)  │ msg (0)  │ msg (1) │
//!               └──────────┴──────────┴─────────┘
//!                  ready     reserved    ready
//! ```
//!
//! 1. **Reserve**: a producer CAS-advances `write_pos` by the 8-byte aligned
//!    message size, as long as that keeps the queue within capacity. The
//!    reserved bytes are zero, so the message reads as not ready.
//! 2. **Commit**: the producer fills the payload and release-stores the
//!    message id. This is the publish point.
//! 3. **Peek**: the consumer looks only at the message under `read_pos`. A
//!    zero id means nothing is available yet, even if later messages are
//!    already committed, which keeps delivery in reservation order.
//! 4. **Consume**: the consumer zeroes the whole message and then
//!    release-advances `read_pos`, handing the bytes back to producers.
//!
//! Cursors grow without bound using wrapping arithmetic and are masked by the
//! (power of two) buffer size only when dereferenced. Messages crossing the
//! end of the ring are contiguous thanks to the mirror mapping.
//!
//! A producer that reserves and never commits blocks delivery of everything
//! behind it; producers commit immediately after writing their payload.

#![allow(unsafe_code)] // Messages are written in place into the mirror buffer

use crate::domain::ProfilerError;
use crate::memory::VirtualMirrorBuffer;
use crate::sampling::ThreadSampler;
use livetrace_common::MessageId;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Fixed prefix of every message
#[repr(C, align(8))]
pub struct MessageHeader {
    id: AtomicU32,
    payload_size: u32,
    thread_sampler: *const ThreadSampler,
}

const HEADER_SIZE: usize = size_of::<MessageHeader>();

#[inline]
const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Bytes occupied in the ring by a message with this payload
#[must_use]
pub const fn message_size(payload_size: usize) -> usize {
    align8(HEADER_SIZE + payload_size)
}

/// A message living in the queue's buffer
pub struct Message<'q> {
    header: NonNull<MessageHeader>,
    _queue: PhantomData<&'q MessageQueue>,
}

impl Message<'_> {
    fn header(&self) -> &MessageHeader {
        unsafe { self.header.as_ref() }
    }

    /// Published id, [`MessageId::NotReady`] until committed
    #[must_use]
    pub fn id(&self) -> Option<MessageId> {
        MessageId::from_raw(self.header().id.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.header().payload_size as usize
    }

    /// Thread that queued the message
    #[must_use]
    pub fn thread_sampler(&self) -> *const ThreadSampler {
        self.header().thread_sampler
    }

    fn payload_ptr(&self) -> *mut u8 {
        unsafe { self.header.as_ptr().cast::<u8>().add(HEADER_SIZE) }
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.payload_ptr(), self.payload_size()) }
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.payload_ptr(), self.payload_size()) }
    }

    /// Move a value into the payload
    ///
    /// # Safety
    ///
    /// The message must have been reserved with a payload of at least
    /// `size_of::<T>()` bytes, and the value must be moved out again exactly
    /// once with [`take_payload`](Self::take_payload).
    pub unsafe fn write_payload<T>(&mut self, value: T) {
        debug_assert!(size_of::<T>() <= self.payload_size());
        unsafe { std::ptr::write_unaligned(self.payload_ptr().cast::<T>(), value) };
    }

    /// Move a value out of the payload
    ///
    /// # Safety
    ///
    /// The payload must hold a `T` written by
    /// [`write_payload`](Self::write_payload) that has not been taken yet.
    #[must_use]
    pub unsafe fn take_payload<T>(&self) -> T {
        debug_assert!(size_of::<T>() <= self.payload_size());
        unsafe { std::ptr::read_unaligned(self.payload_ptr().cast::<T>()) }
    }
}

pub struct MessageQueue {
    data: VirtualMirrorBuffer,
    size: usize,
    read_pos: AtomicUsize,
    write_pos: AtomicUsize,
}

impl MessageQueue {
    /// Create a queue of at least `requested` bytes
    ///
    /// # Errors
    ///
    /// Propagates mirror buffer creation failures.
    pub fn new(requested: usize, mirror_attempts: u32) -> Result<Self, ProfilerError> {
        let data = VirtualMirrorBuffer::new(requested, mirror_attempts)?;
        let size = data.size();
        Ok(Self {
            data,
            size,
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
        })
    }

    /// Capacity in bytes
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.size
    }

    fn header_at(&self, pos: usize) -> NonNull<MessageHeader> {
        let offset = pos & (self.size - 1);
        // Offsets stay inside the mapping, which is never null
        unsafe { NonNull::new_unchecked(self.data.as_ptr().add(offset).cast::<MessageHeader>()) }
    }

    /// Reserve room for a message with `payload_size` bytes of payload
    ///
    /// Returns `None` when the queue is full or the message could never fit.
    pub fn alloc_message(
        &self,
        payload_size: usize,
        thread_sampler: *const ThreadSampler,
    ) -> Option<Message<'_>> {
        let write_size = message_size(payload_size);
        if write_size > self.size {
            return None;
        }
        let payload_size = u32::try_from(payload_size).ok()?;

        let mut w = self.write_pos.load(Ordering::Relaxed);
        loop {
            let r = self.read_pos.load(Ordering::Acquire);
            if w.wrapping_sub(r) > self.size - write_size {
                return None;
            }
            match self.write_pos.compare_exchange_weak(
                w,
                w.wrapping_add(write_size),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => w = observed,
            }
        }

        let header = self.header_at(w);
        unsafe {
            let h = header.as_ptr();
            (*h).payload_size = payload_size;
            (*h).thread_sampler = thread_sampler;
        }
        Some(Message {
            header,
            _queue: PhantomData,
        })
    }

    /// Publish a reserved message
    pub fn commit_message(&self, message: Message<'_>, id: MessageId) {
        debug_assert_ne!(id, MessageId::NotReady);
        message.header().id.store(id.as_raw(), Ordering::Release);
    }

    /// The message under the read cursor, if it has been committed
    ///
    /// Only the consumer thread may call this.
    #[must_use]
    pub fn peek_next_message(&self) -> Option<Message<'_>> {
        let r = self.read_pos.load(Ordering::Relaxed);
        let w = self.write_pos.load(Ordering::Acquire);
        if r == w {
            return None;
        }

        let header = self.header_at(r);
        let message = Message {
            header,
            _queue: PhantomData,
        };
        match message.id() {
            None | Some(MessageId::NotReady) => None,
            Some(_) => Some(message),
        }
    }

    /// Release the message under the read cursor back to producers
    ///
    /// Only the consumer thread may call this, with the message returned by
    /// the last [`peek_next_message`](Self::peek_next_message).
    pub fn consume_next_message(&self, message: Message<'_>) {
        let size = message_size(message.payload_size());
        unsafe { std::ptr::write_bytes(message.header.as_ptr().cast::<u8>(), 0, size) };
        let r = self.read_pos.load(Ordering::Relaxed);
        self.read_pos.store(r.wrapping_add(size), Ordering::Release);
    }

    /// Bytes reserved but not yet consumed
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        w.wrapping_sub(r)
    }
}
