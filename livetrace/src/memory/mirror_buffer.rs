//! Virtual mirror buffer
//!
//! One shared memory object of `size` bytes is mapped twice into adjacent
//! virtual ranges `[base, base + size)` and `[base + size, base + 2 * size)`.
//! A write of `n <= size` bytes starting at any offset below `size` lands
//! contiguously in virtual memory and shows up at the wrapped offsets too,
//! which lets the message queue hand out plain slices that straddle the end
//! of the ring.
//!
//! ## Placement
//!
//! The 2x range is first reserved with an inaccessible anonymous mapping and
//! both halves are then mapped over it with `MAP_FIXED`. If placing a half
//! fails the whole reservation is released and retried, up to the configured
//! number of attempts.

// Mapping and unmapping shared memory goes through libc
#![allow(unsafe_code)]

use crate::domain::ProfilerError;
use log::debug;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

/// Sizes are rounded up to this granularity (the largest common allocation
/// granularity across platforms)
pub const MIRROR_GRANULARITY: usize = 64 * 1024;

/// Ring buffer whose second half aliases the first
pub struct VirtualMirrorBuffer {
    base: NonNull<u8>,
    size: usize,
}

// The buffer is raw shared memory; the queue built on top of it does its own
// synchronization.
unsafe impl Send for VirtualMirrorBuffer {}
unsafe impl Sync for VirtualMirrorBuffer {}

/// Round a requested size up to the granularity and then to a power of two
///
/// `None` when the rounded size, or the twice-as-large mapping, does not fit
/// in `usize`.
#[must_use]
pub fn mirror_size_for(requested: usize) -> Option<usize> {
    let rounded = requested
        .max(1)
        .div_ceil(MIRROR_GRANULARITY)
        .checked_mul(MIRROR_GRANULARITY)?;
    let size = rounded.checked_next_power_of_two()?;
    size.checked_mul(2).map(|_| size)
}

impl VirtualMirrorBuffer {
    /// Map a mirror buffer of at least `requested` bytes
    ///
    /// # Errors
    ///
    /// Returns [`ProfilerError::MirrorBuffer`] when the shared memory object
    /// cannot be created or no adjacent placement is found within `attempts`
    /// tries.
    pub fn new(requested: usize, attempts: u32) -> Result<Self, ProfilerError> {
        let Some(size) = mirror_size_for(requested) else {
            return Err(ProfilerError::MirrorBuffer { size: requested, attempts });
        };
        let failed = || ProfilerError::MirrorBuffer { size, attempts };

        let fd = create_shared_memory(size).map_err(|e| {
            debug!("Shared memory object of {size} bytes failed: {e}");
            failed()
        })?;

        for attempt in 0..attempts {
            if let Some(base) = map_twice(&fd, size) {
                debug!("Mapped {size}-byte mirror buffer after {} attempt(s)", attempt + 1);
                return Ok(Self { base, size });
            }
        }
        Err(failed())
    }

    /// Rounded capacity; callers must use this rather than the requested size
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Start of the first view; `size * 2` bytes are addressable from here
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }
}

impl Drop for VirtualMirrorBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.size * 2);
        }
    }
}

#[cfg(target_os = "linux")]
fn create_shared_memory(size: usize) -> std::io::Result<OwnedFd> {
    let raw = unsafe { libc::memfd_create(c"livetrace-mirror".as_ptr(), libc::MFD_CLOEXEC) };
    if raw < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    truncate(&fd, size)?;
    Ok(fd)
}

#[cfg(not(target_os = "linux"))]
fn create_shared_memory(size: usize) -> std::io::Result<OwnedFd> {
    use std::os::unix::ffi::OsStringExt;

    let mut template = std::env::temp_dir()
        .join("livetrace-mirror-XXXXXX")
        .into_os_string()
        .into_vec();
    template.push(0);

    let raw = unsafe { libc::mkstemp(template.as_mut_ptr().cast()) };
    if raw < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    // Only the descriptor keeps the object alive
    unsafe {
        libc::unlink(template.as_ptr().cast());
    }
    truncate(&fd, size)?;
    Ok(fd)
}

fn truncate(fd: &OwnedFd, size: usize) -> std::io::Result<()> {
    let len = libc::off_t::try_from(size)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    if unsafe { libc::ftruncate(fd.as_raw_fd(), len) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// One placement attempt: reserve 2x, then map both halves over it
fn map_twice(fd: &OwnedFd, size: usize) -> Option<NonNull<u8>> {
    unsafe {
        let reserved = libc::mmap(
            std::ptr::null_mut(),
            size * 2,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if reserved == libc::MAP_FAILED {
            return None;
        }

        let base = reserved.cast::<u8>();
        for half in [base, base.add(size)] {
            let view = libc::mmap(
                half.cast(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_FIXED | libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            );
            if view == libc::MAP_FAILED || view.cast::<u8>() != half {
                libc::munmap(reserved, size * 2);
                return None;
            }
        }
        NonNull::new(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_rounding() {
        assert_eq!(mirror_size_for(1), Some(64 * 1024));
        assert_eq!(mirror_size_for(64 * 1024), Some(64 * 1024));
        assert_eq!(mirror_size_for(64 * 1024 + 1), Some(128 * 1024));
        assert_eq!(mirror_size_for(3 * 64 * 1024), Some(256 * 1024));
    }

    #[test]
    fn test_oversized_request_is_an_error() {
        assert_eq!(mirror_size_for(usize::MAX), None);
        assert_eq!(mirror_size_for(usize::MAX / 2 + 2), None);
        assert!(matches!(
            VirtualMirrorBuffer::new(usize::MAX, 1),
            Err(ProfilerError::MirrorBuffer { size: usize::MAX, attempts: 1 })
        ));
    }

    #[test]
    fn test_write_across_wrap_is_contiguous() {
        let buffer = VirtualMirrorBuffer::new(64 * 1024, 10).unwrap();
        let size = buffer.size();
        let value: u64 = 0x1122_3344_5566_7788;

        unsafe {
            let at = buffer.as_ptr().add(size - 4);
            std::ptr::write_unaligned(at.cast::<u64>(), value);

            // Readable as one value at the wrapped position
            assert_eq!(std::ptr::read_unaligned(at.cast::<u64>()), value);

            // The upper half landed at offset 0 of the first view
            let bytes = value.to_ne_bytes();
            let head = std::slice::from_raw_parts(buffer.as_ptr(), 4);
            assert_eq!(head, &bytes[4..]);
            let tail = std::slice::from_raw_parts(buffer.as_ptr().add(size - 4), 4);
            assert_eq!(tail, &bytes[..4]);
        }
    }

    #[test]
    fn test_views_alias() {
        let buffer = VirtualMirrorBuffer::new(1, 10).unwrap();
        let size = buffer.size();
        unsafe {
            *buffer.as_ptr().add(10) = 0xAB;
            assert_eq!(*buffer.as_ptr().add(size + 10), 0xAB);
        }
    }
}
