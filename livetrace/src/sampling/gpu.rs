//! GPU timer contract
//!
//! GPU work is timed asynchronously: a sample records a start and end marker
//! on the device and the timings only become available once the device has
//! executed past both. The orchestrator therefore polls
//! [`GpuTimer::is_ready`] on a completed tree and, if any marker is still
//! pending, puts the tree back at the end of the queue instead of blocking.
//!
//! Timings are reported relative to the root marker of the thread's GPU tree,
//! recorded once when that tree is created, so device and host clocks never
//! have to be correlated.
//!
//! Concrete backends (CUDA events, D3D11 timestamp queries) live outside this
//! crate and plug in through [`GpuBackend`].

use crate::domain::ProfilerError;
use livetrace_common::SampleType;
use std::any::Any;

/// One pair of device-side markers owned by a pooled sample
pub trait GpuTimer: Send + Sync {
    /// Record the start marker
    ///
    /// # Errors
    ///
    /// Backend-specific recording failures.
    fn begin(&mut self) -> Result<(), ProfilerError>;

    /// Record the end marker
    ///
    /// # Errors
    ///
    /// Backend-specific recording failures.
    fn end(&mut self) -> Result<(), ProfilerError>;

    /// Whether both markers have been reached by the device
    fn is_ready(&self) -> bool;

    /// Start and end in microseconds since `root`'s start marker
    ///
    /// # Errors
    ///
    /// Backend-specific query failures.
    fn times_since(&self, root: &dyn GpuTimer) -> Result<(u64, u64), ProfilerError>;

    /// Lets a backend recover its own timer type from the `root` argument
    fn as_any(&self) -> &dyn Any;
}

/// Factory for the timers of one GPU sample type
pub trait GpuBackend: Send + Sync {
    /// Which tree the samples of this backend go to
    fn sample_type(&self) -> SampleType;

    /// Create the markers for one pooled sample
    ///
    /// # Errors
    ///
    /// Backend-specific creation failures. The sample is not created.
    fn create_timer(&self) -> Result<Box<dyn GpuTimer>, ProfilerError>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! Host-clock backend with a shared readiness switch

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    pub struct FakeBackend {
        pub ready: Arc<AtomicBool>,
        pub created: AtomicUsize,
        sample_type: SampleType,
    }

    impl FakeBackend {
        pub fn new(sample_type: SampleType) -> Self {
            Self {
                ready: Arc::new(AtomicBool::new(false)),
                created: AtomicUsize::new(0),
                sample_type,
            }
        }
    }

    pub struct FakeTimer {
        ready: Arc<AtomicBool>,
        start: Option<Instant>,
        end: Option<Instant>,
    }

    impl GpuTimer for FakeTimer {
        fn begin(&mut self) -> Result<(), ProfilerError> {
            self.start = Some(Instant::now());
            Ok(())
        }

        fn end(&mut self) -> Result<(), ProfilerError> {
            self.end = Some(Instant::now());
            Ok(())
        }

        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::Acquire)
        }

        fn times_since(&self, root: &dyn GpuTimer) -> Result<(u64, u64), ProfilerError> {
            let missing = || ProfilerError::GpuTimer("marker not recorded".into());
            let origin = root
                .as_any()
                .downcast_ref::<FakeTimer>()
                .and_then(|r| r.start)
                .ok_or_else(missing)?;
            let us = |t: Instant| {
                u64::try_from(t.saturating_duration_since(origin).as_micros()).unwrap_or(u64::MAX)
            };
            Ok((us(self.start.ok_or_else(missing)?), us(self.end.ok_or_else(missing)?)))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    impl GpuBackend for FakeBackend {
        fn sample_type(&self) -> SampleType {
            self.sample_type
        }

        fn create_timer(&self) -> Result<Box<dyn GpuTimer>, ProfilerError> {
            self.created.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(FakeTimer {
                ready: Arc::clone(&self.ready),
                start: None,
                end: None,
            }))
        }
    }
}
