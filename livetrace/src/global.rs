//! Process-wide profiler instance
//!
//! Instrumented code rarely has a [`Profiler`] at hand. [`create_global_instance`]
//! installs one for the whole process and the free functions in this module
//! forward to it. Without an instance they do nothing, so instrumentation can
//! stay in place when profiling is off.
//!
//! ```no_run
//! use livetrace::config::ProfilerConfig;
//! use livetrace::global::create_global_instance;
//! use livetrace::sample_scope;
//!
//! let _profiler = create_global_instance(ProfilerConfig::default())?;
//! {
//!     sample_scope!("Frame");
//!     livetrace::global::log_text("frame started");
//! }
//! # Ok::<(), livetrace::domain::ProfilerError>(())
//! ```

use crate::config::ProfilerConfig;
use crate::domain::ProfilerError;
use crate::profiler::{Profiler, ProfilerState, ProfilerStats};
use crate::sampling::GpuBackend;
use livetrace_common::SampleType;
use std::marker::PhantomData;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, PoisonError, RwLock};

static GLOBAL: RwLock<Option<Profiler>> = RwLock::new(None);

fn with_global<R>(f: impl FnOnce(&Profiler) -> R) -> Option<R> {
    let global = GLOBAL.read().unwrap_or_else(PoisonError::into_inner);
    global.as_ref().map(f)
}

/// Owner of the global profiler; dropping it shuts the profiler down
#[must_use = "the global profiler is destroyed as soon as this handle is dropped"]
pub struct GlobalInstance {
    _private: (),
}

/// Start the global profiler
///
/// # Errors
///
/// [`ProfilerError::AlreadyInitialized`] if a global instance exists, or any
/// [`Profiler::new`] failure.
pub fn create_global_instance(config: ProfilerConfig) -> Result<GlobalInstance, ProfilerError> {
    let mut global = GLOBAL.write().unwrap_or_else(PoisonError::into_inner);
    if global.is_some() {
        return Err(ProfilerError::AlreadyInitialized);
    }
    *global = Some(Profiler::new(config)?);
    Ok(GlobalInstance { _private: () })
}

impl GlobalInstance {
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        with_global(Profiler::port)
    }

    #[must_use]
    pub fn state(&self) -> Option<ProfilerState> {
        with_global(Profiler::state)
    }

    #[must_use]
    pub fn stats(&self) -> Option<ProfilerStats> {
        with_global(Profiler::stats)
    }

    #[must_use]
    pub fn is_client_connected(&self) -> bool {
        with_global(Profiler::is_client_connected).unwrap_or(false)
    }
}

impl Drop for GlobalInstance {
    fn drop(&mut self) {
        let profiler = GLOBAL.write().unwrap_or_else(PoisonError::into_inner).take();
        // Joined outside the lock: instrumented threads only ever see no instance
        if let Some(profiler) = profiler {
            profiler.shutdown();
        }
    }
}

/// See [`Profiler::begin_sample`]
pub fn begin_sample(name: &'static str, hash_cache: Option<&AtomicU32>) {
    with_global(|p| p.begin_sample(name, hash_cache));
}

pub fn end_sample() {
    with_global(Profiler::end_sample);
}

pub fn set_current_thread_name(name: &str) {
    with_global(|p| p.set_current_thread_name(name));
}

pub fn log_text(text: &str) {
    with_global(|p| p.log_text(text));
}

/// See [`Profiler::bind_gpu_backend`]
///
/// # Errors
///
/// [`ProfilerError::NoGlobalInstance`] without a global profiler, otherwise
/// the binding failure.
pub fn bind_gpu_backend(backend: Arc<dyn GpuBackend>) -> Result<(), ProfilerError> {
    with_global(|p| p.bind_gpu_backend(backend)).unwrap_or(Err(ProfilerError::NoGlobalInstance))
}

pub fn begin_gpu_sample(sample_type: SampleType, name: &'static str, hash_cache: Option<&AtomicU32>) {
    with_global(|p| p.begin_gpu_sample(sample_type, name, hash_cache));
}

pub fn end_gpu_sample(sample_type: SampleType) {
    with_global(|p| p.end_gpu_sample(sample_type));
}

/// CPU sample on the global profiler, closed when dropped
///
/// Not `Send`: a sample has to end on the thread that opened it.
#[must_use = "the sample ends as soon as the scope is dropped"]
pub struct SampleScope {
    _not_send: PhantomData<*const ()>,
}

impl SampleScope {
    pub fn new(name: &'static str, hash_cache: Option<&AtomicU32>) -> Self {
        begin_sample(name, hash_cache);
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for SampleScope {
    fn drop(&mut self) {
        end_sample();
    }
}

/// Sample the rest of the enclosing block on the global profiler
///
/// Each call site caches its name hash in a hidden static.
#[macro_export]
macro_rules! sample_scope {
    ($name:expr) => {
        let _livetrace_scope = {
            static NAME_HASH: ::std::sync::atomic::AtomicU32 = ::std::sync::atomic::AtomicU32::new(0);
            $crate::global::SampleScope::new($name, Some(&NAME_HASH))
        };
    };
}
