mod common;

use common::{wait_for, Viewer};
use livetrace::{GpuBackend, GpuTimer, Profiler, ProfilerConfig, ProfilerError};
use livetrace_common::SampleType;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Device stand-in: markers are host instants, readiness is a shared switch
struct HostBackend {
    device_done: Arc<AtomicBool>,
}

struct HostTimer {
    device_done: Arc<AtomicBool>,
    start: Option<Instant>,
    end: Option<Instant>,
}

impl GpuTimer for HostTimer {
    fn begin(&mut self) -> Result<(), ProfilerError> {
        self.start = Some(Instant::now());
        Ok(())
    }

    fn end(&mut self) -> Result<(), ProfilerError> {
        self.end = Some(Instant::now());
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.device_done.load(Ordering::Acquire)
    }

    fn times_since(&self, root: &dyn GpuTimer) -> Result<(u64, u64), ProfilerError> {
        let origin = root
            .as_any()
            .downcast_ref::<HostTimer>()
            .and_then(|r| r.start)
            .ok_or_else(|| ProfilerError::GpuTimer("root marker missing".into()))?;
        let us = |t: Option<Instant>| {
            t.map(|t| u64::try_from(t.saturating_duration_since(origin).as_micros()).unwrap_or(u64::MAX))
                .ok_or_else(|| ProfilerError::GpuTimer("marker missing".into()))
        };
        Ok((us(self.start)?, us(self.end)?))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl GpuBackend for HostBackend {
    fn sample_type(&self) -> SampleType {
        SampleType::Cuda
    }

    fn create_timer(&self) -> Result<Box<dyn GpuTimer>, ProfilerError> {
        Ok(Box::new(HostTimer {
            device_done: Arc::clone(&self.device_done),
            start: None,
            end: None,
        }))
    }
}

#[test]
fn test_gpu_tree_is_sent_once_device_finishes() {
    let config = ProfilerConfig::default()
        .with_port(0)
        .without_self_profile();
    let profiler = Profiler::new(config).unwrap();
    let device_done = Arc::new(AtomicBool::new(false));
    profiler
        .bind_gpu_backend(Arc::new(HostBackend {
            device_done: Arc::clone(&device_done),
        }))
        .unwrap();

    let mut viewer = Viewer::connect(profiler.port());
    assert!(wait_for(|| profiler.is_client_connected()));

    profiler.set_current_thread_name("render");
    profiler.begin_gpu_sample(SampleType::Cuda, "Frame", None);
    profiler.begin_gpu_sample(SampleType::Cuda, "Blur", None);
    profiler.end_gpu_sample(SampleType::Cuda);
    profiler.end_gpu_sample(SampleType::Cuda);

    // The orchestrator keeps putting the tree back while the device is busy
    assert!(wait_for(|| profiler.stats().gpu_trees_requeued > 0));
    assert_eq!(profiler.stats().trees_sent, 0);

    device_done.store(true, Ordering::Release);
    let msg = viewer.read_until(|v| v["id"] == "SAMPLES");
    assert_eq!(msg["thread_name"], "render (CUDA)");
    assert_eq!(msg["nb_samples"], 2);
    assert_eq!(msg["samples"][0]["name"], "Frame");
    assert_eq!(msg["samples"][0]["children"][0]["name"], "Blur");

    let frame_start = msg["samples"][0]["us_start"].as_u64().unwrap();
    let blur_start = msg["samples"][0]["children"][0]["us_start"].as_u64().unwrap();
    assert!(blur_start >= frame_start);

    profiler.shutdown();
}

#[test]
fn test_unready_gpu_tree_is_released_on_shutdown() {
    let config = ProfilerConfig::default()
        .with_port(0)
        .without_self_profile();
    let profiler = Profiler::new(config).unwrap();
    profiler
        .bind_gpu_backend(Arc::new(HostBackend {
            device_done: Arc::new(AtomicBool::new(false)),
        }))
        .unwrap();

    profiler.begin_gpu_sample(SampleType::Cuda, "Never", None);
    profiler.end_gpu_sample(SampleType::Cuda);

    // Must not hang or leak waiting for a device that never finishes
    profiler.shutdown();
}
