//! # livetrace - Live Multi-Thread Sample Profiler
//!
//! livetrace is a low-overhead instrumentation core. Application code marks
//! named, timed regions ("samples") from any thread; each thread builds its own
//! call tree of samples, completed trees cross threads through a lock-free
//! queue, and a background thread streams them as JSON to a live viewer over a
//! WebSocket connection.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Instrumented Application Threads                │
//! │        begin_sample / end_sample / log_text / GPU samples       │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ thread-local lookup
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    ThreadSampler (per thread)                   │
//! │  • SampleTree per sample type (CPU, CUDA, D3D11)                │
//! │  • Samples pooled in a lock-free ObjectAllocator                │
//! │  • Path-hashed sample ids, microsecond timer                    │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ completed trees, log lines
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │           MessageQueue (MPSC over a VirtualMirrorBuffer)        │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ drained every 10 ms
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Orchestrator Thread                        │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │ GPU readiness│──▶│     JSON     │──▶│  WebSocket   │──▶ viewer
//! │  │ (re-enqueue) │   │  Serializer  │   │    Server    │         │
//! │  └──────────────┘   └──────────────┘   └──────────────┘         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Core Pipeline Modules
//!
//! - [`memory`]: Lock-free building blocks
//!   - `mirror_buffer`: Ring memory mapped twice back to back
//!   - `object_allocator`: Free-list pool with tagged-pointer heads
//!
//! - [`sampling`]: Samples, trees, per-thread state and the GPU timer contract
//!
//! - [`queue`]: Multi-producer single-consumer message queue
//!
//! - [`export`]: JSON rendering of sample trees, log lines and pings,
//!   plus the structural digest of a tree
//!
//! - [`network`]: Minimal single-client WebSocket server
//!
//! ### Entry Points
//!
//! - [`profiler`]: Explicit [`Profiler`] context and its orchestrator thread
//!
//! - [`global`]: Process-wide instance, free functions and
//!   [`sample_scope!`]
//!
//! - [`config`]: [`ProfilerConfig`] and limits
//!
//! - [`cli`]: Command-line arguments of the demo binary
//!
//! - [`domain`]: Error types and small newtypes (name hashes, sample ids)
//!
//! ## Typical Usage
//!
//! ```no_run
//! use livetrace::{Profiler, ProfilerConfig};
//! use std::sync::atomic::AtomicU32;
//!
//! static FRAME: AtomicU32 = AtomicU32::new(0);
//!
//! let profiler = Profiler::new(ProfilerConfig::default())?;
//! profiler.set_current_thread_name("main");
//! {
//!     let _frame = profiler.scope("Frame", Some(&FRAME));
//!     profiler.log_text("frame started");
//! }
//! profiler.shutdown();
//! # Ok::<(), livetrace::ProfilerError>(())
//! ```
//!
//! ## Key Concepts
//!
//! - **Sample**: Named timed region; nested samples form a tree per thread
//! - **Completed tree**: A root-level sample and its descendants, queued once
//!   the outermost sample ends
//! - **Mirror buffer**: Writes running past the end of the ring land at its
//!   start, so messages never have to be split
//! - **Sample digest**: Hash over every sample id in pre-order; equal digests
//!   mean equal tree shapes

pub mod cli;
pub mod config;
pub mod domain;
pub mod export;
pub mod global;
pub mod memory;
pub mod network;
pub mod profiler;
pub mod queue;
pub mod sampling;

pub use config::ProfilerConfig;
pub use domain::ProfilerError;
pub use profiler::{Profiler, ProfilerScope, ProfilerState, ProfilerStats};
pub use sampling::{GpuBackend, GpuTimer};
