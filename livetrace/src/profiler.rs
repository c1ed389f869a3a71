//! # Profiler Instance
//!
//! Instrumented threads push completed sample trees and log lines into one
//! shared [`MessageQueue`]. A dedicated orchestrator thread owns the
//! [`Server`], drains the queue and streams JSON frames to the viewer.
//!
//! ```text
//! thread A ─ begin/end ─┐
//! thread B ─ begin/end ─┼──▶ MessageQueue ──▶ orchestrator ──▶ Server ──▶ viewer
//! thread C ─ log_text  ─┘      (MPSC)        (every 10 ms)
//! ```
//!
//! ## Thread Samplers
//!
//! The first instrumentation call on a thread creates that thread's
//! [`ThreadSampler`], prepends it to the profiler's lock-free registry and
//! remembers it in a thread-local table keyed by profiler instance. Samplers
//! are only freed when the profiler itself goes away, so the orchestrator can
//! read a thread's name through the pointer stored in each message header.
//!
//! ## Shutdown
//!
//! 1. The exit channel is closed and the orchestrator is joined
//! 2. The orchestrator flushes the queue: trees are released, nothing is sent
//! 3. Dropping the last reference to the shared state flushes whatever was
//!    queued in between and frees every registered sampler

#![allow(unsafe_code)] // Samplers are shared through raw registry and message links

use crate::config::ProfilerConfig;
use crate::domain::ProfilerError;
use crate::export::{log_lines, JsonWriter};
use crate::memory::TaggedHead;
use crate::network::Server;
use crate::queue::{Message, MessageQueue};
use crate::sampling::hash::cached_name_hash;
use crate::sampling::{enqueue_tree, CompletedTree, GpuBackend, ThreadSampler, TreeDelivery};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use livetrace_common::{MessageId, SampleType};
use log::{debug, info, trace, warn};
use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::thread::JoinHandle;

/// Name of the orchestrator thread, in the OS and in the viewer
pub const ORCHESTRATOR_THREAD_NAME: &str = "livetrace";

/// Lifecycle of a profiler instance
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilerState {
    /// Orchestrator is serving the viewer
    Running = 0,
    /// Shutdown was requested, the orchestrator has not noticed yet
    ExitRequested = 1,
    /// Orchestrator is releasing queued messages
    Flushing = 2,
    /// Orchestrator has been joined
    Terminated = 3,
}

impl ProfilerState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::ExitRequested,
            2 => Self::Flushing,
            _ => Self::Terminated,
        }
    }
}

/// Counters snapshot, see [`Profiler::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfilerStats {
    /// Sample trees delivered to a viewer
    pub trees_sent: u64,
    /// Sample trees released because the queue was full or timing failed
    pub trees_dropped: u64,
    /// GPU trees put back because the device had not finished
    pub gpu_trees_requeued: u64,
    /// Log lines delivered to a viewer
    pub log_lines_sent: u64,
    /// Log lines lost to a full queue
    pub log_lines_dropped: u64,
    /// End calls without a matching begin
    pub unbalanced_ends: u64,
}

#[derive(Default)]
struct StatCounters {
    trees_sent: AtomicU64,
    trees_dropped: AtomicU64,
    gpu_trees_requeued: AtomicU64,
    log_lines_sent: AtomicU64,
    log_lines_dropped: AtomicU64,
    unbalanced_ends: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> ProfilerStats {
        ProfilerStats {
            trees_sent: self.trees_sent.load(Ordering::Relaxed),
            trees_dropped: self.trees_dropped.load(Ordering::Relaxed),
            gpu_trees_requeued: self.gpu_trees_requeued.load(Ordering::Relaxed),
            log_lines_sent: self.log_lines_sent.load(Ordering::Relaxed),
            log_lines_dropped: self.log_lines_dropped.load(Ordering::Relaxed),
            unbalanced_ends: self.unbalanced_ends.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

thread_local! {
    /// Samplers created by this thread, one per profiler instance it touched
    static THREAD_SAMPLERS: RefCell<Vec<(Weak<ProfilerShared>, NonNull<ThreadSampler>)>> =
        const { RefCell::new(Vec::new()) };
}

/// State shared by the instrumentation API and the orchestrator thread
pub(crate) struct ProfilerShared {
    config: ProfilerConfig,
    queue: MessageQueue,
    samplers: TaggedHead<ThreadSampler>,
    gpu_backends: RwLock<[Option<Arc<dyn GpuBackend>>; SampleType::COUNT]>,
    state: AtomicU8,
    client_connected: AtomicBool,
    stats: StatCounters,
}

impl ProfilerShared {
    fn new(config: ProfilerConfig) -> Result<Arc<Self>, ProfilerError> {
        let queue = MessageQueue::new(config.message_queue_bytes, config.mirror_buffer_attempts)?;
        debug!("Message queue ready ({} bytes)", queue.capacity());
        Ok(Arc::new(Self {
            config,
            queue,
            samplers: TaggedHead::null(),
            gpu_backends: RwLock::new(Default::default()),
            state: AtomicU8::new(ProfilerState::Running as u8),
            client_connected: AtomicBool::new(false),
            stats: StatCounters::default(),
        }))
    }

    fn state(&self) -> ProfilerState {
        ProfilerState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ProfilerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The calling thread's sampler, created and registered on first use
    fn thread_sampler(self: &Arc<Self>) -> Result<&ThreadSampler, ProfilerError> {
        let key = Arc::as_ptr(self);
        let found = THREAD_SAMPLERS
            .try_with(|samplers| {
                samplers
                    .borrow()
                    .iter()
                    .find(|(owner, _)| owner.as_ptr() == key)
                    .map(|&(_, sampler)| sampler)
            })
            .map_err(|_| ProfilerError::ThreadLocalUnavailable)?;
        if let Some(sampler) = found {
            // Registered samplers are freed only when `self` is dropped
            return Ok(unsafe { sampler.as_ref() });
        }

        let sampler = NonNull::from(Box::leak(ThreadSampler::new()?));
        self.register(sampler);
        THREAD_SAMPLERS
            .try_with(|samplers| {
                let mut samplers = samplers.borrow_mut();
                samplers.retain(|(owner, _)| owner.strong_count() > 0);
                samplers.push((Arc::downgrade(self), sampler));
            })
            .map_err(|_| ProfilerError::ThreadLocalUnavailable)?;
        Ok(unsafe { sampler.as_ref() })
    }

    fn register(&self, sampler: NonNull<ThreadSampler>) {
        let mut head = self.samplers.load(Ordering::Acquire);
        loop {
            unsafe { sampler.as_ref() }
                .next
                .store(head.ptr(), Ordering::Relaxed);
            match self.samplers.compare_exchange(
                head,
                sampler.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(()) => break,
                Err(observed) => head = observed,
            }
        }
        trace!("Registered thread sampler {sampler:p}");
    }

    fn count_delivery(&self, delivery: TreeDelivery) {
        if delivery == TreeDelivery::Dropped {
            bump(&self.stats.trees_dropped);
        }
    }

    fn report_end_failure(&self, err: &ProfilerError) {
        if matches!(err, ProfilerError::UnbalancedEndSample) {
            bump(&self.stats.unbalanced_ends);
            debug!("End of sample without a matching begin, ignored");
        } else {
            warn!("Ending sample failed: {err}");
        }
    }

    fn begin_sample(self: &Arc<Self>, name: &'static str, hash_cache: Option<&AtomicU32>) {
        let result = self
            .thread_sampler()
            .and_then(|sampler| sampler.begin_sample(name, cached_name_hash(name, hash_cache)));
        if let Err(e) = result {
            warn!("Beginning sample {name} failed: {e}");
        }
    }

    fn end_sample(self: &Arc<Self>) {
        match self
            .thread_sampler()
            .and_then(|sampler| sampler.end_sample(&self.queue))
        {
            Ok(delivery) => self.count_delivery(delivery),
            Err(e) => self.report_end_failure(&e),
        }
    }

    fn scope(self: &Arc<Self>, name: &'static str, hash_cache: Option<&AtomicU32>) -> ProfilerScope<'_> {
        self.begin_sample(name, hash_cache);
        ProfilerScope { shared: Some(self) }
    }

    /// Scope around an orchestrator phase, inert unless self-profiling
    fn self_scope(self: &Arc<Self>, name: &'static str, hash_cache: &AtomicU32) -> ProfilerScope<'_> {
        if self.config.self_profile {
            self.scope(name, Some(hash_cache))
        } else {
            ProfilerScope { shared: None }
        }
    }

    fn set_current_thread_name(self: &Arc<Self>, name: &str) {
        match self.thread_sampler() {
            Ok(sampler) => sampler.set_name(name),
            Err(e) => warn!("Naming thread {name} failed: {e}"),
        }
    }

    fn log_text(self: &Arc<Self>, text: &str) {
        let sampler = match self.thread_sampler() {
            Ok(sampler) => sampler,
            Err(e) => {
                warn!("Logging failed: {e}");
                return;
            }
        };

        let mut writer = JsonWriter::new();
        let mut lines = log_lines(text);
        while let Some(line) = lines.next() {
            let json = match writer.write_log_line(line) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Rendering log line failed: {e}");
                    return;
                }
            };
            let Some(mut message) = self.queue.alloc_message(json.len(), sampler) else {
                // The rest of the text is lost along with this line
                let dropped = 1 + lines.by_ref().count() as u64;
                self.stats.log_lines_dropped.fetch_add(dropped, Ordering::Relaxed);
                trace!("Message queue full, dropped {dropped} log lines");
                return;
            };
            message.payload_mut().copy_from_slice(json);
            self.queue.commit_message(message, MessageId::LogText);
        }
    }

    fn bind_gpu_backend(&self, backend: Arc<dyn GpuBackend>) -> Result<(), ProfilerError> {
        let sample_type = backend.sample_type();
        if !sample_type.is_gpu() {
            return Err(ProfilerError::GpuTimer(format!(
                "cannot bind a backend for {sample_type:?} samples"
            )));
        }
        let mut backends = self
            .gpu_backends
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        backends[sample_type.index()] = Some(backend);
        info!("Bound {sample_type:?} timer backend");
        Ok(())
    }

    fn gpu_backend(&self, sample_type: SampleType) -> Option<Arc<dyn GpuBackend>> {
        let backends = self
            .gpu_backends
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        backends[sample_type.index()].clone()
    }

    fn begin_gpu_sample(
        self: &Arc<Self>,
        sample_type: SampleType,
        name: &'static str,
        hash_cache: Option<&AtomicU32>,
    ) {
        let Some(backend) = self.gpu_backend(sample_type) else {
            debug!("No {sample_type:?} backend bound, ignoring sample {name}");
            return;
        };
        let result = self.thread_sampler().and_then(|sampler| {
            sampler.begin_gpu_sample(&backend, name, cached_name_hash(name, hash_cache))
        });
        if let Err(e) = result {
            warn!("Beginning {sample_type:?} sample {name} failed: {e}");
        }
    }

    fn end_gpu_sample(self: &Arc<Self>, sample_type: SampleType) {
        match self
            .thread_sampler()
            .and_then(|sampler| sampler.end_gpu_sample(sample_type, &self.queue))
        {
            Ok(delivery) => self.count_delivery(delivery),
            Err(e) => self.report_end_failure(&e),
        }
    }

    /// Forward up to `max_messages_per_update` queued messages to the viewer
    ///
    /// Without a viewer nothing is consumed, so the queue absorbs the backlog
    /// until it fills up and producers start dropping.
    fn consume_message_queue(
        &self,
        server: &mut Server,
        writer: &mut JsonWriter,
    ) -> Result<(), ProfilerError> {
        if !server.is_client_connected() {
            return Ok(());
        }
        for _ in 0..self.config.max_messages_per_update {
            let Some(message) = self.queue.peek_next_message() else {
                break;
            };
            let result = self.forward_message(&message, server, writer);
            self.queue.consume_next_message(message);
            result?;
        }
        Ok(())
    }

    fn forward_message(
        &self,
        message: &Message<'_>,
        server: &mut Server,
        writer: &mut JsonWriter,
    ) -> Result<(), ProfilerError> {
        match message.id() {
            Some(MessageId::LogText) => {
                server.send(message.payload())?;
                bump(&self.stats.log_lines_sent);
            }
            Some(MessageId::SampleTree) => {
                // Ownership of the tree leaves the queue here
                let tree: CompletedTree = unsafe { message.take_payload() };
                self.forward_tree(tree, message.thread_sampler(), server, writer)?;
            }
            Some(MessageId::NotReady) | None => {
                debug!("Skipping message with unexpected id");
            }
        }
        Ok(())
    }

    fn forward_tree(
        &self,
        mut tree: CompletedTree,
        sampler: *const ThreadSampler,
        server: &mut Server,
        writer: &mut JsonWriter,
    ) -> Result<(), ProfilerError> {
        let sample_type = tree.sample_type();
        if sample_type.is_gpu() {
            if !tree.is_gpu_ready() {
                bump(&self.stats.gpu_trees_requeued);
                let delivery = enqueue_tree(&self.queue, tree, sampler);
                self.count_delivery(delivery);
                return Ok(());
            }
            if let Err(e) = tree.resolve_gpu_times() {
                bump(&self.stats.trees_dropped);
                warn!("Dropping {sample_type:?} tree: {e}");
                return Ok(());
            }
        }

        // Samplers outlive every message that points at them
        let thread_name = unsafe { sampler.as_ref() }
            .map(ThreadSampler::name)
            .unwrap_or_default();
        let json = writer.write_sample_tree(&thread_name, sample_type, tree.root())?;
        server.send(json)?;
        bump(&self.stats.trees_sent);
        Ok(())
    }

    /// Release every committed message without sending it
    fn flush_message_queue(&self) {
        let mut released = 0usize;
        while let Some(message) = self.queue.peek_next_message() {
            if message.id() == Some(MessageId::SampleTree) {
                drop(unsafe { message.take_payload::<CompletedTree>() });
                released += 1;
            }
            self.queue.consume_next_message(message);
        }
        if released > 0 {
            debug!("Released {released} unsent sample trees");
        }
    }
}

impl Drop for ProfilerShared {
    fn drop(&mut self) {
        self.flush_message_queue();

        let mut next = self.samplers.take(Ordering::Acquire);
        let mut freed = 0usize;
        while !next.is_null() {
            // Every registry entry came from `Box::leak` and is unlinked once
            let sampler = unsafe { Box::from_raw(next) };
            next = sampler.next.load(Ordering::Relaxed);
            drop(sampler);
            freed += 1;
        }
        debug!("Freed {freed} thread samplers");
    }
}

fn run_orchestrator(shared: Arc<ProfilerShared>, mut server: Server, exit_rx: Receiver<()>) {
    static WAKEUP: AtomicU32 = AtomicU32::new(0);
    static SERVER_UPDATE: AtomicU32 = AtomicU32::new(0);
    static CONSUME: AtomicU32 = AtomicU32::new(0);

    if shared.config.self_profile {
        shared.set_current_thread_name(ORCHESTRATOR_THREAD_NAME);
    }
    let mut writer = JsonWriter::new();

    loop {
        {
            let _wakeup = shared.self_scope("Wakeup", &WAKEUP);
            {
                let _update = shared.self_scope("ServerUpdate", &SERVER_UPDATE);
                server.update();
            }
            shared
                .client_connected
                .store(server.is_client_connected(), Ordering::Relaxed);

            let _consume = shared.self_scope("ConsumeMessageQueue", &CONSUME);
            if let Err(e) = shared.consume_message_queue(&mut server, &mut writer) {
                debug!("Queue update cut short: {e}");
            }
        }

        match exit_rx.recv_timeout(shared.config.update_interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    shared.set_state(ProfilerState::Flushing);
    shared.flush_message_queue();
    shared.client_connected.store(false, Ordering::Relaxed);
    debug!("Orchestrator exiting");
}

/// Ends the sample it was created for when dropped
#[must_use = "the sample ends as soon as the scope is dropped"]
pub struct ProfilerScope<'a> {
    shared: Option<&'a Arc<ProfilerShared>>,
}

impl Drop for ProfilerScope<'_> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared {
            shared.end_sample();
        }
    }
}

/// A running profiler: the message queue, the thread registry and the
/// orchestrator thread serving one viewer
///
/// Instrumentation calls never fail from the caller's point of view:
/// problems are logged and counted in [`ProfilerStats`].
pub struct Profiler {
    shared: Arc<ProfilerShared>,
    port: u16,
    exit_tx: Option<Sender<()>>,
    orchestrator: Option<JoinHandle<()>>,
}

impl Profiler {
    /// Allocate the queue, bind the viewer port and start the orchestrator
    ///
    /// # Errors
    ///
    /// Mirror buffer creation, port binding or thread spawn failures.
    pub fn new(config: ProfilerConfig) -> Result<Self, ProfilerError> {
        let server = Server::new(&config)?;
        let port = server.port();
        let shared = ProfilerShared::new(config)?;

        let (exit_tx, exit_rx) = bounded(1);
        let thread_shared = Arc::clone(&shared);
        let orchestrator = std::thread::Builder::new()
            .name(ORCHESTRATOR_THREAD_NAME.to_string())
            .spawn(move || run_orchestrator(thread_shared, server, exit_rx))
            .map_err(ProfilerError::ThreadSpawn)?;

        info!("Profiler started, viewer port {port}");
        Ok(Self {
            shared,
            port,
            exit_tx: Some(exit_tx),
            orchestrator: Some(orchestrator),
        })
    }

    /// Port the viewer connects to
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn state(&self) -> ProfilerState {
        self.shared.state()
    }

    #[must_use]
    pub fn stats(&self) -> ProfilerStats {
        self.shared.stats.snapshot()
    }

    /// Whether a viewer completed the handshake, as of the last update
    #[must_use]
    pub fn is_client_connected(&self) -> bool {
        self.shared.client_connected.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn config(&self) -> &ProfilerConfig {
        &self.shared.config
    }

    /// Open a CPU sample on the calling thread
    ///
    /// `hash_cache` is a per-call-site slot holding the name hash; zero means
    /// not computed yet.
    pub fn begin_sample(&self, name: &'static str, hash_cache: Option<&AtomicU32>) {
        self.shared.begin_sample(name, hash_cache);
    }

    /// Close the innermost CPU sample on the calling thread
    pub fn end_sample(&self) {
        self.shared.end_sample();
    }

    /// Open a CPU sample closed by dropping the returned guard
    pub fn scope(&self, name: &'static str, hash_cache: Option<&AtomicU32>) -> ProfilerScope<'_> {
        self.shared.scope(name, hash_cache)
    }

    /// Name shown by the viewer for the calling thread
    pub fn set_current_thread_name(&self, name: &str) {
        self.shared.set_current_thread_name(name);
    }

    /// Queue text for the viewer's log, one message per line
    pub fn log_text(&self, text: &str) {
        self.shared.log_text(text);
    }

    /// Install the timer factory for one GPU sample type
    ///
    /// # Errors
    ///
    /// [`ProfilerError::GpuTimer`] if the backend reports the CPU sample type.
    pub fn bind_gpu_backend(&self, backend: Arc<dyn GpuBackend>) -> Result<(), ProfilerError> {
        self.shared.bind_gpu_backend(backend)
    }

    /// Open a GPU sample; ignored when no backend is bound for `sample_type`
    pub fn begin_gpu_sample(
        &self,
        sample_type: SampleType,
        name: &'static str,
        hash_cache: Option<&AtomicU32>,
    ) {
        self.shared.begin_gpu_sample(sample_type, name, hash_cache);
    }

    pub fn end_gpu_sample(&self, sample_type: SampleType) {
        self.shared.end_gpu_sample(sample_type);
    }

    /// Stop the orchestrator and release everything still queued
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(orchestrator) = self.orchestrator.take() else {
            return;
        };
        self.shared.set_state(ProfilerState::ExitRequested);
        // Closing the channel wakes the orchestrator immediately
        drop(self.exit_tx.take());
        if orchestrator.join().is_err() {
            warn!("Orchestrator thread panicked");
        }
        self.shared.set_state(ProfilerState::Terminated);
        info!("Profiler stopped");
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        self.stop();
    }
}
