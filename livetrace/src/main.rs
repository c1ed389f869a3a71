//! # livetrace - Demo Binary
//!
//! Starts the global profiler, runs a synthetic frame loop on `--threads`
//! worker threads and streams their samples and log lines to a viewer
//! connecting on `--port`. Stops on Ctrl+C or after `--duration` seconds.

use anyhow::{Context, Result};
use clap::Parser;
use livetrace::cli::Args;
use livetrace::domain::ProfilerError;
use livetrace::global::{self, create_global_instance};
use livetrace::sample_scope;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_UNAVAILABLE: i32 = 69;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<ProfilerError>() {
        Some(ProfilerError::ServerStart { source, .. })
            if source.kind() == std::io::ErrorKind::AddrInUse =>
        {
            EXIT_UNAVAILABLE
        }
        _ => EXIT_ERROR,
    }
}

/// Busy-wait so samples have a visible width without yielding the thread
fn spin(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

fn simulate_frame(worker: usize) {
    {
        sample_scope!("Update");
        spin(Duration::from_micros(300));
        {
            sample_scope!("Physics");
            spin(Duration::from_micros(150 + 50 * worker as u64));
        }
    }
    {
        sample_scope!("Render");
        for _ in 0..3 {
            sample_scope!("DrawBatch");
            spin(Duration::from_micros(100));
        }
    }
}

fn run_worker(worker: usize, stop: &AtomicBool) {
    global::set_current_thread_name(&format!("worker-{worker}"));
    let mut frame = 0u64;
    while !stop.load(Ordering::Relaxed) {
        {
            sample_scope!("Frame");
            simulate_frame(worker);
            if frame % 100 == 0 {
                global::log_text(&format!("worker-{worker} reached frame {frame}"));
            }
        }
        frame += 1;
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;

    let profiler =
        create_global_instance(args.profiler_config()).context("Failed to start profiler")?;

    if !quiet {
        println!("livetrace v{}", env!("CARGO_PKG_VERSION"));
        println!("viewer port: {}", profiler.port().unwrap_or(args.port));
        println!("workers: {}", args.threads);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let workers = (0..args.threads)
        .map(|worker| {
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name(format!("worker-{worker}"))
                .spawn(move || run_worker(worker, &stop))
                .context("Failed to spawn worker thread")
        })
        .collect::<Result<Vec<_>>>()?;

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let started = Instant::now();
    let duration_limit =
        if args.duration > 0 { Some(Duration::from_secs(args.duration)) } else { None };
    let mut last_status = Instant::now();
    let mut exit_reason = "interrupted";

    loop {
        if let Some(limit) = duration_limit {
            if started.elapsed() >= limit {
                exit_reason = "duration limit reached";
                break;
            }
        }

        if last_status.elapsed() > Duration::from_secs(10) {
            if let Some(stats) = profiler.stats() {
                info!(
                    "viewer connected: {}, trees sent: {}, trees dropped: {}",
                    profiler.is_client_connected(),
                    stats.trees_sent,
                    stats.trees_dropped
                );
            }
            last_status = Instant::now();
        }

        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = &mut ctrl_c => {
                break;
            }
        }
    }

    stop.store(true, Ordering::Relaxed);
    for worker in workers {
        if worker.join().is_err() {
            warn!("Worker thread panicked");
        }
    }

    let stats = profiler.stats().unwrap_or_default();
    drop(profiler);

    if !quiet {
        eprintln!(
            "\n{}: {:.1}s, {} trees sent, {} dropped, {} GPU requeues, {} log lines sent / {} dropped",
            exit_reason,
            started.elapsed().as_secs_f64(),
            stats.trees_sent,
            stats.trees_dropped,
            stats.gpu_trees_requeued,
            stats.log_lines_sent,
            stats.log_lines_dropped,
        );
    }

    Ok(())
}
