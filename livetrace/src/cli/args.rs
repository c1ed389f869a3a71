//! CLI argument definitions

use crate::config::ProfilerConfig;
use clap::Parser;
use livetrace_common::DEFAULT_PORT;

#[derive(Parser, Debug)]
#[command(
    name = "livetrace",
    about = "Run an instrumented workload and stream its samples to a live viewer",
    after_help = "\
EXAMPLES:
    livetrace                                Serve on the default port until Ctrl+C
    livetrace --threads 8 --duration 30      Eight workers for thirty seconds
    livetrace --port 0 --allow-host localhost  Ephemeral port, local viewers only"
)]
pub struct Args {
    /// Port the viewer connects to (0 picks a free port)
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Number of instrumented worker threads
    #[arg(short, long, default_value = "4")]
    pub threads: usize,

    /// Stop after N seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Accept viewers only with this Host header (repeatable)
    #[arg(long = "allow-host", value_name = "HOST")]
    pub allow_hosts: Vec<String>,

    /// Message queue size in KiB
    #[arg(long, default_value = "64", value_name = "KIB")]
    pub queue_kib: usize,

    /// Do not sample the profiler's own thread
    #[arg(long)]
    pub no_self_profile: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Profiler settings selected on the command line
    #[must_use]
    pub fn profiler_config(&self) -> ProfilerConfig {
        let config = ProfilerConfig::default()
            .with_port(self.port)
            .with_message_queue_bytes(self.queue_kib.saturating_mul(1024))
            .with_allowed_hosts(self.allow_hosts.iter().cloned());
        if self.no_self_profile {
            config.without_self_profile()
        } else {
            config
        }
    }
}
