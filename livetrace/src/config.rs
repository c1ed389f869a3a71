//! Profiler configuration

use livetrace_common::DEFAULT_PORT;
use std::time::Duration;

/// Upper bound on the length of a thread name, in bytes
pub const MAX_THREAD_NAME_BYTES: usize = 64;

/// Log lines longer than this are wrapped into several LOG messages
pub const MAX_LOG_LINE_BYTES: usize = 1024;

/// Controls how the profiler buffers samples and talks to the viewer.
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    /// TCP port the viewer connects to (0 picks an ephemeral port).
    pub port: u16,
    /// Requested message queue capacity in bytes, rounded up by the mirror buffer.
    pub message_queue_bytes: usize,
    /// How many times to retry placing the second half of the mirror mapping.
    pub mirror_buffer_attempts: u32,
    /// Maximum number of queued messages handled per orchestrator update.
    pub max_messages_per_update: usize,
    /// Sleep between orchestrator updates.
    pub update_interval: Duration,
    /// Interval between keep-alive pings to the viewer.
    pub ping_interval: Duration,
    /// Upper bound on the time spent reading a WebSocket upgrade request.
    pub handshake_timeout: Duration,
    /// Upper bound on a single send or receive once data has started flowing.
    pub io_timeout: Duration,
    /// Hosts accepted in the upgrade request. Empty accepts any host.
    pub allowed_hosts: Vec<String>,
    /// Whether the orchestrator thread samples its own update phases.
    pub self_profile: bool,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            message_queue_bytes: 64 * 1024,
            mirror_buffer_attempts: 10,
            max_messages_per_update: 100,
            update_interval: Duration::from_millis(10),
            ping_interval: Duration::from_millis(1000),
            handshake_timeout: Duration::from_millis(1000),
            io_timeout: Duration::from_millis(20),
            allowed_hosts: Vec::new(),
            self_profile: true,
        }
    }
}

impl ProfilerConfig {
    /// Builder-style helper to change the listening port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder-style helper to change the message queue capacity.
    #[must_use]
    pub fn with_message_queue_bytes(mut self, bytes: usize) -> Self {
        self.message_queue_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_max_messages_per_update(mut self, max: usize) -> Self {
        self.max_messages_per_update = max;
        self
    }

    #[must_use]
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    #[must_use]
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Restrict viewers to the given `Host` header values (port excluded).
    #[must_use]
    pub fn with_allowed_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Explicitly disable sampling of the orchestrator thread.
    #[must_use]
    pub fn without_self_profile(mut self) -> Self {
        self.self_profile = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProfilerConfig::default();
        assert_eq!(config.port, 0x4597);
        assert_eq!(config.message_queue_bytes, 64 * 1024);
        assert_eq!(config.max_messages_per_update, 100);
        assert_eq!(config.update_interval, Duration::from_millis(10));
        assert!(config.allowed_hosts.is_empty());
    }

    #[test]
    fn test_builder_helpers() {
        let config = ProfilerConfig::default()
            .with_port(0)
            .with_allowed_hosts(["localhost", "127.0.0.1"])
            .without_self_profile();
        assert_eq!(config.port, 0);
        assert_eq!(config.allowed_hosts, vec!["localhost", "127.0.0.1"]);
        assert!(!config.self_profile);
    }
}
