//! Structured error types for livetrace
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! None of these errors is fatal to the host process: construction errors are
//! returned to the caller, everything raised on the background thread is
//! logged and handled by dropping the affected connection or tree.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProfilerError {
    #[error("Failed to create mirror buffer of {size} bytes after {attempts} attempts")]
    MirrorBuffer { size: usize, attempts: u32 },

    #[error("Failed to start server on port {port}: {source}")]
    ServerStart {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn orchestrator thread: {0}")]
    ThreadSpawn(std::io::Error),

    #[error("A global profiler instance already exists")]
    AlreadyInitialized,

    #[error("end_sample called with no open sample")]
    UnbalancedEndSample,

    #[error("No GPU backend bound for {0:?} samples")]
    NoGpuBackend(livetrace_common::SampleType),

    #[error("GPU timer failure: {0}")]
    GpuTimer(String),

    #[error("No global profiler instance exists")]
    NoGlobalInstance,

    #[error("Thread-local sampler storage is unavailable on this thread")]
    ThreadLocalUnavailable,

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("No data available")]
    RecvNoData,

    #[error("Receive timed out after {0:?}")]
    RecvTimeout(Duration),

    #[error("Send timed out after {0:?}")]
    SendTimeout(Duration),

    #[error("Send timed out after {sent} of {total} frame bytes")]
    SendIncomplete { sent: usize, total: usize },

    #[error("Send failed: {0}")]
    SendFailed(std::io::Error),

    #[error("Receive failed: {0}")]
    RecvFailed(std::io::Error),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Peer sent a close frame")]
    Disconnected,

    #[error("Unsupported frame header byte 0x{0:02x}")]
    BadFrameHeader(u8),

    #[error("Frame header cut short")]
    TruncatedFrameHeader,

    #[error("Frame payload of {0} bytes is too large")]
    FrameTooLarge(u64),

    #[error("Accept failed: {0}")]
    AcceptFailed(std::io::Error),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

impl NetworkError {
    /// Whether the connection survives this error
    ///
    /// Would-block and timeouts that consumed or produced no frame bytes leave
    /// the stream usable; everything else drops the client.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RecvNoData | Self::RecvTimeout(_) | Self::SendTimeout(_)
        )
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Handshake timed out")]
    Timeout,

    #[error("Request is not a GET")]
    NotGet,

    #[error("Missing Sec-WebSocket-Version header")]
    MissingVersion,

    #[error("Unsupported WebSocket version {0}")]
    UnsupportedVersion(String),

    #[error("Missing Host header")]
    MissingHost,

    #[error("Host {0} is not allowed")]
    HostNotAllowed(String),

    #[error("Missing Sec-WebSocket-Key header")]
    MissingKey,

    #[error("Request exceeds {0} bytes")]
    RequestTooLarge(usize),

    #[error("Request is not valid UTF-8")]
    NotUtf8,

    #[error("Connection closed during handshake")]
    Closed,

    #[error("I/O error during handshake: {0}")]
    Io(String),
}
