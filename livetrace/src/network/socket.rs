//! Non-blocking TCP sockets
//!
//! Sends and receives loop until the whole buffer has moved or the timeout
//! expires. Nothing blocks the orchestrator for longer than that timeout,
//! and "no data yet" is reported separately from a stall in the middle of a
//! read so callers can poll cheaply.

use crate::domain::NetworkError;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

/// Listening socket accepting at most one pending connection
pub struct TcpServerSocket {
    listener: TcpListener,
    port: u16,
}

impl TcpServerSocket {
    /// Listen on all interfaces; port 0 picks an ephemeral port
    ///
    /// # Errors
    ///
    /// Bind or socket option failures.
    pub fn bind(port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        limit_backlog(&listener);
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    /// Port actually bound
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Take a pending connection, if any
    ///
    /// # Errors
    ///
    /// [`NetworkError::AcceptFailed`] for anything but would-block.
    pub fn accept(&self) -> Result<Option<(TcpClient, SocketAddr)>, NetworkError> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                let client = TcpClient::new(stream).map_err(NetworkError::AcceptFailed)?;
                Ok(Some((client, peer)))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(NetworkError::AcceptFailed(e)),
        }
    }
}

#[cfg(unix)]
fn limit_backlog(listener: &TcpListener) {
    use std::os::fd::AsRawFd;

    // Re-listening on a bound socket only updates the backlog
    #[allow(unsafe_code)]
    let rc = unsafe { libc::listen(listener.as_raw_fd(), 1) };
    if rc != 0 {
        log::debug!("Could not shrink listen backlog: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn limit_backlog(_listener: &TcpListener) {}

/// Connected, non-blocking stream
pub struct TcpClient {
    stream: TcpStream,
}

impl TcpClient {
    /// # Errors
    ///
    /// Socket option failures.
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Whether at least one byte can be read without blocking
    ///
    /// # Errors
    ///
    /// [`NetworkError::ConnectionClosed`] when the peer has shut down,
    /// [`NetworkError::RecvFailed`] on socket errors.
    pub fn has_pending_data(&self) -> Result<bool, NetworkError> {
        let mut peeked = [0u8; 1];
        match self.stream.peek(&mut peeked) {
            Ok(0) => Err(NetworkError::ConnectionClosed),
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(false),
            Err(e) => Err(NetworkError::RecvFailed(e)),
        }
    }

    /// Read whatever is available, without waiting
    ///
    /// # Errors
    ///
    /// [`NetworkError::RecvNoData`] when nothing is available,
    /// [`NetworkError::ConnectionClosed`] at end of stream.
    pub fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, NetworkError> {
        loop {
            match self.stream.read(buf) {
                Ok(0) if !buf.is_empty() => return Err(NetworkError::ConnectionClosed),
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Err(NetworkError::RecvNoData),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(NetworkError::RecvFailed(e)),
            }
        }
    }

    /// Send the whole buffer within `timeout`
    ///
    /// # Errors
    ///
    /// [`NetworkError::SendTimeout`] when the peer does not drain fast enough
    /// and nothing was written, [`NetworkError::SendIncomplete`] when it
    /// stalls part way, [`NetworkError::SendFailed`] on socket errors.
    pub fn send_all(&mut self, data: &[u8], timeout: Duration) -> Result<(), NetworkError> {
        let start = Instant::now();
        let mut sent = 0;
        while sent < data.len() {
            match self.stream.write(&data[sent..]) {
                Ok(0) => {
                    return Err(NetworkError::SendFailed(ErrorKind::WriteZero.into()));
                }
                Ok(n) => sent += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if start.elapsed() > timeout {
                        return Err(if sent == 0 {
                            NetworkError::SendTimeout(timeout)
                        } else {
                            NetworkError::SendIncomplete { sent, total: data.len() }
                        });
                    }
                    std::thread::yield_now();
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(NetworkError::SendFailed(e)),
            }
        }
        Ok(())
    }

    /// Fill the whole buffer within `timeout`
    ///
    /// # Errors
    ///
    /// [`NetworkError::RecvNoData`] when nothing at all was available,
    /// [`NetworkError::RecvTimeout`] when data stalled part way,
    /// [`NetworkError::ConnectionClosed`] at end of stream,
    /// [`NetworkError::RecvFailed`] on socket errors.
    pub fn receive_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), NetworkError> {
        let start = Instant::now();
        let mut filled = 0;
        while filled < buf.len() {
            match self.read_available(&mut buf[filled..]) {
                Ok(n) => filled += n,
                Err(NetworkError::RecvNoData) if filled == 0 => {
                    return Err(NetworkError::RecvNoData);
                }
                Err(NetworkError::RecvNoData) => {
                    if start.elapsed() > timeout {
                        return Err(NetworkError::RecvTimeout(timeout));
                    }
                    std::thread::yield_now();
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }
}
