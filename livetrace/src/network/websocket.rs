//! WebSocket handshake and framing (RFC 6455 subset)
//!
//! Only what the viewer needs is supported: the upgrade handshake,
//! unfragmented text/binary frames, and close detection. Outgoing frames are
//! never masked; incoming frames may be.

use super::socket::TcpClient;
use crate::domain::{HandshakeError, NetworkError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use livetrace_common::{
    FRAME_CLOSE, FRAME_FIN, FRAME_LEN_16, FRAME_LEN_64, FRAME_MASK_BIT, FRAME_MAX_SHORT_LEN,
    OPCODE_BINARY, OPCODE_TEXT, SUPPORTED_WEBSOCKET_VERSIONS, WEBSOCKET_GUID,
};
use sha1::{Digest, Sha1};
use std::time::{Duration, Instant};

/// Upgrade requests larger than this are rejected
pub const MAX_HANDSHAKE_BYTES: usize = 1024;

/// `Sec-WebSocket-Accept` value for a client key
#[must_use]
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

fn header_value<'a>(request: &'a str, name: &str) -> Option<&'a str> {
    request.split("\r\n").skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

/// Validate an upgrade request and return its `Sec-WebSocket-Key`
///
/// # Errors
///
/// The first missing or unacceptable field.
pub fn parse_upgrade_request<'a>(
    request: &'a str,
    allowed_hosts: &[String],
) -> Result<&'a str, HandshakeError> {
    if !request.starts_with("GET") {
        return Err(HandshakeError::NotGet);
    }

    let version = header_value(request, "Sec-WebSocket-Version").ok_or(HandshakeError::MissingVersion)?;
    if !SUPPORTED_WEBSOCKET_VERSIONS.contains(&version) {
        return Err(HandshakeError::UnsupportedVersion(version.to_string()));
    }

    let host = header_value(request, "Host").ok_or(HandshakeError::MissingHost)?;
    if !allowed_hosts.is_empty() {
        let host_name = strip_port(host);
        if !allowed_hosts.iter().any(|allowed| allowed == host_name) {
            return Err(HandshakeError::HostNotAllowed(host.to_string()));
        }
    }

    header_value(request, "Sec-WebSocket-Key")
        .filter(|key| !key.is_empty())
        .ok_or(HandshakeError::MissingKey)
}

/// Host part of a `Host` header value, bracketed IPv6 literals included
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split_once(']').map_or(host, |(addr, _)| addr);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// `101 Switching Protocols` reply for a validated key
#[must_use]
pub fn handshake_response(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    )
}

fn read_request(tcp: &mut TcpClient, timeout: Duration) -> Result<String, HandshakeError> {
    let start = Instant::now();
    let mut buf = [0u8; MAX_HANDSHAKE_BYTES];
    let mut len = 0;

    let complete = |bytes: &[u8]| bytes.windows(4).any(|w| w == b"\r\n\r\n");

    while !complete(&buf[..len]) {
        if len == buf.len() {
            return Err(HandshakeError::RequestTooLarge(MAX_HANDSHAKE_BYTES));
        }
        match tcp.read_available(&mut buf[len..]) {
            Ok(n) => len += n,
            Err(NetworkError::RecvNoData) => {
                if start.elapsed() > timeout {
                    return Err(HandshakeError::Timeout);
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(NetworkError::ConnectionClosed) => return Err(HandshakeError::Closed),
            Err(e) => return Err(HandshakeError::Io(e.to_string())),
        }
    }

    String::from_utf8(buf[..len].to_vec()).map_err(|_| HandshakeError::NotUtf8)
}

/// Run the server side of the upgrade on a freshly accepted connection
///
/// # Errors
///
/// [`NetworkError::Handshake`] for protocol violations, or the send failure
/// of the reply.
pub fn perform_handshake(
    tcp: &mut TcpClient,
    allowed_hosts: &[String],
    timeout: Duration,
) -> Result<(), NetworkError> {
    let request = read_request(tcp, timeout)?;
    let key = parse_upgrade_request(&request, allowed_hosts)?;
    tcp.send_all(handshake_response(key).as_bytes(), timeout)
}

/// Encode a frame header for an unmasked, final frame into `out`
///
/// Returns the number of header bytes used (2, 4 or 10).
pub fn encode_frame_header(opcode: u8, payload_len: usize, out: &mut [u8; 10]) -> usize {
    out[0] = FRAME_FIN | opcode;
    if payload_len <= FRAME_MAX_SHORT_LEN {
        #[allow(clippy::cast_possible_truncation)]
        let short = payload_len as u8;
        out[1] = short;
        2
    } else if let Ok(len) = u16::try_from(payload_len) {
        out[1] = FRAME_LEN_16;
        out[2..4].copy_from_slice(&len.to_be_bytes());
        4
    } else {
        out[1] = FRAME_LEN_64;
        out[2..10].copy_from_slice(&(payload_len as u64).to_be_bytes());
        10
    }
}

/// Established WebSocket connection
pub struct WebSocketStream {
    tcp: TcpClient,
    io_timeout: Duration,
    frame_bytes_remaining: u64,
    mask: [u8; 4],
    mask_offset: usize,
}

impl WebSocketStream {
    #[must_use]
    pub fn new(tcp: TcpClient, io_timeout: Duration) -> Self {
        Self {
            tcp,
            io_timeout,
            frame_bytes_remaining: 0,
            mask: [0; 4],
            mask_offset: 0,
        }
    }

    /// Send one text frame
    ///
    /// # Errors
    ///
    /// Socket send failures or timeouts.
    pub fn send_text(&mut self, data: &[u8], timeout: Duration) -> Result<(), NetworkError> {
        self.send_frame(OPCODE_TEXT, data, timeout)
    }

    /// A timeout before the first header byte leaves the stream intact; once
    /// any byte of the frame is out, a stall is reported as
    /// [`NetworkError::SendIncomplete`] for the whole frame.
    fn send_frame(&mut self, opcode: u8, data: &[u8], timeout: Duration) -> Result<(), NetworkError> {
        let mut header = [0u8; 10];
        let header_len = encode_frame_header(opcode, data.len(), &mut header);
        let total = header_len + data.len();

        self.tcp
            .send_all(&header[..header_len], timeout)
            .map_err(|e| match e {
                NetworkError::SendIncomplete { sent, .. } => NetworkError::SendIncomplete { sent, total },
                other => other,
            })?;
        self.tcp.send_all(data, timeout).map_err(|e| match e {
            NetworkError::SendTimeout(_) => NetworkError::SendIncomplete { sent: header_len, total },
            NetworkError::SendIncomplete { sent, .. } => NetworkError::SendIncomplete {
                sent: header_len + sent,
                total,
            },
            other => other,
        })
    }

    /// Read one frame header
    ///
    /// Nothing is consumed when no byte is pending. Once the first byte is
    /// read, a stall anywhere in the header is fatal since the frame boundary
    /// would be lost.
    fn receive_frame_header(&mut self) -> Result<(), NetworkError> {
        let mut header = [0u8; 2];
        self.tcp
            .receive_exact(&mut header, self.io_timeout)
            .map_err(|e| match e {
                NetworkError::RecvTimeout(_) => NetworkError::TruncatedFrameHeader,
                other => other,
            })?;

        if header[0] == FRAME_CLOSE {
            return Err(NetworkError::Disconnected);
        }
        if header[0] != FRAME_FIN | OPCODE_TEXT && header[0] != FRAME_FIN | OPCODE_BINARY {
            return Err(NetworkError::BadFrameHeader(header[0]));
        }

        let mut len = u64::from(header[1] & !FRAME_MASK_BIT);
        if len == u64::from(FRAME_LEN_16) {
            let mut ext = [0u8; 2];
            self.receive_header_rest(&mut ext)?;
            len = u64::from(u16::from_be_bytes(ext));
        } else if len == u64::from(FRAME_LEN_64) {
            let mut ext = [0u8; 8];
            self.receive_header_rest(&mut ext)?;
            len = u64::from_be_bytes(ext);
        }

        let mut mask = [0u8; 4];
        if header[1] & FRAME_MASK_BIT != 0 {
            self.receive_header_rest(&mut mask)?;
        }
        self.mask = mask;
        self.frame_bytes_remaining = len;
        self.mask_offset = 0;
        Ok(())
    }

    fn receive_header_rest(&mut self, buf: &mut [u8]) -> Result<(), NetworkError> {
        self.tcp.receive_exact(buf, self.io_timeout).map_err(|e| match e {
            NetworkError::RecvNoData | NetworkError::RecvTimeout(_) => NetworkError::TruncatedFrameHeader,
            other => other,
        })
    }

    /// Fill `buf` with frame payload bytes, unmasked
    ///
    /// # Errors
    ///
    /// [`NetworkError::RecvNoData`] when nothing is pending,
    /// [`NetworkError::RecvTimeout`] when the payload stalls past `timeout`,
    /// [`NetworkError::Disconnected`] on a close frame,
    /// [`NetworkError::BadFrameHeader`] on unsupported frames,
    /// [`NetworkError::TruncatedFrameHeader`] when a header stalls part way,
    /// and socket failures. Payload bytes read before a timeout stay consumed,
    /// so the next call continues inside the same frame.
    pub fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), NetworkError> {
        if !self.tcp.has_pending_data()? {
            return Err(NetworkError::RecvNoData);
        }

        let start = Instant::now();
        let mut filled = 0;
        while filled < buf.len() {
            if self.frame_bytes_remaining == 0 {
                self.receive_frame_header()?;
                if self.frame_bytes_remaining == 0 {
                    continue;
                }
            }

            let wanted = (buf.len() - filled)
                .min(usize::try_from(self.frame_bytes_remaining).unwrap_or(usize::MAX));
            let chunk = &mut buf[filled..filled + wanted];
            // Bytes read count against the frame even if the call then times out
            let read = match self.tcp.read_available(chunk) {
                Ok(n) => n,
                Err(NetworkError::RecvNoData) => {
                    if start.elapsed() > timeout {
                        return Err(NetworkError::RecvTimeout(timeout));
                    }
                    std::thread::yield_now();
                    continue;
                }
                Err(e) => return Err(e),
            };

            if self.mask != [0; 4] {
                for byte in &mut chunk[..read] {
                    *byte ^= self.mask[self.mask_offset % 4];
                    self.mask_offset += 1;
                }
            }
            filled += read;
            self.frame_bytes_remaining -= read as u64;
        }
        Ok(())
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.tcp.peer_addr()
    }
}
