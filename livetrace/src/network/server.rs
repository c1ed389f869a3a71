//! Single-viewer WebSocket server
//!
//! ## Update Cycle
//!
//! ```text
//! update()
//!   ├─ listener missing?  → try to bind it again
//!   ├─ no client?         → accept + handshake (failures drop that connection)
//!   ├─ client connected?  → poll one byte; hard errors drop the client
//!   └─ ping interval due? → send {"id":"PING"}
//! ```
//!
//! Would-block and timeouts that left no partial frame behind never drop the
//! client. Everything else does, and the next update goes back to accepting.

use super::socket::TcpServerSocket;
use super::websocket::{perform_handshake, WebSocketStream};
use crate::config::ProfilerConfig;
use crate::domain::{NetworkError, ProfilerError};
use crate::export::JsonWriter;
use log::{debug, info, warn};
use std::time::{Duration, Instant};

pub struct Server {
    port: u16,
    listener: Option<TcpServerSocket>,
    client: Option<WebSocketStream>,
    last_ping: Instant,
    ping_interval: Duration,
    handshake_timeout: Duration,
    io_timeout: Duration,
    allowed_hosts: Vec<String>,
    ping: Vec<u8>,
}

impl Server {
    /// Start listening on the configured port
    ///
    /// # Errors
    ///
    /// [`ProfilerError::ServerStart`] if the port cannot be bound.
    pub fn new(config: &ProfilerConfig) -> Result<Self, ProfilerError> {
        let listener = TcpServerSocket::bind(config.port).map_err(|source| ProfilerError::ServerStart {
            port: config.port,
            source,
        })?;
        let port = listener.port();
        info!("Listening for viewer connections on port {port}");

        Ok(Self {
            port,
            listener: Some(listener),
            client: None,
            last_ping: Instant::now(),
            ping_interval: config.ping_interval,
            handshake_timeout: config.handshake_timeout,
            io_timeout: config.io_timeout,
            allowed_hosts: config.allowed_hosts.clone(),
            ping: JsonWriter::new().write_ping()?.to_vec(),
        })
    }

    /// Port the server listens on (resolved when 0 was requested)
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn is_client_connected(&self) -> bool {
        self.client.is_some()
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    /// Send one text frame to the viewer, if one is connected
    ///
    /// # Errors
    ///
    /// The send failure. Non-transient failures also drop the client.
    pub fn send(&mut self, data: &[u8]) -> Result<(), NetworkError> {
        let Some(client) = self.client.as_mut() else {
            return Ok(());
        };
        let result = client.send_text(data, self.io_timeout);
        if let Err(e) = &result {
            if !e.is_transient() {
                info!("Viewer disconnected: {e}");
                self.client = None;
            }
        }
        result
    }

    pub fn update(&mut self) {
        if self.listener.is_none() {
            match TcpServerSocket::bind(self.port) {
                Ok(listener) => self.listener = Some(listener),
                Err(e) => debug!("Re-listening on port {} failed: {e}", self.port),
            }
        }

        if self.client.is_none() {
            self.accept_client();
        } else {
            self.poll_client();
        }

        if self.last_ping.elapsed() > self.ping_interval {
            let ping = std::mem::take(&mut self.ping);
            if let Err(e) = self.send(&ping) {
                debug!("Ping not sent: {e}");
            }
            self.ping = ping;
            self.last_ping = Instant::now();
        }
    }

    fn accept_client(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        match listener.accept() {
            Ok(None) => {}
            Ok(Some((mut tcp, peer))) => {
                match perform_handshake(&mut tcp, &self.allowed_hosts, self.handshake_timeout) {
                    Ok(()) => {
                        info!("Viewer connected from {peer}");
                        self.client = Some(WebSocketStream::new(tcp, self.io_timeout));
                    }
                    Err(e) => debug!("Rejected connection from {peer}: {e}"),
                }
            }
            Err(e) => {
                // Recreated on the next update
                warn!("Accept failed, closing listener: {e}");
                self.listener = None;
            }
        }
    }

    fn poll_client(&mut self) {
        let Some(client) = self.client.as_mut() else {
            return;
        };
        // Viewer input is not interpreted; reading keeps close frames visible
        let mut first_byte = [0u8; 1];
        match client.receive(&mut first_byte, Duration::ZERO) {
            Ok(()) => {}
            Err(e) if e.is_transient() => {}
            Err(e) => {
                info!("Viewer disconnected: {e}");
                self.client = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpStream};

    fn test_config() -> ProfilerConfig {
        ProfilerConfig::default()
            .with_port(0)
            .with_ping_interval(Duration::from_millis(10))
    }

    fn connect(server: &mut Server, request: &str) -> TcpStream {
        let mut peer = TcpStream::connect((Ipv4Addr::LOCALHOST, server.port())).unwrap();
        peer.write_all(request.as_bytes()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !server.is_client_connected() && Instant::now() < deadline {
            server.update();
            std::thread::sleep(Duration::from_millis(1));
        }
        peer
    }

    fn request(host: &str) -> String {
        format!(
            "GET / HTTP/1.1\r\nHost: {host}\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        )
    }

    #[test]
    fn test_client_connects_and_receives_ping() {
        let mut server = Server::new(&test_config()).unwrap();
        let mut peer = connect(&mut server, &request("localhost"));
        assert!(server.is_client_connected());

        let mut reply = [0u8; 129];
        let n = peer.read(&mut reply).unwrap();
        assert!(String::from_utf8_lossy(&reply[..n]).starts_with("HTTP/1.1 101"));

        std::thread::sleep(Duration::from_millis(20));
        server.update();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut frame = [0u8; 15];
        peer.read_exact(&mut frame).unwrap();
        assert_eq!(&frame[2..], br#"{"id":"PING"}"#);
    }

    #[test]
    fn test_disallowed_host_is_dropped_without_side_effects() {
        let config = test_config().with_allowed_hosts(["localhost"]);
        let mut server = Server::new(&config).unwrap();
        let mut peer = TcpStream::connect((Ipv4Addr::LOCALHOST, server.port())).unwrap();
        peer.write_all(request("evil.example").as_bytes()).unwrap();

        for _ in 0..20 {
            server.update();
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(!server.is_client_connected());
        assert!(server.is_listening());

        // The rejected peer sees the connection closed
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(peer.read(&mut buf).unwrap_or(0), 0);

        // A valid viewer can still connect afterwards
        let _viewer = connect(&mut server, &request("localhost:1234"));
        assert!(server.is_client_connected());
    }

    #[test]
    fn test_close_frame_drops_client() {
        let mut server = Server::new(&test_config()).unwrap();
        let mut peer = connect(&mut server, &request("localhost"));
        assert!(server.is_client_connected());

        peer.write_all(&[0x88, 0x00]).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while server.is_client_connected() && Instant::now() < deadline {
            server.update();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!server.is_client_connected());
    }

    #[test]
    fn test_frame_cut_short_drops_client() {
        let mut server = Server::new(&test_config()).unwrap();
        let _stalled_viewer = connect(&mut server, &request("localhost"));
        assert!(server.is_client_connected());

        // The viewer never reads, so only part of this frame fits the socket
        let tree = vec![b' '; 64 << 20];
        let err = server.send(&tree).unwrap_err();
        assert!(matches!(err, NetworkError::SendIncomplete { .. }));
        assert!(!server.is_client_connected());

        // Nothing further is written into the broken stream
        assert!(server.send(b"{}").is_ok());
    }

    #[test]
    fn test_send_without_client_is_noop() {
        let mut server = Server::new(&test_config()).unwrap();
        assert!(server.send(b"{}").is_ok());
    }
}
