//! Loopback viewer used by the integration tests

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::time::{Duration, Instant};

pub const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
pub const EXPECTED_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

pub struct Viewer {
    stream: TcpStream,
    pub handshake_response: String,
}

impl Viewer {
    /// Connect and upgrade, retrying until the orchestrator accepts
    pub fn connect(port: u16) -> Self {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut stream = loop {
            match TcpStream::connect((Ipv4Addr::LOCALHOST, port)) {
                Ok(stream) => break stream,
                Err(e) if Instant::now() < deadline => {
                    eprintln!("connect failed, retrying: {e}");
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => panic!("viewer could not connect: {e}"),
            }
        };
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        write!(
            stream,
            "GET / HTTP/1.1\r\nHost: localhost:{port}\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Key: {KEY}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        )
        .unwrap();

        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            response.push(byte[0]);
        }
        Self {
            stream,
            handshake_response: String::from_utf8(response).unwrap(),
        }
    }

    /// Payload of the next server frame
    pub fn read_frame(&mut self) -> Vec<u8> {
        let mut header = [0u8; 2];
        self.stream.read_exact(&mut header).unwrap();
        assert_eq!(header[0], 0x81, "server frames are final text frames");
        assert_eq!(header[1] & 0x80, 0, "server frames are never masked");
        let len = match header[1] & 0x7f {
            126 => {
                let mut ext = [0u8; 2];
                self.stream.read_exact(&mut ext).unwrap();
                u64::from(u16::from_be_bytes(ext))
            }
            127 => {
                let mut ext = [0u8; 8];
                self.stream.read_exact(&mut ext).unwrap();
                u64::from_be_bytes(ext)
            }
            short => u64::from(short),
        };
        let mut payload = vec![0u8; usize::try_from(len).unwrap()];
        self.stream.read_exact(&mut payload).unwrap();
        payload
    }

    /// Next JSON message matching `filter`, skipping everything else
    pub fn read_until(&mut self, filter: impl Fn(&serde_json::Value) -> bool) -> serde_json::Value {
        loop {
            let value: serde_json::Value = serde_json::from_slice(&self.read_frame()).unwrap();
            if filter(&value) {
                return value;
            }
        }
    }

    pub fn send_close(&mut self) {
        // Masked close frame with an empty payload
        self.stream.write_all(&[0x88, 0x80, 1, 2, 3, 4]).unwrap();
    }
}

/// Poll `condition` for up to five seconds
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
