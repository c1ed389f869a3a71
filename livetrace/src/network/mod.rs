//! Viewer connection
//!
//! A single-client WebSocket server built directly on non-blocking std
//! sockets. Everything here runs on the orchestrator thread.
//!
//! - [`socket`]: non-blocking TCP with bounded send/receive loops
//! - [`websocket`]: upgrade handshake and frame codec
//! - [`server`]: listener, client slot, keep-alive pings

pub mod server;
pub mod socket;
pub mod websocket;

pub use server::Server;
pub use socket::{TcpClient, TcpServerSocket};
pub use websocket::{accept_key, WebSocketStream};
