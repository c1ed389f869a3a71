//! Domain model for livetrace
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Structured error handling

pub mod errors;
pub mod types;

pub use types::{NameHash, SampleId, TreeDigest};

pub use errors::{HandshakeError, NetworkError, ProfilerError};
