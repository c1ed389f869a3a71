//! Viewer message rendering
//!
//! This module turns queued sample trees and log text into the JSON text
//! frames the live viewer understands.

pub mod json;

pub use json::{log_lines, sample_digest, JsonWriter};
