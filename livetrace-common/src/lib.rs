//! # Shared Wire Definitions (Instrumentation Core ↔ Viewer)
//!
//! Constants and tags shared between the instrumentation core and anything
//! that talks to it: the live viewer, test clients, or tools that decode the
//! message queue. Everything here is `no_std` and allocation-free so it can be
//! used from the hot path.
//!
//! ## Key Types
//!
//! - [`MessageId`] - Tag stored in every message header of the queue
//! - [`SampleType`] - Which timer produced a sample tree (CPU or a GPU backend)
//!
//! ## Wire Protocol
//!
//! The viewer connects over TCP on [`DEFAULT_PORT`] and upgrades to a
//! WebSocket. Every application payload is a UTF-8 JSON text frame whose
//! `"id"` field is one of [`MSG_SAMPLES`], [`MSG_LOG`] or [`MSG_PING`].

#![no_std]

// ============================================================================
// Network Constants
// ============================================================================

/// Default listening port for the viewer connection (`0x4597`)
pub const DEFAULT_PORT: u16 = 0x4597;

/// GUID appended to `Sec-WebSocket-Key` before hashing (RFC 6455 §1.3)
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// WebSocket versions accepted during the handshake
pub const SUPPORTED_WEBSOCKET_VERSIONS: [&str; 2] = ["8", "13"];

/// Final-fragment bit of the first frame header byte
pub const FRAME_FIN: u8 = 0x80;

/// Text frame opcode
pub const OPCODE_TEXT: u8 = 0x01;

/// Binary frame opcode
pub const OPCODE_BINARY: u8 = 0x02;

/// First header byte of a close frame (FIN | opcode 8)
pub const FRAME_CLOSE: u8 = 0x88;

/// Mask-present bit of the second frame header byte
pub const FRAME_MASK_BIT: u8 = 0x80;

/// 7-bit length marker announcing a 16-bit extended length
pub const FRAME_LEN_16: u8 = 126;

/// 7-bit length marker announcing a 64-bit extended length
pub const FRAME_LEN_64: u8 = 127;

/// Largest payload that fits in the 7-bit length field
pub const FRAME_MAX_SHORT_LEN: usize = 125;

// ============================================================================
// JSON Message Identifiers
// ============================================================================

/// `"id"` of a serialized sample tree
pub const MSG_SAMPLES: &str = "SAMPLES";

/// `"id"` of a log line
pub const MSG_LOG: &str = "LOG";

/// `"id"` of the keep-alive ping
pub const MSG_PING: &str = "PING";

// ============================================================================
// Message Queue Tags
// ============================================================================

/// Tag stored at the start of every message in the queue
///
/// The tag doubles as the publish flag: a reserved message keeps
/// [`MessageId::NotReady`] until its producer commits it, and the consumer
/// resets consumed regions back to zero so that wrapped-around reservations
/// inherit the not-ready state.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    /// Space reserved but not yet committed (all-zero bytes)
    NotReady = 0,

    /// Pre-rendered JSON log line
    LogText = 1,

    /// Completed sample tree handle
    SampleTree = 2,
}

impl MessageId {
    /// Decode a raw tag read from the queue
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::NotReady),
            1 => Some(Self::LogText),
            2 => Some(Self::SampleTree),
            _ => None,
        }
    }

    /// Raw tag value as written into the queue
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }
}

// ============================================================================
// Sample Types
// ============================================================================

/// Timer source of a sample tree
///
/// Each thread keeps one tree per type. CPU trees exist from the first sample;
/// GPU trees are created on their first sample because they need a root
/// timestamp recorded on the device.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleType {
    /// Host CPU timer (microseconds since the thread sampler was created)
    Cpu = 0,

    /// CUDA event timer
    Cuda = 1,

    /// Direct3D 11 timestamp queries
    D3d11 = 2,
}

impl SampleType {
    /// Number of sample types (size of per-thread tree tables)
    pub const COUNT: usize = 3;

    /// All sample types in table order
    pub const ALL: [SampleType; Self::COUNT] = [Self::Cpu, Self::Cuda, Self::D3d11];

    /// Index into per-thread tree tables
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Whether samples of this type are timed on a GPU
    #[must_use]
    pub const fn is_gpu(self) -> bool {
        !matches!(self, Self::Cpu)
    }

    /// Suffix appended to the thread name so GPU trees get their own viewer row
    #[must_use]
    pub const fn thread_name_suffix(self) -> &'static str {
        match self {
            Self::Cpu => "",
            Self::Cuda => " (CUDA)",
            Self::D3d11 => " (D3D11)",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_round_trip() {
        for id in [MessageId::NotReady, MessageId::LogText, MessageId::SampleTree] {
            assert_eq!(MessageId::from_raw(id.as_raw()), Some(id));
        }
        assert_eq!(MessageId::from_raw(7), None);
    }

    #[test]
    fn test_not_ready_is_zero() {
        // Consumed regions are cleared with zero bytes
        assert_eq!(MessageId::NotReady.as_raw(), 0);
    }

    #[test]
    fn test_sample_type_table_order() {
        for (i, ty) in SampleType::ALL.iter().enumerate() {
            assert_eq!(ty.index(), i);
        }
        assert!(!SampleType::Cpu.is_gpu());
        assert!(SampleType::Cuda.is_gpu());
        assert_eq!(SampleType::D3d11.thread_name_suffix(), " (D3D11)");
    }
}
