//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep the three 32-bit hashes that flow through a
//! sample (name hash, path id, tree digest) from being mixed up.

use std::fmt;

/// MurmurHash3 of a sample name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NameHash(pub u32);

impl fmt::Display for NameHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "name#{:08x}", self.0)
    }
}

/// Path-deterministic sample id
///
/// Identical for the same call path across frames, which is what lets the
/// viewer line up samples from consecutive trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SampleId(pub u32);

impl SampleId {
    /// Id of every tree root
    pub const ROOT: SampleId = SampleId(0);
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sample#{:08x}", self.0)
    }
}

/// Structural digest of a serialized tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TreeDigest(pub u32);

impl fmt::Display for TreeDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formats() {
        assert_eq!(NameHash(0xab).to_string(), "name#000000ab");
        assert_eq!(SampleId::ROOT.to_string(), "sample#00000000");
        assert_eq!(TreeDigest(42).to_string(), "42");
    }
}
