//! JSON messages for the live viewer
//!
//! ## Message Shapes
//!
//! ```text
//! {"id":"SAMPLES","thread_name":"Main","nb_samples":3,"sample_digest":1234,
//!  "samples":[{"name":"A","id":..,"us_start":..,"us_length":..,"children":[..]}]}
//! {"id":"LOG","text":"..."}
//! {"id":"PING"}
//! ```
//!
//! `sample_digest` folds the path id of every sample, in pre-order, into a
//! MurmurHash3 chain. Two trees with the same shape and the same call paths
//! share a digest, which lets the viewer reuse its tables for them.

use crate::config::MAX_LOG_LINE_BYTES;
use crate::domain::{ProfilerError, TreeDigest};
use crate::sampling::hash::murmur3_32;
use crate::sampling::Sample;
use livetrace_common::{SampleType, MSG_LOG, MSG_PING, MSG_SAMPLES};
use serde::ser::{SerializeStruct, Serializer};
use serde::Serialize;

/// Digest and sample count of the subtree under `root`, root included
#[must_use]
pub fn sample_digest(root: &Sample) -> (TreeDigest, u32) {
    fn fold(sample: &Sample, digest: &mut u32, count: &mut u32) {
        *count += 1;
        *digest = murmur3_32(&sample.unique_id().0.to_le_bytes(), *digest);
        for child in sample.children() {
            fold(child, digest, count);
        }
    }

    let mut digest = 0;
    let mut count = 0;
    fold(root, &mut digest, &mut count);
    (TreeDigest(digest), count)
}

struct SampleNode<'a>(&'a Sample);

struct ChildList<'a>(&'a Sample);

impl Serialize for SampleNode<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let sample = self.0;
        let mut node = serializer.serialize_struct("Sample", 5)?;
        node.serialize_field("name", sample.name())?;
        node.serialize_field("id", &sample.unique_id().0)?;
        node.serialize_field("us_start", &sample.us_start())?;
        node.serialize_field("us_length", &sample.us_length())?;
        node.serialize_field("children", &ChildList(sample))?;
        node.end()
    }
}

impl Serialize for ChildList<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.children().map(SampleNode))
    }
}

struct SamplesMessage<'a> {
    thread_name: String,
    root: &'a Sample,
}

impl Serialize for SamplesMessage<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (digest, nb_samples) = sample_digest(self.root);
        let mut msg = serializer.serialize_struct("Samples", 5)?;
        msg.serialize_field("id", MSG_SAMPLES)?;
        msg.serialize_field("thread_name", &self.thread_name)?;
        msg.serialize_field("nb_samples", &nb_samples)?;
        msg.serialize_field("sample_digest", &digest.0)?;
        msg.serialize_field("samples", &[SampleNode(self.root)])?;
        msg.end()
    }
}

#[derive(Serialize)]
struct LogMessage<'a> {
    id: &'static str,
    text: &'a str,
}

#[derive(Serialize)]
struct PingMessage {
    id: &'static str,
}

/// Split log text into the lines sent as separate LOG messages
///
/// Lines are split on `\n` and wrapped at [`MAX_LOG_LINE_BYTES`]. A trailing
/// newline does not produce an extra empty line.
pub fn log_lines(text: &str) -> impl Iterator<Item = &str> {
    let mut segments: Vec<&str> = text.split('\n').collect();
    if segments.last() == Some(&"") {
        segments.pop();
    }
    segments.into_iter().flat_map(wrap_line)
}

fn wrap_line(line: &str) -> Vec<&str> {
    if line.is_empty() {
        return vec![line];
    }
    let mut chunks = Vec::with_capacity(line.len() / MAX_LOG_LINE_BYTES + 1);
    let mut rest = line;
    while !rest.is_empty() {
        let mut end = rest.len().min(MAX_LOG_LINE_BYTES);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(head);
        rest = tail;
    }
    chunks
}

/// Reusable output buffer for viewer messages
#[derive(Debug, Default)]
pub struct JsonWriter {
    buf: Vec<u8>,
}

impl JsonWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Render a sample tree; GPU trees get their type appended to the thread
    /// name so the viewer shows them on their own row
    ///
    /// # Errors
    ///
    /// Serialization failures.
    pub fn write_sample_tree(
        &mut self,
        thread_name: &str,
        sample_type: SampleType,
        root: &Sample,
    ) -> Result<&[u8], ProfilerError> {
        self.buf.clear();
        let msg = SamplesMessage {
            thread_name: format!("{thread_name}{}", sample_type.thread_name_suffix()),
            root,
        };
        serde_json::to_writer(&mut self.buf, &msg)?;
        Ok(&self.buf)
    }

    /// Render one log line
    ///
    /// # Errors
    ///
    /// Serialization failures.
    pub fn write_log_line(&mut self, text: &str) -> Result<&[u8], ProfilerError> {
        self.buf.clear();
        serde_json::to_writer(&mut self.buf, &LogMessage { id: MSG_LOG, text })?;
        Ok(&self.buf)
    }

    /// Render the keep-alive ping
    ///
    /// # Errors
    ///
    /// Serialization failures.
    pub fn write_ping(&mut self) -> Result<&[u8], ProfilerError> {
        self.buf.clear();
        serde_json::to_writer(&mut self.buf, &PingMessage { id: MSG_PING })?;
        Ok(&self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NameHash;
    use crate::sampling::SampleTree;
    use serde_json::Value;

    fn a_with_two_b() -> crate::sampling::CompletedTree {
        let mut tree = SampleTree::cpu().unwrap();
        tree.push("A", NameHash(11)).unwrap();
        tree.push("B", NameHash(22)).unwrap();
        tree.pop().unwrap();
        tree.push("B", NameHash(22)).unwrap();
        tree.pop().unwrap();
        let completed = tree.pop().unwrap().unwrap();
        // Keep the allocator alive through the handle, not the tree
        drop(tree);
        completed
    }

    #[test]
    fn test_samples_message_layout() {
        let tree = a_with_two_b();
        let mut writer = JsonWriter::new();
        let bytes = writer
            .write_sample_tree("Main", SampleType::Cpu, tree.root())
            .unwrap()
            .to_vec();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with(r#"{"id":"SAMPLES","thread_name":"Main","nb_samples":3,"sample_digest":"#));

        let json: Value = serde_json::from_str(&text).unwrap();
        let samples = json["samples"].as_array().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0]["name"], "A");
        let children = samples[0]["children"].as_array().unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0]["name"], "B");
        assert_ne!(children[0]["id"], children[1]["id"]);
        // Leaves still carry an empty child list
        assert_eq!(children[0]["children"], Value::Array(vec![]));
    }

    #[test]
    fn test_digest_folds_ids_in_preorder() {
        let tree = a_with_two_b();
        let (digest, count) = sample_digest(tree.root());
        assert_eq!(count, 3);

        let mut expected = 0;
        expected = murmur3_32(&tree.root().unique_id().0.to_le_bytes(), expected);
        for child in tree.root().children() {
            expected = murmur3_32(&child.unique_id().0.to_le_bytes(), expected);
        }
        assert_eq!(digest, TreeDigest(expected));

        // Same shape, same digest
        let again = a_with_two_b();
        assert_eq!(sample_digest(again.root()).0, digest);
    }

    #[test]
    fn test_gpu_thread_name_suffix() {
        let tree = a_with_two_b();
        let mut writer = JsonWriter::new();
        let bytes = writer
            .write_sample_tree("Render", SampleType::D3d11, tree.root())
            .unwrap();
        let json: Value = serde_json::from_slice(bytes).unwrap();
        assert_eq!(json["thread_name"], "Render (D3D11)");
    }

    #[test]
    fn test_log_line_escapes_text() {
        let mut writer = JsonWriter::new();
        let bytes = writer.write_log_line(r#"path "C:\tmp""#).unwrap();
        let json: Value = serde_json::from_slice(bytes).unwrap();
        assert_eq!(json["id"], "LOG");
        assert_eq!(json["text"], r#"path "C:\tmp""#);
    }

    #[test]
    fn test_ping() {
        let mut writer = JsonWriter::new();
        assert_eq!(writer.write_ping().unwrap(), br#"{"id":"PING"}"#);
    }

    #[test]
    fn test_log_lines_split_on_newlines() {
        assert_eq!(log_lines("one\ntwo\n").collect::<Vec<_>>(), vec!["one", "two"]);
        assert_eq!(log_lines("a\n\nb").collect::<Vec<_>>(), vec!["a", "", "b"]);
        assert_eq!(log_lines("").count(), 0);
    }

    #[test]
    fn test_long_lines_are_wrapped() {
        let long = "x".repeat(MAX_LOG_LINE_BYTES * 2 + 10);
        let lines: Vec<_> = log_lines(&long).collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].len(), MAX_LOG_LINE_BYTES);
        assert_eq!(lines[2].len(), 10);
        assert_eq!(lines.concat(), long);
    }
}
