//! Chunk model — the unit of data moved through a stream.
//!
//! A stream carries exactly one chunk type and is configured in one of two
//! modes. In byte mode a chunk weighs its byte length; in object mode every
//! chunk weighs 1, whatever it contains.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// How a stream measures the chunks it buffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Bytes,
    Objects,
}

impl Mode {
    /// Buffer units occupied by `chunk` in this mode.
    pub fn measure<T: Chunk>(self, chunk: &T) -> usize {
        match self {
            Mode::Bytes => chunk.byte_len(),
            Mode::Objects => 1,
        }
    }
}

/// Anything that can travel through a stream.
///
/// Object-mode payloads only need `impl Chunk for MyType {}`. Byte payloads
/// report their length and, when they can, split at a byte offset so that
/// `Source::read(n)` can return exactly `n` bytes.
pub trait Chunk: Clone + Send + Sync + 'static {
    fn byte_len(&self) -> usize {
        1
    }

    /// Detach and return the first `at` units, leaving the rest in `self`.
    /// `None` means the chunk is indivisible.
    fn split_front(&mut self, at: usize) -> Option<Self> {
        let _ = at;
        None
    }
}

impl Chunk for Bytes {
    fn byte_len(&self) -> usize {
        self.len()
    }

    fn split_front(&mut self, at: usize) -> Option<Self> {
        (at <= self.len()).then(|| self.split_to(at))
    }
}

impl Chunk for Vec<u8> {
    fn byte_len(&self) -> usize {
        self.len()
    }

    fn split_front(&mut self, at: usize) -> Option<Self> {
        if at > self.len() {
            return None;
        }
        let rest = self.split_off(at);
        Some(std::mem::replace(self, rest))
    }
}

impl Chunk for String {
    fn byte_len(&self) -> usize {
        self.len()
    }

    fn split_front(&mut self, at: usize) -> Option<Self> {
        // Never cut a UTF-8 sequence in half.
        if at > self.len() || !self.is_char_boundary(at) {
            return None;
        }
        let rest = self.split_off(at);
        Some(std::mem::replace(self, rest))
    }
}
