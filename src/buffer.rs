//! # Chained Byte Buffer
//!
//! A [`ChainBuffer`] is a queue of byte chunks with a consumed prefix. The
//! engine uses one as its read buffer (file chunks in, frames out) and one
//! as its write-coalescing buffer (frames in, one contiguous flush out).
//!
//! Chunks are kept as-is rather than copied into a single growing vector, so
//! appending a chunk is O(1) and the cipher can be applied in place to
//! exactly the bytes that are still pending. That is how the read pipeline
//! switches to decrypting mode mid-stream without re-reading the file.

use std::collections::VecDeque;

/// A chained byte queue.
///
/// Invariant: the front chunk always has unconsumed bytes (fully consumed
/// chunks are popped eagerly), and `len` is the total of unconsumed bytes
/// across all chunks.
#[derive(Debug, Default)]
pub struct ChainBuffer {
    chunks: VecDeque<Vec<u8>>,
    /// Consumed bytes at the front of the first chunk.
    start: usize,
    /// Total unconsumed bytes.
    len: usize,
}

impl ChainBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a copy of `bytes`.
    pub fn append(&mut self, bytes: &[u8]) {
        if !bytes.is_empty() {
            self.len += bytes.len();
            self.chunks.push_back(bytes.to_vec());
        }
    }

    /// Appends an owned chunk without copying.
    pub fn push_chunk(&mut self, chunk: Vec<u8>) {
        if !chunk.is_empty() {
            self.len += chunk.len();
            self.chunks.push_back(chunk);
        }
    }

    /// Copies up to `out.len()` bytes into `out` without consuming them.
    /// Returns the number of bytes copied.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let mut copied = 0;
        let mut start = self.start;
        for chunk in &self.chunks {
            if copied == out.len() {
                break;
            }
            let take = (chunk.len() - start).min(out.len() - copied);
            out[copied..copied + take].copy_from_slice(&chunk[start..start + take]);
            copied += take;
            start = 0;
        }
        copied
    }

    /// Consumes exactly `out.len()` bytes into `out`.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `out.len()` bytes are buffered; callers check
    /// `len()` first.
    pub fn read_exact(&mut self, out: &mut [u8]) {
        assert!(
            out.len() <= self.len,
            "read of {} bytes past end of chain buffer ({} buffered)",
            out.len(),
            self.len
        );
        let mut copied = 0;
        while copied < out.len() {
            let front = self.chunks.front().expect("len invariant covers chunks");
            let take = (front.len() - self.start).min(out.len() - copied);
            out[copied..copied + take].copy_from_slice(&front[self.start..self.start + take]);
            copied += take;
            self.start += take;
            self.len -= take;
            if self.start == front.len() {
                self.chunks.pop_front();
                self.start = 0;
            }
        }
    }

    /// Drains all unconsumed bytes into a single contiguous vector.
    pub fn take_all(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        let start = self.start;
        for (index, chunk) in self.chunks.drain(..).enumerate() {
            if index == 0 {
                out.extend_from_slice(&chunk[start..]);
            } else {
                out.extend_from_slice(&chunk);
            }
        }
        self.start = 0;
        self.len = 0;
        out
    }

    /// Discards everything, consumed or not.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.start = 0;
        self.len = 0;
    }

    /// Applies `f` in place to every unconsumed region, front to back.
    ///
    /// Used to splice a stream cipher into the pipeline: bytes already
    /// consumed stay untouched, bytes still pending are transformed.
    pub fn apply_mut(&mut self, mut f: impl FnMut(&mut [u8])) {
        let start = self.start;
        for (index, chunk) in self.chunks.iter_mut().enumerate() {
            if index == 0 {
                f(&mut chunk[start..]);
            } else {
                f(&mut chunk[..]);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
