//! Append-only, mutex-guarded output buffer with a per-reader offset.
//!
//! Implements the PTYSession buffer invariants from the data model (§3):
//! `0 <= read_offset <= len(buffer)` always, and once EOF is observed,
//! subsequent reads return empty bytes with `is_eof = true`. The buffer is
//! capped at 10 MiB (§4.F "Buffer discipline"); once exceeded the oldest
//! bytes are truncated and a warning marker is spliced in so a consumer can
//! tell data was dropped.

use parking_lot::Mutex;
use std::sync::Arc;

const TRUNCATION_MARKER: &[u8] = b"\n[... output truncated, buffer cap exceeded ...]\n";

struct Inner {
    data: Vec<u8>,
    read_offset: usize,
    eof: bool,
    cap_bytes: usize,
}

impl Inner {
    fn invariant_check(&self) {
        debug_assert!(self.read_offset <= self.data.len());
    }
}

/// Shared, cloneable handle to one session's output buffer.
#[derive(Clone)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Inner>>,
}

impl OutputBuffer {
    pub fn new(cap_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                data: Vec::new(),
                read_offset: 0,
                eof: false,
                cap_bytes,
            })),
        }
    }

    /// Append a chunk of bytes read from the underlying stream, truncating
    /// the head of the buffer (and advancing `read_offset` accordingly) if
    /// the cap would be exceeded.
    pub fn append(&self, chunk: &[u8]) {
        let mut inner = self.inner.lock();
        inner.data.extend_from_slice(chunk);
        if inner.data.len() > inner.cap_bytes {
            let overflow = inner.data.len() - inner.cap_bytes + TRUNCATION_MARKER.len();
            let drained = overflow.min(inner.data.len());
            inner.data.drain(0..drained);
            inner.data.splice(0..0, TRUNCATION_MARKER.iter().copied());
            inner.read_offset = inner.read_offset.saturating_sub(drained);
        }
        inner.invariant_check();
    }

    /// Mark the stream as ended. Idempotent.
    pub fn mark_eof(&self) {
        self.inner.lock().eof = true;
    }

    pub fn is_eof(&self) -> bool {
        self.inner.lock().eof
    }

    /// Return the bytes appended since the last `read_since_offset` call and
    /// advance the offset, plus the current EOF flag. Once EOF is set and
    /// all bytes have been drained, returns `(vec![], true)` forever after.
    pub fn read_since_offset(&self) -> (Vec<u8>, bool) {
        let mut inner = self.inner.lock();
        inner.invariant_check();
        let new_bytes = inner.data[inner.read_offset..].to_vec();
        inner.read_offset = inner.data.len();
        (new_bytes, inner.eof)
    }

    pub fn read_offset(&self) -> usize {
        self.inner.lock().read_offset
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_offset_never_exceeds_len() {
        let buf = OutputBuffer::new(1024);
        buf.append(b"hello");
        let (bytes, eof) = buf.read_since_offset();
        assert_eq!(bytes, b"hello");
        assert!(!eof);
        assert!(buf.read_offset() <= buf.len());
    }

    #[test]
    fn eof_then_empty_reads_forever() {
        let buf = OutputBuffer::new(1024);
        buf.append(b"hi");
        buf.mark_eof();
        let (_, eof) = buf.read_since_offset();
        assert!(eof);
        let (bytes, eof2) = buf.read_since_offset();
        assert!(bytes.is_empty());
        assert!(eof2);
    }

    #[test]
    fn truncates_when_cap_exceeded() {
        let buf = OutputBuffer::new(16);
        buf.append(&vec![b'a'; 10]);
        buf.append(&vec![b'b'; 10]);
        assert!(buf.len() <= 16 + TRUNCATION_MARKER.len());
        assert!(buf.read_offset() <= buf.len());
    }

    #[test]
    fn reads_are_monotonic_and_non_overlapping() {
        let buf = OutputBuffer::new(1024);
        buf.append(b"abc");
        let (first, _) = buf.read_since_offset();
        buf.append(b"def");
        let (second, _) = buf.read_since_offset();
        assert_eq!(first, b"abc");
        assert_eq!(second, b"def");
    }
}
