//! Bounded, line-framed capture of child output.

use crate::common::lock;
use std::collections::VecDeque;
use std::sync::Mutex;

/// How many complete lines are retained per service.
pub const MAX_LOG_LINES: usize = 1000;

/// A concurrent ring of complete output lines.
///
/// Writers hand in byte chunks with arbitrary framing; the ring reassembles
/// them into lines, keeps the most recent [`MAX_LOG_LINES`] and holds the
/// trailing fragment until its newline arrives. Readers get a point-in-time
/// snapshot that later writes cannot mutate.
pub struct LogRing {
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    lines: VecDeque<String>,
    partial: Vec<u8>,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn write(&self, chunk: &[u8]) {
        let mut inner = lock(&self.inner);

        let mut rest = chunk;
        while let Some(newline) = rest.iter().position(|b| *b == b'\n') {
            let (line, tail) = rest.split_at(newline);
            rest = &tail[1..];

            let mut complete = std::mem::take(&mut inner.partial);
            complete.extend_from_slice(line);
            inner
                .lines
                .push_back(String::from_utf8_lossy(&complete).into_owned());
            if inner.lines.len() > self.capacity {
                inner.lines.pop_front();
            }
        }

        inner.partial.extend_from_slice(rest);
    }

    /// Snapshot of the retained lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        lock(&self.inner).lines.iter().cloned().collect()
    }

    /// Drop everything, including the partial fragment. Used when a
    /// service is started again so each run logs from a clean slate.
    pub fn clear(&self) {
        let mut inner = lock(&self.inner);
        inner.lines.clear();
        inner.partial.clear();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::Arc;

    #[test]
    fn basic_write_and_read() {
        let ring = LogRing::new(10);
        ring.write(b"line1\nline2\nline3\n");

        let lines = ring.lines();
        assert_eq!(lines, ["line1", "line2", "line3"]);
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let ring = LogRing::new(3);
        ring.write(b"a\nb\nc\nd\ne\n");

        assert_eq!(ring.lines(), ["c", "d", "e"]);
    }

    #[test]
    fn reassembles_partial_lines() {
        let ring = LogRing::new(10);
        ring.write(b"complete\npartial");
        ring.write(b" continued\n");

        assert_eq!(ring.lines(), ["complete", "partial continued"]);
    }

    #[test]
    fn byte_at_a_time_framing() {
        let ring = LogRing::new(10);
        for byte in b"ab\ncd\n" {
            ring.write(&[*byte]);
        }

        assert_eq!(ring.lines(), ["ab", "cd"]);
    }

    #[test]
    fn trailing_fragment_is_not_a_line() {
        let ring = LogRing::new(10);
        ring.write(b"done\nnot yet");

        assert_eq!(ring.lines(), ["done"]);
    }

    #[test]
    fn snapshot_is_detached_from_later_writes() {
        let ring = LogRing::new(10);
        ring.write(b"one\n");
        let snapshot = ring.lines();
        ring.write(b"two\n");

        assert_eq!(snapshot, ["one"]);
        assert_eq!(ring.lines(), ["one", "two"]);
    }

    #[test]
    fn concurrent_writers_keep_lines_whole() {
        let ring = Arc::new(LogRing::new(MAX_LOG_LINES));
        let mut handles = Vec::new();
        for writer in 0..4 {
            let ring = ring.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    ring.write(format!("w{writer}-{i}\n").as_bytes());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let lines = ring.lines();
        assert_eq!(lines.len(), 400);
        for line in lines {
            assert!(line.starts_with('w') && line.contains('-'), "{line}");
        }
    }
}
