//! Console output shim.
//!
//! The guest has no filesystem; every descriptor it writes to lands in a
//! single byte buffer. Whenever the buffer contains a newline, everything up
//! to and including the last newline is flushed to the sink as one chunk
//! (interior newlines included), and the unterminated tail stays buffered
//! for the next write.

use std::sync::Arc;

/// Destination for flushed output lines.
#[derive(Clone)]
pub enum OutputSink {
    /// Print to the host's stdout (the default).
    Stdout,
    /// Hand each flushed chunk to a callback. The chunk never carries the
    /// trailing newline.
    Callback(Arc<dyn Fn(&str) + Send + Sync>),
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputSink::Stdout => f.write_str("OutputSink::Stdout"),
            OutputSink::Callback(_) => f.write_str("OutputSink::Callback(..)"),
        }
    }
}

/// Byte buffer shared by all guest file descriptors.
#[derive(Debug)]
pub struct ConsoleBuffer {
    buf: Vec<u8>,
    sink: OutputSink,
}

impl ConsoleBuffer {
    pub fn new(sink: OutputSink) -> Self {
        ConsoleBuffer {
            buf: Vec::new(),
            sink,
        }
    }

    /// Append `bytes` and flush up to the last newline, if any.
    /// Returns the number of bytes accepted (always all of them).
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        self.buf.extend_from_slice(bytes);
        if let Some(nl) = self.buf.iter().rposition(|&b| b == b'\n') {
            let chunk = String::from_utf8_lossy(&self.buf[..nl]).into_owned();
            match &self.sink {
                OutputSink::Stdout => println!("{}", chunk),
                OutputSink::Callback(cb) => cb(&chunk),
            }
            self.buf.drain(..=nl);
        }
        bytes.len()
    }

    /// Bytes still waiting for a newline.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }
}

impl Default for ConsoleBuffer {
    fn default() -> Self {
        ConsoleBuffer::new(OutputSink::Stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn capture() -> (ConsoleBuffer, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = Arc::clone(&lines);
        let console = ConsoleBuffer::new(OutputSink::Callback(Arc::new(move |chunk: &str| {
            sink_lines.lock().unwrap().push(chunk.to_string());
        })));
        (console, lines)
    }

    #[test]
    fn test_partial_line_stays_buffered() {
        let (mut console, lines) = capture();
        console.write(b"a\nb");
        assert_eq!(*lines.lock().unwrap(), vec!["a".to_string()]);
        assert_eq!(console.pending(), b"b");

        console.write(b"\n");
        assert_eq!(*lines.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert!(console.pending().is_empty());
    }

    #[test]
    fn test_interior_newlines_flush_as_one_chunk() {
        let (mut console, lines) = capture();
        console.write(b"one\ntwo\nthree");
        assert_eq!(*lines.lock().unwrap(), vec!["one\ntwo".to_string()]);
        assert_eq!(console.pending(), b"three");
    }

    #[test]
    fn test_write_reports_all_bytes_accepted() {
        let (mut console, _lines) = capture();
        assert_eq!(console.write(b"hi\n"), 3);
        assert_eq!(console.write(b""), 0);
    }

    #[test]
    fn test_non_utf8_is_flushed_lossily() {
        let (mut console, lines) = capture();
        console.write(&[0xff, 0xfe, b'\n']);
        assert_eq!(lines.lock().unwrap().len(), 1);
    }
}
