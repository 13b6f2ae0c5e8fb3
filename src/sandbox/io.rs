//! Output capture for the guest's stdout.
//!
//! The guest's `print` output lands in an [`OutputCapture`], which wasmtime-wasi
//! sees as the stdout stream. The buffer never refuses a write (a full buffer
//! must not turn into an `OSError` inside the guest); it keeps a bounded prefix
//! and counts what it dropped. The logs are clipped to the character budget
//! afterwards by [`truncate_logs`].

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use wasmtime_wasi::{HostOutputStream, StdoutStream, StreamResult, Subscribe};

/// Largest write permit handed to the guest at once.
const WRITE_PERMIT: usize = 64 * 1024;

#[derive(Debug, Default)]
struct CaptureBuffer {
    data: Vec<u8>,
    dropped: u64,
}

/// A bounded, shareable capture buffer usable as a WASI output stream.
#[derive(Clone, Debug)]
pub struct OutputCapture {
    buffer: Arc<Mutex<CaptureBuffer>>,
    capacity: usize,
}

impl OutputCapture {
    /// Create a capture buffer that keeps at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(CaptureBuffer::default())),
            capacity,
        }
    }

    /// Create a capture buffer sized for a character budget (up to four
    /// UTF-8 bytes per character).
    pub fn for_char_budget(max_chars: usize) -> Self {
        Self::new(max_chars.saturating_mul(4).saturating_add(4))
    }

    fn lock(&self) -> MutexGuard<'_, CaptureBuffer> {
        // A poisoned buffer still holds valid bytes.
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append bytes, dropping whatever does not fit.
    pub fn append(&self, bytes: &[u8]) {
        let mut buffer = self.lock();
        let room = self.capacity.saturating_sub(buffer.data.len());
        let kept = room.min(bytes.len());
        buffer.data.extend_from_slice(&bytes[..kept]);
        buffer.dropped += (bytes.len() - kept) as u64;
    }

    /// Get the captured output as a string.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.lock().data).into_owned()
    }

    /// Number of bytes dropped because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Get the length of captured data.
    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear the buffer.
    pub fn clear(&self) {
        let mut buffer = self.lock();
        buffer.data.clear();
        buffer.dropped = 0;
    }
}

#[async_trait::async_trait]
impl Subscribe for OutputCapture {
    async fn ready(&mut self) {}
}

impl HostOutputStream for OutputCapture {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        self.append(&bytes);
        Ok(())
    }

    fn flush(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        Ok(WRITE_PERMIT)
    }
}

impl StdoutStream for OutputCapture {
    fn stream(&self) -> Box<dyn HostOutputStream> {
        Box::new(self.clone())
    }

    fn isatty(&self) -> bool {
        false
    }
}

/// Build the marker inserted where logs were clipped.
pub fn truncation_marker(max_chars: usize) -> String {
    format!("\n..._This content has been truncated to stay below {max_chars} characters_...\n")
}

/// Clip `logs` to at most `max_chars` characters.
///
/// Keeps the head and the tail (where error diagnostics live) around a
/// truncation marker. Returns whether anything was removed.
pub fn truncate_logs(logs: String, max_chars: usize) -> (String, bool) {
    let total = logs.chars().count();
    if total <= max_chars {
        return (logs, false);
    }

    let marker = truncation_marker(max_chars);
    let marker_len = marker.chars().count();
    if marker_len >= max_chars {
        return (logs.chars().take(max_chars).collect(), true);
    }

    let keep = max_chars - marker_len;
    let head = keep / 2;
    let tail = keep - head;

    let mut clipped: String = logs.chars().take(head).collect();
    clipped.push_str(&marker);
    clipped.extend(logs.chars().skip(total - tail));
    (clipped, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_appends() {
        let mut output = OutputCapture::new(1024);
        output.write(Bytes::from_static(b"hello ")).unwrap();
        output.write(Bytes::from_static(b"world")).unwrap();
        assert_eq!(output.to_string_lossy(), "hello world");
        assert_eq!(output.dropped(), 0);
    }

    #[test]
    fn test_capture_drops_past_capacity() {
        let output = OutputCapture::new(4);
        output.append(b"abcdef");
        assert_eq!(output.to_string_lossy(), "abcd");
        assert_eq!(output.dropped(), 2);
        output.clear();
        assert!(output.is_empty());
    }

    #[test]
    fn test_streams_share_buffer() {
        let capture = OutputCapture::new(64);
        let mut stream = capture.stream();
        stream.write(Bytes::from_static(b"via stream")).unwrap();
        assert_eq!(capture.to_string_lossy(), "via stream");
    }

    #[test]
    fn test_truncate_keeps_short_logs() {
        let (logs, truncated) = truncate_logs("short".to_string(), 100);
        assert_eq!(logs, "short");
        assert!(!truncated);
    }

    #[test]
    fn test_truncate_respects_budget() {
        let long = "x".repeat(10_000) + "TAIL";
        for budget in [5usize, 50, 100, 500, 1000] {
            let (logs, truncated) = truncate_logs(long.clone(), budget);
            assert!(truncated);
            assert!(logs.chars().count() <= budget, "budget {budget}");
        }
        let (logs, _) = truncate_logs(long, 1000);
        assert!(logs.contains("truncated to stay below 1000 characters"));
        assert!(logs.ends_with("TAIL"));
    }

    #[test]
    fn test_truncate_counts_characters() {
        let (logs, truncated) = truncate_logs("ééé".to_string(), 3);
        assert_eq!(logs, "ééé");
        assert!(!truncated);
    }
}
