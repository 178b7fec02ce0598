//! SSE (Server-Sent Events) stream decoder for OpenAI-compatible APIs.
//!
//! Handles the `data: ` prefix, `[DONE]` termination, line buffering across
//! TCP chunk boundaries, and empty keep-alive lines.

use serde_json::Value;

/// SSE stream decoder for OpenAI-compatible APIs.
///
/// Buffers raw bytes rather than text, so a multi-byte character split
/// across two chunks is decoded intact. Stops producing values once
/// `data: [DONE]` has been seen.
///
/// # Example
///
/// ```
/// use vision_batch::backend::sse::SseDecoder;
///
/// let mut decoder = SseDecoder::new();
/// let data = b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\ndata: [DONE]\n\n";
/// let values = decoder.decode(data);
/// assert_eq!(values.len(), 1);
/// assert!(decoder.is_done());
/// ```
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    /// Create a new empty SSE decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the `[DONE]` terminator has been received.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed raw bytes into the decoder and return any complete JSON payloads.
    ///
    /// Ignores `event:`, `id:` and comment lines as well as keep-alives.
    /// Lines that are not valid JSON are skipped.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);

        let mut values = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if self.done {
                continue;
            }
            if let Some(val) = self.decode_line(&String::from_utf8_lossy(&line)) {
                values.push(val);
            }
        }
        values
    }

    /// Flush any remaining buffer content.
    pub fn flush(&mut self) -> Vec<Value> {
        let remaining = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&remaining);

        let mut values = Vec::new();
        for line in text.lines() {
            if self.done {
                break;
            }
            if let Some(val) = self.decode_line(line) {
                values.push(val);
            }
        }
        values
    }

    fn decode_line(&mut self, line: &str) -> Option<Value> {
        let line = line.trim();
        let data = line
            .strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))?
            .trim();

        if data == "[DONE]" {
            self.done = true;
            return None;
        }
        serde_json::from_str::<Value>(data).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_basic_decode() {
        let mut decoder = SseDecoder::new();
        let chunk = b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n";
        let values = decoder.decode(chunk);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["choices"][0]["delta"]["content"], "Hello");
        assert!(!decoder.is_done());
    }

    #[test]
    fn test_sse_done_stops_decoding() {
        let mut decoder = SseDecoder::new();
        let chunk = b"data: {\"a\":1}\n\ndata: [DONE]\n\ndata: {\"a\":2}\n\n";
        let values = decoder.decode(chunk);
        assert_eq!(values.len(), 1);
        assert!(decoder.is_done());
    }

    #[test]
    fn test_sse_event_and_comment_lines_ignored() {
        let mut decoder = SseDecoder::new();
        let chunk = b": keep-alive\n\n\nevent: message\nid: 7\ndata: {\"x\":1}\n\n";
        let values = decoder.decode(chunk);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["x"], 1);
    }

    #[test]
    fn test_sse_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.decode(b"data: {\"cho").is_empty());
        let values = decoder.decode(b"ices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n");
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn test_sse_multibyte_char_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let frame = "data: {\"t\":\"发票\"}\n".as_bytes();
        // Split inside the first character's UTF-8 sequence.
        let split = frame.iter().position(|b| *b >= 0x80).unwrap() + 1;
        assert!(decoder.decode(&frame[..split]).is_empty());
        let values = decoder.decode(&frame[split..]);
        assert_eq!(values[0]["t"], "发票");
    }

    #[test]
    fn test_sse_flush_trailing_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.decode(b"data: {\"a\":3}").is_empty());
        let values = decoder.flush();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["a"], 3);
    }
}
