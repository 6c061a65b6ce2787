//! Byte-level SSE line decoding.
//!
//! Network chunks can split a line, and a line can split a multi-byte UTF-8
//! sequence, so bytes are buffered until a full `\n`-terminated line exists
//! and only then decoded as text.

use tracing::warn;

/// One meaningful record from the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseRecord {
    /// Payload of a `data:` line
    Data(String),
    /// `data: [DONE]`
    Done,
}

/// Longest line the decoder will buffer. Anything longer is discarded up to
/// its terminating newline.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already known to hold no newline.
    scanned: usize,
    /// Inside an oversized line; drop bytes until the next newline.
    skipping: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a network chunk, returning every record completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseRecord> {
        let mut records = Vec::new();
        let mut chunk = chunk;

        if self.skipping {
            match chunk.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.skipping = false;
                    chunk = &chunk[pos + 1..];
                }
                None => return records,
            }
        }

        self.buffer.extend_from_slice(chunk);
        let mut start = 0;
        let mut cursor = self.scanned;
        while let Some(offset) = self.buffer[cursor..].iter().position(|&b| b == b'\n') {
            let end = cursor + offset;
            if let Some(record) = parse_line(&self.buffer[start..=end]) {
                records.push(record);
            }
            start = end + 1;
            cursor = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > MAX_LINE_BYTES {
            warn!(
                pending = self.buffer.len(),
                limit = MAX_LINE_BYTES,
                "Discarding oversized stream line"
            );
            self.buffer.clear();
            self.scanned = 0;
            self.skipping = true;
        }
        records
    }

    /// Flush a final line that was not newline-terminated.
    pub fn finish(&mut self) -> Vec<SseRecord> {
        let line = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        self.skipping = false;
        parse_line(&line).into_iter().collect()
    }
}

fn parse_line(raw: &[u8]) -> Option<SseRecord> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    let data = line.strip_prefix("data:")?.trim_start();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseRecord::Done);
    }
    Some(SseRecord::Data(data.to_string()))
}
