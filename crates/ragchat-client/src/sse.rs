//! SSE frame decoder.
//!
//! Turns incrementally arriving bytes into `(event, data)` frames. Only the two
//! field forms the chat backend emits are recognized: an `event: ` line names
//! the next frame and the following `data: ` line completes it. Everything else
//! is skipped. The decoder never fails.

const EVENT_PREFIX: &str = "event: ";
const DATA_PREFIX: &str = "data: ";

/// One `(event-name, data)` pair extracted from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub event_name: String,
    pub raw_data: String,
}

/// UTF-8 decoder that tolerates multi-byte characters split across chunks.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    /// Decode as much of `pending + chunk` as forms complete characters.
    ///
    /// An incomplete sequence at the end is held back for the next call.
    /// Invalid sequences become U+FFFD.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush whatever is held back. A dangling partial character becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        self.pending.clear();
        char::REPLACEMENT_CHARACTER.to_string()
    }
}

/// Incremental line-based frame decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    utf8: Utf8ChunkDecoder,
    buffer: String,
    pending_event: Option<String>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every frame completed by them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        let text = self.utf8.decode(chunk);
        self.feed_str(&text)
    }

    /// Feed already-decoded text, returning every frame completed by it.
    pub fn feed_str(&mut self, text: &str) -> Vec<RawFrame> {
        self.buffer.push_str(text);

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches('\n').trim_end_matches('\r');
            if let Some(frame) = self.process_line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// End of stream. A trailing line without a newline is discarded.
    pub fn finish(&mut self) {
        let _ = self.utf8.finish();
        self.buffer.clear();
        self.pending_event = None;
    }

    fn process_line(&mut self, line: &str) -> Option<RawFrame> {
        if let Some(name) = line.strip_prefix(EVENT_PREFIX) {
            self.pending_event = Some(name.trim().to_string());
            return None;
        }

        if let Some(data) = line.strip_prefix(DATA_PREFIX) {
            let event_name = self.pending_event.take()?;
            return Some(RawFrame {
                event_name,
                raw_data: data.to_string(),
            });
        }

        None
    }
}

/// Decode a complete SSE body in one go.
pub fn parse_frames(text: &str) -> Vec<RawFrame> {
    let mut decoder = FrameDecoder::new();
    let frames = decoder.feed_str(text);
    decoder.finish();
    frames
}
