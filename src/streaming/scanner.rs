/// A complete SSE frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// `data:` payload (JSON text for chat streams).
    Data(String),
    /// The `data: [DONE]` sentinel.
    Done,
}

/// Resumable SSE scanner.
///
/// Network reads split frames anywhere, including inside a line or a
/// multi-byte character, so raw bytes are buffered until a full line is
/// available. `data:` lines accumulate into the current event; an empty
/// line dispatches it. `event:`/`id:`/`retry:` fields and comments are not
/// part of the chat stream contract and are skipped.
#[derive(Debug, Default)]
pub struct SseScanner {
    buf: Vec<u8>,
    data: String,
}

impl SseScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preallocate the line buffer (sized from `streaming.buffer_size`).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            data: String::new(),
        }
    }

    /// Feed one network read; returns every frame completed by it.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        // '\n' (0x0A) never occurs inside a multi-byte UTF-8 sequence, so
        // splitting on it keeps characters intact across reads.
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(['\n', '\r']);
            self.scan_line(line, &mut frames);
        }
        frames
    }

    /// Flush a trailing event that was never terminated by a blank line
    /// (upstream closed mid-frame).
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buf.is_empty() {
            let line_bytes = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&line_bytes).to_string();
            let mut frames = Vec::new();
            self.scan_line(line.trim_end_matches(['\n', '\r']), &mut frames);
            if let Some(frame) = frames.pop() {
                return Some(frame);
            }
        }
        if self.data.is_empty() {
            None
        } else {
            Some(self.take_frame())
        }
    }

    fn scan_line(&mut self, line: &str, frames: &mut Vec<SseFrame>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                frames.push(self.take_frame());
            }
        } else if let Some(data) = line.strip_prefix("data:") {
            let data = data.strip_prefix(' ').unwrap_or(data);
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(data);
        }
    }

    fn take_frame(&mut self) -> SseFrame {
        let payload = std::mem::take(&mut self.data);
        if payload.trim() == "[DONE]" {
            SseFrame::Done
        } else {
            SseFrame::Data(payload)
        }
    }
}

/// Render a payload as an SSE frame for the client side.
pub fn encode_frame(payload: &str) -> String {
    format!("data: {}\n\n", payload)
}
