/// Accumulates raw bytes from one output stream and hands back complete,
/// decoded lines. A line that is not valid UTF-8 is dropped and counted.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
    decode_failures: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|byte| *byte == b'\n') {
            let end = start + offset;
            match decode_line(&self.buffer[start..end]) {
                Some(line) => lines.push(line),
                None => self.decode_failures = self.decode_failures.saturating_add(1),
            }
            start = end + 1;
        }
        self.buffer.drain(..start);

        lines
    }

    pub fn consume_decode_failures(&mut self) -> usize {
        std::mem::take(&mut self.decode_failures)
    }

    /// Returns the trailing partial line, if any. Used once the stream closed.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.is_empty() {
            return None;
        }
        let decoded = decode_line(&rest);
        if decoded.is_none() {
            self.decode_failures = self.decode_failures.saturating_add(1);
        }
        decoded
    }
}

fn decode_line(raw: &[u8]) -> Option<String> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    std::str::from_utf8(raw).ok().map(ToString::to_string)
}
