// SSE line framing shared by every streaming executor.

use super::Preprocessed;

/// Accumulates raw bytes and yields complete lines (without the newline).
/// Carriage returns are stripped; a trailing partial line stays buffered.
#[derive(Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// Remaining partial line at end of stream, if any.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.buffer))
    }
}

/// Default SSE preprocessing: `data:` lines yield payloads, `[DONE]` ends
/// the stream, everything else (blank separators, `event:` names, comments)
/// is framing noise.
pub fn preprocess_data_line(line: &[u8]) -> Preprocessed {
    if line.is_empty() {
        return Preprocessed::Skip;
    }
    let Some(rest) = line.strip_prefix(b"data:") else {
        return Preprocessed::Skip;
    };
    let payload = trim_ascii(rest);
    if payload.is_empty() {
        return Preprocessed::Skip;
    }
    if payload == b"[DONE]" {
        return Preprocessed::Done;
    }
    Preprocessed::Payload(payload.to_vec())
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|p| p + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_lines_across_chunks() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"data: {\"a\":").is_empty());
        let lines = buffer.push(b"1}\r\ndata: [DONE]\n\n");
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], b"data: {\"a\":1}");
        assert_eq!(lines[1], b"data: [DONE]");
        assert!(lines[2].is_empty());
    }

    #[test]
    fn flush_returns_trailing_partial() {
        let mut buffer = LineBuffer::new();
        buffer.push(b"data: tail");
        assert_eq!(buffer.flush().unwrap(), b"data: tail");
        assert!(buffer.flush().is_none());
    }

    #[test]
    fn data_line_preprocessing() {
        assert_eq!(
            preprocess_data_line(b"data: {\"x\":1}"),
            Preprocessed::Payload(b"{\"x\":1}".to_vec())
        );
        assert_eq!(preprocess_data_line(b"data: [DONE]"), Preprocessed::Done);
        assert_eq!(preprocess_data_line(b""), Preprocessed::Skip);
        assert_eq!(preprocess_data_line(b"event: message_start"), Preprocessed::Skip);
        assert_eq!(preprocess_data_line(b": keepalive"), Preprocessed::Skip);
    }
}
