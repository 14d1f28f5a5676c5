use bytes::Bytes;

/// One server-sent-events record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseChunk {
    pub event: Option<String>,
    pub id: Option<String>,
    pub retry: Option<u64>,
    pub data: String,
}

impl SseChunk {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }
}

/// Incremental SSE parser.
///
/// Records are separated by a blank line; multi-line `data` fields are
/// joined with `\n`. Input that is not valid UTF-8 is decoded with
/// replacement before it reaches the line buffer.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    id: Option<String>,
    retry: Option<u64>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<SseChunk> {
        let text = String::from_utf8_lossy(chunk);
        self.push_str(&text)
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseChunk> {
        self.buffer.push_str(chunk);
        let mut chunks = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);

            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                self.finish_chunk(&mut chunks);
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            self.accept_field(&line);
        }

        chunks
    }

    /// Flushes whatever is buffered at end of input; a trailing record
    /// without its blank-line terminator is still emitted.
    pub fn finish(&mut self) -> Vec<SseChunk> {
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            if !line.is_empty() && !line.starts_with(':') {
                self.accept_field(&line);
            }
        }
        let mut chunks = Vec::new();
        self.finish_chunk(&mut chunks);
        chunks
    }

    fn accept_field(&mut self, line: &str) {
        if let Some(value) = line.strip_prefix("event:") {
            let value = value.trim_start();
            self.event = (!value.is_empty()).then(|| value.to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data_lines.push(value.trim_start().to_string());
        } else if line == "data" {
            self.data_lines.push(String::new());
        } else if let Some(value) = line.strip_prefix("id:") {
            let value = value.trim_start();
            self.id = (!value.is_empty()).then(|| value.to_string());
        } else if let Some(value) = line.strip_prefix("retry:") {
            self.retry = value.trim().parse::<u64>().ok();
        }
    }

    fn finish_chunk(&mut self, chunks: &mut Vec<SseChunk>) {
        if self.event.is_none()
            && self.id.is_none()
            && self.retry.is_none()
            && self.data_lines.is_empty()
        {
            return;
        }
        chunks.push(SseChunk {
            event: self.event.take(),
            id: self.id.take(),
            retry: self.retry.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

/// Symmetric re-encoding: header fields first, each data line prefixed with
/// `data: `, blank-line terminator.
pub fn encode_chunk(chunk: &SseChunk) -> Bytes {
    let mut out = String::new();
    if let Some(event) = &chunk.event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    if let Some(id) = &chunk.id {
        out.push_str("id: ");
        out.push_str(id);
        out.push('\n');
    }
    if let Some(retry) = chunk.retry {
        out.push_str("retry: ");
        out.push_str(&retry.to_string());
        out.push('\n');
    }
    for line in chunk.data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_events_and_multiline_data() {
        let mut parser = SseParser::new();
        let chunks =
            parser.push_str("event: message_start\ndata: {\"a\":1}\ndata: {\"b\":2}\n\n");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].event.as_deref(), Some("message_start"));
        assert_eq!(chunks[0].data, "{\"a\":1}\n{\"b\":2}");
    }

    #[test]
    fn carries_partial_records_across_pushes() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: hel").is_empty());
        assert!(parser.push_str("lo\n").is_empty());
        let chunks = parser.push_str("\n");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data, "hello");
    }

    #[test]
    fn finish_flushes_unterminated_tail() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: tail").is_empty());
        let chunks = parser.finish();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data, "tail");
    }

    #[test]
    fn roundtrip_preserves_records() {
        let original = "event: delta\nid: 7\ndata: one\ndata: two\n\n";
        let mut parser = SseParser::new();
        let chunks = parser.push_str(original);
        assert_eq!(chunks.len(), 1);
        let encoded = encode_chunk(&chunks[0]);
        let mut reparse = SseParser::new();
        let again = reparse.push_bytes(&encoded);
        assert_eq!(chunks, again);
    }

    #[test]
    fn comment_lines_are_skipped() {
        let mut parser = SseParser::new();
        let chunks = parser.push_str(": keep-alive\n\ndata: x\n\n");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data, "x");
    }
}
