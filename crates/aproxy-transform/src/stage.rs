use bytes::{Bytes, BytesMut};

use crate::sse::{SseChunk, SseParser, encode_chunk};

/// Per-record rewrite applied while a stream flows through the proxy.
///
/// `rewrite` may drop a record (empty vec), replace it, or fan it out into
/// several records. `finish` runs once at end of stream for transforms that
/// owe a trailing record. `rewrite_body` is the non-streaming variant used
/// when the same transform must run over a complete JSON body; `None` means
/// "leave the body untouched".
pub trait ChunkRewrite: Send {
    fn rewrite(&mut self, chunk: SseChunk) -> Vec<SseChunk>;

    fn finish(&mut self) -> Vec<SseChunk> {
        Vec::new()
    }

    fn rewrite_body(&mut self, _body: &str) -> Option<String> {
        None
    }
}

impl<R: ChunkRewrite + ?Sized> ChunkRewrite for Box<R> {
    fn rewrite(&mut self, chunk: SseChunk) -> Vec<SseChunk> {
        (**self).rewrite(chunk)
    }

    fn finish(&mut self) -> Vec<SseChunk> {
        (**self).finish()
    }

    fn rewrite_body(&mut self, body: &str) -> Option<String> {
        (**self).rewrite_body(body)
    }
}

#[derive(Debug, Default)]
pub struct Passthrough;

impl ChunkRewrite for Passthrough {
    fn rewrite(&mut self, chunk: SseChunk) -> Vec<SseChunk> {
        vec![chunk]
    }
}

/// Streaming pipeline stage: owns the decode buffer, flushes complete SSE
/// records through the rewrite, and carries partial records until the next
/// read. Never buffers more than the current incomplete record.
pub struct SseRewriteStage<R> {
    parser: SseParser,
    rewrite: R,
}

impl<R: ChunkRewrite> SseRewriteStage<R> {
    pub fn new(rewrite: R) -> Self {
        Self {
            parser: SseParser::new(),
            rewrite,
        }
    }

    pub fn push(&mut self, input: &[u8]) -> Bytes {
        let mut out = BytesMut::new();
        for chunk in self.parser.push_bytes(input) {
            for rewritten in self.rewrite.rewrite(chunk) {
                out.extend_from_slice(&encode_chunk(&rewritten));
            }
        }
        out.freeze()
    }

    /// Terminal flush: parses any unterminated tail record, then lets the
    /// rewrite emit its trailing records.
    pub fn finish(mut self) -> Bytes {
        let mut out = BytesMut::new();
        for chunk in self.parser.finish() {
            for rewritten in self.rewrite.rewrite(chunk) {
                out.extend_from_slice(&encode_chunk(&rewritten));
            }
        }
        for trailing in self.rewrite.finish() {
            out.extend_from_slice(&encode_chunk(&trailing));
        }
        out.freeze()
    }

    pub fn rewrite_body(&mut self, body: &str) -> Option<String> {
        self.rewrite.rewrite_body(body)
    }
}
