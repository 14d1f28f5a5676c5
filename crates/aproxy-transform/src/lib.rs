//! Wire-format rewriting for proxied model traffic.
//!
//! Three independent concerns live here: SSE framing (parse/encode with
//! streaming flush), per-record data rewrites (model substitution, envelope
//! unwrap, the Responses→Chat transcoder), and request-body translation
//! (Cloud Code Assist envelope, Chat→Responses).
//!
//! Provider payloads are handled as `serde_json::Value` trees on purpose:
//! they evolve independently of this proxy, and a rewrite must forward
//! anything it does not understand byte-for-byte.

pub mod envelope;
pub mod responses;
pub mod rewrite;
pub mod sse;
pub mod stage;

pub use rewrite::{ModelRewrite, rewrite_body_model, substitute_model, suppress_thinking};
pub use sse::{SseChunk, SseParser, encode_chunk};
pub use stage::{ChunkRewrite, Passthrough, SseRewriteStage};
