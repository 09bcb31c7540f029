//! Binary chunk codec: arbitrary bytes ⇄ transport-safe text.
//!
//! Page snapshots and merged documents cross text-only channels (JSON
//! protocol frames, notifications). Those channels have hard per-message
//! limits, so the encoder never builds one giant fragment. It walks the
//! payload in fixed-size chunks and encodes each one on its own:
//!
//! ```text
//! payload ──▶ 8190 B chunks ──▶ base64 fragment ──▶ append in order
//!                 │ fragment over the limit?
//!                 └─▶ 1023 B chunks ──▶ … ──▶ 255 B chunks ──▶ error
//! ```
//!
//! Every granularity is a multiple of 3 bytes, so independently encoded
//! fragments concatenate into exactly the standard base64 of the whole
//! payload (no interior `=` padding). The fallback only re-splits the chunk
//! that failed, and its depth is bounded by the ladder length.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::debug;

use crate::error::CodecError;

/// Chunk sizes tried in order: ~8 KiB, ~1 KiB, ~256 B.
pub const DEFAULT_LADDER: [usize; 3] = [8190, 1023, 255];

/// Largest fragment (in chars) a single chunk may encode to by default.
pub const DEFAULT_FRAGMENT_LIMIT: usize = 64 * 1024;

/// Chunked base64 encoder/decoder with an explicit fallback ladder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkCodec {
    ladder: Vec<usize>,
    fragment_limit: usize,
}

impl Default for ChunkCodec {
    fn default() -> Self {
        Self {
            ladder: DEFAULT_LADDER.to_vec(),
            fragment_limit: DEFAULT_FRAGMENT_LIMIT,
        }
    }
}

impl ChunkCodec {
    /// Build a codec from a strictly decreasing ladder of chunk sizes.
    ///
    /// Each size must be a non-zero multiple of 3.
    pub fn new(ladder: Vec<usize>, fragment_limit: usize) -> Result<Self, CodecError> {
        if ladder.is_empty() {
            return Err(CodecError::InvalidLadder("ladder is empty".into()));
        }
        if let Some(bad) = ladder.iter().find(|&&s| s == 0 || s % 3 != 0) {
            return Err(CodecError::InvalidLadder(format!(
                "chunk size {bad} is not a non-zero multiple of 3"
            )));
        }
        if ladder.windows(2).any(|w| w[1] >= w[0]) {
            return Err(CodecError::InvalidLadder(
                "chunk sizes must strictly decrease".into(),
            ));
        }
        if fragment_limit < 4 {
            return Err(CodecError::InvalidLadder(format!(
                "fragment limit {fragment_limit} cannot hold one base64 quantum"
            )));
        }
        Ok(Self {
            ladder,
            fragment_limit,
        })
    }

    /// Keep the default ladder but cap fragments at `limit` chars.
    pub fn with_fragment_limit(limit: usize) -> Result<Self, CodecError> {
        Self::new(DEFAULT_LADDER.to_vec(), limit)
    }

    pub fn ladder(&self) -> &[usize] {
        &self.ladder
    }

    pub fn fragment_limit(&self) -> usize {
        self.fragment_limit
    }

    /// Encode `bytes` as standard base64.
    pub fn encode(&self, bytes: &[u8]) -> Result<String, CodecError> {
        let first = self.ladder[0];

        // Small payloads: one fragment, no chunk walk.
        if bytes.len() <= first && encoded_len(bytes.len()) <= self.fragment_limit {
            return Ok(STANDARD.encode(bytes));
        }

        let mut out = String::with_capacity(encoded_len(bytes.len()));
        self.encode_level(bytes, 0, 0, &mut out)?;
        debug!(
            "Encoded {} bytes → {} chars in {}-byte chunks",
            bytes.len(),
            out.len(),
            first
        );
        Ok(out)
    }

    fn encode_level(
        &self,
        bytes: &[u8],
        base_offset: usize,
        level: usize,
        out: &mut String,
    ) -> Result<(), CodecError> {
        let size = self.ladder[level];
        for (i, chunk) in bytes.chunks(size).enumerate() {
            let offset = base_offset + i * size;
            if encoded_len(chunk.len()) <= self.fragment_limit {
                STANDARD.encode_string(chunk, out);
            } else if level + 1 < self.ladder.len() {
                self.encode_level(chunk, offset, level + 1, out)?;
            } else {
                return Err(CodecError::FragmentTooLarge {
                    offset,
                    chunk_len: chunk.len(),
                    limit: self.fragment_limit,
                });
            }
        }
        Ok(())
    }

    /// Decode standard base64 produced by [`ChunkCodec::encode`] (or any
    /// canonical, padded standard-alphabet encoder).
    pub fn decode(&self, text: &str) -> Result<Vec<u8>, CodecError> {
        if text.len() % 4 != 0 {
            return Err(CodecError::InvalidEncoding {
                offset: text.len(),
                detail: format!("length {} is not a multiple of 4", text.len()),
            });
        }
        if let Some(pos) = text.find('=') {
            let tail = &text[pos..];
            if tail.len() > 2 || tail.bytes().any(|b| b != b'=') {
                return Err(CodecError::InvalidEncoding {
                    offset: pos,
                    detail: "padding before the end of the payload".into(),
                });
            }
        }

        // A slice of whole quanta decodes independently of its neighbours.
        let slice_chars = encoded_len(self.ladder[0]);
        let mut out = Vec::with_capacity(text.len() / 4 * 3);
        let bytes = text.as_bytes();
        for (i, slice) in bytes.chunks(slice_chars).enumerate() {
            STANDARD
                .decode_vec(slice, &mut out)
                .map_err(|e| CodecError::InvalidEncoding {
                    offset: i * slice_chars,
                    detail: e.to_string(),
                })?;
        }
        Ok(out)
    }
}

/// Length of the padded base64 encoding of `n` bytes.
fn encoded_len(n: usize) -> usize {
    n.div_ceil(3) * 4
}
