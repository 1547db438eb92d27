//! Splitting oversized replies into chunks and putting them back together.
//!
//! A reply body longer than the configured limit `L` is cut into
//! `N = ceil(len / L)` near-equal contiguous segments. Every segment travels in
//! its own [`Envelope`] carrying the shared `replyKey`, a 1-based `chunkIndex`
//! and `chunkCount = N`. The final chunk additionally carries the hex SHA-256
//! of the whole body in `checksum`.
//!
//! Chunks of one reply always travel on the same TCP stream, so they arrive in
//! order. The [`Reassembler`] still verifies it: indices must run 1..N with a
//! constant N, and the digest must match once the last chunk is in. Any
//! violation drops that reply's accumulator and reports a
//! [`ProtocolError::Chunk`]; other replies are unaffected.

use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, Result};
use crate::messages::{params, Envelope};

/// Hex SHA-256 of `data`.
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Split `body` into envelopes of at most `max_len` body bytes each.
///
/// Bodies no longer than `max_len` (including empty ones) produce a single
/// envelope with `chunkIndex = chunkCount = 1`.
pub fn split(command: &str, reply_key: &str, body: &[u8], max_len: usize) -> Result<Vec<Envelope>> {
    if max_len == 0 {
        return Err(ProtocolError::Protocol(
            "chunk size must be greater than zero".to_string(),
        ));
    }

    let count = body.len().div_ceil(max_len).max(1);
    // Spread bytes evenly instead of leaving a runt final chunk.
    let segment = body.len().div_ceil(count).max(1);
    let digest = checksum(body);

    let mut envelopes = Vec::with_capacity(count);
    let mut pieces = body.chunks(segment);
    for index in 1..=count {
        let piece = pieces.next().unwrap_or(&[]);
        let mut envelope = Envelope::new(command)
            .with_param(params::REPLY_KEY, reply_key)
            .with_param(params::CHUNK_INDEX, index)
            .with_param(params::CHUNK_COUNT, count)
            .with_body(piece.to_vec());
        if index == count {
            envelope = envelope.with_param(params::CHECKSUM, &digest);
        }
        envelopes.push(envelope);
    }
    Ok(envelopes)
}

/// Outcome of feeding one chunk to the [`Reassembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkProgress {
    /// More chunks are expected.
    Partial { received: usize, total: usize },
    /// The reply is complete; its accumulator has been removed.
    Complete(Vec<u8>),
}

/// Per-reply accumulation state.
#[derive(Debug, Default)]
struct ReplyAccumulator {
    received: usize,
    total: usize,
    bytes: Vec<u8>,
}

/// Reassembles chunked replies keyed by `replyKey`.
///
/// Safe to share between connection tasks.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: Mutex<HashMap<String, ReplyAccumulator>>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk envelope.
    pub fn accept(&self, envelope: &Envelope) -> Result<ChunkProgress> {
        let reply_key = envelope.require_param(params::REPLY_KEY)?;
        // Envelopes without chunk params are single-piece replies.
        let index = parse_count(envelope, params::CHUNK_INDEX, reply_key)?.unwrap_or(1);
        let total = parse_count(envelope, params::CHUNK_COUNT, reply_key)?.unwrap_or(1);
        self.accept_chunk(
            reply_key,
            index,
            total,
            &envelope.body,
            envelope.param(params::CHECKSUM),
        )
    }

    /// Feed one chunk given its parts.
    pub fn accept_chunk(
        &self,
        reply_key: &str,
        index: usize,
        total: usize,
        body: &[u8],
        expected_checksum: Option<&str>,
    ) -> Result<ChunkProgress> {
        let chunk_error = |reason: String| ProtocolError::Chunk {
            reply_key: reply_key.to_string(),
            reason,
        };

        let mut pending = self
            .pending
            .lock()
            .map_err(|_| ProtocolError::Protocol("reassembly state poisoned".to_string()))?;

        if total == 0 || index == 0 || index > total {
            pending.remove(reply_key);
            return Err(chunk_error(format!("invalid chunk {}/{}", index, total)));
        }

        let accumulator = pending.entry(reply_key.to_string()).or_default();
        if accumulator.received == 0 {
            accumulator.total = total;
        }

        let expected = accumulator.received + 1;
        if index != expected || total != accumulator.total {
            let reason = format!(
                "expected chunk {}/{}, got {}/{}",
                expected, accumulator.total, index, total
            );
            pending.remove(reply_key);
            return Err(chunk_error(reason));
        }

        accumulator.bytes.extend_from_slice(body);
        accumulator.received = index;

        if accumulator.received < accumulator.total {
            return Ok(ChunkProgress::Partial {
                received: accumulator.received,
                total: accumulator.total,
            });
        }

        let finished = pending.remove(reply_key).unwrap_or_default();
        if let Some(expected) = expected_checksum {
            let actual = checksum(&finished.bytes);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(chunk_error(format!(
                    "checksum mismatch: expected {}, computed {}",
                    expected, actual
                )));
            }
        }
        Ok(ChunkProgress::Complete(finished.bytes))
    }

    /// Number of replies currently being accumulated.
    pub fn pending(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Drop a partially received reply. Returns whether one existed.
    pub fn discard(&self, reply_key: &str) -> bool {
        self.pending
            .lock()
            .map(|mut p| p.remove(reply_key).is_some())
            .unwrap_or(false)
    }
}

fn parse_count(envelope: &Envelope, key: &str, reply_key: &str) -> Result<Option<usize>> {
    envelope
        .param(key)
        .map(|raw| {
            raw.parse::<usize>().map_err(|_| ProtocolError::Chunk {
                reply_key: reply_key.to_string(),
                reason: format!("{} is not a number: {:?}", key, raw),
            })
        })
        .transpose()
}
