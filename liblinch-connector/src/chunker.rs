// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Chunked transport for payloads that do not fit one IPC frame
//! budget.
//!
//! A payload is serialised once, hashed once, and split into ordered
//! chunks that all carry the session metadata. The receiving side
//! validates the set and re-hashes the concatenation, so a missing,
//! duplicated, or corrupted chunk is always detected. The hash is a
//! stable non-cryptographic one: this is integrity against transport
//! faults, not tamper resistance against an adversary.

use std::hash::Hasher as _;

use fnv::FnvHasher;
use serde_json::Value;
use tracing::debug;

use linch_connector_protocol::{ChunkEnvelope, ChunkInfo, CHUNK_MESSAGE_TYPE};

use crate::{consts, error::ConnectorError};

#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    pub max_chunk_size: usize,
    pub min_chunk_size: usize,
    /// Factor the chunk size shrinks by when the daemon pushes back.
    pub shrink_factor: f64,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        ChunkerConfig {
            max_chunk_size: consts::MAX_CHUNK_SIZE,
            min_chunk_size: consts::MIN_CHUNK_SIZE,
            shrink_factor: consts::CHUNK_SHRINK_FACTOR,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkerStats {
    pub sessions: u64,
    pub successful: u64,
    pub failed: u64,
    pub chunks_produced: u64,
    pub avg_chunk_size: usize,
}

pub struct Chunker {
    config: ChunkerConfig,
    current_chunk_size: usize,
    stats: ChunkerStats,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        let current_chunk_size = config.max_chunk_size;
        Chunker {
            config,
            current_chunk_size,
            stats: ChunkerStats::default(),
        }
    }

    pub fn current_chunk_size(&self) -> usize {
        self.current_chunk_size
    }

    pub fn stats(&self) -> ChunkerStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = ChunkerStats::default();
    }

    /// Split a JSON payload into ordered chunks at the current chunk
    /// size. All chunks share one freshly generated session id.
    ///
    /// Every call records an outcome in the statistics, success or
    /// not.
    pub fn chunkify(&mut self, payload: &Value) -> Result<Vec<ChunkInfo>, ConnectorError> {
        let serialised = match serde_json::to_string(payload) {
            Ok(serialised) => serialised,
            Err(err) => {
                self.record_outcome(0, false);
                return Err(err.into());
            }
        };
        let session_id = generate_session_id();
        let chunks = self.split(&serialised, &session_id);
        self.record_outcome(chunks.len(), true);

        debug!(
            "chunked {} bytes into {} chunks (session {})",
            serialised.len(),
            chunks.len(),
            session_id
        );
        Ok(chunks)
    }

    fn record_outcome(&mut self, produced: usize, success: bool) {
        self.stats.sessions += 1;
        if success {
            self.stats.successful += 1;
        } else {
            self.stats.failed += 1;
        }

        let total = self.stats.chunks_produced + produced as u64;
        if total > 0 {
            self.stats.avg_chunk_size = ((self.stats.avg_chunk_size as u64
                * self.stats.chunks_produced
                + self.current_chunk_size as u64 * produced as u64)
                / total) as usize;
        }
        self.stats.chunks_produced = total;
    }

    fn split(&self, data: &str, session_id: &str) -> Vec<ChunkInfo> {
        if data.is_empty() {
            return Vec::new();
        }

        // Chunk data travels as JSON strings, so cuts must land on
        // char boundaries. Pieces are at most current_chunk_size
        // bytes; a multibyte tail can make one a few bytes shorter.
        let mut pieces = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let mut end = self.current_chunk_size.min(rest.len());
            while !rest.is_char_boundary(end) {
                end -= 1;
            }
            let (piece, tail) = rest.split_at(end);
            pieces.push(piece);
            rest = tail;
        }

        let total_chunks = pieces.len();
        let checksum = checksum(data);

        let mut chunks = Vec::with_capacity(total_chunks);
        for (index, piece) in pieces.into_iter().enumerate() {
            chunks.push(ChunkInfo {
                session_id: String::from(session_id),
                chunk_index: index as u32,
                total_chunks: total_chunks as u32,
                data: String::from(piece),
                original_size: data.len() as u64,
                checksum: checksum.clone(),
            });
        }
        chunks
    }

    /// Wrap one chunk in the IPC message envelope.
    pub fn envelope(&self, chunk: ChunkInfo) -> ChunkEnvelope {
        ChunkEnvelope {
            kind: String::from(CHUNK_MESSAGE_TYPE),
            session_id: chunk.session_id,
            chunk_index: chunk.chunk_index,
            total_chunks: chunk.total_chunks,
            original_size: chunk.original_size,
            checksum: chunk.checksum,
            data: chunk.data,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Shrink the chunk size after the daemon rejected a chunk for
    /// being too expensive. Only size-ish error kinds shrink; the
    /// floor is `min_chunk_size`.
    pub fn adapt_chunk_size(&mut self, error_kind: &str) -> usize {
        if ["MEMORY", "SIZE", "TIMEOUT"]
            .iter()
            .any(|kind| error_kind.contains(kind))
        {
            let shrunk = (self.current_chunk_size as f64 * self.config.shrink_factor) as usize;
            self.current_chunk_size = shrunk.max(self.config.min_chunk_size);
            debug!(
                "adapted chunk size to {} after {}",
                self.current_chunk_size, error_kind
            );
        }
        self.current_chunk_size
    }

    /// Validate a chunk set and reassemble the original payload
    /// string.
    pub fn reassemble(chunks: &[ChunkInfo]) -> Result<String, ConnectorError> {
        if chunks.is_empty() {
            return Err(ConnectorError::ChecksumMismatch(String::from(
                "no chunks to reassemble",
            )));
        }

        let first = &chunks[0];
        if chunks.len() != first.total_chunks as usize {
            return Err(ConnectorError::ChecksumMismatch(format!(
                "got {} chunks, session says {}",
                chunks.len(),
                first.total_chunks
            )));
        }

        let mut sorted: Vec<&ChunkInfo> = chunks.iter().collect();
        sorted.sort_by_key(|chunk| chunk.chunk_index);

        for (index, chunk) in sorted.iter().enumerate() {
            if chunk.session_id != first.session_id
                || chunk.total_chunks != first.total_chunks
                || chunk.original_size != first.original_size
                || chunk.checksum != first.checksum
            {
                return Err(ConnectorError::ChecksumMismatch(format!(
                    "chunk {} does not match session metadata",
                    chunk.chunk_index
                )));
            }
            if chunk.chunk_index as usize != index {
                return Err(ConnectorError::ChecksumMismatch(format!(
                    "missing or duplicate chunk at index {}",
                    index
                )));
            }
        }

        let mut assembled = String::with_capacity(first.original_size as usize);
        for chunk in &sorted {
            assembled.push_str(&chunk.data);
        }

        if checksum(&assembled) != first.checksum {
            return Err(ConnectorError::ChecksumMismatch(String::from(
                "reassembled payload does not hash to the session checksum",
            )));
        }
        Ok(assembled)
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Chunker::new(ChunkerConfig::default())
    }
}

/// Stable hash of the payload, hex encoded.
pub fn checksum(data: &str) -> String {
    let mut hasher = FnvHasher::default();
    hasher.write(data.as_bytes());
    format!("{:x}", hasher.finish())
}

fn generate_session_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let tag = uuid::Uuid::new_v4().simple().to_string();
    format!("chunk_{}_{}", millis, &tag[..8])
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn kilobyte_payload(kib: usize) -> Value {
        json!({ "blob": "x".repeat(kib * 1024) })
    }

    #[test]
    fn round_trip() {
        let payload = json!({
            "connector_id": "filesystem",
            "items": (0..100).map(|i| json!({"index": i})).collect::<Vec<_>>(),
        });

        let mut chunker = Chunker::new(ChunkerConfig {
            max_chunk_size: 64,
            ..Default::default()
        });
        let chunks = chunker.chunkify(&payload).expect("chunkify");
        assert!(chunks.len() > 1);

        let assembled = Chunker::reassemble(&chunks).expect("reassemble");
        let parsed: Value = serde_json::from_str(&assembled).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn round_trip_out_of_order() {
        let mut chunker = Chunker::new(ChunkerConfig {
            max_chunk_size: 32,
            ..Default::default()
        });
        let mut chunks = chunker.chunkify(&kilobyte_payload(1)).unwrap();
        chunks.reverse();
        assert!(Chunker::reassemble(&chunks).is_ok());
    }

    #[test]
    fn round_trip_multibyte() {
        let payload = json!({ "text": "división — 文件系统 — ürün".repeat(40) });
        let mut chunker = Chunker::new(ChunkerConfig {
            max_chunk_size: 33,
            ..Default::default()
        });
        let chunks = chunker.chunkify(&payload).unwrap();
        let assembled = Chunker::reassemble(&chunks).expect("reassemble");
        assert_eq!(serde_json::from_str::<Value>(&assembled).unwrap(), payload);
    }

    #[test]
    fn hundred_kib_makes_four_chunks() {
        let payload = json!("y".repeat(100 * 1024 - 2));
        let mut chunker = Chunker::default();
        let chunks = chunker.chunkify(&payload).unwrap();
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.total_chunks == 4));
        assert!(chunks
            .iter()
            .all(|c| c.session_id == chunks[0].session_id));
    }

    #[test]
    fn tamper_detection() {
        let mut chunker = Chunker::new(ChunkerConfig {
            max_chunk_size: 128,
            ..Default::default()
        });
        let mut chunks = chunker.chunkify(&kilobyte_payload(1)).unwrap();

        let victim = chunks.len() / 2;
        let mut flipped = chunks[victim].data.clone().into_bytes();
        flipped[0] ^= 0x20;
        chunks[victim].data = String::from_utf8(flipped).unwrap();

        assert_matches!(
            Chunker::reassemble(&chunks),
            Err(ConnectorError::ChecksumMismatch(_))
        );
    }

    #[test]
    fn missing_chunk_rejected() {
        let mut chunker = Chunker::new(ChunkerConfig {
            max_chunk_size: 64,
            ..Default::default()
        });
        let mut chunks = chunker.chunkify(&kilobyte_payload(1)).unwrap();
        chunks.pop();
        assert_matches!(
            Chunker::reassemble(&chunks),
            Err(ConnectorError::ChecksumMismatch(_))
        );
    }

    #[test]
    fn duplicate_chunk_rejected() {
        let mut chunker = Chunker::new(ChunkerConfig {
            max_chunk_size: 64,
            ..Default::default()
        });
        let mut chunks = chunker.chunkify(&kilobyte_payload(1)).unwrap();
        let dup = chunks[0].clone();
        let last = chunks.len() - 1;
        chunks[last] = dup;
        assert_matches!(
            Chunker::reassemble(&chunks),
            Err(ConnectorError::ChecksumMismatch(_))
        );
    }

    #[test]
    fn adapt_shrinks_with_floor() {
        let mut chunker = Chunker::default();
        let before = chunker.current_chunk_size();

        let after = chunker.adapt_chunk_size("TIMEOUT");
        assert!(after < before);
        assert!(after >= consts::MIN_CHUNK_SIZE);

        // unrelated error kinds leave the size alone
        let unchanged = chunker.adapt_chunk_size("PERMISSION_DENIED");
        assert_eq!(unchanged, after);

        // shrinking bottoms out at the floor
        for _ in 0..100 {
            chunker.adapt_chunk_size("MEMORY");
        }
        assert_eq!(chunker.current_chunk_size(), consts::MIN_CHUNK_SIZE);
    }

    #[test]
    fn stats_record_every_outcome() {
        let mut chunker = Chunker::new(ChunkerConfig {
            max_chunk_size: 64,
            ..Default::default()
        });

        chunker.chunkify(&kilobyte_payload(1)).unwrap();
        chunker.chunkify(&kilobyte_payload(2)).unwrap();

        let stats = chunker.stats();
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.failed, 0);
        assert!(stats.chunks_produced >= 2);
        assert!(stats.avg_chunk_size > 0);

        // a failed serialisation still counts as an outcome
        chunker.record_outcome(0, false);
        let stats = chunker.stats();
        assert_eq!(stats.sessions, 3);
        assert_eq!(stats.failed, 1);
        assert!(stats.chunks_produced >= 2);

        chunker.reset_stats();
        assert_eq!(chunker.stats().sessions, 0);
    }

    #[test]
    fn envelope_is_tagged() {
        let mut chunker = Chunker::default();
        let chunks = chunker.chunkify(&json!({"k": "v"})).unwrap();
        let envelope = chunker.envelope(chunks[0].clone());
        assert_eq!(envelope.kind, CHUNK_MESSAGE_TYPE);

        let back = ChunkInfo::from(envelope);
        assert_eq!(back, chunks[0]);
    }
}
