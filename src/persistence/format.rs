//! Snapshot record codec.
//!
//! A snapshot is stored as a small JSON record:
//!
//! ```text
//! {
//!   "payload":    base64(lz4_frame(JSON([entry, ...]))),
//!   "timestamp":  epoch-ms at save time,
//!   "checksum":   CRC-32/ISCSI of the decoded payload bytes (optional),
//!   "compressed": whether the payload is an LZ4 frame
//! }
//! ```
//!
//! Entries are listed least recently used first so hydration restores the
//! recency order. A compression level of 0 writes the JSON uncompressed;
//! any other level selects the LZ4 frame format (LZ4 has no tunable levels).
//! Records without a checksum are accepted.

use crate::cache::{CacheEntry, Content};
use crate::error::PersistenceError;
use crate::types::ChunkId;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use crc::{Crc, CRC_32_ISCSI};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::time::Duration;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Upper bound on the decoded payload, to refuse absurd records early.
pub const MAX_PAYLOAD_SIZE: usize = 256 * 1024 * 1024;

/// The persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub payload: String,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<u32>,
    #[serde(default = "default_compressed")]
    pub compressed: bool,
}

fn default_compressed() -> bool {
    true
}

/// One cache entry inside the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedEntry {
    pub key: ChunkId,
    pub value: Content,
    pub expiry: u64,
    pub last_used: u64,
}

impl SnapshotRecord {
    /// Encode `entries` into a record stamped `timestamp`.
    pub fn encode(
        entries: &[(ChunkId, CacheEntry)],
        timestamp: u64,
        compression_level: u32,
    ) -> Result<Self, PersistenceError> {
        let persisted: Vec<PersistedEntry> = entries
            .iter()
            .map(|(key, entry)| PersistedEntry {
                key: key.clone(),
                value: entry.value.to_persistable(),
                expiry: entry.expiry,
                last_used: entry.last_used,
            })
            .collect();

        let json =
            serde_json::to_vec(&persisted).map_err(|e| PersistenceError::Write(e.to_string()))?;

        let compressed = compression_level > 0;
        let bytes = if compressed {
            let mut encoder = FrameEncoder::new(Vec::with_capacity(json.len() / 2));
            encoder
                .write_all(&json)
                .map_err(|e| PersistenceError::Write(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| PersistenceError::Write(format!("compression failed: {}", e)))?
        } else {
            json
        };

        Ok(Self {
            checksum: Some(CRC32.checksum(&bytes)),
            payload: STANDARD.encode(&bytes),
            timestamp,
            compressed,
        })
    }

    /// Age of the record at `now_ms`.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp)
    }

    /// Decode the payload, rejecting records at least `max_age` old.
    pub fn decode(
        &self,
        now_ms: u64,
        max_age: Duration,
    ) -> Result<Vec<(ChunkId, CacheEntry)>, PersistenceError> {
        let max_age_ms = max_age.as_millis() as u64;
        let age_ms = self.age_ms(now_ms);
        if age_ms >= max_age_ms {
            return Err(PersistenceError::Stale { age_ms, max_age_ms });
        }

        let bytes = STANDARD.decode(self.payload.as_bytes())?;
        if let Some(expected) = self.checksum {
            let actual = CRC32.checksum(&bytes);
            if expected != actual {
                return Err(PersistenceError::ChecksumMismatch { expected, actual });
            }
        }

        let json = if self.compressed {
            let mut out = Vec::new();
            FrameDecoder::new(bytes.as_slice())
                .take(MAX_PAYLOAD_SIZE as u64 + 1)
                .read_to_end(&mut out)
                .map_err(|e| PersistenceError::Corrupt(format!("decompression failed: {}", e)))?;
            out
        } else {
            bytes
        };
        if json.len() > MAX_PAYLOAD_SIZE {
            return Err(PersistenceError::Corrupt(format!(
                "payload exceeds {} bytes",
                MAX_PAYLOAD_SIZE
            )));
        }

        let persisted: Vec<PersistedEntry> = serde_json::from_slice(&json)?;
        Ok(persisted
            .into_iter()
            .map(|p| (p.key, CacheEntry::new(p.value, p.expiry, p.last_used)))
            .collect())
    }

    pub fn to_json(&self) -> Result<String, PersistenceError> {
        serde_json::to_string(self).map_err(|e| PersistenceError::Write(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, PersistenceError> {
        Ok(serde_json::from_str(raw)?)
    }
}
