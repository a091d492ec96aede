//! Framing for values stored in RocksDB.
//!
//! ```text
//! ┌──────────────┬───────────────────────────────────────┐
//! │ checksum u32 │ lz4( bincode(value) ), size-prepended │
//! │  (LE, FNV)   │                                       │
//! └──────────────┴───────────────────────────────────────┘
//! ```
//!
//! The checksum covers the uncompressed payload, so a record that
//! decompresses cleanly but was altered on disk is still rejected.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::StoreError;

const CHECKSUM_LEN: usize = 4;

/// Serialize, checksum and compress a value.
pub fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let payload = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    let compressed = lz4_flex::compress_prepend_size(&payload);
    let mut out = Vec::with_capacity(CHECKSUM_LEN + compressed.len());
    out.extend_from_slice(&checksum(&payload).to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Reverse [`encode_record`]. `key` only labels errors.
pub fn decode_record<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StoreError> {
    if bytes.len() < CHECKSUM_LEN {
        return Err(StoreError::Deserialization(format!("record {key} is truncated")));
    }
    let (sum, compressed) = bytes.split_at(CHECKSUM_LEN);
    let mut sum_buf = [0u8; CHECKSUM_LEN];
    sum_buf.copy_from_slice(sum);

    let payload = lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    if checksum(&payload) != u32::from_le_bytes(sum_buf) {
        return Err(StoreError::Checksum { key: key.to_string() });
    }

    let (value, _) = bincode::serde::decode_from_slice(&payload, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// FNV-1a over little-endian words.
fn checksum(payload: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    hash ^= payload.len() as u32;
    hash = hash.wrapping_mul(0x0100_0193);
    for chunk in payload.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        hash ^= u32::from_le_bytes(word);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        name: String,
        version: u64,
    }

    fn row() -> Row {
        Row { name: "a document title that repeats, repeats, repeats".into(), version: 42 }
    }

    #[test]
    fn test_record_roundtrip() {
        let bytes = encode_record(&row()).unwrap();
        let back: Row = decode_record("row", &bytes).unwrap();
        assert_eq!(back, row());
    }

    #[test]
    fn test_record_detects_corruption() {
        let mut bytes = encode_record(&row()).unwrap();
        bytes[0] ^= 0xff;
        let err = decode_record::<Row>("row", &bytes).unwrap_err();
        assert_eq!(err, StoreError::Checksum { key: "row".into() });
    }

    #[test]
    fn test_record_rejects_truncated() {
        let bytes = encode_record(&row()).unwrap();
        assert!(decode_record::<Row>("row", &bytes[..2]).is_err());
        assert!(decode_record::<Row>("row", &bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn test_checksum_sensitive_to_trailing_zero() {
        assert_ne!(checksum(b"abc"), checksum(b"abc\0"));
    }
}
