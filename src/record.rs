//! # Credential Records
//!
//! A [`KeyRecord`] is one engineer credential: the shared signing secret for a
//! port pair plus the relay's session bookkeeping. Records are stored as
//! fixed-layout little-endian blobs keyed by the engineer port (`port2`).
//!
//! ## Binary Layout (96 bytes)
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 8 | `magic` (`0x6b73e867a72cdd1f`) |
//! | 8 | 8 | `timestamp` (last accepted signing timestamp) |
//! | 16 | 32 | `secret_key` (SHA-256 of the passphrase) |
//! | 48 | 4 | `port1` (signed) |
//! | 52 | 4 | `connections` |
//! | 56 | 4 | `count1` |
//! | 60 | 4 | `count2` |
//! | 64 | 32 | `name` (UTF-8, zero padded) |
//!
//! The legacy layout is the first 48 bytes only (magic, timestamp, secret).

use std::fmt;

use thiserror::Error;

use crate::crypto::derive_secret;

// ============================================================================
// Layout Constants
// ============================================================================

/// Sentinel identifying a valid record.
pub const KEY_MAGIC: u64 = 0x6b73_e867_a72c_dd1f;

/// Size of a current-layout record.
pub const RECORD_SIZE: usize = 96;

/// Size of a legacy record (magic, timestamp, secret key).
pub const LEGACY_RECORD_SIZE: usize = 48;

/// Size of the shared signing secret.
pub const SECRET_KEY_LEN: usize = 32;

/// Fixed width of the display name field.
pub const NAME_LEN: usize = 32;

/// Legacy records carry no pairing; the user port sat this far below port2.
pub const LEGACY_PORT_OFFSET: i32 = 1000;

const NAME_OFFSET: usize = RECORD_SIZE - NAME_LEN;

// ============================================================================
// Record Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record has length {actual}, expected {expected}")]
    WrongLength { expected: usize, actual: usize },
    #[error("record magic {0:#018x} does not match")]
    BadMagic(u64),
    #[error("legacy port2 {0} has no paired port1")]
    LegacyPortOutOfRange(i32),
}

// ============================================================================
// KeyRecord
// ============================================================================

#[derive(Clone, PartialEq, Eq)]
pub struct KeyRecord {
    /// Engineer port; the store key, not part of the packed value.
    pub port2: i32,
    pub magic: u64,
    pub timestamp: u64,
    pub secret_key: [u8; SECRET_KEY_LEN],
    pub port1: i32,
    pub connections: u32,
    pub count1: u32,
    pub count2: u32,
    pub name: String,
}

impl KeyRecord {
    /// Empty record for `port2`: valid magic, zero secret, zero counters.
    pub fn new(port2: i32) -> Self {
        Self {
            port2,
            magic: KEY_MAGIC,
            timestamp: 0,
            secret_key: [0u8; SECRET_KEY_LEN],
            port1: 0,
            connections: 0,
            count1: 0,
            count2: 0,
            name: String::new(),
        }
    }

    /// Replace the secret with the digest of `passphrase`.
    pub fn set_passphrase(&mut self, passphrase: &str) {
        self.secret_key = derive_secret(passphrase);
    }

    /// True when the secret has never been set.
    pub fn has_secret(&self) -> bool {
        self.secret_key.iter().any(|&b| b != 0)
    }

    /// Serialize into the fixed 96-byte layout.
    ///
    /// Names longer than [`NAME_LEN`] bytes are cut at the byte boundary; a
    /// split multi-byte character is dropped again on [`unpack`](Self::unpack).
    pub fn pack(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[0..8].copy_from_slice(&self.magic.to_le_bytes());
        out[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        out[16..48].copy_from_slice(&self.secret_key);
        out[48..52].copy_from_slice(&self.port1.to_le_bytes());
        out[52..56].copy_from_slice(&self.connections.to_le_bytes());
        out[56..60].copy_from_slice(&self.count1.to_le_bytes());
        out[60..64].copy_from_slice(&self.count2.to_le_bytes());

        let name = self.name.as_bytes();
        let len = name.len().min(NAME_LEN);
        out[NAME_OFFSET..NAME_OFFSET + len].copy_from_slice(&name[..len]);
        out
    }

    /// Parse a current-layout record. Length and magic are both checked.
    pub fn unpack(port2: i32, data: &[u8]) -> Result<Self, RecordError> {
        if data.len() != RECORD_SIZE {
            return Err(RecordError::WrongLength {
                expected: RECORD_SIZE,
                actual: data.len(),
            });
        }
        let magic = read_u64(data, 0);
        if magic != KEY_MAGIC {
            return Err(RecordError::BadMagic(magic));
        }

        let mut secret_key = [0u8; SECRET_KEY_LEN];
        secret_key.copy_from_slice(&data[16..48]);

        Ok(Self {
            port2,
            magic,
            timestamp: read_u64(data, 8),
            secret_key,
            port1: read_u32(data, 48) as i32,
            connections: read_u32(data, 52),
            count1: read_u32(data, 56),
            count2: read_u32(data, 60),
            name: decode_name(&data[NAME_OFFSET..]),
        })
    }

    /// Lift a 48-byte legacy record into the current layout.
    ///
    /// Legacy records predate pairing, so `port1` is derived from `port2`.
    pub fn from_legacy(port2: i32, data: &[u8]) -> Result<Self, RecordError> {
        if data.len() != LEGACY_RECORD_SIZE {
            return Err(RecordError::WrongLength {
                expected: LEGACY_RECORD_SIZE,
                actual: data.len(),
            });
        }
        let mut record = Self::new(port2);
        record.timestamp = read_u64(data, 8);
        record.secret_key.copy_from_slice(&data[16..48]);
        if port2 != 0 {
            record.port1 = port2
                .checked_sub(LEGACY_PORT_OFFSET)
                .ok_or(RecordError::LegacyPortOutOfRange(port2))?;
        }
        Ok(record)
    }

    /// Store key for this record.
    pub fn key(&self) -> [u8; 4] {
        store_key(self.port2)
    }
}

impl fmt::Display for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} '{}' counts={}/{} connections={}",
            self.port1, self.port2, self.name, self.count1, self.count2, self.connections
        )
    }
}

// The secret never reaches logs; only a short fingerprint of it.
impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRecord")
            .field("port1", &self.port1)
            .field("port2", &self.port2)
            .field("name", &self.name)
            .field("timestamp", &self.timestamp)
            .field("secret", &hex::encode(&derive_secret_fingerprint(&self.secret_key)))
            .field("connections", &self.connections)
            .field("count1", &self.count1)
            .field("count2", &self.count2)
            .finish()
    }
}

// ============================================================================
// Key Encoding Helpers
// ============================================================================

/// Encode an engineer port as a 4-byte little-endian store key.
pub fn store_key(port2: i32) -> [u8; 4] {
    port2.to_le_bytes()
}

/// Decode a store key; `None` for keys of any other width.
pub fn port_from_key(key: &[u8]) -> Option<i32> {
    let bytes: [u8; 4] = key.try_into().ok()?;
    Some(i32::from_le_bytes(bytes))
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

/// Lenient name decode: stop at the padding, skip invalid UTF-8.
fn decode_name(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    field[..end].utf8_chunks().map(|chunk| chunk.valid()).collect()
}

fn derive_secret_fingerprint(secret: &[u8; SECRET_KEY_LEN]) -> [u8; 4] {
    let digest = crate::crypto::digest(secret);
    [digest[0], digest[1], digest[2], digest[3]]
}

// ============================================================================
// Tests
// ============================================================================
