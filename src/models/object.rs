//! Represents an object version tracked by the metabase.

use super::stream::ObjectStream;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle status of an object row.
///
/// `Pending -> Committed` is the only transition and it never reverses.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[repr(i32)]
pub enum ObjectStatus {
    /// Upload in progress; eligible for zombie purge once its deadline passes.
    Pending = 1,
    /// Upload finished; never matched by zombie purge.
    Committed = 3,
}

/// Cipher used to encrypt the object content.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[repr(i32)]
pub enum CipherSuite {
    Unspecified = 0,
    Null = 1,
    AesGcm = 2,
    SecretBox = 3,
}

/// Encryption descriptor. Opaque to the metabase; stored and returned as-is.
#[derive(Serialize, Deserialize, Clone, Copy, FromRow, Debug, PartialEq, Eq, Hash)]
pub struct EncryptionParameters {
    #[sqlx(rename = "encryption_cipher_suite")]
    pub cipher_suite: CipherSuite,

    #[sqlx(rename = "encryption_block_size")]
    pub block_size: i32,
}

impl EncryptionParameters {
    pub fn is_zero(&self) -> bool {
        self.cipher_suite == CipherSuite::Unspecified && self.block_size == 0
    }
}

/// A single object version.
///
/// The row holds only metadata; segment descriptors live in the
/// `segments` table keyed by `stream.stream_id`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Object {
    #[sqlx(flatten)]
    pub stream: ObjectStream,

    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,

    pub status: ObjectStatus,
    pub segment_count: i32,

    pub encrypted_metadata_nonce: Option<Vec<u8>>,
    pub encrypted_metadata: Option<Vec<u8>>,
    pub encrypted_metadata_encrypted_key: Option<Vec<u8>>,

    /// Sum of plain sizes of all segments, set on commit.
    pub total_plain_size: i64,
    /// Sum of encrypted sizes of all segments, set on commit.
    pub total_encrypted_size: i64,
    /// Plain size shared by every segment but the last, or -1 when they differ.
    pub fixed_segment_size: i32,

    #[sqlx(flatten)]
    pub encryption: EncryptionParameters,

    /// Only meaningful while the object is pending.
    pub zombie_deletion_deadline: Option<DateTime<Utc>>,
}

impl Object {
    pub fn is_pending(&self) -> bool {
        self.status == ObjectStatus::Pending
    }
}
