//! Represents segments of an object and the erasure-coded pieces behind them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Position of a segment within its stream.
///
/// Segments are totally ordered by `(part, index)`. The pair is packed into a
/// single integer column so ordering in SQL matches ordering here.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentPosition {
    pub part: u32,
    pub index: u32,
}

impl SegmentPosition {
    /// Largest part number whose packed encoding stays non-negative.
    pub const MAX_PART: u32 = i32::MAX as u32;

    pub fn new(part: u32, index: u32) -> Self {
        Self { part, index }
    }

    /// Pack into the stored integer form, `part << 32 | index`.
    pub fn encode(self) -> i64 {
        ((u64::from(self.part) << 32) | u64::from(self.index)) as i64
    }
}

impl From<i64> for SegmentPosition {
    fn from(packed: i64) -> Self {
        let packed = packed as u64;
        Self {
            part: (packed >> 32) as u32,
            index: packed as u32,
        }
    }
}

impl fmt::Display for SegmentPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.part, self.index)
    }
}

#[derive(Debug, Error)]
#[error("expected {expected} bytes, got {actual}")]
pub struct InvalidIdLength {
    pub expected: usize,
    pub actual: usize,
}

macro_rules! fixed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0 == [0; 32]
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl TryFrom<Vec<u8>> for $name {
            type Error = InvalidIdLength;

            fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
                let actual = bytes.len();
                <[u8; 32]>::try_from(bytes)
                    .map(Self)
                    .map_err(|_| InvalidIdLength { expected: 32, actual })
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(", stringify!($name))?;
                for byte in &self.0[..8] {
                    write!(f, "{:02x}", byte)?;
                }
                write!(f, "..)")
            }
        }
    };
}

fixed_id!(
    /// Root identifier from which every piece id of a segment is derived.
    PieceId
);

fixed_id!(
    /// Identity of a storage node holding pieces.
    NodeId
);

/// One erasure-coded share of a segment, held by one storage node.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Piece {
    /// Share index within the erasure-coding scheme.
    pub number: u16,
    pub storage_node: NodeId,
}

/// Pieces of a segment, kept sorted by piece number.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Pieces(Vec<Piece>);

impl Pieces {
    pub fn new(mut pieces: Vec<Piece>) -> Self {
        pieces.sort_by_key(|piece| piece.number);
        Self(pieces)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Piece> {
        self.0.iter()
    }

    /// Check that there is at least one piece and that piece numbers are unique.
    pub fn verify(&self) -> Result<(), String> {
        if self.0.is_empty() {
            return Err("pieces missing".into());
        }
        // sorted, so duplicates are adjacent
        if let Some(pair) = self.0.windows(2).find(|w| w[0].number == w[1].number) {
            return Err(format!("duplicated piece number {}", pair[0].number));
        }
        Ok(())
    }
}

impl From<Vec<Piece>> for Pieces {
    fn from(pieces: Vec<Piece>) -> Self {
        Self::new(pieces)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, sqlx::Type)]
#[repr(i32)]
pub enum RedundancyAlgorithm {
    #[default]
    Invalid = 0,
    ReedSolomon = 1,
}

/// Erasure-coding scheme of a segment.
#[derive(Serialize, Deserialize, Clone, Copy, FromRow, Debug, Default, PartialEq, Eq, Hash)]
pub struct Redundancy {
    #[sqlx(rename = "redundancy_algorithm")]
    pub algorithm: RedundancyAlgorithm,

    /// Size in bytes of each erasure share.
    #[sqlx(rename = "redundancy_share_size")]
    pub share_size: i32,

    /// Minimum shares needed to reconstruct.
    #[sqlx(rename = "redundancy_required_shares")]
    pub required_shares: i32,

    /// Shares at or below which repair is triggered.
    #[sqlx(rename = "redundancy_repair_shares")]
    pub repair_shares: i32,

    /// Healthy target share count.
    #[sqlx(rename = "redundancy_optimal_shares")]
    pub optimal_shares: i32,

    /// Shares actually stored.
    #[sqlx(rename = "redundancy_total_shares")]
    pub total_shares: i32,
}

impl Redundancy {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Check the share thresholds are ordered
    /// `required <= repair <= optimal <= total`.
    pub fn verify(&self) -> Result<(), String> {
        if self.algorithm == RedundancyAlgorithm::Invalid {
            return Err("redundancy algorithm missing".into());
        }
        if self.share_size <= 0 {
            return Err("redundancy share size must be positive".into());
        }
        if self.required_shares <= 0
            || self.required_shares > self.repair_shares
            || self.repair_shares > self.optimal_shares
            || self.optimal_shares > self.total_shares
        {
            return Err(format!(
                "redundancy shares out of order: required={} repair={} optimal={} total={}",
                self.required_shares, self.repair_shares, self.optimal_shares, self.total_shares
            ));
        }
        Ok(())
    }
}

/// A segment row.
///
/// A segment created by `begin_segment` is a placeholder: its encryption key,
/// sizes and redundancy are empty until `commit_segment` finalizes it.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Segment {
    pub stream_id: Uuid,

    #[sqlx(try_from = "i64")]
    pub position: SegmentPosition,

    pub created_at: DateTime<Utc>,
    /// Copy of the owning object's expiration.
    pub expires_at: Option<DateTime<Utc>>,

    #[sqlx(try_from = "Vec<u8>")]
    pub root_piece_id: PieceId,
    pub encrypted_key_nonce: Vec<u8>,
    pub encrypted_key: Vec<u8>,
    pub encrypted_etag: Vec<u8>,

    pub encrypted_size: i32,
    pub plain_offset: i64,
    pub plain_size: i32,

    #[sqlx(flatten)]
    pub redundancy: Redundancy,

    #[sqlx(json)]
    pub pieces: Pieces,
}

impl Segment {
    /// True until the segment has been committed with its encryption key.
    pub fn is_placeholder(&self) -> bool {
        self.encrypted_key.is_empty()
    }
}
