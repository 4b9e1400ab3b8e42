//! Core data model of the metabase.
//!
//! Objects and segments map to the `objects` and `segments` tables via
//! `sqlx::FromRow` and serialize as JSON via `serde`. Segments reference
//! their object by `stream_id` only.

pub mod object;
pub mod segment;
pub mod stream;

pub use object::{CipherSuite, EncryptionParameters, Object, ObjectStatus};
pub use segment::{
    NodeId, Piece, PieceId, Pieces, Redundancy, RedundancyAlgorithm, Segment, SegmentPosition,
};
pub use stream::{ObjectLocation, ObjectStream, ObjectVersionLocation};
