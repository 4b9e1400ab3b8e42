//! Segment store: reserve and finalize segments under a pending object.

use super::metabase::{
    Metabase, SEGMENT_COLUMNS, fetch_pending_object, fetch_segment, fetch_segments,
    verify_object_stream,
};
use crate::errors::{MetabaseError, MetabaseResult, is_unique_violation};
use crate::models::{ObjectStream, PieceId, Pieces, Redundancy, Segment, SegmentPosition};
use chrono::Utc;
use sqlx::types::Json;
use tracing::debug;
use uuid::Uuid;

/// Options for [`Metabase::begin_segment`].
#[derive(Clone, Debug)]
pub struct BeginSegment {
    pub object_stream: ObjectStream,
    pub position: SegmentPosition,
    pub root_piece_id: PieceId,
    pub pieces: Pieces,
}

/// Options for [`Metabase::commit_segment`].
#[derive(Clone, Debug)]
pub struct CommitSegment {
    pub object_stream: ObjectStream,
    pub position: SegmentPosition,
    pub root_piece_id: PieceId,
    pub pieces: Pieces,

    pub encrypted_key_nonce: Vec<u8>,
    pub encrypted_key: Vec<u8>,
    pub encrypted_etag: Vec<u8>,

    pub encrypted_size: i32,
    pub plain_size: i32,
    pub plain_offset: i64,

    pub redundancy: Redundancy,
}

impl CommitSegment {
    fn verify(&self) -> MetabaseResult<()> {
        verify_object_stream(&self.object_stream)?;
        verify_position(self.position)?;
        if self.root_piece_id.is_zero() {
            return Err(MetabaseError::invalid("RootPieceID missing"));
        }
        self.pieces.verify().map_err(MetabaseError::Invalid)?;
        if self.encrypted_key.is_empty() {
            return Err(MetabaseError::invalid("EncryptedKey missing"));
        }
        if self.encrypted_key_nonce.is_empty() {
            return Err(MetabaseError::invalid("EncryptedKeyNonce missing"));
        }
        if self.encrypted_size <= 0 {
            return Err(MetabaseError::invalid(format!(
                "EncryptedSize negative or zero: {}",
                self.encrypted_size
            )));
        }
        if self.plain_size <= 0 {
            return Err(MetabaseError::invalid(format!(
                "PlainSize negative or zero: {}",
                self.plain_size
            )));
        }
        if self.plain_offset < 0 {
            return Err(MetabaseError::invalid(format!(
                "PlainOffset negative: {}",
                self.plain_offset
            )));
        }
        self.redundancy.verify().map_err(MetabaseError::Invalid)?;
        let total_shares = self.redundancy.total_shares;
        if let Some(piece) = self
            .pieces
            .iter()
            .find(|piece| i32::from(piece.number) >= total_shares)
        {
            return Err(MetabaseError::invalid(format!(
                "piece number {} exceeds total shares {}",
                piece.number, total_shares
            )));
        }
        Ok(())
    }

    /// True when `segment` already holds exactly this commit's content.
    fn matches(&self, segment: &Segment) -> bool {
        segment.root_piece_id == self.root_piece_id
            && segment.pieces == self.pieces
            && segment.encrypted_key_nonce == self.encrypted_key_nonce
            && segment.encrypted_key == self.encrypted_key
            && segment.encrypted_etag == self.encrypted_etag
            && segment.encrypted_size == self.encrypted_size
            && segment.plain_size == self.plain_size
            && segment.plain_offset == self.plain_offset
            && segment.redundancy == self.redundancy
    }
}

fn verify_position(position: SegmentPosition) -> MetabaseResult<()> {
    if position.part > SegmentPosition::MAX_PART {
        return Err(MetabaseError::invalid(format!(
            "segment part {} out of range",
            position.part
        )));
    }
    Ok(())
}

impl Metabase {
    /// Reserve a segment slot under a pending object.
    ///
    /// Inserts a placeholder row carrying only the root piece id and the
    /// initial pieces; `commit_segment` fills in the rest.
    pub async fn begin_segment(&self, opts: BeginSegment) -> MetabaseResult<Segment> {
        verify_object_stream(&opts.object_stream)?;
        verify_position(opts.position)?;
        if opts.root_piece_id.is_zero() {
            return Err(MetabaseError::invalid("RootPieceID missing"));
        }
        opts.pieces.verify().map_err(MetabaseError::Invalid)?;

        let stream_id = opts.object_stream.stream_id;
        let mut tx = self.db.begin().await?;

        let object = fetch_pending_object(&mut tx, &opts.object_stream).await?;

        let segment = sqlx::query_as::<_, Segment>(&format!(
            "INSERT INTO segments (
                stream_id, position, created_at, expires_at, root_piece_id, pieces
            ) VALUES (?, ?, ?, ?, ?, ?)
            RETURNING {SEGMENT_COLUMNS}"
        ))
        .bind(stream_id)
        .bind(opts.position.encode())
        .bind(Utc::now())
        .bind(object.expires_at)
        .bind(opts.root_piece_id.as_bytes())
        .bind(Json(&opts.pieces))
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                MetabaseError::SegmentAlreadyExists {
                    stream_id,
                    position: opts.position,
                }
            } else {
                MetabaseError::Sqlx(err)
            }
        })?;

        tx.commit().await?;

        debug!(%stream_id, position = %opts.position, "began segment");
        Ok(segment)
    }

    /// Finalize a segment with its complete metadata.
    ///
    /// Fills in a placeholder from `begin_segment`, or inserts the segment
    /// directly when none was begun. Re-committing identical content is
    /// accepted and returns the stored row; differing content is a conflict.
    pub async fn commit_segment(&self, opts: CommitSegment) -> MetabaseResult<Segment> {
        opts.verify()?;

        let stream_id = opts.object_stream.stream_id;
        let mut tx = self.db.begin().await?;

        let object = fetch_pending_object(&mut tx, &opts.object_stream).await?;
        let existing = fetch_segment(&mut tx, stream_id, opts.position).await?;

        let segment = match existing {
            Some(segment) if !segment.is_placeholder() => {
                if opts.matches(&segment) {
                    debug!(%stream_id, position = %opts.position, "segment already committed");
                    return Ok(segment);
                }
                return Err(MetabaseError::SegmentConflict {
                    stream_id,
                    position: opts.position,
                });
            }
            Some(_) => {
                sqlx::query_as::<_, Segment>(&format!(
                    "UPDATE segments SET
                        expires_at = ?,
                        root_piece_id = ?,
                        encrypted_key_nonce = ?,
                        encrypted_key = ?,
                        encrypted_etag = ?,
                        encrypted_size = ?,
                        plain_offset = ?,
                        plain_size = ?,
                        redundancy_algorithm = ?,
                        redundancy_share_size = ?,
                        redundancy_required_shares = ?,
                        redundancy_repair_shares = ?,
                        redundancy_optimal_shares = ?,
                        redundancy_total_shares = ?,
                        pieces = ?
                    WHERE stream_id = ? AND position = ?
                    RETURNING {SEGMENT_COLUMNS}"
                ))
                .bind(object.expires_at)
                .bind(opts.root_piece_id.as_bytes())
                .bind(&opts.encrypted_key_nonce)
                .bind(&opts.encrypted_key)
                .bind(&opts.encrypted_etag)
                .bind(opts.encrypted_size)
                .bind(opts.plain_offset)
                .bind(opts.plain_size)
                .bind(opts.redundancy.algorithm)
                .bind(opts.redundancy.share_size)
                .bind(opts.redundancy.required_shares)
                .bind(opts.redundancy.repair_shares)
                .bind(opts.redundancy.optimal_shares)
                .bind(opts.redundancy.total_shares)
                .bind(Json(&opts.pieces))
                .bind(stream_id)
                .bind(opts.position.encode())
                .fetch_one(&mut *tx)
                .await?
            }
            None => {
                sqlx::query_as::<_, Segment>(&format!(
                    "INSERT INTO segments (
                        stream_id, position, created_at, expires_at, root_piece_id,
                        encrypted_key_nonce, encrypted_key, encrypted_etag,
                        encrypted_size, plain_offset, plain_size,
                        redundancy_algorithm, redundancy_share_size, redundancy_required_shares,
                        redundancy_repair_shares, redundancy_optimal_shares, redundancy_total_shares,
                        pieces
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    RETURNING {SEGMENT_COLUMNS}"
                ))
                .bind(stream_id)
                .bind(opts.position.encode())
                .bind(Utc::now())
                .bind(object.expires_at)
                .bind(opts.root_piece_id.as_bytes())
                .bind(&opts.encrypted_key_nonce)
                .bind(&opts.encrypted_key)
                .bind(&opts.encrypted_etag)
                .bind(opts.encrypted_size)
                .bind(opts.plain_offset)
                .bind(opts.plain_size)
                .bind(opts.redundancy.algorithm)
                .bind(opts.redundancy.share_size)
                .bind(opts.redundancy.required_shares)
                .bind(opts.redundancy.repair_shares)
                .bind(opts.redundancy.optimal_shares)
                .bind(opts.redundancy.total_shares)
                .bind(Json(&opts.pieces))
                .fetch_one(&mut *tx)
                .await?
            }
        };

        tx.commit().await?;

        debug!(%stream_id, position = %opts.position, "committed segment");
        Ok(segment)
    }

    /// Fetch a single segment, placeholder or committed.
    pub async fn get_segment_by_position(
        &self,
        stream_id: Uuid,
        position: SegmentPosition,
    ) -> MetabaseResult<Segment> {
        let mut conn = self.db.acquire().await?;
        fetch_segment(&mut conn, stream_id, position)
            .await?
            .ok_or(MetabaseError::SegmentNotFound {
                stream_id,
                position,
            })
    }

    /// All segments of a stream, ordered by position.
    pub async fn list_segments(&self, stream_id: Uuid) -> MetabaseResult<Vec<Segment>> {
        let mut conn = self.db.acquire().await?;
        fetch_segments(&mut conn, stream_id).await
    }
}
