//! Object lifecycle: begin, commit, read and delete object versions.
//!
//! `Pending -> Committed` is the only status transition. Deleting an object
//! removes the object row and all of its segments in one transaction.

use super::metabase::{
    Metabase, OBJECT_COLUMNS, SEGMENT_COLUMNS, fetch_pending_object, fetch_segments,
    verify_object_stream,
};
use crate::errors::{MetabaseError, MetabaseResult, is_unique_violation};
use crate::models::{
    EncryptionParameters, Object, ObjectLocation, ObjectStatus, ObjectStream,
    ObjectVersionLocation, Segment, SegmentPosition,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqliteConnection;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Options for [`Metabase::begin_object_exact_version`].
#[derive(Clone, Debug)]
pub struct BeginObjectExactVersion {
    pub object_stream: ObjectStream,
    pub encryption: EncryptionParameters,
    pub expires_at: Option<DateTime<Utc>>,
    /// Defaults to creation time plus the configured zombie deadline.
    pub zombie_deletion_deadline: Option<DateTime<Utc>>,
}

/// Options for [`Metabase::commit_object`].
#[derive(Clone, Debug, Default)]
pub struct CommitObject {
    pub object_stream: ObjectStream,

    pub encrypted_metadata_nonce: Option<Vec<u8>>,
    pub encrypted_metadata: Option<Vec<u8>>,
    pub encrypted_metadata_encrypted_key: Option<Vec<u8>>,

    /// Positions the caller has uploaded; each must be committed in the store.
    pub declared_segments: Vec<SegmentPosition>,
}

/// An object removed from the metabase together with its segments.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DeletedObject {
    pub object: Object,
    pub segments: Vec<Segment>,
}

/// Aggregates computed over an object's segments at commit time.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct CommitTotals {
    pub segment_count: i32,
    pub total_plain_size: i64,
    pub total_encrypted_size: i64,
    pub fixed_segment_size: i32,
}

impl Metabase {
    /// Create a pending object at an exact version.
    ///
    /// Returns `ObjectAlreadyExists` if the (key, version) slot or the stream
    /// id is already taken.
    pub async fn begin_object_exact_version(
        &self,
        opts: BeginObjectExactVersion,
    ) -> MetabaseResult<Object> {
        verify_object_stream(&opts.object_stream)?;
        if opts.encryption.is_zero() {
            return Err(MetabaseError::invalid("Encryption is missing"));
        }

        let created_at = Utc::now();
        let zombie_deletion_deadline = opts
            .zombie_deletion_deadline
            .unwrap_or(created_at + self.config().zombie_deadline);
        let stream = &opts.object_stream;

        let object = sqlx::query_as::<_, Object>(&format!(
            "INSERT INTO objects (
                project_id, bucket_name, object_key, version, stream_id,
                created_at, expires_at, status,
                encryption_cipher_suite, encryption_block_size,
                zombie_deletion_deadline
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {OBJECT_COLUMNS}"
        ))
        .bind(stream.project_id)
        .bind(&stream.bucket_name)
        .bind(&stream.object_key)
        .bind(stream.version)
        .bind(stream.stream_id)
        .bind(created_at)
        .bind(opts.expires_at)
        .bind(ObjectStatus::Pending)
        .bind(opts.encryption.cipher_suite)
        .bind(opts.encryption.block_size)
        .bind(zombie_deletion_deadline)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                MetabaseError::ObjectAlreadyExists(stream.to_string())
            } else {
                MetabaseError::Sqlx(err)
            }
        })?;

        debug!(stream = %stream, "began object");
        Ok(object)
    }

    /// Commit a pending object, finalizing its metadata and segment totals.
    ///
    /// All of the object's segments must be committed, indexes within each
    /// part must run contiguously from 0, plain offsets must accumulate in
    /// position order and every declared position must be present.
    pub async fn commit_object(&self, opts: CommitObject) -> MetabaseResult<Object> {
        verify_object_stream(&opts.object_stream)?;
        let metadata_fields = [
            opts.encrypted_metadata.is_some(),
            opts.encrypted_metadata_nonce.is_some(),
            opts.encrypted_metadata_encrypted_key.is_some(),
        ];
        if metadata_fields.iter().any(|set| *set) && !metadata_fields.iter().all(|set| *set) {
            return Err(MetabaseError::invalid(
                "EncryptedMetadata, EncryptedMetadataNonce and EncryptedMetadataEncryptedKey must be set together",
            ));
        }

        let stream = &opts.object_stream;
        let mut tx = self.db.begin().await?;

        fetch_pending_object(&mut tx, stream).await?;
        let segments = fetch_segments(&mut tx, stream.stream_id).await?;
        let totals = commit_totals(&segments, &opts.declared_segments)?;

        let object = sqlx::query_as::<_, Object>(&format!(
            "UPDATE objects SET
                status = ?,
                segment_count = ?,
                encrypted_metadata_nonce = ?,
                encrypted_metadata = ?,
                encrypted_metadata_encrypted_key = ?,
                total_plain_size = ?,
                total_encrypted_size = ?,
                fixed_segment_size = ?
            WHERE stream_id = ? AND status = ?
            RETURNING {OBJECT_COLUMNS}"
        ))
        .bind(ObjectStatus::Committed)
        .bind(totals.segment_count)
        .bind(opts.encrypted_metadata_nonce.as_deref())
        .bind(opts.encrypted_metadata.as_deref())
        .bind(opts.encrypted_metadata_encrypted_key.as_deref())
        .bind(totals.total_plain_size)
        .bind(totals.total_encrypted_size)
        .bind(totals.fixed_segment_size)
        .bind(stream.stream_id)
        .bind(ObjectStatus::Pending)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(MetabaseError::PendingObjectNotFound(stream.stream_id))?;

        tx.commit().await?;

        info!(
            stream = %stream,
            segments = totals.segment_count,
            plain_size = totals.total_plain_size,
            "committed object"
        );
        Ok(object)
    }

    /// Fetch an object version in any status.
    pub async fn get_object_exact_version(
        &self,
        location: &ObjectVersionLocation,
    ) -> MetabaseResult<Object> {
        let mut conn = self.db.acquire().await?;
        fetch_object_exact_version(&mut conn, location)
            .await?
            .ok_or_else(|| MetabaseError::ObjectNotFound(location.to_string()))
    }

    /// Delete one object version and all of its segments atomically.
    pub async fn delete_object_exact_version(
        &self,
        location: &ObjectVersionLocation,
    ) -> MetabaseResult<DeletedObject> {
        let mut tx = self.db.begin().await?;

        let object = fetch_object_exact_version(&mut tx, location)
            .await?
            .ok_or_else(|| MetabaseError::ObjectNotFound(location.to_string()))?;
        let deleted = delete_object_with_segments(&mut tx, object).await?;

        tx.commit().await?;

        info!(
            location = %location,
            segments = deleted.segments.len(),
            "deleted object"
        );
        Ok(deleted)
    }

    /// Delete every version stored under `location`, each together with its
    /// segments, in one transaction.
    pub async fn delete_object_all_versions(
        &self,
        location: &ObjectLocation,
    ) -> MetabaseResult<Vec<DeletedObject>> {
        let mut tx = self.db.begin().await?;

        let objects = sqlx::query_as::<_, Object>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE project_id = ? AND bucket_name = ? AND object_key = ?
             ORDER BY version ASC"
        ))
        .bind(location.project_id)
        .bind(&location.bucket_name)
        .bind(&location.object_key)
        .fetch_all(&mut *tx)
        .await?;

        if objects.is_empty() {
            return Err(MetabaseError::ObjectNotFound(location.to_string()));
        }

        let mut deleted = Vec::with_capacity(objects.len());
        for object in objects {
            deleted.push(delete_object_with_segments(&mut tx, object).await?);
        }

        tx.commit().await?;

        info!(location = %location, versions = deleted.len(), "deleted all object versions");
        Ok(deleted)
    }
}

async fn fetch_object_exact_version(
    conn: &mut SqliteConnection,
    location: &ObjectVersionLocation,
) -> MetabaseResult<Option<Object>> {
    let object = sqlx::query_as::<_, Object>(&format!(
        "SELECT {OBJECT_COLUMNS} FROM objects
         WHERE project_id = ? AND bucket_name = ? AND object_key = ? AND version = ?"
    ))
    .bind(location.location.project_id)
    .bind(&location.location.bucket_name)
    .bind(&location.location.object_key)
    .bind(location.version)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(object)
}

/// Remove segments first, then the object row. Must run inside a transaction.
async fn delete_object_with_segments(
    conn: &mut SqliteConnection,
    object: Object,
) -> MetabaseResult<DeletedObject> {
    let stream_id = object.stream.stream_id;

    let mut segments = sqlx::query_as::<_, Segment>(&format!(
        "DELETE FROM segments WHERE stream_id = ? RETURNING {SEGMENT_COLUMNS}"
    ))
    .bind(stream_id)
    .fetch_all(&mut *conn)
    .await?;
    // RETURNING order is unspecified
    segments.sort_by_key(|segment| segment.position);

    let result = sqlx::query("DELETE FROM objects WHERE stream_id = ?")
        .bind(stream_id)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() != 1 {
        return Err(MetabaseError::ObjectNotFound(object.stream.to_string()));
    }

    Ok(DeletedObject { object, segments })
}

/// Check the commit policy over `segments` (ordered by position) and compute
/// the totals stored on the object.
pub(crate) fn commit_totals(
    segments: &[Segment],
    declared: &[SegmentPosition],
) -> MetabaseResult<CommitTotals> {
    let mut totals = CommitTotals::default();
    let mut previous: Option<SegmentPosition> = None;

    for segment in segments {
        let position = segment.position;
        if segment.is_placeholder() {
            return Err(MetabaseError::invalid(format!(
                "segment {} was begun but never committed",
                position
            )));
        }

        let expected_index = match previous {
            Some(prev) if prev.part == position.part => prev.index.saturating_add(1),
            _ => 0,
        };
        if position.index != expected_index {
            return Err(MetabaseError::invalid(format!(
                "segment gap in part {}: expected index {}, found {}",
                position.part, expected_index, position.index
            )));
        }

        if segment.plain_offset != totals.total_plain_size {
            return Err(MetabaseError::invalid(format!(
                "segment {} has plain offset {}, expected {}",
                position, segment.plain_offset, totals.total_plain_size
            )));
        }

        totals.segment_count += 1;
        totals.total_plain_size += i64::from(segment.plain_size);
        totals.total_encrypted_size += i64::from(segment.encrypted_size);
        previous = Some(position);
    }

    let present: BTreeSet<SegmentPosition> = segments.iter().map(|s| s.position).collect();
    if let Some(missing) = declared.iter().find(|pos| !present.contains(pos)) {
        return Err(MetabaseError::invalid(format!(
            "declared segment {} is missing",
            missing
        )));
    }

    totals.fixed_segment_size = fixed_segment_size(segments);
    Ok(totals)
}

/// Plain size shared by every segment except the last, which may be
/// smaller. -1 when sizes vary, 0 for an object without segments.
fn fixed_segment_size(segments: &[Segment]) -> i32 {
    let Some((last, rest)) = segments.split_last() else {
        return 0;
    };
    let Some(first) = rest.first() else {
        return last.plain_size;
    };
    let fixed = first.plain_size;
    if rest.iter().all(|s| s.plain_size == fixed) && last.plain_size <= fixed {
        fixed
    } else {
        -1
    }
}
