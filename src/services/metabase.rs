//! Metabase: durable bookkeeping of objects, their segments and the pieces
//! of each segment, backed by a SQLite pool.
//!
//! The service issues no in-process locks. Every multi-row change runs in a
//! single store transaction, and isolation between concurrent uploads and
//! purges is left to the store.

use crate::errors::{MetabaseError, MetabaseResult};
use crate::models::{Object, ObjectStatus, ObjectStream, Segment, SegmentPosition};
use chrono::Duration;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use uuid::Uuid;

use super::purge::DEFAULT_PURGE_BATCH_SIZE;

pub(crate) const OBJECT_COLUMNS: &str = "project_id, bucket_name, object_key, version, stream_id, \
     created_at, expires_at, status, segment_count, \
     encrypted_metadata_nonce, encrypted_metadata, encrypted_metadata_encrypted_key, \
     total_plain_size, total_encrypted_size, fixed_segment_size, \
     encryption_cipher_suite, encryption_block_size, zombie_deletion_deadline";

pub(crate) const SEGMENT_COLUMNS: &str = "stream_id, position, created_at, expires_at, \
     root_piece_id, encrypted_key_nonce, encrypted_key, encrypted_etag, \
     encrypted_size, plain_offset, plain_size, \
     redundancy_algorithm, redundancy_share_size, redundancy_required_shares, \
     redundancy_repair_shares, redundancy_optimal_shares, redundancy_total_shares, pieces";

/// Tunables of the metabase service.
#[derive(Clone, Debug)]
pub struct MetabaseConfig {
    /// Batch size used by purges that are called with a batch size of 0.
    pub default_batch_size: usize,
    /// Zombie deadline given to pending objects that do not set one.
    pub zombie_deadline: Duration,
}

impl Default for MetabaseConfig {
    fn default() -> Self {
        Self {
            default_batch_size: DEFAULT_PURGE_BATCH_SIZE,
            zombie_deadline: Duration::hours(24),
        }
    }
}

#[derive(Clone)]
pub struct Metabase {
    /// Shared SQLite connection pool holding the `objects` and `segments` tables.
    pub db: Arc<SqlitePool>,

    config: MetabaseConfig,
}

impl Metabase {
    pub fn new(db: Arc<SqlitePool>, config: MetabaseConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &MetabaseConfig {
        &self.config
    }
}

/// Fetch the pending object that owns `stream`, matching every identity field.
///
/// Missing objects and committed objects both report
/// [`MetabaseError::PendingObjectNotFound`].
pub(crate) async fn fetch_pending_object(
    conn: &mut SqliteConnection,
    stream: &ObjectStream,
) -> MetabaseResult<Object> {
    let object = sqlx::query_as::<_, Object>(&format!(
        "SELECT {OBJECT_COLUMNS} FROM objects
         WHERE project_id = ? AND bucket_name = ? AND object_key = ? AND version = ?
           AND stream_id = ? AND status = ?"
    ))
    .bind(stream.project_id)
    .bind(&stream.bucket_name)
    .bind(&stream.object_key)
    .bind(stream.version)
    .bind(stream.stream_id)
    .bind(ObjectStatus::Pending)
    .fetch_optional(&mut *conn)
    .await?;

    object.ok_or(MetabaseError::PendingObjectNotFound(stream.stream_id))
}

pub(crate) async fn fetch_segment(
    conn: &mut SqliteConnection,
    stream_id: Uuid,
    position: SegmentPosition,
) -> MetabaseResult<Option<Segment>> {
    let segment = sqlx::query_as::<_, Segment>(&format!(
        "SELECT {SEGMENT_COLUMNS} FROM segments WHERE stream_id = ? AND position = ?"
    ))
    .bind(stream_id)
    .bind(position.encode())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(segment)
}

pub(crate) async fn fetch_segments(
    conn: &mut SqliteConnection,
    stream_id: Uuid,
) -> MetabaseResult<Vec<Segment>> {
    let segments = sqlx::query_as::<_, Segment>(&format!(
        "SELECT {SEGMENT_COLUMNS} FROM segments WHERE stream_id = ? ORDER BY position ASC"
    ))
    .bind(stream_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(segments)
}

/// Validate the identity of an object stream before it reaches the store.
pub(crate) fn verify_object_stream(stream: &ObjectStream) -> MetabaseResult<()> {
    if stream.project_id.is_nil() {
        return Err(MetabaseError::invalid("ProjectID missing"));
    }
    if stream.bucket_name.is_empty() {
        return Err(MetabaseError::invalid("BucketName missing"));
    }
    if stream.object_key.is_empty() {
        return Err(MetabaseError::invalid("ObjectKey missing"));
    }
    if stream.version <= 0 {
        return Err(MetabaseError::invalid(format!(
            "Version invalid: {}",
            stream.version
        )));
    }
    if stream.stream_id.is_nil() {
        return Err(MetabaseError::invalid("StreamID missing"));
    }
    Ok(())
}
