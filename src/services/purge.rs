//! Bounded batch purge.
//!
//! A purge repeatedly selects up to `batch_size` objects matching a filter,
//! ordered by stream id, and deletes their segments and then the object
//! rows in one transaction per batch. The loop ends on the first empty
//! selection. Committed batches stay deleted if a later batch fails, so a
//! purge can always be re-invoked to continue.

use super::metabase::Metabase;
use crate::errors::{ErrorKind, MetabaseError, MetabaseResult};
use crate::models::ObjectStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Batch size used when the caller passes 0 and the service has no default.
pub const DEFAULT_PURGE_BATCH_SIZE: usize = 1000;

/// Upper bound on a batch, keeping bound parameters well under SQLite's limit.
pub const MAX_PURGE_BATCH_SIZE: usize = 10_000;

/// Options for [`Metabase::delete_expired_objects`].
#[derive(Clone, Copy, Debug)]
pub struct DeleteExpiredObjects {
    pub expired_before: DateTime<Utc>,
    /// 0 selects the default batch size.
    pub batch_size: usize,
}

/// Options for [`Metabase::delete_zombie_objects`].
#[derive(Clone, Copy, Debug)]
pub struct DeleteZombieObjects {
    pub deadline_before: DateTime<Utc>,
    /// 0 selects the default batch size.
    pub batch_size: usize,
}

/// Progress of a purge.
#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub deleted_objects: u64,
    pub deleted_segments: u64,
    /// Batches that deleted at least one object.
    pub batches: u64,
}

/// Which objects a purge removes.
#[derive(Clone, Copy, Debug)]
pub(crate) enum PurgeFilter {
    /// Objects of any status whose expiration is set and before the cutoff.
    Expired { before: DateTime<Utc> },
    /// Pending objects whose zombie deadline is before the cutoff. Status
    /// gates the match; the deadline of a committed object is ignored.
    Zombie { before: DateTime<Utc> },
}

impl PurgeFilter {
    fn name(&self) -> &'static str {
        match self {
            Self::Expired { .. } => "expired",
            Self::Zombie { .. } => "zombie",
        }
    }

    /// Append the filter as a boolean SQL expression over `objects` columns.
    fn push_predicate(&self, query: &mut QueryBuilder<'_, Sqlite>) {
        match *self {
            Self::Expired { before } => {
                query.push("(expires_at IS NOT NULL AND expires_at < ");
                query.push_bind(before);
                query.push(")");
            }
            Self::Zombie { before } => {
                query.push("(status = ");
                query.push_bind(ObjectStatus::Pending);
                query.push(" AND zombie_deletion_deadline IS NOT NULL AND zombie_deletion_deadline < ");
                query.push_bind(before);
                query.push(")");
            }
        }
    }
}

struct BatchOutcome {
    deleted_objects: u64,
    deleted_segments: u64,
    last_stream_id: Uuid,
}

impl Metabase {
    /// Delete every object, pending or committed, whose expiration is
    /// before `opts.expired_before`, together with its segments.
    pub async fn delete_expired_objects(
        &self,
        opts: DeleteExpiredObjects,
        cancel: &CancellationToken,
    ) -> MetabaseResult<PurgeReport> {
        self.purge(
            PurgeFilter::Expired {
                before: opts.expired_before,
            },
            opts.batch_size,
            cancel,
        )
        .await
    }

    /// Delete every pending object whose zombie deadline is before
    /// `opts.deadline_before`, together with its segments.
    pub async fn delete_zombie_objects(
        &self,
        opts: DeleteZombieObjects,
        cancel: &CancellationToken,
    ) -> MetabaseResult<PurgeReport> {
        self.purge(
            PurgeFilter::Zombie {
                before: opts.deadline_before,
            },
            opts.batch_size,
            cancel,
        )
        .await
    }

    fn effective_batch_size(&self, requested: usize) -> usize {
        let size = match requested {
            0 => self.config().default_batch_size,
            n => n,
        };
        match size {
            0 => DEFAULT_PURGE_BATCH_SIZE,
            n => n.min(MAX_PURGE_BATCH_SIZE),
        }
    }

    /// Run batches until a selection comes back empty.
    ///
    /// Cancellation is observed before each batch and while one is in
    /// flight; an interrupted batch is dropped with its transaction, which
    /// rolls it back. Any failure is returned wrapped with the progress made
    /// by earlier, already committed batches.
    pub(crate) async fn purge(
        &self,
        filter: PurgeFilter,
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> MetabaseResult<PurgeReport> {
        let batch_size = self.effective_batch_size(batch_size);
        let mut report = PurgeReport::default();
        let mut cursor: Option<Uuid> = None;

        loop {
            let batch = if cancel.is_cancelled() {
                Err(MetabaseError::Canceled)
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(MetabaseError::Canceled),
                    result = self.purge_batch(filter, batch_size, cursor) => result,
                }
            };

            match batch {
                Ok(None) => break,
                Ok(Some(outcome)) => {
                    report.deleted_objects += outcome.deleted_objects;
                    report.deleted_segments += outcome.deleted_segments;
                    report.batches += 1;
                    cursor = Some(outcome.last_stream_id);
                    debug!(
                        purge = filter.name(),
                        batch = report.batches,
                        objects = outcome.deleted_objects,
                        segments = outcome.deleted_segments,
                        "purge batch committed"
                    );
                }
                Err(err) => {
                    match err.kind() {
                        ErrorKind::InvariantViolation => error!(
                            purge = filter.name(),
                            error = %err,
                            "purge batch broke referential integrity"
                        ),
                        ErrorKind::Canceled => info!(
                            purge = filter.name(),
                            deleted_objects = report.deleted_objects,
                            "purge canceled"
                        ),
                        _ => warn!(
                            purge = filter.name(),
                            deleted_objects = report.deleted_objects,
                            error = %err,
                            "purge batch failed"
                        ),
                    }
                    return Err(MetabaseError::BatchFailed {
                        batch: report.batches + 1,
                        deleted_objects: report.deleted_objects,
                        deleted_segments: report.deleted_segments,
                        source: Box::new(err),
                    });
                }
            }
        }

        info!(
            purge = filter.name(),
            deleted_objects = report.deleted_objects,
            deleted_segments = report.deleted_segments,
            batches = report.batches,
            "purge finished"
        );
        Ok(report)
    }

    /// One bounded transaction. Returns `None` when nothing matched.
    async fn purge_batch(
        &self,
        filter: PurgeFilter,
        batch_size: usize,
        after: Option<Uuid>,
    ) -> MetabaseResult<Option<BatchOutcome>> {
        let mut tx = self.db.begin().await?;

        let mut select = QueryBuilder::<Sqlite>::new("SELECT stream_id FROM objects WHERE ");
        filter.push_predicate(&mut select);
        if let Some(after) = after {
            select.push(" AND stream_id > ");
            select.push_bind(after);
        }
        select.push(" ORDER BY stream_id ASC LIMIT ");
        select.push_bind(batch_size as i64);

        let stream_ids: Vec<Uuid> = select.build_query_scalar().fetch_all(&mut *tx).await?;
        let Some(&last_stream_id) = stream_ids.last() else {
            tx.rollback().await?;
            return Ok(None);
        };

        // The predicate is re-applied so an object that stopped matching
        // since the selection keeps both its row and its segments.
        let mut delete_segments = QueryBuilder::<Sqlite>::new(
            "DELETE FROM segments WHERE stream_id IN (SELECT stream_id FROM objects WHERE ",
        );
        push_stream_id_filter(&mut delete_segments, &stream_ids);
        delete_segments.push(" AND ");
        filter.push_predicate(&mut delete_segments);
        delete_segments.push(")");
        let deleted_segments = delete_segments
            .build()
            .execute(&mut *tx)
            .await?
            .rows_affected();

        // A segment still referencing one of these objects fails the foreign
        // key here, which surfaces as InvariantViolation and rolls back.
        let mut delete_objects = QueryBuilder::<Sqlite>::new("DELETE FROM objects WHERE ");
        push_stream_id_filter(&mut delete_objects, &stream_ids);
        delete_objects.push(" AND ");
        filter.push_predicate(&mut delete_objects);
        let deleted_objects = delete_objects
            .build()
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        Ok(Some(BatchOutcome {
            deleted_objects,
            deleted_segments,
            last_stream_id,
        }))
    }
}

/// Append `stream_id IN (?, ?, ...)`.
fn push_stream_id_filter(query: &mut QueryBuilder<'_, Sqlite>, stream_ids: &[Uuid]) {
    query.push("stream_id IN (");
    let mut separated = query.separated(", ");
    for stream_id in stream_ids {
        separated.push_bind(*stream_id);
    }
    separated.push_unseparated(")");
}
