//! Raw access used to verify store contents in tests and ops tooling.

use super::metabase::{Metabase, OBJECT_COLUMNS, SEGMENT_COLUMNS};
use crate::errors::{MetabaseError, MetabaseResult};
use crate::models::{Object, Segment};
use tracing::error;
use uuid::Uuid;

impl Metabase {
    /// Every object row, ordered by location and version.
    pub async fn testing_all_objects(&self) -> MetabaseResult<Vec<Object>> {
        let objects = sqlx::query_as::<_, Object>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             ORDER BY project_id, bucket_name, object_key, version"
        ))
        .fetch_all(&*self.db)
        .await?;
        Ok(objects)
    }

    /// Every segment row, ordered by stream id and position.
    pub async fn testing_all_segments(&self) -> MetabaseResult<Vec<Segment>> {
        let segments = sqlx::query_as::<_, Segment>(&format!(
            "SELECT {SEGMENT_COLUMNS} FROM segments ORDER BY stream_id, position"
        ))
        .fetch_all(&*self.db)
        .await?;
        Ok(segments)
    }

    /// Remove every segment and object.
    pub async fn testing_delete_all(&self) -> MetabaseResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM segments").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM objects").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Fail with `InvariantViolation` if any segment references a stream
    /// id that has no object row.
    pub async fn check_referential_integrity(&self) -> MetabaseResult<()> {
        let orphans: Vec<Uuid> = sqlx::query_scalar(
            "SELECT DISTINCT stream_id FROM segments
             WHERE stream_id NOT IN (SELECT stream_id FROM objects)
             ORDER BY stream_id",
        )
        .fetch_all(&*self.db)
        .await?;

        if orphans.is_empty() {
            return Ok(());
        }

        error!(streams = orphans.len(), "found segments without an object");
        let listed: Vec<String> = orphans.iter().map(Uuid::to_string).collect();
        Err(MetabaseError::InvariantViolation(format!(
            "segments without an object for streams {}",
            listed.join(", ")
        )))
    }
}
