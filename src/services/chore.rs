//! Background chore that periodically purges expired and zombie objects.

use super::metabase::Metabase;
use super::purge::{DeleteExpiredObjects, DeleteZombieObjects, PurgeReport};
use crate::errors::{ErrorKind, MetabaseError, MetabaseResult};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Clone, Debug)]
pub struct PurgeChoreConfig {
    pub expired_interval: Duration,
    pub zombie_interval: Duration,
    /// 0 selects the metabase default.
    pub batch_size: usize,
}

/// Runs both purges on their own intervals until cancelled.
///
/// A failed purge is logged and retried on the next tick; deletions from
/// batches committed before the failure are kept. A referential integrity
/// violation is never retried: the chore stops and returns it.
pub struct PurgeChore {
    metabase: Arc<Metabase>,
    config: PurgeChoreConfig,
}

impl PurgeChore {
    pub fn new(metabase: Arc<Metabase>, config: PurgeChoreConfig) -> Self {
        Self { metabase, config }
    }

    pub async fn run(self, cancel: CancellationToken) -> MetabaseResult<()> {
        let mut expired_ticker = interval(self.config.expired_interval);
        expired_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut zombie_ticker = interval(self.config.zombie_interval);
        zombie_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            expired_interval = ?self.config.expired_interval,
            zombie_interval = ?self.config.zombie_interval,
            "purge chore started"
        );

        loop {
            let fatal = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = expired_ticker.tick() => {
                    check_outcome("expired", self.delete_expired_once(&cancel).await)
                }
                _ = zombie_ticker.tick() => {
                    check_outcome("zombie", self.delete_zombies_once(&cancel).await)
                }
            };
            if let Some(err) = fatal {
                error!(error = %err, "purge chore stopped on integrity violation");
                return Err(err);
            }
        }

        info!("purge chore stopped");
        Ok(())
    }

    pub async fn delete_expired_once(
        &self,
        cancel: &CancellationToken,
    ) -> MetabaseResult<PurgeReport> {
        self.metabase
            .delete_expired_objects(
                DeleteExpiredObjects {
                    expired_before: Utc::now(),
                    batch_size: self.config.batch_size,
                },
                cancel,
            )
            .await
    }

    pub async fn delete_zombies_once(
        &self,
        cancel: &CancellationToken,
    ) -> MetabaseResult<PurgeReport> {
        self.metabase
            .delete_zombie_objects(
                DeleteZombieObjects {
                    deadline_before: Utc::now(),
                    batch_size: self.config.batch_size,
                },
                cancel,
            )
            .await
    }
}

/// Log a purge run. Returns the error only when it must stop the chore.
fn check_outcome(purge: &str, outcome: MetabaseResult<PurgeReport>) -> Option<MetabaseError> {
    match outcome {
        Ok(report) => {
            if report.deleted_objects > 0 {
                info!(
                    purge,
                    deleted_objects = report.deleted_objects,
                    deleted_segments = report.deleted_segments,
                    "purge chore removed objects"
                );
            }
            None
        }
        Err(err) => match err.kind() {
            ErrorKind::InvariantViolation => Some(err),
            ErrorKind::Canceled => None,
            _ => {
                warn!(purge, error = %err, "purge chore run failed");
                None
            }
        },
    }
}
