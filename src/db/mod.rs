//! Transactional storage layer.
//!
//! Every logical database is a SQLite pool. A [`DatabaseCollection`] holds
//! the default store plus any stores named in the database mapping, and
//! routes logical names to handles. Only names on the partitionable
//! allow-list are ever routed away from the default store.

mod mapping;

pub use mapping::parse_db_mapping;

use crate::errors::{MetabaseError, MetabaseResult, MultiError};
use crate::services::metabase::{Metabase, MetabaseConfig};
use futures::future::join_all;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::{
    collections::HashMap,
    str::FromStr,
    sync::{Arc, OnceLock},
    time::Duration,
};
use tracing::{debug, info, warn};

/// Key of the default store in a database mapping.
pub const DEFAULT_DB: &str = "";

/// Logical name of the store holding objects and segments.
pub const METABASE_DB: &str = "metabase";

/// Logical databases that may be hosted on a separate physical store.
///
/// Only list a name here after checking it never joins across stores.
const SAFELY_PARTITIONABLE_DBS: &[&str] = &[METABASE_DB];

/// Ordered schema migrations. The index + 1 is the schema version.
const MIGRATIONS: &[&str] = &[include_str!("../../migrations/0001_init.sql")];

/// Connection settings applied to every store in a collection.
#[derive(Clone, Debug)]
pub struct DbOptions {
    pub max_connections: u32,
    pub busy_timeout: Duration,
    pub metabase: MetabaseConfig,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            busy_timeout: Duration::from_secs(5),
            metabase: MetabaseConfig::default(),
        }
    }
}

/// One physical store and the sub-resources lazily built on top of it.
pub struct DatabaseHandle {
    name: String,
    pool: Arc<SqlitePool>,
    opts: DbOptions,

    metabase: OnceLock<Arc<Metabase>>,
}

impl DatabaseHandle {
    /// Open a pool for `url`. In-memory databases are pinned to a single
    /// connection that is never recycled, since every connection would
    /// otherwise see its own empty database.
    pub async fn connect(name: &str, url: &str, opts: DbOptions) -> MetabaseResult<Self> {
        let in_memory = is_in_memory(url);
        let mut connect = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(opts.busy_timeout);

        let mut pool_opts = SqlitePoolOptions::new();
        if in_memory {
            pool_opts = pool_opts
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            connect = connect.journal_mode(SqliteJournalMode::Wal);
            pool_opts = pool_opts.max_connections(opts.max_connections);

            // Create parent directory if needed
            if let Some(parent) = connect.get_filename().parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
                    info!("Created missing directory {:?}", parent);
                }
            }
        }

        let pool = pool_opts.connect_with(connect).await?;
        let label = display_name(name);
        debug!(db = label, "connected to {}", url);

        Ok(Self {
            name: name.to_string(),
            pool: Arc::new(pool),
            opts,
            metabase: OnceLock::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &Arc<SqlitePool> {
        &self.pool
    }

    /// The metabase service bound to this store, built on first use and
    /// shared by every later caller.
    pub fn metabase(&self) -> Arc<Metabase> {
        self.metabase
            .get_or_init(|| {
                debug!(db = display_name(&self.name), "initializing metabase");
                Arc::new(Metabase::new(
                    self.pool.clone(),
                    self.opts.metabase.clone(),
                ))
            })
            .clone()
    }

    /// Current schema version, from `PRAGMA user_version`.
    pub async fn schema_version(&self) -> MetabaseResult<usize> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&*self.pool)
            .await?;
        Ok(usize::try_from(version).unwrap_or_default())
    }

    /// Apply every migration newer than the stored schema version. Each
    /// migration runs in its own transaction together with the version bump.
    pub async fn migrate_to_latest(&self) -> MetabaseResult<()> {
        let current = self.schema_version().await?;
        let label = display_name(&self.name);

        for (idx, sql) in MIGRATIONS.iter().enumerate().skip(current) {
            let version = idx + 1;
            let statements = sql
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>();

            info!(
                db = label,
                version,
                "Running {} migration statements...",
                statements.len()
            );

            let mut tx = self.pool.begin().await?;
            for stmt in statements {
                debug!("Executing migration SQL: {}", stmt);
                sqlx::query(stmt).execute(&mut *tx).await?;
            }
            sqlx::query(&format!("PRAGMA user_version = {}", version))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }

        Ok(())
    }

    /// Run a trivial query to confirm the store answers.
    pub async fn ping(&self) -> MetabaseResult<()> {
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&*self.pool).await?;
        if one != 1 {
            return Err(MetabaseError::invalid(format!(
                "unexpected ping result: {}",
                one
            )));
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// All configured stores, routed by logical name.
pub struct DatabaseCollection {
    default: Arc<DatabaseHandle>,
    named: HashMap<String, Arc<DatabaseHandle>>,
}

impl DatabaseCollection {
    /// Open every store listed in `database_url` (see [`parse_db_mapping`]).
    /// Stores already opened are closed again if a later one fails.
    pub async fn open(database_url: &str, opts: DbOptions) -> MetabaseResult<Self> {
        let mapping = parse_db_mapping(database_url)?;

        let mut opened: Vec<DatabaseHandle> = Vec::with_capacity(mapping.len());
        for (name, url) in &mapping {
            if !name.is_empty() && !SAFELY_PARTITIONABLE_DBS.contains(&name.as_str()) {
                warn!(
                    db = name.as_str(),
                    "database is not partitionable; it is opened but never routed to"
                );
            }
            match DatabaseHandle::connect(name, url, opts.clone()).await {
                Ok(handle) => opened.push(handle),
                Err(err) => {
                    join_all(opened.iter().map(DatabaseHandle::close)).await;
                    return Err(err);
                }
            }
        }

        let mut named: HashMap<String, Arc<DatabaseHandle>> = opened
            .into_iter()
            .map(|handle| (handle.name.clone(), Arc::new(handle)))
            .collect();
        let default = named
            .remove(DEFAULT_DB)
            .ok_or_else(|| MetabaseError::UnknownDatabase("default".into()))?;

        Ok(Self { default, named })
    }

    /// Handle for a logical database. Names off the partitionable
    /// allow-list, or absent from the mapping, resolve to the default store.
    pub fn get_by_name(&self, name: &str) -> &Arc<DatabaseHandle> {
        if SAFELY_PARTITIONABLE_DBS.contains(&name) {
            if let Some(handle) = self.named.get(name) {
                return handle;
            }
        }
        &self.default
    }

    /// The metabase service, routed through [`METABASE_DB`].
    pub fn metabase(&self) -> Arc<Metabase> {
        self.get_by_name(METABASE_DB).metabase()
    }

    /// Every opened store, default first.
    pub fn handles(&self) -> impl Iterator<Item = &Arc<DatabaseHandle>> {
        std::iter::once(&self.default).chain(self.named.values())
    }

    /// Migrate every store to the latest schema. Failures are combined.
    pub async fn migrate_to_latest(&self) -> MetabaseResult<()> {
        let results = join_all(self.handles().map(|db| db.migrate_to_latest())).await;
        MultiError(results.into_iter().filter_map(Result::err).collect()).into_result()
    }

    /// Ping every store, returning one result per store name.
    pub async fn check_health(&self) -> Vec<(String, MetabaseResult<()>)> {
        let handles: Vec<&Arc<DatabaseHandle>> = self.handles().collect();
        let results = join_all(handles.iter().map(|db| db.ping())).await;
        handles
            .into_iter()
            .map(|db| display_name(&db.name).to_string())
            .zip(results)
            .collect()
    }

    pub async fn close(&self) {
        join_all(self.handles().map(|db| db.close())).await;
    }
}

fn display_name(name: &str) -> &str {
    if name.is_empty() { "default" } else { name }
}

fn is_in_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}
