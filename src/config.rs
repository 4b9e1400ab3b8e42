use crate::db::DbOptions;
use crate::services::{MetabaseConfig, PurgeChoreConfig};
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized daemon configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Database mapping, see [`crate::db::parse_db_mapping`].
    pub database_url: String,
    pub max_connections: u32,
    pub purge_batch_size: usize,
    pub expired_interval: Duration,
    pub zombie_interval: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Object metadata engine and purge daemon")]
pub struct Args {
    /// Host to bind the health listener to (overrides METABASE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind the health listener to (overrides METABASE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database mapping (overrides METABASE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Connections per database pool (overrides METABASE_MAX_CONNECTIONS)
    #[arg(long)]
    pub max_connections: Option<u32>,

    /// Objects deleted per purge transaction, 0 for the default (overrides METABASE_PURGE_BATCH_SIZE)
    #[arg(long)]
    pub purge_batch_size: Option<usize>,

    /// Seconds between expired-object purges (overrides METABASE_EXPIRED_INTERVAL_SECS)
    #[arg(long)]
    pub expired_interval_secs: Option<u64>,

    /// Seconds between zombie-object purges (overrides METABASE_ZOMBIE_INTERVAL_SECS)
    #[arg(long)]
    pub zombie_interval_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        Self::resolve(args, |name| env::var(name))
    }

    /// Merge parsed args over values read through `lookup`, falling back to
    /// defaults for anything unset.
    pub fn resolve<F>(args: Args, lookup: F) -> Result<(Self, bool)>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        // --- Environment fallback ---
        let env_host = lookup("METABASE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_number(&lookup, "METABASE_PORT", 3000)?;
        let env_db = lookup("METABASE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/metabase.db".into());
        let env_max_connections = env_number(&lookup, "METABASE_MAX_CONNECTIONS", 5)?;
        let env_batch = env_number(&lookup, "METABASE_PURGE_BATCH_SIZE", 0)?;
        let env_expired = env_number(&lookup, "METABASE_EXPIRED_INTERVAL_SECS", 3600)?;
        let env_zombie = env_number(&lookup, "METABASE_ZOMBIE_INTERVAL_SECS", 3600)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            max_connections: args.max_connections.unwrap_or(env_max_connections),
            purge_batch_size: args.purge_batch_size.unwrap_or(env_batch),
            expired_interval: Duration::from_secs(
                args.expired_interval_secs.unwrap_or(env_expired).max(1),
            ),
            zombie_interval: Duration::from_secs(
                args.zombie_interval_secs.unwrap_or(env_zombie).max(1),
            ),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn db_options(&self) -> DbOptions {
        DbOptions {
            max_connections: self.max_connections,
            metabase: MetabaseConfig::default(),
            ..DbOptions::default()
        }
    }

    pub fn chore_config(&self) -> PurgeChoreConfig {
        PurgeChoreConfig {
            expired_interval: self.expired_interval,
            zombie_interval: self.zombie_interval,
            batch_size: self.purge_batch_size,
        }
    }
}

fn env_number<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Result<String, env::VarError>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
