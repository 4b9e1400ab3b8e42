use anyhow::Result;
use axum::Router;
use metabase::{
    MetabaseResult, config::AppConfig, db::DatabaseCollection,
    handlers::health_handlers::AppState, routes, services::PurgeChore,
};
use std::{io::ErrorKind, sync::Arc};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting metabase with config: {:?}", cfg);

    // --- Open every configured database ---
    let dbs = Arc::new(DatabaseCollection::open(&cfg.database_url, cfg.db_options()).await?);

    // --- Handle migration mode ---
    if migrate {
        dbs.migrate_to_latest().await?;
        tracing::info!("Database migration complete.");
        dbs.close().await;
        return Ok(()); // exit after migration
    }

    // --- Start purge chore ---
    let shutdown = CancellationToken::new();
    let chore = PurgeChore::new(dbs.metabase(), cfg.chore_config());
    let chore_shutdown = shutdown.clone();
    let chore_handle = tokio::spawn(async move {
        let result = chore.run(chore_shutdown.child_token()).await;
        if result.is_err() {
            // integrity violations take the whole daemon down
            chore_shutdown.cancel();
        }
        result
    });

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(AppState { dbs: dbs.clone() });

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Health endpoints listening on http://{}", listener.local_addr()?);

    let server_shutdown = shutdown.clone();
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
                _ = server_shutdown.cancelled() => {}
            }
        })
        .await;

    finish(serve_result, shutdown, chore_handle, &dbs).await
}

/// Stop the chore and release every pool, whether the server exited cleanly
/// or failed. A server error wins over a chore error.
async fn finish(
    serve_result: std::io::Result<()>,
    shutdown: CancellationToken,
    chore_handle: JoinHandle<MetabaseResult<()>>,
    dbs: &DatabaseCollection,
) -> Result<()> {
    shutdown.cancel();
    let chore_result = chore_handle.await;
    dbs.close().await;
    serve_result?;
    chore_result??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use metabase::db::DbOptions;
    use metabase::services::PurgeChoreConfig;
    use std::time::Duration;

    async fn running_chore(
        dbs: &DatabaseCollection,
        shutdown: &CancellationToken,
    ) -> JoinHandle<MetabaseResult<()>> {
        let config = PurgeChoreConfig {
            expired_interval: Duration::from_secs(60),
            zombie_interval: Duration::from_secs(60),
            batch_size: 0,
        };
        tokio::spawn(PurgeChore::new(dbs.metabase(), config).run(shutdown.child_token()))
    }

    #[tokio::test]
    async fn server_failure_still_stops_chore_and_closes_pools() {
        let dbs = DatabaseCollection::open("sqlite::memory:", DbOptions::default())
            .await
            .unwrap();
        dbs.migrate_to_latest().await.unwrap();
        let shutdown = CancellationToken::new();
        let chore = running_chore(&dbs, &shutdown).await;

        let err = finish(
            Err(std::io::Error::other("listener died")),
            shutdown.clone(),
            chore,
            &dbs,
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("listener died"));
        assert!(shutdown.is_cancelled());
        assert!(dbs.check_health().await.iter().all(|(_, r)| r.is_err()));
    }

    #[tokio::test]
    async fn clean_exit_is_ok() {
        let dbs = DatabaseCollection::open("sqlite::memory:", DbOptions::default())
            .await
            .unwrap();
        dbs.migrate_to_latest().await.unwrap();
        let shutdown = CancellationToken::new();
        let chore = running_chore(&dbs, &shutdown).await;

        finish(Ok(()), shutdown, chore, &dbs).await.unwrap();
    }
}
