//! Routes of the purge daemon.
//!
//! - `GET /healthz`: liveness
//! - `GET /readyz`: readiness across every configured database

use crate::handlers::health_handlers::{AppState, healthz, readyz};
use axum::{Router, routing::get};

/// Build and return the router carrying `AppState` to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}
