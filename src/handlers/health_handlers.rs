//! Health & readiness handlers of the purge daemon.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that pings every configured database

use crate::db::DatabaseCollection;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub dbs: Arc<DatabaseCollection>,
}

/// `GET /healthz`
///
/// Very small liveness probe. Always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Runs `SELECT 1` against every database in the collection. HTTP 200 when
/// all answer, HTTP 503 when any fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let checks: BTreeMap<String, CheckStatus> = state
        .dbs
        .check_health()
        .await
        .into_iter()
        .map(|(name, result)| {
            let status = match result {
                Ok(()) => CheckStatus {
                    ok: true,
                    error: None,
                },
                Err(e) => CheckStatus {
                    ok: false,
                    error: Some(format!("error: {}", e)),
                },
            };
            (name, status)
        })
        .collect();

    let overall_ok = checks.values().all(|check| check.ok);
    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: BTreeMap<String, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbOptions;

    async fn state() -> AppState {
        let dbs = DatabaseCollection::open("sqlite::memory:", DbOptions::default())
            .await
            .unwrap();
        AppState { dbs: Arc::new(dbs) }
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        assert_eq!(healthz().await.into_response().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_tracks_database_availability() {
        let state = state().await;
        let ready = readyz(State(state.clone())).await.into_response();
        assert_eq!(ready.status(), StatusCode::OK);

        state.dbs.close().await;
        let ready = readyz(State(state)).await.into_response();
        assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
