//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks SQLite and the attribute store

use crate::handlers::AppState;
use crate::services::metadata_codec;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Very small liveness probe — always returns 200 OK with a plain JSON body.
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
/// Readiness probe with two checks:
/// 1. A lightweight query against SQLite (`SELECT 1`).
/// 2. An attribute round-trip under the storage directory. Trigger bindings
///    live in extended attributes, so a volume that stopped supporting them
///    (or filled up) makes the service useless even while plain file I/O
///    still works.
///
/// Returns JSON describing each check. HTTP 200 when all checks pass,
/// HTTP 503 when any check fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let sqlite = CheckStatus::from(
        match sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*state.storage.db)
            .await
        {
            Ok(1) => Ok(()),
            Ok(v) => Err(format!("unexpected result: {}", v)),
            Err(e) => Err(format!("error: {}", e)),
        },
    );

    let base = state.storage.base_path.clone();
    let attributes = CheckStatus::from(
        match tokio::task::spawn_blocking(move || metadata_codec::probe_attribute_support(&base))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("error: {}", e)),
            Err(e) => Err(format!("probe did not finish: {}", e)),
        },
    );

    let ok = sqlite.ok && attributes.ok;
    let mut checks = HashMap::new();
    checks.insert("sqlite", sqlite);
    checks.insert("attributes", attributes);

    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            status: if ok { "ok".into() } else { "error".into() },
            checks,
        }),
    )
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl From<Result<(), String>> for CheckStatus {
    fn from(result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self {
                ok: true,
                error: None,
            },
            Err(error) => Self {
                ok: false,
                error: Some(error),
            },
        }
    }
}
