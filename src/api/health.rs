// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::collections::BTreeMap;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::auth::jwks::{CacheState, JwksCache};
use crate::state::AppState;

/// Health check response with individual component status.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    /// Overall health status ("ok" or "degraded").
    pub status: String,
    pub checks: HealthChecks,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub service: String,
    /// JWKS status per verifier. Empty when no bearer auth is configured.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub jwks: BTreeMap<String, String>,
}

/// Simple health check response for liveness probes.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Usable keys right now, fetching them if the cache is cold or stale.
async fn check_jwks(jwks: &JwksCache) -> &'static str {
    match jwks.state() {
        CacheState::Fresh | CacheState::Prefetch => "ok",
        CacheState::Cold | CacheState::Stale => match jwks.refresh().await {
            Ok(()) => "ok",
            Err(_) => "unavailable",
        },
    }
}

/// Health check endpoint handler.
///
/// Returns 200 if all checks pass, 503 if any check fails.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let mut jwks = BTreeMap::new();
    for (name, cache) in &state.jwks {
        jwks.insert(name.to_string(), check_jwks(cache).await.to_string());
    }
    let all_ok = jwks.values().all(|status| status == "ok");

    let response = ReadyResponse {
        status: if all_ok { "ok" } else { "degraded" }.to_string(),
        checks: HealthChecks {
            service: "ok".to_string(),
            jwks,
        },
    };

    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(response))
}

/// Liveness probe handler.
///
/// Always returns 200 if the process is running.
pub async fn liveness() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}
