// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    http::{HeaderName, Request},
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::auth::{firebase::require_firebase_auth, hmac::require_hmac, oidc::require_oidc};
use crate::state::AppState;

pub mod health;
pub mod me;
pub mod service;
pub mod webhooks;

const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .with_state(state.clone())
        .merge(
            Router::new()
                .route("/webhooks/payments/{provider}", post(webhooks::receive_payment))
                .route_layer(from_fn_with_state(state.webhooks.clone(), require_hmac)),
        );

    if let Some(guard) = state.service.clone() {
        app = app.merge(
            Router::new()
                .route("/internal/whoami", get(service::whoami))
                .route_layer(from_fn_with_state(guard, require_oidc)),
        );
    }

    if let Some(handle) = state.prometheus.clone() {
        app = app.route("/metrics", get(move || async move { handle.render() }));
    }

    if let Some(guard) = state.users.clone() {
        app = app.merge(
            Router::new()
                .route("/v1/me", get(me::me))
                .route_layer(from_fn_with_state(guard, require_firebase_auth)),
        );
    }

    let x_request_id = HeaderName::from_static(REQUEST_ID_HEADER);
    app.layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                    request_id = %request_id,
                )
            }),
        )
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::firebase::{FirebaseAuthenticator, TokenVerifier, TokenVerifyError, VerifiedToken};
    use crate::auth::hmac::HmacValidator;
    use crate::auth::nonce::InMemoryNonceStore;
    use crate::auth::secrets::StaticSecretProvider;
    use crate::metrics::{CounterMetrics, MetricsRecorder};
    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{header::AUTHORIZATION, StatusCode},
    };
    use serde_json::{json, Map, Value};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    struct OneUser;

    #[async_trait]
    impl TokenVerifier for OneUser {
        async fn verify_id_token(&self, token: &str) -> Result<VerifiedToken, TokenVerifyError> {
            if token != "good" {
                return Err(TokenVerifyError::Invalid("unknown token".to_string()));
            }
            let mut claims = Map::new();
            claims.insert("roles".to_string(), json!(["Admin"]));
            claims.insert("email".to_string(), json!("ada@example.com"));
            Ok(VerifiedToken {
                uid: "uid-ada".to_string(),
                claims,
            })
        }
    }

    fn state() -> AppState {
        let hmac = HmacValidator::new(
            Arc::new(StaticSecretProvider::new().with_secret("webhooks/stripe", "whsec")),
            Arc::new(InMemoryNonceStore::new()),
        );
        let providers = HashMap::from([("stripe".to_string(), "webhooks/stripe".to_string())]);
        AppState::new(Arc::new(hmac), providers)
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value, Option<String>) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json, request_id)
    }

    #[tokio::test]
    async fn health_is_public_and_tagged_with_request_id() {
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body, request_id) = call(router(state()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert!(request_id.is_some());
    }

    #[tokio::test]
    async fn unsigned_webhook_is_rejected() {
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/payments/stripe")
            .body(Body::from("{}"))
            .unwrap();
        let (status, body, _) = call(router(state()), request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error_code"], "signature_missing");
    }

    #[tokio::test]
    async fn unregistered_provider_is_unknown() {
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/payments/paypal")
            .body(Body::from("{}"))
            .unwrap();
        let (status, body, _) = call(router(state()), request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error_code"], "unknown_provider");
    }

    #[tokio::test]
    async fn metrics_route_renders_decision_counters() {
        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let (status, _, _) = call(router(state()), request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        ::metrics::with_local_recorder(&recorder, || {
            CounterMetrics.record("hmac", false, "signature_mismatch", Duration::from_millis(1));
        });
        let app = router(state().with_prometheus(handle));

        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains(r#"reason="signature_mismatch""#), "{text}");
    }

    #[tokio::test]
    async fn bearer_routes_exist_only_when_configured() {
        let request = Request::builder().uri("/v1/me").body(Body::empty()).unwrap();
        let (status, _, _) = call(router(state()), request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let authenticator = Arc::new(FirebaseAuthenticator::new(Arc::new(OneUser)));
        let app = router(state().with_user_auth(authenticator, None));

        let request = Request::builder()
            .uri("/v1/me")
            .header(AUTHORIZATION, "Bearer good")
            .body(Body::empty())
            .unwrap();
        let (status, body, _) = call(app.clone(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["uid"], "uid-ada");
        assert_eq!(body["roles"], json!(["admin"]));

        let request = Request::builder()
            .uri("/v1/me")
            .header(AUTHORIZATION, "Bearer bad")
            .body(Body::empty())
            .unwrap();
        let (status, body, _) = call(app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error_code"], "token_invalid");
    }
}
