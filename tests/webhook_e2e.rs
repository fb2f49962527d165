// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Signed payment webhook through the full router, then replayed.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::{SecondsFormat, Utc};
use inbound_auth::api::router;
use inbound_auth::auth::hmac::{
    sign_request, HmacValidator, DEFAULT_NONCE_HEADER, DEFAULT_SIGNATURE_HEADER,
    DEFAULT_TIMESTAMP_HEADER,
};
use inbound_auth::auth::nonce::InMemoryNonceStore;
use inbound_auth::auth::secrets::StaticSecretProvider;
use inbound_auth::metrics::RecordingMetrics;
use inbound_auth::state::AppState;
use serde_json::Value;
use tower::ServiceExt;

const SECRET: &[u8] = b"whsec_e2e";
const PATH: &str = "/webhooks/payments/stripe";
const BODY: &[u8] = br#"{"event":"x"}"#;

fn app(metrics: &RecordingMetrics) -> Router {
    let secrets = StaticSecretProvider::new().with_secret("webhooks/stripe", SECRET);
    let hmac = HmacValidator::new(Arc::new(secrets), Arc::new(InMemoryNonceStore::new()))
        .with_metrics(Arc::new(metrics.clone()));
    let providers = HashMap::from([("stripe".to_string(), "webhooks/stripe".to_string())]);
    router(AppState::new(Arc::new(hmac), providers))
}

fn signed_request(timestamp: &str, nonce: &str) -> Request<Body> {
    let signature = sign_request(SECRET, &Method::POST, PATH, timestamp, nonce, BODY);
    Request::builder()
        .method(Method::POST)
        .uri(PATH)
        .header("content-type", "application/json")
        .header(DEFAULT_SIGNATURE_HEADER, signature)
        .header(DEFAULT_TIMESTAMP_HEADER, timestamp)
        .header(DEFAULT_NONCE_HEADER, nonce)
        .body(Body::from(BODY))
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn signed_webhook_is_accepted_once_then_replay_is_rejected() {
    let metrics = RecordingMetrics::new();
    let app = app(&metrics);
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

    let (status, body) = send(&app, signed_request(&timestamp, "nonce-e2e-1")).await;
    assert!(status.is_success(), "unexpected status {status}: {body}");
    assert_eq!(body["secret_name"], "webhooks/stripe");
    assert_eq!(body["provider"], "stripe");
    assert_eq!(body["received_bytes"], BODY.len());

    let (status, body) = send(&app, signed_request(&timestamp, "nonce-e2e-1")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], "nonce_replay");

    let counts = metrics.counts();
    assert_eq!(counts[&("hmac", "ok".to_string())], 1);
    assert_eq!(counts[&("hmac", "nonce_replay".to_string())], 1);
}

#[tokio::test]
async fn fresh_nonce_with_same_payload_is_accepted() {
    let metrics = RecordingMetrics::new();
    let app = app(&metrics);
    let timestamp = Utc::now().timestamp().to_string();

    let (status, _) = send(&app, signed_request(&timestamp, "nonce-a")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, signed_request(&timestamp, "nonce-b")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn signature_for_another_provider_path_is_rejected() {
    let metrics = RecordingMetrics::new();
    let app = app(&metrics);
    let timestamp = Utc::now().timestamp().to_string();

    let signature = sign_request(SECRET, &Method::POST, "/webhooks/payments/adyen", &timestamp, "n", BODY);
    let request = Request::builder()
        .method(Method::POST)
        .uri(PATH)
        .header(DEFAULT_SIGNATURE_HEADER, signature)
        .header(DEFAULT_TIMESTAMP_HEADER, &timestamp)
        .header(DEFAULT_NONCE_HEADER, "n")
        .body(Body::from(BODY))
        .unwrap();

    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], "signature_mismatch");
}
