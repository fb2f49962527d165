// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{body::Bytes, extract::Path, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::auth::extractor::Webhook;

/// Acknowledgement returned to the webhook sender.
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub provider: String,
    pub secret_name: String,
    pub nonce: String,
    pub signed_at: DateTime<Utc>,
    pub received_bytes: usize,
}

/// Receive a verified payment webhook.
///
/// Only reachable through the HMAC guard, so the body is authentic and
/// has not been seen before.
pub async fn receive_payment(
    Path(provider): Path<String>,
    Webhook(meta): Webhook,
    body: Bytes,
) -> Json<WebhookAck> {
    info!(
        provider = %provider,
        secret_name = %meta.secret_name,
        bytes = body.len(),
        "Payment webhook accepted"
    );

    Json(WebhookAck {
        provider,
        secret_name: meta.secret_name,
        nonce: meta.nonce,
        signed_at: meta.timestamp,
        received_bytes: body.len(),
    })
}
