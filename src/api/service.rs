// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::Json;
use serde::Serialize;

use crate::auth::extractor::Service;
use crate::auth::oidc::TokenSource;

#[derive(Debug, Serialize)]
pub struct WhoAmIResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub issuer: String,
    pub audience: String,
    pub source: TokenSource,
}

/// Echo the verified service caller.
pub async fn whoami(Service(caller): Service) -> Json<WhoAmIResponse> {
    Json(WhoAmIResponse {
        subject: caller.subject,
        email: caller.email,
        issuer: caller.issuer,
        audience: caller.audience,
        source: caller.source,
    })
}
