// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::Json;
use serde::Serialize;

use crate::auth::extractor::User;

/// Current user as seen by the API.
#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub roles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

pub async fn me(User(user): User) -> Json<MeResponse> {
    Json(MeResponse {
        uid: user.uid().to_string(),
        email: user.email().map(str::to_string),
        roles: user.roles().iter().cloned().collect(),
        locale: user.locale().map(str::to_string),
    })
}
