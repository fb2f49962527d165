// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Access to what the guards attached to a request.
//!
//! Guards insert their result into the request extensions only after
//! verification succeeds. Handlers read it with the accessor functions or,
//! more conveniently, with the extractors:
//!
//! ```rust,ignore
//! async fn handle(Webhook(meta): Webhook, body: Bytes) -> impl IntoResponse { .. }
//! async fn whoami(Service(caller): Service) -> impl IntoResponse { .. }
//! async fn me(User(user): User) -> impl IntoResponse { .. }
//! ```
//!
//! An extractor used on a route without the matching guard rejects with
//! `unauthenticated` (401) instead of letting the handler run.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, Extensions, HeaderMap},
};

use super::error::AuthError;
use super::hmac::HmacMetadata;
use super::identity::Identity;
use super::oidc::ServiceIdentity;

/// Metadata attached by the HMAC guard.
pub fn hmac_metadata(extensions: &Extensions) -> Option<&HmacMetadata> {
    extensions.get::<HmacMetadata>()
}

/// Caller attached by the OIDC guard.
pub fn service_identity(extensions: &Extensions) -> Option<&ServiceIdentity> {
    extensions.get::<ServiceIdentity>()
}

/// End user attached by the Firebase guard.
pub fn identity(extensions: &Extensions) -> Option<&Identity> {
    extensions.get::<Identity>()
}

/// Token from `Authorization: Bearer <token>`. The scheme is matched
/// case-insensitively.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Verified webhook metadata.
pub struct Webhook(pub HmacMetadata);

impl<S: Send + Sync> FromRequestParts<S> for Webhook {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        hmac_metadata(&parts.extensions)
            .cloned()
            .map(Webhook)
            .ok_or(AuthError::Unauthenticated)
    }
}

/// Verified service caller.
pub struct Service(pub ServiceIdentity);

impl<S: Send + Sync> FromRequestParts<S> for Service {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        service_identity(&parts.extensions)
            .cloned()
            .map(Service)
            .ok_or(AuthError::Unauthenticated)
    }
}

/// Verified end user.
pub struct User(pub Identity);

impl<S: Send + Sync> FromRequestParts<S> for User {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        identity(&parts.extensions)
            .cloned()
            .map(User)
            .ok_or(AuthError::Unauthenticated)
    }
}
