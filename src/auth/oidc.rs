// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Service-to-service OIDC / IAP token verification.
//!
//! ## Flow
//!
//! 1. Take the token from `Authorization: Bearer <token>`, or failing that
//!    from `X-Goog-Iap-Jwt-Assertion`
//! 2. Require RS256 and resolve the key by `kid` through [`JwksCache`]
//! 3. Verify signature and expiry
//! 4. Check `iss` against the allowlist (empty allowlist accepts any issuer)
//! 5. Check that `aud` (string or array) contains the expected audience exactly
//! 6. Attach a [`ServiceIdentity`] to the request
//!
//! A JWKS outage is reported as `jwks_unavailable` but still answered with
//! 401: a token whose keys cannot be fetched is not authenticated.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, Header, Validation};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, warn};

use super::error::AuthError;
use super::extractor::bearer_token;
use super::jwks::{JwksCache, JwksError};
use crate::metrics::{CounterMetrics, SharedMetrics, REASON_OK};

/// Header carrying the IAP-forwarded identity token.
pub const IAP_ASSERTION_HEADER: &str = "x-goog-iap-jwt-assertion";

/// Clock skew tolerance for `exp`/`nbf`.
pub const DEFAULT_LEEWAY: Duration = Duration::from_secs(60);

const METRIC_KIND: &str = "oidc";

/// Expected audience and issuers for one protected surface.
#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub audience: String,
    /// Empty accepts any issuer.
    pub allowed_issuers: Vec<String>,
    pub leeway: Duration,
}

impl OidcConfig {
    pub fn new(audience: impl Into<String>) -> Self {
        Self {
            audience: audience.into(),
            allowed_issuers: Vec::new(),
            leeway: DEFAULT_LEEWAY,
        }
    }

    pub fn with_allowed_issuers<I, S>(mut self, issuers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_issuers = issuers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }
}

/// Where the token was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TokenSource {
    Authorization,
    IapAssertion,
}

/// Verified service caller. Built per request, never cached.
#[derive(Clone)]
pub struct ServiceIdentity {
    pub subject: String,
    pub email: Option<String>,
    pub issuer: String,
    /// The configured audience the token was confirmed for.
    pub audience: String,
    pub claims: Map<String, Value>,
    pub header: Header,
    /// Raw token. Never log this.
    pub token: String,
    pub source: TokenSource,
}

impl std::fmt::Debug for ServiceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceIdentity")
            .field("subject", &self.subject)
            .field("email", &self.email)
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// Verifies RS256 service tokens against a JWKS.
pub struct OidcValidator {
    jwks: JwksCache,
    metrics: SharedMetrics,
}

impl OidcValidator {
    pub fn new(jwks: JwksCache) -> Self {
        Self {
            jwks,
            metrics: Arc::new(CounterMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn jwks(&self) -> &JwksCache {
        &self.jwks
    }

    /// Guard for one audience/issuer configuration.
    pub fn require(self: &Arc<Self>, config: OidcConfig) -> RequireOidc {
        RequireOidc {
            validator: Arc::clone(self),
            config: Arc::new(config),
        }
    }

    /// Verify a token and build the identity.
    pub async fn verify(
        &self,
        token: &str,
        source: TokenSource,
        config: &OidcConfig,
    ) -> Result<ServiceIdentity, AuthError> {
        // Unknown algorithms (including "none") fail to decode here.
        let header = decode_header(token).map_err(|_| AuthError::TokenInvalid)?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::TokenInvalid);
        }

        let key = self.jwks.key_for_header(&header).await.map_err(|e| match e {
            JwksError::KeyNotFound(_) | JwksError::UnsupportedHeader(_) => AuthError::TokenInvalid,
            JwksError::FetchFailed(_) | JwksError::InvalidUrl(_) | JwksError::Client(_) => {
                AuthError::JwksUnavailable
            }
        })?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = config.leeway.as_secs();
        // Audience is matched below against string or array claims.
        validation.validate_aud = false;

        let claims = decode::<Map<String, Value>>(token, &key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::TokenInvalid,
            })?
            .claims;

        let issuer = claim_str(&claims, "iss").unwrap_or_default();
        if !config.allowed_issuers.is_empty()
            && !config.allowed_issuers.iter().any(|allowed| *allowed == issuer)
        {
            return Err(AuthError::IssuerMismatch);
        }

        if !audience_matches(claims.get("aud"), &config.audience) {
            return Err(AuthError::AudienceMismatch);
        }

        let subject = claim_str(&claims, "sub")
            .filter(|sub| !sub.is_empty())
            .ok_or(AuthError::TokenInvalid)?;

        Ok(ServiceIdentity {
            subject,
            email: claim_str(&claims, "email"),
            issuer,
            audience: config.audience.clone(),
            claims,
            header,
            token: token.to_string(),
            source,
        })
    }
}

/// OIDC guard state for [`require_oidc`].
#[derive(Clone)]
pub struct RequireOidc {
    validator: Arc<OidcValidator>,
    config: Arc<OidcConfig>,
}

impl RequireOidc {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<ServiceIdentity, AuthError> {
        let (token, source) = service_token(headers).ok_or(AuthError::TokenMissing)?;
        self.validator.verify(&token, source, &self.config).await
    }
}

/// OIDC middleware function.
pub async fn require_oidc(
    State(guard): State<RequireOidc>,
    mut request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let outcome = guard.authenticate(request.headers()).await;

    let reason = match &outcome {
        Ok(_) => REASON_OK,
        Err(e) => e.error_code(),
    };
    guard
        .validator
        .metrics
        .record(METRIC_KIND, outcome.is_ok(), reason, started.elapsed());

    match outcome {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(err) => {
            let path = request.uri().path();
            if err.is_infrastructure() {
                error!(path = %path, reason, "Service token rejected");
            } else {
                warn!(path = %path, reason, "Service token rejected");
            }
            err.into_response()
        }
    }
}

/// Bearer token first, IAP assertion second.
fn service_token(headers: &HeaderMap) -> Option<(String, TokenSource)> {
    if let Some(token) = bearer_token(headers) {
        return Some((token, TokenSource::Authorization));
    }
    headers
        .get(IAP_ASSERTION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| (v.to_string(), TokenSource::IapAssertion))
}

fn claim_str(claims: &Map<String, Value>, name: &str) -> Option<String> {
    claims.get(name).and_then(Value::as_str).map(str::to_string)
}

/// Exact match against a string or array `aud` claim.
fn audience_matches(aud: Option<&Value>, expected: &str) -> bool {
    match aud {
        Some(Value::String(aud)) => aud == expected,
        Some(Value::Array(auds)) => auds.iter().any(|aud| aud.as_str() == Some(expected)),
        _ => false,
    }
}
