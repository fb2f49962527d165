// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! End-user authentication with Firebase ID tokens.
//!
//! Token verification goes through the [`TokenVerifier`] trait so the guard
//! does not depend on a particular identity-provider SDK.
//! [`FirebaseJwtVerifier`] is the built-in implementation on top of
//! [`JwksCache`].
//!
//! ## Roles
//!
//! Roles come from a configurable custom claim (default `roles`), see
//! [`roles_from_claim`]. A token with no roles gets the fallback role when one
//! is configured, and is rejected with `missing_role` otherwise. A guard with
//! allowed roles rejects identities whose roles do not intersect them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde_json::{Map, Value};
use tracing::{error, warn};

use super::error::AuthError;
use super::extractor::bearer_token;
use super::identity::{Identity, UserGetter, DEFAULT_USER_TIMEOUT};
use super::jwks::{JwksCache, JwksError};
use super::roles::{normalize_role, role_set, roles_from_claim, RoleSet};
use crate::metrics::{CounterMetrics, SharedMetrics, REASON_OK};

/// Google's JWKS for Firebase ID tokens.
pub const FIREBASE_JWKS_URL: &str =
    "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com";

/// Issuer prefix; the project id is appended.
pub const FIREBASE_ISSUER_PREFIX: &str = "https://securetoken.google.com/";

pub const DEFAULT_ROLE_CLAIM: &str = "roles";
pub const DEFAULT_LOCALE_CLAIM: &str = "locale";
pub const DEFAULT_EMAIL_CLAIM: &str = "email";
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(3);

const METRIC_KIND: &str = "firebase";

/// A token the verifier accepted.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub uid: String,
    pub claims: Map<String, Value>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenVerifyError {
    #[error("token expired")]
    Expired,

    #[error("invalid token: {0}")]
    Invalid(String),

    /// The verifier's backend (keys, network) could not be reached.
    #[error("verifier unavailable: {0}")]
    Unavailable(String),
}

/// Verifies an ID token.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify_id_token(&self, token: &str) -> Result<VerifiedToken, TokenVerifyError>;
}

/// Claim names, fallback role and timeouts.
#[derive(Debug, Clone)]
pub struct FirebaseConfig {
    pub role_claim: String,
    pub locale_claim: String,
    pub email_claim: String,
    pub default_role: Option<String>,
    pub verify_timeout: Duration,
    pub user_timeout: Duration,
}

impl Default for FirebaseConfig {
    fn default() -> Self {
        Self {
            role_claim: DEFAULT_ROLE_CLAIM.to_string(),
            locale_claim: DEFAULT_LOCALE_CLAIM.to_string(),
            email_claim: DEFAULT_EMAIL_CLAIM.to_string(),
            default_role: None,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            user_timeout: DEFAULT_USER_TIMEOUT,
        }
    }
}

impl FirebaseConfig {
    pub fn with_claims(
        mut self,
        role: impl Into<String>,
        locale: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        self.role_claim = role.into();
        self.locale_claim = locale.into();
        self.email_claim = email.into();
        self
    }

    pub fn with_default_role(mut self, role: Option<String>) -> Self {
        self.default_role = role;
        self
    }

    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    pub fn with_user_timeout(mut self, timeout: Duration) -> Self {
        self.user_timeout = timeout;
        self
    }
}

/// Authenticates end users with a [`TokenVerifier`].
pub struct FirebaseAuthenticator {
    verifier: Arc<dyn TokenVerifier>,
    users: Option<Arc<dyn UserGetter>>,
    config: FirebaseConfig,
    metrics: SharedMetrics,
}

impl FirebaseAuthenticator {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            verifier,
            users: None,
            config: FirebaseConfig::default(),
            metrics: Arc::new(CounterMetrics),
        }
    }

    pub fn with_config(mut self, config: FirebaseConfig) -> Self {
        self.config = config;
        self
    }

    /// Enable [`Identity::user`] on attached identities.
    pub fn with_user_getter(mut self, users: Arc<dyn UserGetter>) -> Self {
        self.users = Some(users);
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &FirebaseConfig {
        &self.config
    }

    /// Guard admitting any of `allowed_roles`; empty admits every role.
    pub fn require<I, S>(self: &Arc<Self>, allowed_roles: I) -> RequireFirebaseAuth
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        RequireFirebaseAuth {
            authenticator: Arc::clone(self),
            allowed_roles: Arc::new(role_set(allowed_roles)),
        }
    }

    /// Verify `token` and build the identity.
    pub async fn authenticate(&self, token: &str, allowed_roles: &RoleSet) -> Result<Identity, AuthError> {
        let verified = tokio::time::timeout(
            self.config.verify_timeout,
            self.verifier.verify_id_token(token),
        )
        .await
        .map_err(|_| {
            error!("ID token verification timed out");
            AuthError::VerifierUnavailable
        })?
        .map_err(|e| match e {
            TokenVerifyError::Expired => AuthError::TokenExpired,
            TokenVerifyError::Invalid(_) => AuthError::TokenInvalid,
            TokenVerifyError::Unavailable(msg) => {
                error!(error = %msg, "ID token verifier unavailable");
                AuthError::VerifierUnavailable
            }
        })?;

        if verified.uid.is_empty() {
            return Err(AuthError::TokenInvalid);
        }

        let mut roles = verified
            .claims
            .get(&self.config.role_claim)
            .map(roles_from_claim)
            .unwrap_or_default();
        if roles.is_empty() {
            if let Some(role) = self.config.default_role.as_deref().and_then(normalize_role) {
                roles.insert(role);
            }
        }
        if roles.is_empty() {
            return Err(AuthError::MissingRole);
        }
        if !allowed_roles.is_empty() && roles.is_disjoint(allowed_roles) {
            return Err(AuthError::InsufficientRole);
        }

        let email = claim_str(&verified.claims, &self.config.email_claim);
        let locale = claim_str(&verified.claims, &self.config.locale_claim);

        let mut identity = Identity::new(verified.uid, token, verified.claims)
            .with_email(email)
            .with_locale(locale)
            .with_roles(roles);
        if let Some(users) = &self.users {
            identity = identity.with_user_getter(Arc::clone(users), self.config.user_timeout);
        }
        Ok(identity)
    }
}

/// Firebase guard state for [`require_firebase_auth`].
#[derive(Clone)]
pub struct RequireFirebaseAuth {
    authenticator: Arc<FirebaseAuthenticator>,
    allowed_roles: Arc<RoleSet>,
}

impl RequireFirebaseAuth {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AuthError> {
        let token = bearer_token(headers).ok_or(AuthError::TokenMissing)?;
        self.authenticator
            .authenticate(&token, &self.allowed_roles)
            .await
    }
}

/// Firebase middleware function.
pub async fn require_firebase_auth(
    State(guard): State<RequireFirebaseAuth>,
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
        .authenticator
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
                error!(path = %path, reason, "User token rejected");
            } else {
                warn!(path = %path, reason, "User token rejected");
            }
            err.into_response()
        }
    }
}

/// [`TokenVerifier`] for Firebase ID tokens backed by a [`JwksCache`].
pub struct FirebaseJwtVerifier {
    jwks: JwksCache,
    project_id: String,
    issuer: String,
    leeway: Duration,
}

impl FirebaseJwtVerifier {
    /// Verifier using Google's published Firebase keys.
    pub fn new(project_id: impl Into<String>) -> Result<Self, JwksError> {
        Ok(Self::with_jwks(project_id, JwksCache::new(FIREBASE_JWKS_URL)?))
    }

    pub fn with_jwks(project_id: impl Into<String>, jwks: JwksCache) -> Self {
        let project_id = project_id.into();
        Self {
            jwks,
            issuer: format!("{FIREBASE_ISSUER_PREFIX}{project_id}"),
            project_id,
            leeway: Duration::from_secs(60),
        }
    }

    pub fn jwks(&self) -> &JwksCache {
        &self.jwks
    }
}

#[async_trait]
impl TokenVerifier for FirebaseJwtVerifier {
    async fn verify_id_token(&self, token: &str) -> Result<VerifiedToken, TokenVerifyError> {
        let header = decode_header(token).map_err(|e| TokenVerifyError::Invalid(e.to_string()))?;

        let key = self.jwks.key_for_header(&header).await.map_err(|e| match e {
            JwksError::KeyNotFound(_) | JwksError::UnsupportedHeader(_) => {
                TokenVerifyError::Invalid(e.to_string())
            }
            JwksError::FetchFailed(_) | JwksError::InvalidUrl(_) | JwksError::Client(_) => {
                TokenVerifyError::Unavailable(e.to_string())
            }
        })?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = self.leeway.as_secs();
        validation.set_audience(&[&self.project_id]);
        validation.set_issuer(&[&self.issuer]);

        let claims = decode::<Map<String, Value>>(token, &key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenVerifyError::Expired,
                _ => TokenVerifyError::Invalid(e.to_string()),
            })?
            .claims;

        let uid = claim_str(&claims, "sub")
            .filter(|sub| !sub.is_empty())
            .ok_or_else(|| TokenVerifyError::Invalid("missing sub".to_string()))?;

        Ok(VerifiedToken { uid, claims })
    }
}

fn claim_str(claims: &Map<String, Value>, name: &str) -> Option<String> {
    claims.get(name).and_then(Value::as_str).map(str::to_string)
}
