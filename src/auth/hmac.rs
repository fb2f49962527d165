// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! HMAC-signed webhook verification.
//!
//! ## Wire format
//!
//! The signer sends three headers (names configurable):
//!
//! - `X-Signature`: base64 (standard) or hex HMAC-SHA256
//! - `X-Signature-Timestamp`: RFC3339 (fractional seconds allowed) or Unix seconds
//! - `X-Signature-Nonce`: opaque, unique per secret name
//!
//! and signs the canonical string
//!
//! ```text
//! {METHOD}\n{EscapedPath}\n{TimestampHeaderRawValue}\n{Nonce}\n{hex(sha256(body))}
//! ```
//!
//! ## Ordering
//!
//! The nonce is committed only after the signature verifies, so a forged
//! request can never burn a legitimate sender's nonce.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let validator = Arc::new(HmacValidator::new(secrets, nonces));
//! let app = Router::new()
//!     .route("/webhooks/payments/{provider}", post(handle))
//!     .route_layer(axum::middleware::from_fn_with_state(
//!         validator.require_with(provider_secret_resolver(providers)),
//!         require_hmac,
//!     ));
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::{to_bytes, Body},
    extract::{OriginalUri, Request, State},
    http::{HeaderMap, HeaderName, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, TimeDelta, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::{error, warn};

use super::error::AuthError;
use super::nonce::{NonceStore, NonceStoreError};
use super::secrets::{SecretCache, SecretProvider};
use crate::clock::{system_clock, SharedClock};
use crate::metrics::{CounterMetrics, SharedMetrics, REASON_OK};

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_SIGNATURE_HEADER: &str = "x-signature";
pub const DEFAULT_TIMESTAMP_HEADER: &str = "x-signature-timestamp";
pub const DEFAULT_NONCE_HEADER: &str = "x-signature-nonce";

/// Maximum tolerated distance between the signed timestamp and server time.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);
/// How long a consumed nonce is remembered.
pub const DEFAULT_NONCE_TTL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
pub const DEFAULT_NONCE_TIMEOUT: Duration = Duration::from_secs(2);

/// Length of an HMAC-SHA256 tag.
const SIGNATURE_LEN: usize = 32;

const METRIC_KIND: &str = "hmac";

/// HMAC verification settings.
#[derive(Debug, Clone)]
pub struct HmacConfig {
    pub signature_header: HeaderName,
    pub timestamp_header: HeaderName,
    pub nonce_header: HeaderName,
    pub clock_skew: Duration,
    pub nonce_ttl: Duration,
    pub max_body_bytes: usize,
    pub nonce_timeout: Duration,
}

impl Default for HmacConfig {
    fn default() -> Self {
        Self {
            signature_header: HeaderName::from_static(DEFAULT_SIGNATURE_HEADER),
            timestamp_header: HeaderName::from_static(DEFAULT_TIMESTAMP_HEADER),
            nonce_header: HeaderName::from_static(DEFAULT_NONCE_HEADER),
            clock_skew: DEFAULT_CLOCK_SKEW,
            nonce_ttl: DEFAULT_NONCE_TTL,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            nonce_timeout: DEFAULT_NONCE_TIMEOUT,
        }
    }
}

impl HmacConfig {
    pub fn with_headers(
        mut self,
        signature: HeaderName,
        timestamp: HeaderName,
        nonce: HeaderName,
    ) -> Self {
        self.signature_header = signature;
        self.timestamp_header = timestamp;
        self.nonce_header = nonce;
        self
    }

    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    pub fn with_nonce_ttl(mut self, ttl: Duration) -> Self {
        self.nonce_ttl = ttl;
        self
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn with_nonce_timeout(mut self, timeout: Duration) -> Self {
        self.nonce_timeout = timeout;
        self
    }

    /// Nonce lifetime actually used. A nonce must outlive the skew window,
    /// otherwise an old-but-accepted timestamp would map to an expiry in
    /// the past.
    fn effective_nonce_ttl(&self) -> TimeDelta {
        let floor = self.clock_skew + Duration::from_secs(1);
        to_delta(self.nonce_ttl.max(floor))
    }
}

/// Result of a successful HMAC verification, attached to the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HmacMetadata {
    pub secret_name: String,
    pub timestamp: DateTime<Utc>,
    pub nonce: String,
    /// Decoded signature bytes.
    pub signature: Vec<u8>,
    /// Signature header exactly as received.
    pub raw_signature: String,
}

/// Maps a request to the secret name that should verify it.
pub type SecretResolver = Arc<dyn Fn(&Request) -> Option<String> + Send + Sync>;

#[derive(Clone)]
enum SecretSelector {
    Fixed(String),
    Resolved(SecretResolver),
}

/// Verifies HMAC-signed requests.
pub struct HmacValidator {
    config: HmacConfig,
    secrets: SecretCache,
    nonces: Arc<dyn NonceStore>,
    metrics: SharedMetrics,
    clock: SharedClock,
}

impl HmacValidator {
    pub fn new(secrets: Arc<dyn SecretProvider>, nonces: Arc<dyn NonceStore>) -> Self {
        Self {
            config: HmacConfig::default(),
            secrets: SecretCache::new(secrets),
            nonces,
            metrics: Arc::new(CounterMetrics),
            clock: system_clock(),
        }
    }

    pub fn with_config(mut self, config: HmacConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_secret_timeout(mut self, timeout: Duration) -> Self {
        self.secrets = self.secrets.with_timeout(timeout);
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &HmacConfig {
        &self.config
    }

    /// The secret cache, for explicit eviction after a rotation.
    pub fn secrets(&self) -> &SecretCache {
        &self.secrets
    }

    /// Guard that verifies every request against one named secret.
    pub fn require(self: &Arc<Self>, secret_name: impl Into<String>) -> RequireHmac {
        RequireHmac {
            validator: Arc::clone(self),
            selector: SecretSelector::Fixed(secret_name.into()),
        }
    }

    /// Guard that picks the secret per request.
    pub fn require_with<F>(self: &Arc<Self>, resolver: F) -> RequireHmac
    where
        F: Fn(&Request) -> Option<String> + Send + Sync + 'static,
    {
        RequireHmac {
            validator: Arc::clone(self),
            selector: SecretSelector::Resolved(Arc::new(resolver)),
        }
    }

    /// Verify a request against `secret_name`.
    ///
    /// On success the body is restored and [`HmacMetadata`] is attached to
    /// the request extensions. On failure the request is dropped.
    pub async fn verify(&self, secret_name: &str, request: Request) -> Result<Request, AuthError> {
        let secret = self.secrets.get(secret_name).await.map_err(|e| {
            error!(secret_name, error = %e, "Webhook secret resolution failed");
            AuthError::SecretUnavailable
        })?;

        let (mut parts, body) = request.into_parts();

        let raw_signature = required_header(
            &parts.headers,
            &self.config.signature_header,
            AuthError::SignatureMissing,
            AuthError::SignatureInvalid,
        )?;
        let raw_timestamp = required_header(
            &parts.headers,
            &self.config.timestamp_header,
            AuthError::TimestampMissing,
            AuthError::TimestampInvalid,
        )?;
        let nonce = required_header(
            &parts.headers,
            &self.config.nonce_header,
            AuthError::NonceMissing,
            AuthError::NonceInvalid,
        )?;

        let timestamp = parse_timestamp(&raw_timestamp).ok_or(AuthError::TimestampInvalid)?;
        let now = self.clock.now();
        if (now - timestamp).abs() > to_delta(self.config.clock_skew) {
            return Err(AuthError::TimestampSkew);
        }

        let body = to_bytes(body, self.config.max_body_bytes)
            .await
            .map_err(|_| AuthError::BodyUnreadable)?;

        let path = parts
            .extensions
            .get::<OriginalUri>()
            .map(|uri| uri.0.path().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string());
        let canonical = canonical_string(&parts.method, &path, &raw_timestamp, &nonce, &body);

        let signature = decode_signature(&raw_signature).ok_or(AuthError::SignatureInvalid)?;

        let mut mac = HmacSha256::new_from_slice(secret.expose())
            .map_err(|_| AuthError::SecretUnavailable)?;
        mac.update(canonical.as_bytes());
        // verify_slice compares in constant time
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::SignatureMismatch)?;

        let expiry = timestamp
            .min(now)
            .checked_add_signed(self.config.effective_nonce_ttl())
            .ok_or(AuthError::NonceStoreError)?;
        self.commit_nonce(secret_name, &nonce, expiry).await?;

        parts.extensions.insert(HmacMetadata {
            secret_name: secret_name.to_string(),
            timestamp,
            nonce,
            signature,
            raw_signature,
        });

        Ok(Request::from_parts(parts, Body::from(body)))
    }

    async fn commit_nonce(
        &self,
        scope: &str,
        nonce: &str,
        expiry: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let outcome = tokio::time::timeout(
            self.config.nonce_timeout,
            self.nonces.use_nonce(scope, nonce, expiry),
        )
        .await;

        match outcome {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(AuthError::NonceReplay),
            Ok(Err(NonceStoreError::Unavailable(msg))) => {
                error!(scope, error = %msg, "Nonce store unavailable");
                Err(AuthError::NonceStoreUnavailable)
            }
            Ok(Err(e)) => {
                error!(scope, error = %e, "Nonce store error");
                Err(AuthError::NonceStoreError)
            }
            Err(_) => {
                error!(scope, "Nonce store timed out");
                Err(AuthError::NonceStoreUnavailable)
            }
        }
    }
}

/// HMAC guard state for [`require_hmac`].
#[derive(Clone)]
pub struct RequireHmac {
    validator: Arc<HmacValidator>,
    selector: SecretSelector,
}

impl RequireHmac {
    fn secret_name(&self, request: &Request) -> Result<String, AuthError> {
        match &self.selector {
            SecretSelector::Fixed(name) if name.trim().is_empty() => {
                Err(AuthError::SecretNotConfigured)
            }
            SecretSelector::Fixed(name) => Ok(name.clone()),
            SecretSelector::Resolved(resolve) => resolve(request)
                .filter(|name| !name.trim().is_empty())
                .ok_or(AuthError::UnknownProvider),
        }
    }

    async fn authenticate(&self, request: Request) -> Result<Request, AuthError> {
        let secret_name = self.secret_name(&request)?;
        self.validator.verify(&secret_name, request).await
    }
}

/// HMAC middleware function.
pub async fn require_hmac(
    State(guard): State<RequireHmac>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let path = request.uri().path().to_string();
    let outcome = guard.authenticate(request).await;

    let reason = match &outcome {
        Ok(_) => REASON_OK,
        Err(e) => e.error_code(),
    };
    guard
        .validator
        .metrics
        .record(METRIC_KIND, outcome.is_ok(), reason, started.elapsed());

    match outcome {
        Ok(request) => next.run(request).await,
        Err(err) => {
            if err.is_infrastructure() {
                error!(path = %path, reason, "Webhook rejected");
            } else {
                warn!(path = %path, reason, "Webhook rejected");
            }
            err.into_response()
        }
    }
}

/// Resolver that maps the last path segment (the provider) to a secret name.
///
/// Only providers present in the map resolve; anything else is reported as
/// `unknown_provider`. Provider names match case-insensitively.
pub fn provider_secret_resolver(
    providers: HashMap<String, String>,
) -> impl Fn(&Request) -> Option<String> + Send + Sync + 'static {
    let providers: HashMap<String, String> = providers
        .into_iter()
        .map(|(provider, secret_name)| (provider.to_ascii_lowercase(), secret_name))
        .collect();
    move |request: &Request| {
        let path = request
            .extensions()
            .get::<OriginalUri>()
            .map(|uri| uri.0.path().to_string())
            .unwrap_or_else(|| request.uri().path().to_string());
        let provider = path.rsplit('/').find(|segment| !segment.is_empty())?;
        providers.get(&provider.to_ascii_lowercase()).cloned()
    }
}

/// Build the canonical string that gets signed.
pub fn canonical_string(
    method: &Method,
    escaped_path: &str,
    raw_timestamp: &str,
    nonce: &str,
    body: &[u8],
) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}",
        method.as_str().to_ascii_uppercase(),
        escaped_path,
        raw_timestamp,
        nonce,
        hex::encode(Sha256::digest(body)),
    )
}

/// Sign a request the way a webhook sender would. Returns standard base64.
pub fn sign_request(
    secret: &[u8],
    method: &Method,
    escaped_path: &str,
    raw_timestamp: &str,
    nonce: &str,
    body: &[u8],
) -> String {
    let canonical = canonical_string(method, escaped_path, raw_timestamp, nonce, body);
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(canonical.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Parse an RFC3339 (with or without fractional seconds) or Unix-seconds
/// timestamp.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let secs: i64 = raw.parse().ok()?;
    DateTime::from_timestamp(secs, 0)
}

/// Decode a signature header: base64 first, hex as fallback.
///
/// Hex digits are also valid base64, so a base64 decode that does not yield
/// a 32-byte tag gives way to a successful hex decode.
pub fn decode_signature(raw: &str) -> Option<Vec<u8>> {
    let from_base64 = STANDARD.decode(raw).ok();
    if let Some(bytes) = &from_base64 {
        if bytes.len() == SIGNATURE_LEN {
            return from_base64;
        }
    }
    match hex::decode(raw) {
        Ok(bytes) => Some(bytes),
        Err(_) => from_base64,
    }
}

fn required_header(
    headers: &HeaderMap,
    name: &HeaderName,
    missing: AuthError,
    invalid: AuthError,
) -> Result<String, AuthError> {
    let value = headers.get(name).ok_or(missing)?;
    let value = value.to_str().map_err(|_| invalid)?.trim();
    if value.is_empty() {
        return Err(missing);
    }
    Ok(value.to_string())
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}
