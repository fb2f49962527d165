// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! JWKS (JSON Web Key Set) fetching and caching.
//!
//! ## States
//!
//! - **Cold**: no snapshot yet; every lookup refreshes synchronously first.
//! - **Fresh**: `now < prefetch_at`; served from memory, no I/O.
//! - **Prefetch**: `prefetch_at <= now < expiry`; served from memory, and one
//!   detached background refresh is scheduled (deduplicated by an atomic flag).
//! - **Stale**: `now >= expiry`; refreshed synchronously before lookup.
//!
//! ## Security
//!
//! - JWKS is fetched via HTTPS only (plain HTTP is accepted for loopback hosts)
//! - Snapshots are replaced whole; readers never see a partial key map
//! - A failed refresh never clobbers the installed snapshot; a stale snapshot
//!   keeps serving until a refresh succeeds, a cold cache fails closed
//! - Caching headers are clamped to `max_ttl`
//! - Concurrent refreshes are serialized so N cold lookups cost one fetch
//! - Refreshes forced by unknown kids are spaced by `forced_refresh_interval`

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, KeyAlgorithm, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey, Header};
use metrics::counter;
use reqwest::header::{HeaderMap, CACHE_CONTROL, EXPIRES};
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::{Host, Url};

use crate::clock::{system_clock, SharedClock};
use crate::metrics::JWKS_REFRESH_TOTAL;

/// Validity used when the response carries no usable caching headers.
pub const DEFAULT_JWKS_TTL: Duration = Duration::from_secs(15 * 60);

/// Longest validity any caching header can grant.
pub const DEFAULT_MAX_JWKS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound on one JWKS HTTP fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimum spacing between refreshes forced by an unknown kid.
pub const DEFAULT_FORCED_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, thiserror::Error)]
pub enum JwksError {
    /// Transport error, non-200, undecodable or empty key set.
    #[error("failed to fetch JWKS: {0}")]
    FetchFailed(String),

    #[error("no JWKS key matches kid {0:?}")]
    KeyNotFound(String),

    /// Token header cannot be resolved to an RS256 key.
    #[error("unsupported token header: {0}")]
    UnsupportedHeader(String),

    #[error("invalid JWKS URL: {0}")]
    InvalidUrl(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// JWKS cache settings.
#[derive(Debug, Clone)]
pub struct JwksConfig {
    pub default_ttl: Duration,
    /// Cap on `Cache-Control: max-age` / `Expires`.
    pub max_ttl: Duration,
    pub fetch_timeout: Duration,
    pub forced_refresh_interval: Duration,
    /// Schedule a detached refresh inside the prefetch window.
    pub background_refresh: bool,
}

impl Default for JwksConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_JWKS_TTL,
            max_ttl: DEFAULT_MAX_JWKS_TTL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            forced_refresh_interval: DEFAULT_FORCED_REFRESH_INTERVAL,
            background_refresh: true,
        }
    }
}

/// Freshness of the installed snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Cold,
    Fresh,
    Prefetch,
    Stale,
}

/// One immutable key set as fetched.
struct Snapshot {
    keys: HashMap<String, DecodingKey>,
    expiry: DateTime<Utc>,
    prefetch_at: DateTime<Utc>,
    generation: u64,
}

impl Snapshot {
    fn state(&self, now: DateTime<Utc>) -> CacheState {
        if now >= self.expiry {
            CacheState::Stale
        } else if now >= self.prefetch_at {
            CacheState::Prefetch
        } else {
            CacheState::Fresh
        }
    }
}

struct Inner {
    url: String,
    config: JwksConfig,
    http: reqwest::Client,
    clock: SharedClock,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    /// Held across the fetch; only one refresh runs at a time.
    refresh_lock: tokio::sync::Mutex<()>,
    prefetching: AtomicBool,
    /// Unix millis of the last refresh forced by an unknown kid.
    last_forced: AtomicI64,
    fetches: AtomicU64,
}

/// Remote JWKS with time-bounded caching and background prefetch.
#[derive(Clone)]
pub struct JwksCache {
    inner: Arc<Inner>,
}

impl JwksCache {
    /// Create a cache for `jwks_url` with default settings.
    pub fn new(jwks_url: impl Into<String>) -> Result<Self, JwksError> {
        Self::with_config(jwks_url, JwksConfig::default(), system_clock())
    }

    pub fn with_config(
        jwks_url: impl Into<String>,
        config: JwksConfig,
        clock: SharedClock,
    ) -> Result<Self, JwksError> {
        let url = jwks_url.into();
        validate_url(&url)?;

        let http = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .map_err(|e| JwksError::Client(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                url,
                config,
                http,
                clock,
                snapshot: RwLock::new(None),
                refresh_lock: tokio::sync::Mutex::new(()),
                prefetching: AtomicBool::new(false),
                last_forced: AtomicI64::new(i64::MIN),
                fetches: AtomicU64::new(0),
            }),
        })
    }

    /// Get the JWKS URL.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Freshness of the installed snapshot right now.
    pub fn state(&self) -> CacheState {
        match self.current() {
            Some(snapshot) => snapshot.state(self.inner.clock.now()),
            None => CacheState::Cold,
        }
    }

    /// Number of upstream fetch attempts so far.
    pub fn fetch_count(&self) -> u64 {
        self.inner.fetches.load(Ordering::Relaxed)
    }

    /// Key ids in the installed snapshot.
    pub fn key_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .current()
            .map(|s| s.keys.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Get the verification key for `kid`.
    ///
    /// A stale snapshot whose refresh fails is still served; only a cold
    /// cache propagates the fetch error.
    pub async fn key(&self, kid: &str) -> Result<DecodingKey, JwksError> {
        let now = self.inner.clock.now();
        let mut refresh_error = None;
        let (snapshot, refreshed) = match self.current() {
            Some(snapshot) if snapshot.state(now) != CacheState::Stale => (snapshot, false),
            Some(stale) => match self.refresh_after(stale.generation).await {
                Ok(snapshot) => (snapshot, true),
                Err(e) => {
                    warn!(url = %self.inner.url, error = %e, "Serving stale JWKS after failed refresh");
                    refresh_error = Some(e);
                    (stale, true)
                }
            },
            None => (self.refresh_after(0).await?, true),
        };

        if let Some(key) = snapshot.keys.get(kid) {
            if snapshot.state(self.inner.clock.now()) == CacheState::Prefetch {
                self.schedule_prefetch(snapshot.generation);
            }
            return Ok(key.clone());
        }

        // The kid may be valid; we just could not fetch the current set.
        if let Some(e) = refresh_error {
            return Err(e);
        }

        // Unknown kid on a snapshot we did not just fetch: the signer may
        // have rotated. One forced refresh, then give up.
        if !refreshed {
            let snapshot = if self.claim_forced_refresh() {
                debug!(kid, "Key not in cached JWKS, forcing refresh");
                self.refresh_after(snapshot.generation).await?
            } else {
                // Rate limited: wait out any in-flight refresh and re-read.
                drop(self.inner.refresh_lock.lock().await);
                self.current().unwrap_or(snapshot)
            };
            if let Some(key) = snapshot.keys.get(kid) {
                return Ok(key.clone());
            }
        }

        Err(JwksError::KeyNotFound(kid.to_string()))
    }

    /// Resolve the key for a token header. Only RS256 with a `kid` is accepted.
    pub async fn key_for_header(&self, header: &Header) -> Result<DecodingKey, JwksError> {
        if header.alg != Algorithm::RS256 {
            return Err(JwksError::UnsupportedHeader(format!(
                "algorithm {:?} is not RS256",
                header.alg
            )));
        }
        let kid = header
            .kid
            .as_deref()
            .filter(|kid| !kid.is_empty())
            .ok_or_else(|| JwksError::UnsupportedHeader("missing kid".to_string()))?;
        self.key(kid).await
    }

    /// Force refresh the JWKS cache.
    pub async fn refresh(&self) -> Result<(), JwksError> {
        let observed = self.current().map(|s| s.generation).unwrap_or(0);
        self.refresh_after(observed).await.map(|_| ())
    }

    /// Take the forced-refresh slot unless one was taken within
    /// `forced_refresh_interval`.
    fn claim_forced_refresh(&self) -> bool {
        let now = self.inner.clock.now().timestamp_millis();
        let interval = to_delta(self.inner.config.forced_refresh_interval).num_milliseconds();
        let last = self.inner.last_forced.load(Ordering::Acquire);
        if last != i64::MIN && now.saturating_sub(last) < interval {
            return false;
        }
        self.inner
            .last_forced
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn current(&self) -> Option<Arc<Snapshot>> {
        self.inner.snapshot.read().ok().and_then(|s| s.clone())
    }

    /// Refresh unless another caller installed a usable snapshot newer than
    /// `observed` while we waited for the refresh lock.
    async fn refresh_after(&self, observed: u64) -> Result<Arc<Snapshot>, JwksError> {
        let _refreshing = self.inner.refresh_lock.lock().await;

        if let Some(current) = self.current() {
            if current.generation != observed
                && current.state(self.inner.clock.now()) != CacheState::Stale
            {
                return Ok(current);
            }
        }

        let generation = self.current().map(|s| s.generation).unwrap_or(0) + 1;
        let snapshot = match self.fetch(generation).await {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                counter!(JWKS_REFRESH_TOTAL, "outcome" => "error").increment(1);
                warn!(url = %self.inner.url, error = %e, "JWKS refresh failed");
                return Err(e);
            }
        };
        counter!(JWKS_REFRESH_TOTAL, "outcome" => "ok").increment(1);

        info!(
            url = %self.inner.url,
            keys = snapshot.keys.len(),
            expiry = %snapshot.expiry,
            "Installed JWKS snapshot"
        );

        if let Ok(mut slot) = self.inner.snapshot.write() {
            *slot = Some(Arc::clone(&snapshot));
        }
        Ok(snapshot)
    }

    /// Fire one detached refresh; no-op if one is already in flight.
    fn schedule_prefetch(&self, observed: u64) {
        if !self.inner.config.background_refresh {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self
            .inner
            .prefetching
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let cache = self.clone();
        runtime.spawn(async move {
            let _slot = PrefetchSlot(&cache.inner.prefetching);
            if let Err(e) = cache.refresh_after(observed).await {
                warn!(url = %cache.inner.url, error = %e, "Background JWKS prefetch failed");
            }
        });
    }

    /// Fetch JWKS from the endpoint.
    async fn fetch(&self, generation: u64) -> Result<Snapshot, JwksError> {
        self.inner.fetches.fetch_add(1, Ordering::Relaxed);

        let response = self
            .inner
            .http
            .get(&self.inner.url)
            .send()
            .await
            .map_err(|e| JwksError::FetchFailed(e.to_string()))?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(JwksError::FetchFailed(format!(
                "HTTP {} from JWKS endpoint",
                response.status()
            )));
        }

        let now = self.inner.clock.now();
        let default_ttl = to_delta(self.inner.config.default_ttl);
        let validity = cache_validity(response.headers(), now)
            .unwrap_or(default_ttl)
            .min(to_delta(self.inner.config.max_ttl));
        let (expiry, prefetch_at) = validity_window(now, validity)
            .or_else(|| validity_window(now, default_ttl))
            .ok_or_else(|| JwksError::FetchFailed("JWKS validity out of range".to_string()))?;

        let body = response
            .bytes()
            .await
            .map_err(|e| JwksError::FetchFailed(e.to_string()))?;
        let keys = parse_key_set(&body)?;
        if keys.is_empty() {
            return Err(JwksError::FetchFailed(
                "JWKS contains no usable keys".to_string(),
            ));
        }

        Ok(Snapshot {
            keys,
            expiry,
            prefetch_at,
            generation,
        })
    }
}

/// Clears the prefetch flag when the background task ends, however it ends.
struct PrefetchSlot<'a>(&'a AtomicBool);

impl Drop for PrefetchSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Deserialize)]
struct RawKeySet {
    #[serde(default)]
    keys: Vec<serde_json::Value>,
}

/// Decode a JWKS document, keeping only usable RS256 signing keys.
fn parse_key_set(body: &[u8]) -> Result<HashMap<String, DecodingKey>, JwksError> {
    let raw: RawKeySet = serde_json::from_slice(body)
        .map_err(|e| JwksError::FetchFailed(format!("undecodable JWKS: {e}")))?;

    let mut keys = HashMap::new();
    for value in raw.keys {
        let jwk: Jwk = match serde_json::from_value(value) {
            Ok(jwk) => jwk,
            Err(e) => {
                debug!(error = %e, "Skipping unparsable JWK");
                continue;
            }
        };
        let Some(kid) = jwk.common.key_id.clone().filter(|kid| !kid.is_empty()) else {
            debug!("Skipping JWK without kid");
            continue;
        };
        match jwk_to_decoding_key(&jwk) {
            Some(key) => {
                keys.insert(kid, key);
            }
            None => debug!(kid = %kid, "Skipping JWK with unusable key material"),
        }
    }
    Ok(keys)
}

/// Convert a JWK to a DecodingKey. Only RSA signing keys qualify.
fn jwk_to_decoding_key(jwk: &Jwk) -> Option<DecodingKey> {
    if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
        return None;
    }
    if jwk
        .common
        .key_algorithm
        .as_ref()
        .is_some_and(|alg| *alg != KeyAlgorithm::RS256)
    {
        return None;
    }
    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        _ => None,
    }
}

/// Validity window from `Cache-Control: max-age` or `Expires`.
fn cache_validity(headers: &HeaderMap, now: DateTime<Utc>) -> Option<TimeDelta> {
    let max_age = headers
        .get(CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.split(',').find_map(|directive| {
                let (name, value) = directive.trim().split_once('=')?;
                if name.trim().eq_ignore_ascii_case("max-age") {
                    value.trim().trim_matches('"').parse::<i64>().ok()
                } else {
                    None
                }
            })
        })
        .filter(|secs| *secs > 0)
        .map(|secs| TimeDelta::try_seconds(secs).unwrap_or(TimeDelta::MAX));
    if max_age.is_some() {
        return max_age;
    }

    headers
        .get(EXPIRES)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v.trim()).ok())
        .map(|expires| expires.with_timezone(&Utc) - now)
        .filter(|validity| *validity > TimeDelta::zero())
}

/// `(expiry, prefetch_at)` for `validity` from `now`, if representable.
fn validity_window(
    now: DateTime<Utc>,
    validity: TimeDelta,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    Some((
        now.checked_add_signed(validity)?,
        now.checked_add_signed(validity / 2)?,
    ))
}

fn validate_url(raw: &str) -> Result<(), JwksError> {
    let url = Url::parse(raw).map_err(|e| JwksError::InvalidUrl(format!("{raw}: {e}")))?;
    let loopback = match url.host() {
        Some(Host::Domain(host)) => host.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    };
    match url.scheme() {
        "https" => Ok(()),
        "http" if loopback => Ok(()),
        _ => Err(JwksError::InvalidUrl(format!(
            "{raw}: JWKS must be served over HTTPS"
        ))),
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}
