// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Environment variable names, defaults and the [`Settings`] loaded from
//! them at startup. Misconfiguration fails fast in `main`.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |
//! | `HMAC_CLOCK_SKEW_SECS` | Accepted webhook timestamp skew | `300` |
//! | `HMAC_NONCE_TTL_SECS` | How long webhook nonces are remembered | `600` |
//! | `HMAC_MAX_BODY_BYTES` | Largest webhook body that gets hashed | `1048576` |
//! | `HMAC_SECRET_TIMEOUT_MS` | Bound on one secret lookup | `2000` |
//! | `WEBHOOK_PROVIDERS` | Comma list of webhook providers, e.g. `stripe,adyen` | empty |
//! | `WEBHOOK_SECRET_<NAME>` | Secret for `webhooks/<name>` | none |
//! | `OIDC_JWKS_URL` | JWKS for service tokens | Google OAuth2 certs |
//! | `OIDC_AUDIENCE` | Expected service token audience | Required for `/internal` |
//! | `OIDC_ALLOWED_ISSUERS` | Comma list of accepted issuers | any |
//! | `FIREBASE_PROJECT_ID` | Firebase project | Required for `/v1` |
//! | `FIREBASE_JWKS_URL` | JWKS for Firebase ID tokens | Google securetoken keys |
//! | `FIREBASE_ROLE_CLAIM` | Custom claim holding roles | `roles` |
//! | `FIREBASE_DEFAULT_ROLE` | Role given to tokens without one | none |
//! | `FIREBASE_VERIFY_TIMEOUT_MS` | Bound on one ID token verification | `3000` |
//! | `JWKS_DEFAULT_TTL_SECS` | Key set validity without caching headers | `900` |
//! | `JWKS_MAX_TTL_SECS` | Cap on validity granted by caching headers | `86400` |
//! | `JWKS_FETCH_TIMEOUT_MS` | Bound on one JWKS fetch | `5000` |
//! | `JWKS_FORCED_REFRESH_SECS` | Spacing of refreshes forced by unknown kids | `30` |

use std::collections::HashMap;
use std::time::Duration;

use crate::auth::firebase::{FirebaseConfig, FIREBASE_JWKS_URL};
use crate::auth::hmac::HmacConfig;
use crate::auth::jwks::JwksConfig;
use crate::auth::oidc::OidcConfig;

pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

pub const HMAC_CLOCK_SKEW_ENV: &str = "HMAC_CLOCK_SKEW_SECS";
pub const HMAC_NONCE_TTL_ENV: &str = "HMAC_NONCE_TTL_SECS";
pub const HMAC_MAX_BODY_ENV: &str = "HMAC_MAX_BODY_BYTES";
pub const HMAC_SECRET_TIMEOUT_ENV: &str = "HMAC_SECRET_TIMEOUT_MS";
pub const WEBHOOK_PROVIDERS_ENV: &str = "WEBHOOK_PROVIDERS";

pub const OIDC_JWKS_URL_ENV: &str = "OIDC_JWKS_URL";
pub const OIDC_AUDIENCE_ENV: &str = "OIDC_AUDIENCE";
pub const OIDC_ALLOWED_ISSUERS_ENV: &str = "OIDC_ALLOWED_ISSUERS";

pub const FIREBASE_PROJECT_ID_ENV: &str = "FIREBASE_PROJECT_ID";
pub const FIREBASE_JWKS_URL_ENV: &str = "FIREBASE_JWKS_URL";
pub const FIREBASE_ROLE_CLAIM_ENV: &str = "FIREBASE_ROLE_CLAIM";
pub const FIREBASE_DEFAULT_ROLE_ENV: &str = "FIREBASE_DEFAULT_ROLE";
pub const FIREBASE_VERIFY_TIMEOUT_ENV: &str = "FIREBASE_VERIFY_TIMEOUT_MS";

pub const JWKS_DEFAULT_TTL_ENV: &str = "JWKS_DEFAULT_TTL_SECS";
pub const JWKS_MAX_TTL_ENV: &str = "JWKS_MAX_TTL_SECS";
pub const JWKS_FETCH_TIMEOUT_ENV: &str = "JWKS_FETCH_TIMEOUT_MS";
pub const JWKS_FORCED_REFRESH_ENV: &str = "JWKS_FORCED_REFRESH_SECS";

/// Google's JWKS for OIDC identity tokens (including IAP-forwarded ones).
pub const GOOGLE_OIDC_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";

/// Secret-name prefix for webhook providers: `stripe` verifies with `webhooks/stripe`.
pub const WEBHOOK_SECRET_PREFIX: &str = "webhooks/";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is invalid: {message}")]
    Invalid { var: &'static str, message: String },

    #[error("{var} is required when {because} is set")]
    Missing {
        var: &'static str,
        because: &'static str,
    },
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct OidcSettings {
    pub jwks_url: String,
    pub audience: String,
    pub allowed_issuers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FirebaseSettings {
    pub project_id: String,
    pub jwks_url: String,
    pub role_claim: String,
    pub default_role: Option<String>,
    pub verify_timeout: Duration,
}

/// Everything the server reads from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub hmac_clock_skew: Duration,
    pub hmac_nonce_ttl: Duration,
    pub hmac_max_body_bytes: usize,
    pub hmac_secret_timeout: Duration,
    pub webhook_providers: Vec<String>,
    /// `None` disables the `/internal` routes.
    pub oidc: Option<OidcSettings>,
    /// `None` disables the `/v1` routes.
    pub firebase: Option<FirebaseSettings>,
    pub jwks_default_ttl: Duration,
    pub jwks_max_ttl: Duration,
    pub jwks_fetch_timeout: Duration,
    pub jwks_forced_refresh_interval: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load settings through `lookup`, which returns a variable's value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let log_format = match get(LOG_FORMAT_ENV) {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        let oidc = match (get(OIDC_AUDIENCE_ENV), get(OIDC_JWKS_URL_ENV)) {
            (Some(audience), jwks_url) => Some(OidcSettings {
                jwks_url: jwks_url.unwrap_or_else(|| GOOGLE_OIDC_JWKS_URL.to_string()),
                audience,
                allowed_issuers: get(OIDC_ALLOWED_ISSUERS_ENV)
                    .map(|v| split_list(&v))
                    .unwrap_or_default(),
            }),
            (None, Some(_)) => {
                return Err(ConfigError::Missing {
                    var: OIDC_AUDIENCE_ENV,
                    because: OIDC_JWKS_URL_ENV,
                })
            }
            (None, None) => None,
        };

        let firebase = match get(FIREBASE_PROJECT_ID_ENV) {
            Some(project_id) => Some(FirebaseSettings {
                project_id,
                jwks_url: get(FIREBASE_JWKS_URL_ENV).unwrap_or_else(|| FIREBASE_JWKS_URL.to_string()),
                role_claim: get(FIREBASE_ROLE_CLAIM_ENV).unwrap_or_else(|| "roles".to_string()),
                default_role: get(FIREBASE_DEFAULT_ROLE_ENV),
                verify_timeout: millis(FIREBASE_VERIFY_TIMEOUT_ENV, get(FIREBASE_VERIFY_TIMEOUT_ENV), 3000)?,
            }),
            None => None,
        };

        Ok(Self {
            host: get(HOST_ENV).unwrap_or_else(|| "0.0.0.0".to_string()),
            port: number(PORT_ENV, get(PORT_ENV), 8080)?,
            log_format,
            hmac_clock_skew: seconds(HMAC_CLOCK_SKEW_ENV, get(HMAC_CLOCK_SKEW_ENV), 300)?,
            hmac_nonce_ttl: seconds(HMAC_NONCE_TTL_ENV, get(HMAC_NONCE_TTL_ENV), 600)?,
            hmac_max_body_bytes: number(HMAC_MAX_BODY_ENV, get(HMAC_MAX_BODY_ENV), 1024 * 1024)?,
            hmac_secret_timeout: millis(HMAC_SECRET_TIMEOUT_ENV, get(HMAC_SECRET_TIMEOUT_ENV), 2000)?,
            webhook_providers: get(WEBHOOK_PROVIDERS_ENV)
                .map(|v| split_list(&v).into_iter().map(|p| p.to_ascii_lowercase()).collect())
                .unwrap_or_default(),
            oidc,
            firebase,
            jwks_default_ttl: seconds(JWKS_DEFAULT_TTL_ENV, get(JWKS_DEFAULT_TTL_ENV), 900)?,
            jwks_max_ttl: seconds(JWKS_MAX_TTL_ENV, get(JWKS_MAX_TTL_ENV), 24 * 60 * 60)?,
            jwks_fetch_timeout: millis(JWKS_FETCH_TIMEOUT_ENV, get(JWKS_FETCH_TIMEOUT_ENV), 5000)?,
            jwks_forced_refresh_interval: seconds(JWKS_FORCED_REFRESH_ENV, get(JWKS_FORCED_REFRESH_ENV), 30)?,
        })
    }

    pub fn hmac_config(&self) -> HmacConfig {
        HmacConfig::default()
            .with_clock_skew(self.hmac_clock_skew)
            .with_nonce_ttl(self.hmac_nonce_ttl)
            .with_max_body_bytes(self.hmac_max_body_bytes)
    }

    pub fn jwks_config(&self) -> JwksConfig {
        JwksConfig {
            default_ttl: self.jwks_default_ttl,
            max_ttl: self.jwks_max_ttl,
            fetch_timeout: self.jwks_fetch_timeout,
            forced_refresh_interval: self.jwks_forced_refresh_interval,
            ..JwksConfig::default()
        }
    }

    pub fn oidc_config(&self) -> Option<OidcConfig> {
        self.oidc.as_ref().map(|oidc| {
            OidcConfig::new(oidc.audience.clone()).with_allowed_issuers(oidc.allowed_issuers.clone())
        })
    }

    pub fn firebase_config(&self) -> FirebaseConfig {
        let mut config = FirebaseConfig::default();
        if let Some(firebase) = &self.firebase {
            config.role_claim = firebase.role_claim.clone();
            config = config
                .with_default_role(firebase.default_role.clone())
                .with_verify_timeout(firebase.verify_timeout);
        }
        config
    }

    /// Provider path segment to secret name, e.g. `stripe` to `webhooks/stripe`.
    pub fn provider_secrets(&self) -> HashMap<String, String> {
        self.webhook_providers
            .iter()
            .map(|provider| (provider.clone(), format!("{WEBHOOK_SECRET_PREFIX}{provider}")))
            .collect()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn number<T: std::str::FromStr>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

fn seconds(var: &'static str, raw: Option<String>, default: u64) -> Result<Duration, ConfigError> {
    number(var, raw, default).map(Duration::from_secs)
}

fn millis(var: &'static str, raw: Option<String>, default: u64) -> Result<Duration, ConfigError> {
    number(var, raw, default).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let settings = load(&[]).unwrap();
        assert_eq!(settings.port, 8080);
        assert_eq!(settings.log_format, LogFormat::Pretty);
        assert_eq!(settings.hmac_clock_skew, Duration::from_secs(300));
        assert_eq!(settings.hmac_nonce_ttl, Duration::from_secs(600));
        assert_eq!(settings.hmac_max_body_bytes, 1024 * 1024);
        assert_eq!(settings.jwks_default_ttl, Duration::from_secs(900));
        assert!(settings.oidc.is_none());
        assert!(settings.firebase.is_none());
        assert!(settings.provider_secrets().is_empty());
    }

    #[test]
    fn providers_map_to_secret_names() {
        let settings = load(&[(WEBHOOK_PROVIDERS_ENV, " Stripe, adyen ,")]).unwrap();
        let secrets = settings.provider_secrets();
        assert_eq!(secrets.len(), 2);
        assert_eq!(secrets["stripe"], "webhooks/stripe");
        assert_eq!(secrets["adyen"], "webhooks/adyen");
    }

    #[test]
    fn invalid_numbers_name_the_variable() {
        let err = load(&[(HMAC_CLOCK_SKEW_ENV, "five")]).unwrap_err();
        assert!(err.to_string().contains(HMAC_CLOCK_SKEW_ENV));
    }

    #[test]
    fn oidc_requires_an_audience() {
        let err = load(&[(OIDC_JWKS_URL_ENV, "https://example.com/jwks")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { var: OIDC_AUDIENCE_ENV, .. }));

        let settings = load(&[
            (OIDC_AUDIENCE_ENV, "https://api.example.com"),
            (OIDC_ALLOWED_ISSUERS_ENV, "https://accounts.google.com, https://cloud.google.com/iap"),
        ])
        .unwrap();
        let oidc = settings.oidc_config().unwrap();
        assert_eq!(oidc.audience, "https://api.example.com");
        assert_eq!(oidc.allowed_issuers.len(), 2);
        assert_eq!(settings.oidc.unwrap().jwks_url, GOOGLE_OIDC_JWKS_URL);
    }

    #[test]
    fn jwks_limits_flow_into_config() {
        let config = load(&[]).unwrap().jwks_config();
        assert_eq!(config.max_ttl, Duration::from_secs(24 * 60 * 60));
        assert_eq!(config.forced_refresh_interval, Duration::from_secs(30));

        let config = load(&[(JWKS_MAX_TTL_ENV, "3600"), (JWKS_FORCED_REFRESH_ENV, "5")])
            .unwrap()
            .jwks_config();
        assert_eq!(config.max_ttl, Duration::from_secs(3600));
        assert_eq!(config.forced_refresh_interval, Duration::from_secs(5));
        assert!(config.background_refresh);
    }

    #[test]
    fn firebase_settings_flow_into_config() {
        let settings = load(&[
            (FIREBASE_PROJECT_ID_ENV, "demo"),
            (FIREBASE_ROLE_CLAIM_ENV, "perms"),
            (FIREBASE_DEFAULT_ROLE_ENV, "member"),
            (FIREBASE_VERIFY_TIMEOUT_ENV, "1500"),
        ])
        .unwrap();
        let config = settings.firebase_config();
        assert_eq!(config.role_claim, "perms");
        assert_eq!(config.default_role.as_deref(), Some("member"));
        assert_eq!(config.verify_timeout, Duration::from_millis(1500));
    }
}
