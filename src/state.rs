// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::collections::HashMap;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::auth::firebase::{FirebaseAuthenticator, FirebaseJwtVerifier, RequireFirebaseAuth};
use crate::auth::hmac::{provider_secret_resolver, HmacValidator, RequireHmac};
use crate::auth::jwks::{JwksCache, JwksError};
use crate::auth::nonce::InMemoryNonceStore;
use crate::auth::oidc::{OidcConfig, OidcValidator, RequireOidc};
use crate::auth::secrets::EnvSecretProvider;
use crate::clock::system_clock;
use crate::config::Settings;
use crate::metrics::{CounterMetrics, SharedMetrics};

/// Guards and key caches shared by all routes.
#[derive(Clone)]
pub struct AppState {
    pub webhooks: RequireHmac,
    /// `None` leaves `/internal` unrouted.
    pub service: Option<RequireOidc>,
    /// `None` leaves `/v1` unrouted.
    pub users: Option<RequireFirebaseAuth>,
    /// Key caches reported by the health check, by name.
    pub jwks: Vec<(&'static str, JwksCache)>,
    /// Rendered at `/metrics` when set.
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    /// Webhook-only state; `providers` maps path segment to secret name.
    pub fn new(hmac: Arc<HmacValidator>, providers: HashMap<String, String>) -> Self {
        Self {
            webhooks: hmac.require_with(provider_secret_resolver(providers)),
            service: None,
            users: None,
            jwks: Vec::new(),
            prometheus: None,
        }
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    pub fn with_service_auth(mut self, validator: Arc<OidcValidator>, config: OidcConfig) -> Self {
        self.jwks.push(("oidc", validator.jwks().clone()));
        self.service = Some(validator.require(config));
        self
    }

    pub fn with_user_auth(mut self, authenticator: Arc<FirebaseAuthenticator>, jwks: Option<JwksCache>) -> Self {
        if let Some(jwks) = jwks {
            self.jwks.push(("firebase", jwks));
        }
        self.users = Some(authenticator.require(Vec::<String>::new()));
        self
    }

    /// Wire everything from the environment: env-backed webhook secrets, an
    /// in-memory nonce store and the JWKS-backed token verifiers.
    pub fn from_settings(settings: &Settings) -> Result<Self, JwksError> {
        let metrics: SharedMetrics = Arc::new(CounterMetrics);

        let hmac = Arc::new(
            HmacValidator::new(
                Arc::new(EnvSecretProvider::default()),
                Arc::new(InMemoryNonceStore::new()),
            )
            .with_config(settings.hmac_config())
            .with_secret_timeout(settings.hmac_secret_timeout)
            .with_metrics(metrics.clone()),
        );
        let mut state = Self::new(hmac, settings.provider_secrets());

        if let (Some(oidc), Some(config)) = (&settings.oidc, settings.oidc_config()) {
            let jwks = JwksCache::with_config(&oidc.jwks_url, settings.jwks_config(), system_clock())?;
            let validator = Arc::new(OidcValidator::new(jwks).with_metrics(metrics.clone()));
            state = state.with_service_auth(validator, config);
        }

        if let Some(firebase) = &settings.firebase {
            let jwks = JwksCache::with_config(&firebase.jwks_url, settings.jwks_config(), system_clock())?;
            let verifier = FirebaseJwtVerifier::with_jwks(&firebase.project_id, jwks.clone());
            let authenticator = Arc::new(
                FirebaseAuthenticator::new(Arc::new(verifier))
                    .with_config(settings.firebase_config())
                    .with_metrics(metrics),
            );
            state = state.with_user_auth(authenticator, Some(jwks));
        }

        Ok(state)
    }
}
