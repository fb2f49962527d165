// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Shared-secret resolution for HMAC webhooks.
//!
//! Secrets are resolved through a [`SecretProvider`] (a secret manager, the
//! environment, a static map) and cached in-process by name for the process
//! lifetime. Rotation is picked up only on restart or an explicit
//! [`SecretCache::evict`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

/// Default bound on a single secret lookup.
pub const DEFAULT_SECRET_TIMEOUT: Duration = Duration::from_secs(2);

/// Environment prefix used by [`EnvSecretProvider`].
pub const DEFAULT_SECRET_ENV_PREFIX: &str = "WEBHOOK_SECRET_";

/// Opaque secret bytes. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Arc<[u8]>);

impl Secret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(bytes.into()))
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret([REDACTED; {}])", self.0.len())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SecretError {
    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("secret backend unavailable: {0}")]
    Unavailable(String),
}

/// Resolves a named shared secret.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<Secret, SecretError>;
}

/// Fixed in-memory secrets.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretProvider {
    secrets: HashMap<String, Secret>,
}

impl StaticSecretProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        self.secrets.insert(name.into(), Secret::new(secret));
        self
    }
}

#[async_trait]
impl SecretProvider for StaticSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<Secret, SecretError> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(name.to_string()))
    }
}

/// Reads secrets from environment variables.
///
/// `webhooks/stripe` resolves to `WEBHOOK_SECRET_WEBHOOKS_STRIPE`.
#[derive(Debug, Clone)]
pub struct EnvSecretProvider {
    prefix: String,
}

impl EnvSecretProvider {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Environment variable name for a secret name.
    pub fn var_name(&self, name: &str) -> String {
        let suffix: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

impl Default for EnvSecretProvider {
    fn default() -> Self {
        Self::new(DEFAULT_SECRET_ENV_PREFIX)
    }
}

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn get_secret(&self, name: &str) -> Result<Secret, SecretError> {
        match std::env::var(self.var_name(name)) {
            Ok(value) if !value.is_empty() => Ok(Secret::new(value.into_bytes())),
            _ => Err(SecretError::NotFound(name.to_string())),
        }
    }
}

/// Name-keyed cache in front of a [`SecretProvider`].
///
/// Entries are never invalidated automatically.
pub struct SecretCache {
    provider: Arc<dyn SecretProvider>,
    cache: RwLock<HashMap<String, Secret>>,
    timeout: Duration,
}

impl SecretCache {
    pub fn new(provider: Arc<dyn SecretProvider>) -> Self {
        Self {
            provider,
            cache: RwLock::new(HashMap::new()),
            timeout: DEFAULT_SECRET_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve a secret, hitting the provider only on the first lookup.
    ///
    /// Failures are not cached. An empty secret is treated as unavailable.
    pub async fn get(&self, name: &str) -> Result<Secret, SecretError> {
        if let Some(secret) = self.cached(name) {
            return Ok(secret);
        }

        let secret = tokio::time::timeout(self.timeout, self.provider.get_secret(name))
            .await
            .map_err(|_| SecretError::Unavailable(format!("lookup of {name} timed out")))??;

        if secret.is_empty() {
            return Err(SecretError::Unavailable(format!("secret {name} is empty")));
        }

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(name.to_string(), secret.clone());
        }
        Ok(secret)
    }

    fn cached(&self, name: &str) -> Option<Secret> {
        self.cache.read().ok()?.get(name).cloned()
    }

    /// Drop a cached secret so the next lookup re-resolves it.
    pub fn evict(&self, name: &str) -> bool {
        self.cache
            .write()
            .map(|mut cache| cache.remove(name).is_some())
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl SecretProvider for CountingProvider {
        async fn get_secret(&self, _name: &str) -> Result<Secret, SecretError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(Secret::new(b"s3cret".to_vec()))
        }
    }

    fn counting(delay: Duration) -> Arc<CountingProvider> {
        Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    #[tokio::test]
    async fn caches_after_first_resolution() {
        let provider = counting(Duration::ZERO);
        let cache = SecretCache::new(provider.clone());

        cache.get("webhooks/stripe").await.unwrap();
        cache.get("webhooks/stripe").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn evict_forces_reresolution() {
        let provider = counting(Duration::ZERO);
        let cache = SecretCache::new(provider.clone());

        cache.get("a").await.unwrap();
        assert!(cache.evict("a"));
        cache.get("a").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_provider_times_out_as_unavailable() {
        let provider = counting(Duration::from_millis(200));
        let cache = SecretCache::new(provider).with_timeout(Duration::from_millis(10));

        let err = cache.get("a").await.unwrap_err();
        assert!(matches!(err, SecretError::Unavailable(_)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn static_provider_reports_missing_names() {
        let provider = StaticSecretProvider::new().with_secret("known", "k");
        assert!(provider.get_secret("known").await.is_ok());
        assert!(matches!(
            provider.get_secret("unknown").await,
            Err(SecretError::NotFound(_))
        ));
    }

    #[test]
    fn env_var_name_is_normalized() {
        let provider = EnvSecretProvider::default();
        assert_eq!(
            provider.var_name("webhooks/stripe"),
            "WEBHOOK_SECRET_WEBHOOKS_STRIPE"
        );
    }

    #[test]
    fn debug_is_redacted() {
        let secret = Secret::new(b"hunter2".to_vec());
        assert!(!format!("{secret:?}").contains("hunter2"));
    }
}
