// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Single-use nonce tracking for signed webhooks.
//!
//! A `(scope, nonce)` pair can be stored once until its expiry; after that
//! it becomes reusable. The scope is the secret name, so two integrations
//! never collide on each other's nonces.
//!
//! [`InMemoryNonceStore`] sweeps every expired entry on each call, which is
//! O(entries) per request. That is fine for a single instance at webhook
//! volumes. A deployment with several instances must plug in a shared,
//! TTL-native store behind the same [`NonceStore`] trait.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::clock::{system_clock, SharedClock};

#[derive(Debug, Clone, thiserror::Error)]
pub enum NonceStoreError {
    /// The requested expiry is not in the future.
    #[error("nonce expiry {0} is in the past")]
    ExpiryInPast(DateTime<Utc>),

    /// Backend unreachable or timed out.
    #[error("nonce store unavailable: {0}")]
    Unavailable(String),

    #[error("nonce store failure: {0}")]
    Backend(String),
}

/// Records consumed nonces.
///
/// Returns:
/// - `Ok(true)`  => first use, stored
/// - `Ok(false)` => replay, the pair exists and has not expired
/// - `Err(_)`    => store failure, callers must fail closed
#[async_trait]
pub trait NonceStore: Send + Sync {
    async fn use_nonce(
        &self,
        scope: &str,
        nonce: &str,
        expiry: DateTime<Utc>,
    ) -> Result<bool, NonceStoreError>;
}

/// Reference in-memory nonce store.
pub struct InMemoryNonceStore {
    entries: Mutex<HashMap<(String, String), DateTime<Utc>>>,
    clock: SharedClock,
}

impl InMemoryNonceStore {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of tracked (possibly expired) entries.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryNonceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NonceStore for InMemoryNonceStore {
    async fn use_nonce(
        &self,
        scope: &str,
        nonce: &str,
        expiry: DateTime<Utc>,
    ) -> Result<bool, NonceStoreError> {
        let now = self.clock.now();
        if expiry <= now {
            return Err(NonceStoreError::ExpiryInPast(expiry));
        }

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| NonceStoreError::Backend("nonce table lock poisoned".to_string()))?;

        entries.retain(|_, expires_at| *expires_at > now);

        let key = (scope.to_string(), nonce.to_string());
        if entries.contains_key(&key) {
            return Ok(false);
        }
        entries.insert(key, expiry);
        Ok(true)
    }
}
