// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Verified end-user identity.
//!
//! An [`Identity`] is built per request after the ID token verifies. The
//! optional profile loader is bound to that one identity: the first call to
//! [`Identity::user`] fetches, later calls (and clones of the identity) reuse
//! the memoized result, errors included.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::OnceCell;

use super::roles::{normalize_role, RoleSet};

/// Default bound on one profile fetch.
pub const DEFAULT_USER_TIMEOUT: Duration = Duration::from_secs(3);

/// User record from the identity provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub uid: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub custom_claims: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UserLoadError {
    #[error("no user loader configured")]
    NotConfigured,

    #[error("user not found: {0}")]
    NotFound(String),

    #[error("user directory unavailable: {0}")]
    Unavailable(String),
}

/// Fetches a user profile by uid.
#[async_trait]
pub trait UserGetter: Send + Sync {
    async fn get_user(&self, uid: &str) -> Result<UserProfile, UserLoadError>;
}

struct LazyProfile {
    getter: Arc<dyn UserGetter>,
    timeout: Duration,
    cell: OnceCell<Result<Arc<UserProfile>, UserLoadError>>,
}

impl LazyProfile {
    async fn load(&self, uid: &str) -> Result<Arc<UserProfile>, UserLoadError> {
        self.cell
            .get_or_init(|| async {
                match tokio::time::timeout(self.timeout, self.getter.get_user(uid)).await {
                    Ok(result) => result.map(Arc::new),
                    Err(_) => Err(UserLoadError::Unavailable(format!(
                        "profile fetch for {uid} timed out"
                    ))),
                }
            })
            .await
            .clone()
    }
}

/// Verified end user attached by the Firebase guard.
#[derive(Clone)]
pub struct Identity {
    uid: String,
    email: Option<String>,
    roles: RoleSet,
    locale: Option<String>,
    claims: Map<String, Value>,
    token: String,
    loader: Option<Arc<LazyProfile>>,
}

impl Identity {
    pub fn new(uid: impl Into<String>, token: impl Into<String>, claims: Map<String, Value>) -> Self {
        Self {
            uid: uid.into(),
            email: None,
            roles: RoleSet::new(),
            locale: None,
            claims,
            token: token.into(),
            loader: None,
        }
    }

    pub fn with_email(mut self, email: Option<String>) -> Self {
        self.email = email;
        self
    }

    pub fn with_roles(mut self, roles: RoleSet) -> Self {
        self.roles = roles;
        self
    }

    pub fn with_locale(mut self, locale: Option<String>) -> Self {
        self.locale = locale;
        self
    }

    /// Bind a profile loader to this identity.
    pub fn with_user_getter(mut self, getter: Arc<dyn UserGetter>, timeout: Duration) -> Self {
        self.loader = Some(Arc::new(LazyProfile {
            getter,
            timeout,
            cell: OnceCell::new(),
        }));
        self
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    pub fn roles(&self) -> &RoleSet {
        &self.roles
    }

    /// All verified token claims.
    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    /// Raw verified ID token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Case-insensitive role check.
    pub fn has_role(&self, role: &str) -> bool {
        normalize_role(role).is_some_and(|role| self.roles.contains(&role))
    }

    pub fn has_any_role<I, S>(&self, roles: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        roles.into_iter().any(|role| self.has_role(role.as_ref()))
    }

    /// Load the user profile at most once for this identity.
    pub async fn user(&self) -> Result<Arc<UserProfile>, UserLoadError> {
        match &self.loader {
            Some(loader) => loader.load(&self.uid).await,
            None => Err(UserLoadError::NotConfigured),
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("uid", &self.uid)
            .field("email", &self.email)
            .field("roles", &self.roles)
            .field("locale", &self.locale)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::roles::role_set;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingGetter {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl UserGetter for CountingGetter {
        async fn get_user(&self, uid: &str) -> Result<UserProfile, UserLoadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                return Err(UserLoadError::NotFound(uid.to_string()));
            }
            Ok(UserProfile {
                uid: uid.to_string(),
                email: Some("ada@example.com".to_string()),
                display_name: Some("Ada".to_string()),
                disabled: false,
                custom_claims: Map::new(),
            })
        }
    }

    fn identity_with(getter: Arc<CountingGetter>) -> Identity {
        Identity::new("uid-1", "token", Map::new())
            .with_user_getter(getter, DEFAULT_USER_TIMEOUT)
    }

    #[tokio::test]
    async fn loader_runs_once_across_calls_and_clones() {
        let getter = Arc::new(CountingGetter {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let identity = identity_with(getter.clone());
        let copy = identity.clone();

        let (a, b) = tokio::join!(identity.user(), copy.user());
        assert_eq!(a.unwrap().uid, "uid-1");
        assert_eq!(b.unwrap().display_name.as_deref(), Some("Ada"));
        identity.user().await.unwrap();

        assert_eq!(getter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn loader_errors_are_memoized() {
        let getter = Arc::new(CountingGetter {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let identity = identity_with(getter.clone());

        assert!(matches!(identity.user().await, Err(UserLoadError::NotFound(_))));
        assert!(matches!(identity.user().await, Err(UserLoadError::NotFound(_))));
        assert_eq!(getter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn separate_identities_do_not_share_profiles() {
        let getter = Arc::new(CountingGetter {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        identity_with(getter.clone()).user().await.unwrap();
        identity_with(getter.clone()).user().await.unwrap();
        assert_eq!(getter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn user_without_loader_is_not_configured() {
        let identity = Identity::new("uid-1", "token", Map::new());
        assert_eq!(identity.user().await.unwrap_err(), UserLoadError::NotConfigured);
    }

    #[test]
    fn role_checks_are_case_insensitive() {
        let identity =
            Identity::new("uid-1", "token", Map::new()).with_roles(role_set(["admin", "staff"]));
        assert!(identity.has_role("Admin"));
        assert!(!identity.has_role("viewer"));
        assert!(identity.has_any_role(["viewer", "STAFF"]));
        assert!(!identity.has_any_role(Vec::<String>::new()));
    }
}
