// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Authentication Module
//!
//! Inbound request authentication for three kinds of callers.
//!
//! ## Guards
//!
//! | Caller | Guard | Attaches |
//! |--------|-------|----------|
//! | Webhook sender (shared secret) | [`RequireHmac`] / [`require_hmac`] | [`HmacMetadata`] |
//! | Service (OIDC / IAP token) | [`RequireOidc`] / [`require_oidc`] | [`ServiceIdentity`] |
//! | End user (Firebase ID token) | [`RequireFirebaseAuth`] / [`require_firebase_auth`] | [`Identity`] |
//!
//! Guards are installed with `axum::middleware::from_fn_with_state`.
//!
//! ## Security
//!
//! - Nothing is attached to a request before verification succeeds
//! - Webhook nonces are committed only after the signature verifies
//! - Bearer tokens are RS256 only, keys come from an HTTPS JWKS
//! - Caller faults answer 401, infrastructure faults 503, never 500

pub mod error;
pub mod extractor;
pub mod firebase;
pub mod hmac;
pub mod identity;
pub mod jwks;
pub mod nonce;
pub mod oidc;
pub mod roles;
pub mod secrets;

pub use error::AuthError;
pub use extractor::{bearer_token, hmac_metadata, identity, service_identity, Service, User, Webhook};
pub use firebase::{
    require_firebase_auth, FirebaseAuthenticator, FirebaseConfig, FirebaseJwtVerifier,
    RequireFirebaseAuth, TokenVerifier, TokenVerifyError, VerifiedToken,
};
pub use hmac::{
    provider_secret_resolver, require_hmac, sign_request, HmacConfig, HmacMetadata, HmacValidator,
    RequireHmac,
};
pub use identity::{Identity, UserGetter, UserLoadError, UserProfile};
pub use jwks::{CacheState, JwksCache, JwksConfig, JwksError};
pub use nonce::{InMemoryNonceStore, NonceStore, NonceStoreError};
pub use oidc::{require_oidc, OidcConfig, OidcValidator, RequireOidc, ServiceIdentity, TokenSource};
pub use roles::RoleSet;
pub use secrets::{EnvSecretProvider, Secret, SecretCache, SecretError, SecretProvider, StaticSecretProvider};
