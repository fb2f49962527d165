// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Authentication rejections.
//!
//! Each variant carries a stable machine-readable reason (`error_code`) that
//! is both returned to the caller and reported to the metrics recorder.
//! Caller faults map to 401, infrastructure faults to 503, and an unreadable
//! body to 400. Nothing here ever maps to 500.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Authentication error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    // -- HMAC webhook chain --
    /// The guard has no secret name configured
    SecretNotConfigured,
    /// The resolver could not map the request to a known integration
    UnknownProvider,
    /// The secret provider failed or timed out
    SecretUnavailable,
    SignatureMissing,
    TimestampMissing,
    NonceMissing,
    /// Nonce header is not valid UTF-8
    NonceInvalid,
    /// Timestamp header is not RFC3339 or Unix seconds
    TimestampInvalid,
    /// Timestamp is too far from server time
    TimestampSkew,
    /// Request body could not be buffered
    BodyUnreadable,
    /// Signature header is neither base64 nor hex
    SignatureInvalid,
    SignatureMismatch,
    /// Nonce was already used within its validity window
    NonceReplay,
    /// Nonce store timed out or is unreachable
    NonceStoreUnavailable,
    /// Nonce store returned an error
    NonceStoreError,

    // -- Bearer chains --
    /// No bearer token in any accepted header
    TokenMissing,
    /// Signature, algorithm or claim fault
    TokenInvalid,
    TokenExpired,
    /// Signing keys could not be fetched
    JwksUnavailable,
    IssuerMismatch,
    AudienceMismatch,
    /// Token verifier (identity provider) unreachable or timed out
    VerifierUnavailable,
    /// No role resolved and no fallback role configured
    MissingRole,
    /// Roles do not intersect the route's allowed roles
    InsufficientRole,

    /// A handler asked for an identity its guard never attached
    Unauthenticated,
}

#[derive(Serialize)]
struct AuthErrorBody {
    error: String,
    error_code: String,
}

impl AuthError {
    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::SecretNotConfigured => "secret_not_configured",
            AuthError::UnknownProvider => "unknown_provider",
            AuthError::SecretUnavailable => "secret_unavailable",
            AuthError::SignatureMissing => "signature_missing",
            AuthError::TimestampMissing => "timestamp_missing",
            AuthError::NonceMissing => "nonce_missing",
            AuthError::NonceInvalid => "nonce_invalid",
            AuthError::TimestampInvalid => "timestamp_invalid",
            AuthError::TimestampSkew => "timestamp_skew",
            AuthError::BodyUnreadable => "body_unreadable",
            AuthError::SignatureInvalid => "signature_invalid",
            AuthError::SignatureMismatch => "signature_mismatch",
            AuthError::NonceReplay => "nonce_replay",
            AuthError::NonceStoreUnavailable => "nonce_store_unavailable",
            AuthError::NonceStoreError => "nonce_store_error",
            AuthError::TokenMissing => "token_missing",
            AuthError::TokenInvalid => "token_invalid",
            AuthError::TokenExpired => "token_expired",
            AuthError::JwksUnavailable => "jwks_unavailable",
            AuthError::IssuerMismatch => "issuer_mismatch",
            AuthError::AudienceMismatch => "audience_mismatch",
            AuthError::VerifierUnavailable => "verifier_unavailable",
            AuthError::MissingRole => "missing_role",
            AuthError::InsufficientRole => "insufficient_role",
            AuthError::Unauthenticated => "unauthenticated",
        }
    }

    /// Get the HTTP status code for this error.
    ///
    /// `JwksUnavailable` is deliberately a 401: a token whose keys cannot be
    /// fetched is treated as unauthenticated.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::SecretNotConfigured
            | AuthError::SecretUnavailable
            | AuthError::NonceStoreUnavailable
            | AuthError::NonceStoreError
            | AuthError::VerifierUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::BodyUnreadable => StatusCode::BAD_REQUEST,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    /// True for faults in our own dependencies rather than the caller.
    pub fn is_infrastructure(&self) -> bool {
        self.status_code() == StatusCode::SERVICE_UNAVAILABLE || *self == AuthError::JwksUnavailable
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::SecretNotConfigured => write!(f, "Signing secret is not configured"),
            AuthError::UnknownProvider => write!(f, "Unknown webhook provider"),
            AuthError::SecretUnavailable => write!(f, "Signing secret is temporarily unavailable"),
            AuthError::SignatureMissing => write!(f, "Signature header is required"),
            AuthError::TimestampMissing => write!(f, "Signature timestamp header is required"),
            AuthError::NonceMissing => write!(f, "Signature nonce header is required"),
            AuthError::NonceInvalid => write!(f, "Signature nonce is malformed"),
            AuthError::TimestampInvalid => write!(f, "Signature timestamp is malformed"),
            AuthError::TimestampSkew => write!(f, "Signature timestamp is outside the allowed window"),
            AuthError::BodyUnreadable => write!(f, "Request body could not be read"),
            AuthError::SignatureInvalid => write!(f, "Signature is not valid base64 or hex"),
            AuthError::SignatureMismatch => write!(f, "Signature does not match"),
            AuthError::NonceReplay => write!(f, "Nonce has already been used"),
            AuthError::NonceStoreUnavailable => write!(f, "Replay protection is temporarily unavailable"),
            AuthError::NonceStoreError => write!(f, "Replay protection failed"),
            AuthError::TokenMissing => {
                write!(f, "Bearer token is required (expected 'Bearer <token>')")
            }
            AuthError::TokenInvalid => write!(f, "Token is invalid"),
            AuthError::TokenExpired => write!(f, "Token has expired"),
            AuthError::JwksUnavailable => write!(f, "Token signing keys are unavailable"),
            AuthError::IssuerMismatch => write!(f, "Token issuer is not allowed"),
            AuthError::AudienceMismatch => write!(f, "Token audience is invalid"),
            AuthError::VerifierUnavailable => write!(f, "Token verification is temporarily unavailable"),
            AuthError::MissingRole => write!(f, "Token carries no role"),
            AuthError::InsufficientRole => write!(f, "Insufficient role for this operation"),
            AuthError::Unauthenticated => write!(f, "Request is not authenticated"),
        }
    }
}

impl std::error::Error for AuthError {}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(AuthErrorBody {
            error: self.to_string(),
            error_code: self.error_code().to_string(),
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn nonce_replay_returns_401_with_code() {
        let response = AuthError::NonceReplay.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap();
        assert_eq!(body["error_code"], "nonce_replay");
    }

    #[test]
    fn infrastructure_faults_are_503() {
        for err in [
            AuthError::SecretNotConfigured,
            AuthError::SecretUnavailable,
            AuthError::NonceStoreUnavailable,
            AuthError::NonceStoreError,
            AuthError::VerifierUnavailable,
        ] {
            assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE, "{err:?}");
            assert!(err.is_infrastructure());
        }
    }

    #[test]
    fn jwks_unavailable_is_unauthorized_but_infrastructure() {
        assert_eq!(AuthError::JwksUnavailable.status_code(), StatusCode::UNAUTHORIZED);
        assert!(AuthError::JwksUnavailable.is_infrastructure());
    }

    #[test]
    fn unreadable_body_is_400() {
        assert_eq!(AuthError::BodyUnreadable.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn caller_faults_are_401() {
        for err in [
            AuthError::UnknownProvider,
            AuthError::SignatureMismatch,
            AuthError::TimestampSkew,
            AuthError::NonceInvalid,
            AuthError::InsufficientRole,
            AuthError::AudienceMismatch,
        ] {
            assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED, "{err:?}");
            assert!(!err.is_infrastructure());
        }
    }
}
