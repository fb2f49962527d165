// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Inbound Auth - request authentication for a backend API
//!
//! Verifies three kinds of inbound callers before any handler runs:
//! webhook senders signing with a shared HMAC secret, services presenting
//! OIDC / IAP tokens, and end users presenting Firebase ID tokens.
//!
//! ## Modules
//!
//! - `auth` - Guards, verifiers, JWKS cache, nonce and secret stores
//! - `api` - HTTP routes (Axum) wired to the guards
//! - `config` - Environment configuration
//! - `metrics` - Per-decision authentication metrics

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod metrics;
pub mod state;

#[cfg(test)]
pub(crate) mod testutil;
