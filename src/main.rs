// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::future::Future;
use std::net::SocketAddr;
use std::process::ExitCode;

use inbound_auth::api::router;
use inbound_auth::config::{LogFormat, Settings};
use inbound_auth::metrics::install_prometheus;
use inbound_auth::state::AppState;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(settings.log_format);

    let prometheus = match install_prometheus() {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "Failed to install metrics recorder");
            return ExitCode::FAILURE;
        }
    };
    let state = match AppState::from_settings(&settings) {
        Ok(state) => state.with_prometheus(prometheus),
        Err(e) => {
            error!(error = %e, "Failed to initialise authentication");
            return ExitCode::FAILURE;
        }
    };
    info!(
        providers = ?settings.webhook_providers,
        service_auth = state.service.is_some(),
        user_auth = state.users.is_some(),
        "Authentication configured"
    );

    let addr: SocketAddr = match format!("{}:{}", settings.host, settings.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, host = %settings.host, "Invalid bind address");
            return ExitCode::FAILURE;
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, %addr, "Failed to bind");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(tokio::signal::ctrl_c(), shutdown.clone()));

    info!(%addr, "inbound-auth listening");
    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await;

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}

/// Cancel `shutdown` once `signal` fires. A failed signal listener leaves the
/// server running.
async fn cancel_on_signal<F>(signal: F, shutdown: CancellationToken)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Shutdown signal received");
            shutdown.cancel();
        }
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stdout))
            .init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_target(true).with_writer(std::io::stdout))
            .init(),
    }
}
