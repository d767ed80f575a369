// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use relational_wallet_connect::api::router;
use relational_wallet_connect::backend::BackendSelector;
use relational_wallet_connect::config::{LogFormat, ServiceConfig};
use relational_wallet_connect::protocol::{Reconciler, RequestRouter};
use relational_wallet_connect::relay::{Dispatcher, HttpRelayPublisher};
use relational_wallet_connect::state::AppState;
use relational_wallet_connect::storage::{seed_applications, Ledger};
use relational_wallet_connect::telemetry::init_tracing;

#[tokio::main]
async fn main() {
    init_tracing(LogFormat::from_env());

    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    std::fs::create_dir_all(&config.data_dir).expect("Failed to create data directory");
    let ledger = Arc::new(Ledger::open(&config.ledger_path()).expect("Failed to open ledger"));
    info!(path = %config.ledger_path().display(), "Ledger opened");

    if let Some(seed_path) = &config.apps_seed_path {
        let inserted = seed_applications(&ledger, seed_path).expect("Failed to seed applications");
        info!(inserted, path = %seed_path.display(), "Applications seeded");
    }

    let selector = Arc::new(BackendSelector::new(config.lightning.clone()));
    let publisher = Arc::new(
        HttpRelayPublisher::new(&config.relay_publish_url, &config.relay_ingress_token)
            .expect("Failed to build relay publisher"),
    );
    let request_router = Arc::new(RequestRouter::new(ledger.clone(), selector.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        request_router,
        publisher.clone(),
        config.request_timeout,
    ));

    let shutdown = CancellationToken::new();
    let reconciler = Reconciler::new(ledger.clone(), selector, publisher, config.reconcile_interval);
    let reconciler_task = tokio::spawn(reconciler.run(shutdown.clone()));

    let state = AppState::new(ledger, dispatcher.clone(), &config.relay_ingress_token);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .expect("Failed to bind listener");
    info!(
        addr = %config.bind_addr,
        backend = %config.lightning.default_backend,
        "Wallet connect bridge listening (docs at /docs)"
    );

    let server_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = server_shutdown.cancelled() => {},
            }
        })
        .await;
    if let Err(e) = served {
        error!(error = %e, "HTTP server failed");
    }

    info!(in_flight = dispatcher.in_flight(), "Draining in-flight requests");
    shutdown.cancel();
    dispatcher.drain().await;
    let _ = reconciler_task.await;
    info!("Shutdown complete");
}
