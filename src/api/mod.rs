// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    models::{ErrorCode, InboundEvent, Nip47Error, Nip47Request, Nip47Response, ResponseEnvelope},
    state::AppState,
};

pub mod events;
pub mod health;

pub fn router(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route("/relay/events", post(events::ingest_event))
        .with_state(state.clone());

    let health_routes = Router::new()
        .route("/live", get(health::liveness))
        .route("/ready", get(health::readiness))
        .with_state(state);

    Router::new()
        .nest("/health", health_routes)
        .nest("/v1", v1_routes)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::liveness,
        health::readiness,
        events::ingest_event
    ),
    components(
        schemas(
            health::HealthResponse,
            health::ReadyResponse,
            health::HealthChecks,
            events::AcceptedResponse,
            InboundEvent,
            Nip47Request,
            ResponseEnvelope,
            Nip47Response,
            Nip47Error,
            ErrorCode
        )
    ),
    tags(
        (name = "Health", description = "Liveness and readiness probes"),
        (name = "Relay", description = "Wallet-connect events from the relay sidecar")
    )
)]
struct ApiDoc;
