// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Relay ingress: the sidecar hands over verified, decrypted events here.

use axum::{
    body::Bytes,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use tracing::{debug, warn};
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::models::InboundEvent;
use crate::relay::DispatchError;
use crate::state::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct AcceptedResponse {
    pub event_id: String,
    pub status: String,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

fn validate(event: &InboundEvent) -> Result<(), ApiError> {
    if event.id.trim().is_empty() {
        return Err(ApiError::bad_request("event id is required"));
    }
    if !matches!(hex::decode(&event.pubkey), Ok(bytes) if bytes.len() == 32) {
        return Err(ApiError::bad_request("pubkey must be 32 bytes of hex"));
    }
    Ok(())
}

/// Accept one relay event for asynchronous handling.
///
/// The response to the requester is published later through the relay.
#[utoipa::path(
    post,
    path = "/v1/relay/events",
    tag = "Relay",
    request_body = InboundEvent,
    responses(
        (status = 202, description = "Event accepted", body = AcceptedResponse),
        (status = 400, description = "Malformed event"),
        (status = 401, description = "Missing or invalid relay token"),
        (status = 503, description = "Service is shutting down")
    )
)]
pub async fn ingest_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let authorized = bearer_token(&headers).is_some_and(|token| state.is_relay_token(token));
    if !authorized {
        warn!("Rejected relay event with missing or invalid token");
        return Err(ApiError::unauthorized("invalid relay token"));
    }

    let event: InboundEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid event: {e}")))?;
    validate(&event)?;

    let event_id = event.id.clone();
    state.dispatcher.dispatch(event).map_err(|e| match e {
        DispatchError::ShuttingDown => ApiError::unavailable(e.to_string()),
    })?;
    debug!(event_id = %event_id, "Relay event accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            event_id,
            status: "accepted".to_string(),
        }),
    ))
}
