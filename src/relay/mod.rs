// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Relay Boundary
//!
//! The relay sidecar owns relay connections, signature checks and payload
//! encryption. It delivers verified, decrypted events to
//! `POST /v1/relay/events` and receives plaintext response envelopes back
//! through a [`ResponseSink`].
//!
//! - [`HttpRelayPublisher`]: POSTs envelopes to `RELAY_PUBLISH_URL`
//! - [`Dispatcher`]: one tracked task per inbound event, bounded by the
//!   request deadline

mod dispatcher;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::models::ResponseEnvelope;

pub use dispatcher::{DispatchError, Dispatcher};

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay transport error: {0}")]
    Transport(String),

    #[error("relay rejected response with HTTP {status}")]
    Rejected { status: u16 },

    #[error("relay configuration error: {0}")]
    Configuration(String),
}

/// Destination for response envelopes.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn publish(&self, envelope: ResponseEnvelope) -> Result<(), RelayError>;
}

/// Publishes envelopes to the sidecar over HTTP, authenticated with the
/// shared relay token.
pub struct HttpRelayPublisher {
    url: String,
    token: String,
    http: Client,
}

impl HttpRelayPublisher {
    pub fn new(url: &str, token: &str) -> Result<Self, RelayError> {
        let http = Client::builder()
            .timeout(PUBLISH_TIMEOUT)
            .build()
            .map_err(|e| RelayError::Configuration(e.to_string()))?;
        Ok(Self {
            url: url.to_string(),
            token: token.to_string(),
            http,
        })
    }
}

#[async_trait]
impl ResponseSink for HttpRelayPublisher {
    async fn publish(&self, envelope: ResponseEnvelope) -> Result<(), RelayError> {
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Rejected {
                status: status.as_u16(),
            });
        }
        debug!(event_id = %envelope.event_id, "Response handed to relay");
        Ok(())
    }
}
