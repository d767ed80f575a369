// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Shared HTTP plumbing for the REST-based adapters.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;

use super::{truncate_diagnostic, BackendError, BackendResult};

/// Build a client with the given timeout and optional pinned root certificate.
pub fn build_client(timeout: Duration, root_cert_pem: Option<&[u8]>) -> BackendResult<Client> {
    let mut builder = Client::builder().timeout(timeout);
    if let Some(pem) = root_cert_pem {
        let cert = reqwest::Certificate::from_pem(pem)
            .map_err(|e| BackendError::Configuration(format!("invalid TLS certificate: {e}")))?;
        builder = builder.add_root_certificate(cert);
    }
    builder
        .build()
        .map_err(|e| BackendError::Configuration(format!("failed to build HTTP client: {e}")))
}

/// Join a base URL and an absolute path.
pub fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

/// Map a transport failure.
pub fn map_transport(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Unavailable(err.to_string())
    }
}

/// Send a request and decode a JSON body, translating status codes.
///
/// 404 maps to `NotFound`; any other non-2xx status keeps a truncated body.
pub async fn send_json<T: DeserializeOwned>(request: RequestBuilder, what: &str) -> BackendResult<T> {
    let response = request.send().await.map_err(map_transport)?;
    read_json(response, what).await
}

pub async fn read_json<T: DeserializeOwned>(response: Response, what: &str) -> BackendResult<T> {
    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(BackendError::NotFound(what.to_string()));
    }
    let body = response.text().await.map_err(map_transport)?;
    if !status.is_success() {
        return Err(BackendError::Http {
            status: status.as_u16(),
            body: truncate_diagnostic(&body),
        });
    }
    serde_json::from_str(&body)
        .map_err(|e| BackendError::Protocol(format!("{what}: {e}")))
}

/// Parse a decimal string field, as LND encodes 64-bit integers.
pub fn parse_u64(field: &str, value: &str) -> BackendResult<u64> {
    if value.is_empty() {
        return Ok(0);
    }
    value
        .parse()
        .map_err(|_| BackendError::Protocol(format!("{field} is not an integer: {value}")))
}

pub fn parse_i64(field: &str, value: &str) -> BackendResult<i64> {
    if value.is_empty() {
        return Ok(0);
    }
    value
        .parse()
        .map_err(|_| BackendError::Protocol(format!("{field} is not an integer: {value}")))
}
