// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Request Router
//!
//! Turns one verified relay event into at most one response.
//!
//! ## Event lifecycle
//!
//! ```text
//! received ──► executed
//!          ├─► handler_error
//!          └─► unauthorized
//! ```
//!
//! 1. The requester pubkey is resolved to an application. Unknown pubkeys are
//!    ignored.
//! 2. The event is inserted into the ledger. A second delivery of the same
//!    relay message id is suppressed here.
//! 3. Expired applications are refused with `EXPIRED` whatever they asked
//!    for. `pay_invoice` is the exception: its invoice is decoded first and
//!    expiry is checked during authorization.
//! 4. The method handler runs (see [`handlers`]).
//! 5. The terminal state is written, and only then is the response returned
//!    for publication.
//!
//! A handler may also *defer*: the request was cancelled while a payment was
//! in flight. The event stays `received` and the [`reconcile`] sweep finishes
//! it later.

mod handlers;
pub mod locks;
pub mod reconcile;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{BackendResolver, RequestContext};
use crate::models::{ErrorCode, InboundEvent, Method, Nip47Response, ResponseEnvelope};
use crate::permissions::{Denial, PermissionEngine};
use crate::storage::{EventState, InboundEventRecord, Ledger, LedgerError};

pub use locks::AppLocks;
pub use reconcile::Reconciler;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The ledger could not record the request. No response may be sent.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// What the caller should do after handling an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Terminal state recorded; publish this response.
    Respond(ResponseEnvelope),
    /// The relay message id was already handled.
    Duplicate,
    /// No application owns the requester pubkey.
    Ignored,
    /// Cancelled mid-flight; left for reconciliation.
    Deferred,
}

/// Result of running a method handler.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Completion {
    Done {
        state: EventState,
        response: Nip47Response,
    },
    Deferred,
}

impl Completion {
    pub(crate) fn executed(result_type: &str, result: Value) -> Self {
        Completion::Done {
            state: EventState::Executed,
            response: Nip47Response::success(result_type, result),
        }
    }

    pub(crate) fn handler_error(result_type: &str, code: ErrorCode, message: impl Into<String>) -> Self {
        Completion::Done {
            state: EventState::HandlerError,
            response: Nip47Response::error(result_type, code, message),
        }
    }

    pub(crate) fn unauthorized(result_type: &str, denial: Denial) -> Self {
        Completion::Done {
            state: EventState::Unauthorized,
            response: Nip47Response::error(result_type, denial.code, denial.message),
        }
    }
}

/// Record the terminal state of an event and build its response envelope.
///
/// The write must succeed before the envelope exists, so a response is never
/// published for an event the ledger does not know finished.
pub(crate) fn finish_event(
    ledger: &Ledger,
    event_id: &str,
    recipient: &str,
    state: EventState,
    response: Nip47Response,
) -> Result<ResponseEnvelope, LedgerError> {
    ledger.save_event_state(event_id, state, response.error_code())?;
    Ok(ResponseEnvelope {
        event_id: event_id.to_string(),
        recipient: recipient.to_string(),
        response,
    })
}

pub struct RequestRouter {
    ledger: Arc<Ledger>,
    permissions: PermissionEngine,
    backends: Arc<dyn BackendResolver>,
    locks: AppLocks,
}

impl RequestRouter {
    pub fn new(ledger: Arc<Ledger>, backends: Arc<dyn BackendResolver>) -> Self {
        Self {
            permissions: PermissionEngine::new(ledger.clone()),
            ledger,
            backends,
            locks: AppLocks::new(),
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Handle one inbound event.
    ///
    /// `cancel` fires when the request deadline passes or the service shuts
    /// down. Ledger failures are returned as errors and no response is built.
    pub async fn handle(
        &self,
        event: InboundEvent,
        cancel: CancellationToken,
    ) -> Result<Outcome, ProtocolError> {
        let Some(app) = self.ledger.find_application_by_pubkey(&event.pubkey)? else {
            warn!(event_id = %event.id, pubkey = %event.pubkey, "Ignoring request from unknown pubkey");
            return Ok(Outcome::Ignored);
        };

        let record = InboundEventRecord::received(
            &event.id,
            &app.id,
            &event.pubkey,
            &event.request.method,
            &event.content,
        );
        match self.ledger.create_event(&record) {
            Ok(()) => {}
            Err(LedgerError::AlreadyExists(_)) => {
                info!(event_id = %event.id, app_id = %app.id, "Duplicate event suppressed");
                return Ok(Outcome::Duplicate);
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.ledger.touch_application(&app.id, Utc::now()) {
            warn!(app_id = %app.id, error = %e, "Failed to update application last use");
        }

        let ctx = RequestContext::new(&event.id, &app.id, &event.pubkey, cancel);
        let method_name = event.request.method;
        let method = Method::from_str(&method_name);

        // pay_invoice decodes its invoice first and checks expiry in authorize.
        let expired = match method {
            Some(Method::PayInvoice) => None,
            _ => self.permissions.expiry(&app, Utc::now()),
        };

        let completion = match (method, expired) {
            (_, Some(denial)) => {
                info!(event_id = %ctx.event_id, app_id = %app.id, method = %method_name, "Expired app refused");
                Completion::unauthorized(&method_name, denial)
            }
            (Some(method), None) => {
                info!(event_id = %ctx.event_id, app_id = %app.id, method = %method, "Handling request");
                self.execute(&app, method, event.request.params, &ctx).await?
            }
            (None, None) => {
                warn!(event_id = %ctx.event_id, app_id = %app.id, method = %method_name, "Unknown method");
                Completion::handler_error(
                    &method_name,
                    ErrorCode::NotImplemented,
                    format!("Unknown method: {method_name}"),
                )
            }
        };

        match completion {
            Completion::Deferred => {
                warn!(event_id = %ctx.event_id, "Request deferred to reconciliation");
                Ok(Outcome::Deferred)
            }
            Completion::Done { state, response } => {
                let envelope = finish_event(&self.ledger, &ctx.event_id, &event.pubkey, state, response)?;
                info!(event_id = %ctx.event_id, state = ?state, "Request finished");
                Ok(Outcome::Respond(envelope))
            }
        }
    }
}
