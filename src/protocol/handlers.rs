// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Method handlers.
//!
//! Every handler validates its params before touching the permission engine
//! or a backend; validation failures answer `INTERNAL`.
//!
//! Paying methods (`pay_invoice`, `pay_keysend`) take the application's lock,
//! authorize against the budget, record a pending attempt, and hand the call
//! to a detached task that owns the lock until the outcome is written. If the
//! request is cancelled meanwhile, the payment keeps going and the event is
//! left for reconciliation.

use std::str::FromStr;

use chrono::Utc;
use futures::TryStreamExt;
use lightning_invoice::Bolt11Invoice;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::{Completion, ProtocolError, RequestRouter};
use crate::backend::{
    payment_hash_of, truncate_diagnostic, BackendError, BackendResult, KeysendRequest, MakeInvoiceRequest,
    RequestContext, TransactionQuery,
};
use crate::models::{
    ErrorCode, ListTransactionsParams, LookupInvoiceParams, MakeInvoiceParams, Method, PayInvoiceParams,
    PayKeysendParams, Transaction,
};
use crate::permissions::Authorization;
use crate::storage::{Application, Ledger, LedgerError, PaymentAttempt, PaymentTarget};

/// A validated payment ready to be authorized and sent.
struct PaymentOrder {
    method: Method,
    target: PaymentTarget,
    payment_hash: String,
    amount_msat: u64,
    call: PaymentCall,
}

enum PaymentCall {
    Invoice {
        bolt11: String,
        /// Only set for amountless invoices.
        amount_msat: Option<u64>,
    },
    Keysend(KeysendRequest),
}

/// A validated read or invoice-creation request.
enum Query {
    Balance,
    MakeInvoice(MakeInvoiceRequest),
    LookupInvoice { payment_hash: String },
    ListTransactions(TransactionQuery),
    Info,
}

enum Prepared {
    Payment(PaymentOrder),
    Query(Query),
}

fn action(method: Method) -> &'static str {
    match method {
        Method::PayInvoice => "paying invoice",
        Method::PayKeysend => "sending keysend payment",
        Method::GetBalance => "fetching balance",
        Method::MakeInvoice => "creating invoice",
        Method::LookupInvoice => "looking up invoice",
        Method::ListTransactions => "listing transactions",
        Method::GetInfo => "fetching node info",
    }
}

/// Error code surfaced for a backend failure.
fn error_code(err: &BackendError) -> ErrorCode {
    match err {
        BackendError::Unsupported(_) => ErrorCode::NotImplemented,
        BackendError::NotFound(_) => ErrorCode::Other,
        _ => ErrorCode::Internal,
    }
}

/// Backend failure text safe to send to the requester. Upstream bodies are
/// never echoed.
fn sanitize(err: &BackendError) -> String {
    match err {
        BackendError::Http { status, .. } => format!("backend returned HTTP {status}"),
        other => truncate_diagnostic(&other.to_string()),
    }
}

fn invalid(method: Method, message: impl Into<String>) -> Completion {
    Completion::handler_error(method.as_str(), ErrorCode::Internal, message)
}

fn decode_params<T: DeserializeOwned>(method: Method, params: Value) -> Result<T, Completion> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| invalid(method, format!("Invalid {method} params: {e}")))
}

fn decode_invoice(method: Method, invoice: &str) -> Result<Bolt11Invoice, Completion> {
    Bolt11Invoice::from_str(&invoice.trim().to_lowercase())
        .map_err(|e| invalid(method, format!("Failed to decode bolt11 invoice: {e}")))
}

fn is_hex_of_len(value: &str, len: usize) -> bool {
    matches!(hex::decode(value), Ok(bytes) if bytes.len() == len)
}

fn to_result<T: Serialize>(value: T) -> BackendResult<Value> {
    serde_json::to_value(value).map_err(|e| BackendError::Protocol(e.to_string()))
}

impl RequestRouter {
    pub(super) async fn execute(
        &self,
        app: &Application,
        method: Method,
        params: Value,
        ctx: &RequestContext,
    ) -> Result<Completion, ProtocolError> {
        let prepared = match method {
            Method::PayInvoice => parse_pay_invoice(params).map(Prepared::Payment),
            Method::PayKeysend => parse_pay_keysend(params).map(Prepared::Payment),
            _ => parse_query(method, params).map(Prepared::Query),
        };
        match prepared {
            Err(completion) => Ok(completion),
            Ok(Prepared::Payment(order)) => self.pay(app, order, ctx).await,
            Ok(Prepared::Query(query)) => self.query(app, method, query, ctx).await,
        }
    }

    async fn pay(
        &self,
        app: &Application,
        order: PaymentOrder,
        ctx: &RequestContext,
    ) -> Result<Completion, ProtocolError> {
        let PaymentOrder {
            method,
            target,
            payment_hash,
            amount_msat,
            call,
        } = order;
        let guard = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Ok(Completion::Deferred),
            guard = self.locks.acquire(&app.id) => guard,
        };

        if let Authorization::Denied(denial) =
            self.permissions.authorize(app, method, amount_msat, Utc::now())?
        {
            info!(event_id = %ctx.event_id, app_id = %app.id, code = %denial.code, "Payment refused");
            return Ok(Completion::unauthorized(method.as_str(), denial));
        }

        let attempt = PaymentAttempt::pending(&app.id, &ctx.event_id, target, payment_hash, amount_msat);
        self.ledger.create_payment(&attempt)?;

        let handle = match self.backends.resolve(app) {
            Ok(handle) => handle,
            Err(e) => {
                let reason = sanitize(&e);
                error!(event_id = %ctx.event_id, app_id = %app.id, error = %e, "Failed to select backend");
                self.ledger.fail_payment(&attempt.id, &reason)?;
                return Ok(invalid(method, format!("Failed to select lightning backend: {reason}")));
            }
        };

        info!(
            event_id = %ctx.event_id,
            app_id = %app.id,
            backend = %handle.kind,
            payment_hash = %attempt.payment_hash,
            amount_msat = attempt.amount_msat,
            "Sending payment"
        );

        let ledger = self.ledger.clone();
        let call_ctx = ctx.detached();
        let task = tokio::spawn(async move {
            let _guard = guard;
            let result = match &call {
                PaymentCall::Invoice { bolt11, amount_msat } => {
                    handle.backend.pay_invoice(&call_ctx, bolt11, *amount_msat).await
                }
                PaymentCall::Keysend(request) => handle.backend.pay_keysend(&call_ctx, request).await,
            };
            record_payment(&ledger, &attempt, method, result)
        });

        tokio::select! {
            joined = task => match joined {
                Ok(recorded) => Ok(recorded?),
                Err(e) => {
                    error!(event_id = %ctx.event_id, error = %e, "Payment task aborted");
                    Ok(Completion::Deferred)
                }
            },
            _ = ctx.cancel.cancelled() => {
                warn!(event_id = %ctx.event_id, "Request cancelled with payment in flight");
                Ok(Completion::Deferred)
            }
        }
    }

    async fn query(
        &self,
        app: &Application,
        method: Method,
        query: Query,
        ctx: &RequestContext,
    ) -> Result<Completion, ProtocolError> {
        if let Authorization::Denied(denial) = self.permissions.authorize(app, method, 0, Utc::now())? {
            info!(event_id = %ctx.event_id, app_id = %app.id, code = %denial.code, "Request refused");
            return Ok(Completion::unauthorized(method.as_str(), denial));
        }

        let handle = match self.backends.resolve(app) {
            Ok(handle) => handle,
            Err(e) => {
                error!(event_id = %ctx.event_id, app_id = %app.id, error = %e, "Failed to select backend");
                return Ok(invalid(
                    method,
                    format!("Failed to select lightning backend: {}", sanitize(&e)),
                ));
            }
        };
        let backend = handle.backend;

        let result = match query {
            Query::Balance => backend
                .get_balance(ctx)
                .await
                .map(|balance| json!({ "balance": balance })),
            Query::MakeInvoice(request) => backend.make_invoice(ctx, &request).await.and_then(to_result),
            Query::LookupInvoice { payment_hash } => {
                backend.lookup_invoice(ctx, &payment_hash).await.and_then(to_result)
            }
            Query::ListTransactions(query) => match backend.list_transactions(ctx, query).await {
                Ok(stream) => ctx
                    .guard(stream.try_collect::<Vec<Transaction>>())
                    .await
                    .map(|transactions| json!({ "transactions": transactions })),
                Err(e) => Err(e),
            },
            Query::Info => backend.get_info(ctx).await.and_then(|mut info| {
                info.methods
                    .retain(|name| Method::from_str(name).is_some_and(|m| app.grant_for(m).is_some()));
                to_result(info)
            }),
        };

        match result {
            Ok(value) => Ok(Completion::executed(method.as_str(), value)),
            Err(BackendError::Cancelled) => Ok(Completion::Deferred),
            Err(e) => {
                warn!(event_id = %ctx.event_id, backend = %handle.kind, error = %e, "Backend call failed");
                Ok(Completion::handler_error(
                    method.as_str(),
                    error_code(&e),
                    format!("Something went wrong while {}: {}", action(method), sanitize(&e)),
                ))
            }
        }
    }
}

/// Write the outcome of a payment call to the ledger.
///
/// Timeouts leave the attempt pending: the payment may still complete and
/// only a status lookup can tell.
pub(super) fn record_payment(
    ledger: &Ledger,
    attempt: &PaymentAttempt,
    method: Method,
    result: BackendResult<String>,
) -> Result<Completion, LedgerError> {
    match result {
        Ok(preimage) => {
            if payment_hash_of(&preimage).as_deref() != Some(attempt.payment_hash.as_str()) {
                warn!(
                    event_id = %attempt.event_id,
                    payment_hash = %attempt.payment_hash,
                    "Preimage does not hash to the payment hash"
                );
            }
            ledger.settle_payment(&attempt.id, &preimage)?;
            info!(event_id = %attempt.event_id, payment_hash = %attempt.payment_hash, "Payment settled");
            Ok(Completion::executed(method.as_str(), json!({ "preimage": preimage })))
        }
        Err(BackendError::Timeout) => {
            warn!(event_id = %attempt.event_id, payment_hash = %attempt.payment_hash, "Payment outcome unknown");
            Ok(Completion::Deferred)
        }
        Err(e) => {
            let reason = sanitize(&e);
            ledger.fail_payment(&attempt.id, &reason)?;
            warn!(event_id = %attempt.event_id, payment_hash = %attempt.payment_hash, error = %e, "Payment failed");
            Ok(Completion::handler_error(
                method.as_str(),
                error_code(&e),
                format!("Something went wrong while {}: {reason}", action(method)),
            ))
        }
    }
}

fn parse_pay_invoice(params: Value) -> Result<PaymentOrder, Completion> {
    let method = Method::PayInvoice;
    let params: PayInvoiceParams = decode_params(method, params)?;
    let bolt11 = params.invoice.trim().to_lowercase();
    let invoice = decode_invoice(method, &bolt11)?;
    if invoice.is_expired() {
        return Err(invalid(method, "Invoice has expired"));
    }

    let (amount_msat, override_msat) = match (invoice.amount_milli_satoshis(), params.amount) {
        (Some(amount), _) => (amount, None),
        (None, Some(amount)) if amount > 0 => (amount, Some(amount)),
        (None, _) => return Err(invalid(method, "Invoice has no amount and none was provided")),
    };

    Ok(PaymentOrder {
        method,
        target: PaymentTarget::Invoice {
            bolt11: bolt11.clone(),
        },
        payment_hash: invoice.payment_hash().to_string(),
        amount_msat,
        call: PaymentCall::Invoice {
            bolt11,
            amount_msat: override_msat,
        },
    })
}

fn parse_pay_keysend(params: Value) -> Result<PaymentOrder, Completion> {
    let method = Method::PayKeysend;
    let params: PayKeysendParams = decode_params(method, params)?;
    if params.amount == 0 {
        return Err(invalid(method, "Amount must be greater than zero"));
    }
    let destination = params.destination.trim().to_lowercase();
    if !is_hex_of_len(&destination, 33) {
        return Err(invalid(method, "Invalid destination pubkey"));
    }
    if params.custom_records.iter().any(|r| hex::decode(&r.value).is_err()) {
        return Err(invalid(method, "TLV record values must be hex"));
    }

    let preimage = match params.preimage {
        Some(preimage) => {
            let preimage = preimage.trim().to_lowercase();
            if !is_hex_of_len(&preimage, 32) {
                return Err(invalid(method, "Preimage must be 32 bytes of hex"));
            }
            preimage
        }
        None => {
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            hex::encode(bytes)
        }
    };
    let Some(payment_hash) = payment_hash_of(&preimage) else {
        return Err(invalid(method, "Preimage must be 32 bytes of hex"));
    };

    Ok(PaymentOrder {
        method,
        target: PaymentTarget::Keysend {
            destination: destination.clone(),
        },
        payment_hash,
        amount_msat: params.amount,
        call: PaymentCall::Keysend(KeysendRequest {
            amount_msat: params.amount,
            destination,
            preimage,
            custom_records: params.custom_records,
        }),
    })
}

fn parse_query(method: Method, params: Value) -> Result<Query, Completion> {
    match method {
        Method::GetBalance => Ok(Query::Balance),
        Method::GetInfo => Ok(Query::Info),
        Method::MakeInvoice => {
            let params: MakeInvoiceParams = decode_params(method, params)?;
            if params.amount == 0 {
                return Err(invalid(method, "Amount must be greater than zero"));
            }
            let description_hash = params.description_hash.map(|h| h.trim().to_lowercase());
            if description_hash.as_deref().is_some_and(|h| !is_hex_of_len(h, 32)) {
                return Err(invalid(method, "Description hash must be 32 bytes of hex"));
            }
            Ok(Query::MakeInvoice(MakeInvoiceRequest {
                amount_msat: params.amount,
                description: params.description,
                description_hash,
                expiry: params.expiry,
            }))
        }
        Method::LookupInvoice => {
            let params: LookupInvoiceParams = decode_params(method, params)?;
            let payment_hash = match (params.payment_hash, params.invoice) {
                (Some(hash), _) => hash.trim().to_lowercase(),
                (None, Some(invoice)) => decode_invoice(method, &invoice)?.payment_hash().to_string(),
                (None, None) => return Err(invalid(method, "Either payment_hash or invoice is required")),
            };
            if !is_hex_of_len(&payment_hash, 32) {
                return Err(invalid(method, "Payment hash must be 32 bytes of hex"));
            }
            Ok(Query::LookupInvoice { payment_hash })
        }
        Method::ListTransactions => {
            let params: ListTransactionsParams = decode_params(method, params)?;
            Ok(Query::ListTransactions(params.into()))
        }
        Method::PayInvoice | Method::PayKeysend => Err(Completion::handler_error(
            method.as_str(),
            ErrorCode::Internal,
            format!("{method} is not a query"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_errors_are_sanitized() {
        let err = BackendError::Http {
            status: 502,
            body: "<html>upstream</html>".to_string(),
        };
        assert_eq!(sanitize(&err), "backend returned HTTP 502");
        assert_eq!(error_code(&err), ErrorCode::Internal);
    }

    #[test]
    fn error_codes_follow_failure_kind() {
        assert_eq!(error_code(&BackendError::Unsupported("keysend")), ErrorCode::NotImplemented);
        assert_eq!(error_code(&BackendError::NotFound("x".to_string())), ErrorCode::Other);
        assert_eq!(error_code(&BackendError::Timeout), ErrorCode::Internal);
    }

    #[test]
    fn null_params_decode_as_empty_object() {
        let params: ListTransactionsParams = decode_params(Method::ListTransactions, Value::Null).unwrap();
        assert_eq!(params.limit, None);
    }

    #[test]
    fn keysend_rejects_short_destination() {
        let result = parse_pay_keysend(json!({ "amount": 1_000, "destination": "02abcd" }));
        assert!(matches!(result, Err(Completion::Done { .. })));
    }

    #[test]
    fn make_invoice_requires_amount() {
        let result = parse_query(Method::MakeInvoice, json!({ "amount": 0 }));
        assert!(result.is_err());
        let result = parse_query(Method::MakeInvoice, json!({ "amount": 1_000, "description": "coffee" }));
        assert!(matches!(result, Ok(Query::MakeInvoice(MakeInvoiceRequest { amount_msat: 1_000, .. }))));
    }
}
