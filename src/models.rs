// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Wire Data Models
//!
//! Request and response shapes exchanged with wallet-connect applications
//! through the relay sidecar. The sidecar verifies signatures and decrypts
//! payloads before handing an [`InboundEvent`] to the bridge, and encrypts
//! and signs every [`ResponseEnvelope`] before publishing it.
//!
//! ## Model Categories
//!
//! - **Envelopes**: [`InboundEvent`], [`ResponseEnvelope`]
//! - **Requests**: [`Nip47Request`] plus one params struct per method
//! - **Responses**: [`Nip47Response`], [`Nip47Error`], [`ErrorCode`]
//! - **Payloads**: [`Transaction`], [`NodeInfo`], [`TlvRecord`]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

// =============================================================================
// Methods
// =============================================================================

/// Request methods understood by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    PayInvoice,
    GetBalance,
    MakeInvoice,
    LookupInvoice,
    ListTransactions,
    PayKeysend,
    GetInfo,
}

impl Method {
    /// Every supported method, in the order advertised by `get_info`.
    pub const ALL: [Method; 7] = [
        Method::PayInvoice,
        Method::GetBalance,
        Method::MakeInvoice,
        Method::LookupInvoice,
        Method::ListTransactions,
        Method::PayKeysend,
        Method::GetInfo,
    ];

    /// Wire name of the method.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::PayInvoice => "pay_invoice",
            Method::GetBalance => "get_balance",
            Method::MakeInvoice => "make_invoice",
            Method::LookupInvoice => "lookup_invoice",
            Method::ListTransactions => "list_transactions",
            Method::PayKeysend => "pay_keysend",
            Method::GetInfo => "get_info",
        }
    }

    /// Parse a wire method name. Unknown names yield `None`.
    pub fn from_str(s: &str) -> Option<Method> {
        Method::ALL.into_iter().find(|m| m.as_str() == s)
    }

    /// Whether the method moves funds out of the wallet.
    pub fn spends(&self) -> bool {
        matches!(self, Method::PayInvoice | Method::PayKeysend)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Envelopes
// =============================================================================

/// Decrypted request as delivered by the relay sidecar.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Nip47Request {
    /// Method name (kept as a string so unknown methods can be answered).
    pub method: String,
    /// Method-specific parameters.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub params: Value,
}

/// One verified, decrypted relay event.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InboundEvent {
    /// Relay message id; the deduplication key.
    pub id: String,
    /// Requester identity (hex public key).
    pub pubkey: String,
    /// Raw encrypted content, retained for auditing.
    #[serde(default)]
    pub content: String,
    /// Decrypted request.
    pub request: Nip47Request,
}

/// Outbound response handed back to the relay sidecar for encryption,
/// signing and publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ResponseEnvelope {
    /// Relay message id of the request being answered.
    pub event_id: String,
    /// Requester identity the response is addressed to.
    pub recipient: String,
    pub response: Nip47Response,
}

// =============================================================================
// Responses
// =============================================================================

/// Error codes surfaced to applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Internal,
    NotImplemented,
    Expired,
    Restricted,
    QuotaExceeded,
    Other,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::NotImplemented => "NOT_IMPLEMENTED",
            ErrorCode::Expired => "EXPIRED",
            ErrorCode::Restricted => "RESTRICTED",
            ErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCode::Other => "OTHER",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Nip47Error {
    pub code: ErrorCode,
    pub message: String,
}

/// Response body. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Nip47Response {
    pub result_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Nip47Error>,
}

impl Nip47Response {
    pub fn success(result_type: impl Into<String>, result: Value) -> Self {
        Self {
            result_type: result_type.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(result_type: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            result_type: result_type.into(),
            result: None,
            error: Some(Nip47Error {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

// =============================================================================
// Request Params
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct PayInvoiceParams {
    pub invoice: String,
    /// Amount in msat, only honoured for invoices that carry no amount.
    #[serde(default)]
    pub amount: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MakeInvoiceParams {
    /// Amount in msat.
    pub amount: u64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub description_hash: Option<String>,
    /// Expiry in seconds.
    #[serde(default)]
    pub expiry: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LookupInvoiceParams {
    #[serde(default)]
    pub payment_hash: Option<String>,
    #[serde(default)]
    pub invoice: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListTransactionsParams {
    #[serde(default)]
    pub from: Option<u64>,
    #[serde(default)]
    pub until: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub unpaid: Option<bool>,
    #[serde(default, rename = "type")]
    pub transaction_type: Option<TransactionType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TlvRecord {
    #[serde(rename = "type")]
    pub tlv_type: u64,
    /// Hex encoded value.
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayKeysendParams {
    /// Amount in msat.
    pub amount: u64,
    /// Destination node public key (hex).
    #[serde(alias = "pubkey")]
    pub destination: String,
    /// Optional hex preimage; generated when absent.
    #[serde(default)]
    pub preimage: Option<String>,
    #[serde(default, alias = "tlv_records")]
    pub custom_records: Vec<TlvRecord>,
}

// =============================================================================
// Result Payloads
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Incoming,
    Outgoing,
}

/// Backend-neutral transaction record. Amounts are msat, times unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Transaction {
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    #[serde(default)]
    pub invoice: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub description_hash: String,
    #[serde(default)]
    pub preimage: String,
    pub payment_hash: String,
    pub amount: u64,
    #[serde(default)]
    pub fees_paid: u64,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<i64>,
}

impl Transaction {
    pub fn is_settled(&self) -> bool {
        self.settled_at.is_some()
    }
}

/// Node identity and network information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct NodeInfo {
    pub alias: String,
    pub color: String,
    pub pubkey: String,
    pub network: String,
    pub block_height: u32,
    pub block_hash: String,
    #[serde(default)]
    pub methods: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn method_names_round_trip() {
        for method in Method::ALL {
            assert_eq!(Method::from_str(method.as_str()), Some(method));
        }
        assert_eq!(Method::from_str("sign_message"), None);
    }

    #[test]
    fn only_payment_methods_spend() {
        let spending: Vec<_> = Method::ALL.into_iter().filter(Method::spends).collect();
        assert_eq!(spending, vec![Method::PayInvoice, Method::PayKeysend]);
    }

    #[test]
    fn error_response_serializes_without_result() {
        let response = Nip47Response::error("pay_invoice", ErrorCode::QuotaExceeded, "over budget");
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(
            body,
            json!({
                "result_type": "pay_invoice",
                "error": { "code": "QUOTA_EXCEEDED", "message": "over budget" }
            })
        );
    }

    #[test]
    fn request_without_params_defaults_to_null() {
        let request: Nip47Request = serde_json::from_value(json!({ "method": "get_balance" })).unwrap();
        assert_eq!(request.method, "get_balance");
        assert!(request.params.is_null());
    }

    #[test]
    fn list_params_accept_type_filter() {
        let params: ListTransactionsParams =
            serde_json::from_value(json!({ "limit": 5, "type": "outgoing", "unpaid": true })).unwrap();
        assert_eq!(params.limit, Some(5));
        assert_eq!(params.transaction_type, Some(TransactionType::Outgoing));
        assert_eq!(params.unpaid, Some(true));
    }
}
