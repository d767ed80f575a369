// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Alby hosted wallet adapter.
//!
//! The hosted API speaks whole satoshis; msat amounts that do not divide
//! evenly are rejected instead of rounded. The OAuth token exchange happens
//! outside this service; the adapter only carries the resulting access token.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::http::{build_client, endpoint, send_json};
use super::{
    paginate, BackendError, BackendKind, BackendResult, KeysendRequest, LightningBackend,
    MakeInvoiceRequest, PaymentStatus, RequestContext, TransactionQuery, TransactionStream,
    DEFAULT_TIMEOUT, PAYMENT_TIMEOUT,
};
use crate::models::{Method, NodeInfo, Transaction, TransactionType};

pub const DEFAULT_API_URL: &str = "https://api.getalby.com";

const LIST_PAGE_SIZE: usize = 50;

#[derive(Clone)]
pub struct AlbyClient {
    api_url: String,
    access_token: String,
    http: Client,
}

impl fmt::Debug for AlbyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlbyClient")
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    /// Balance in sats.
    balance: i64,
}

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    #[serde(default)]
    payment_preimage: String,
}

#[derive(Debug, Deserialize)]
struct AlbyInvoice {
    #[serde(rename = "type", default)]
    invoice_type: String,
    /// Amount in sats.
    #[serde(default)]
    amount: u64,
    #[serde(default)]
    fee: Option<u64>,
    #[serde(default)]
    memo: Option<String>,
    #[serde(default)]
    description_hash: Option<String>,
    #[serde(default)]
    payment_hash: String,
    #[serde(default)]
    payment_request: String,
    #[serde(default)]
    preimage: Option<String>,
    #[serde(default)]
    settled: bool,
    #[serde(default)]
    state: Option<String>,
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    settled_at: Option<DateTime<Utc>>,
}

impl AlbyInvoice {
    fn is_failed(&self) -> bool {
        matches!(self.state.as_deref(), Some("FAILED") | Some("CANCELLED"))
    }

    fn into_transaction(self) -> Transaction {
        let created_at = self.created_at.map(|t| t.timestamp()).unwrap_or_default();
        let settled_at = if self.settled {
            Some(self.settled_at.map(|t| t.timestamp()).unwrap_or(created_at))
        } else {
            None
        };
        Transaction {
            transaction_type: if self.invoice_type == "outgoing" {
                TransactionType::Outgoing
            } else {
                TransactionType::Incoming
            },
            invoice: self.payment_request,
            description: self.memo.unwrap_or_default(),
            description_hash: self.description_hash.unwrap_or_default(),
            preimage: if self.settled {
                self.preimage.unwrap_or_default()
            } else {
                String::new()
            },
            payment_hash: self.payment_hash,
            amount: self.amount.saturating_mul(1000),
            fees_paid: self.fee.unwrap_or(0).saturating_mul(1000),
            created_at,
            expires_at: self.expires_at.map(|t| t.timestamp()),
            settled_at,
        }
    }
}

/// The `message` field of an Alby error body, never the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| "payment failed".to_string())
}

fn whole_sats(amount_msat: u64) -> BackendResult<u64> {
    if amount_msat % 1000 != 0 {
        return Err(BackendError::InvalidRequest(format!(
            "amount {amount_msat} msat is not a whole number of sats"
        )));
    }
    Ok(amount_msat / 1000)
}

impl AlbyClient {
    pub fn new(api_url: &str, access_token: &str) -> BackendResult<Self> {
        if access_token.trim().is_empty() {
            return Err(BackendError::Configuration("Alby access token is empty".to_string()));
        }
        let api_url = if api_url.trim().is_empty() {
            DEFAULT_API_URL
        } else {
            api_url.trim()
        };
        Ok(Self {
            api_url: api_url.to_string(),
            access_token: access_token.trim().to_string(),
            http: build_client(DEFAULT_TIMEOUT, None)?,
        })
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> BackendResult<T> {
        let request = self
            .http
            .get(endpoint(&self.api_url, path))
            .bearer_auth(&self.access_token);
        send_json(request, path).await
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Value,
        paying: bool,
    ) -> BackendResult<T> {
        let mut request = self
            .http
            .post(endpoint(&self.api_url, path))
            .bearer_auth(&self.access_token)
            .json(body);
        if paying {
            request = request.timeout(PAYMENT_TIMEOUT);
        }
        send_json(request, path).await
    }

    async fn send_payment(&self, path: &str, body: &Value) -> BackendResult<String> {
        let response: PaymentResponse = self.post(path, body, true).await.map_err(|e| match e {
            // Alby reports routing failures as 400 with a JSON message
            BackendError::Http { status: 400, body } => BackendError::PaymentFailed {
                reason: error_message(&body),
            },
            other => other,
        })?;
        if response.payment_preimage.is_empty() {
            return Err(BackendError::Protocol("payment returned no preimage".to_string()));
        }
        Ok(response.payment_preimage)
    }

    async fn list_page(&self, page: usize) -> BackendResult<Vec<Transaction>> {
        // Alby pages are 1-based.
        let path = format!("/invoices?page={}&items={LIST_PAGE_SIZE}", page + 1);
        let invoices: Vec<AlbyInvoice> = self.get(&path).await?;
        Ok(invoices.into_iter().map(AlbyInvoice::into_transaction).collect())
    }
}

#[async_trait]
impl LightningBackend for AlbyClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Alby
    }

    async fn get_balance(&self, ctx: &RequestContext) -> BackendResult<u64> {
        let response: BalanceResponse = ctx.guard(self.get("/balance")).await?;
        Ok((response.balance.max(0) as u64).saturating_mul(1000))
    }

    async fn pay_invoice(
        &self,
        ctx: &RequestContext,
        invoice: &str,
        amount_msat: Option<u64>,
    ) -> BackendResult<String> {
        let mut body = json!({ "invoice": invoice });
        if let Some(amount) = amount_msat {
            body["amount"] = json!(whole_sats(amount)?);
        }
        debug!(event_id = %ctx.event_id, "Alby: sending payment");
        self.send_payment("/payments/bolt11", &body).await
    }

    async fn make_invoice(
        &self,
        ctx: &RequestContext,
        request: &MakeInvoiceRequest,
    ) -> BackendResult<Transaction> {
        let mut body = json!({
            "amount": whole_sats(request.amount_msat)?,
            "description": request.description.clone().unwrap_or_default(),
        });
        if let Some(hash) = &request.description_hash {
            body["description_hash"] = Value::String(hash.clone());
        }
        if let Some(expiry) = request.expiry {
            body["expiry"] = json!(expiry);
        }

        let invoice: AlbyInvoice = ctx.guard(self.post("/invoices", &body, false)).await?;
        let mut tx = invoice.into_transaction();
        tx.transaction_type = TransactionType::Incoming;
        tx.amount = request.amount_msat;
        if tx.created_at == 0 {
            tx.created_at = Utc::now().timestamp();
        }
        if tx.description.is_empty() {
            tx.description = request.description.clone().unwrap_or_default();
        }
        Ok(tx)
    }

    async fn lookup_invoice(&self, ctx: &RequestContext, payment_hash: &str) -> BackendResult<Transaction> {
        let path = format!("/invoices/{payment_hash}");
        let invoice: AlbyInvoice = ctx.guard(self.get(&path)).await?;
        Ok(invoice.into_transaction())
    }

    async fn list_transactions(
        &self,
        _ctx: &RequestContext,
        query: TransactionQuery,
    ) -> BackendResult<TransactionStream> {
        let client = self.clone();
        Ok(paginate(query, LIST_PAGE_SIZE, move |page| {
            let client = client.clone();
            async move { client.list_page(page).await }
        }))
    }

    async fn pay_keysend(&self, ctx: &RequestContext, request: &KeysendRequest) -> BackendResult<String> {
        let records: HashMap<String, String> = request
            .custom_records
            .iter()
            .map(|r| (r.tlv_type.to_string(), r.value.clone()))
            .collect();
        let body = json!({
            "amount": whole_sats(request.amount_msat)?,
            "destination": request.destination,
            "preimage": request.preimage,
            "custom_records": records,
        });
        debug!(event_id = %ctx.event_id, destination = %request.destination, "Alby: sending keysend");
        self.send_payment("/payments/keysend", &body).await
    }

    async fn get_info(&self, _ctx: &RequestContext) -> BackendResult<NodeInfo> {
        // The hosted wallet exposes no node identity.
        Ok(NodeInfo {
            alias: "getalby.com".to_string(),
            color: String::new(),
            pubkey: String::new(),
            network: "mainnet".to_string(),
            block_height: 0,
            block_hash: String::new(),
            methods: Method::ALL.iter().map(|m| m.as_str().to_string()).collect(),
        })
    }

    async fn lookup_payment(&self, ctx: &RequestContext, payment_hash: &str) -> BackendResult<PaymentStatus> {
        let path = format!("/invoices/{payment_hash}");
        let invoice: AlbyInvoice = ctx.guard(self.get(&path)).await?;
        if invoice.is_failed() {
            return Ok(PaymentStatus::Failed {
                reason: "payment failed".to_string(),
            });
        }
        match invoice.preimage {
            Some(preimage) if invoice.settled && !preimage.is_empty() => {
                Ok(PaymentStatus::Settled { preimage })
            }
            _ => Ok(PaymentStatus::InFlight),
        }
    }
}
