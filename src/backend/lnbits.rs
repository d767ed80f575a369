// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! LNbits custodial wallet adapter.
//!
//! Authenticates with the wallet admin key. LNbits has no node-level
//! capabilities, so `get_info` and keysend are reported as unsupported.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::http::{build_client, endpoint, send_json};
use super::{
    paginate, BackendError, BackendKind, BackendResult, KeysendRequest, LightningBackend,
    MakeInvoiceRequest, PaymentStatus, RequestContext, TransactionQuery, TransactionStream,
    DEFAULT_TIMEOUT, PAYMENT_TIMEOUT,
};
use crate::models::{NodeInfo, Transaction, TransactionType};

const LIST_PAGE_SIZE: usize = 50;

#[derive(Clone)]
pub struct LnBitsClient {
    host: String,
    admin_key: String,
    http: Client,
}

impl fmt::Debug for LnBitsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LnBitsClient")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct WalletResponse {
    /// Balance in msat.
    balance: i64,
}

#[derive(Debug, Deserialize)]
struct CreatedPayment {
    payment_hash: String,
    #[serde(default, alias = "bolt11")]
    payment_request: String,
}

/// LNbits has reported times both as unix seconds and as ISO strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Timestamp {
    Unix(i64),
    Text(String),
}

impl Timestamp {
    fn unix(&self) -> i64 {
        match self {
            Timestamp::Unix(secs) => *secs,
            Timestamp::Text(text) => DateTime::parse_from_rfc3339(text)
                .map(|t| t.with_timezone(&Utc).timestamp())
                .or_else(|_| {
                    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                        .map(|t| t.and_utc().timestamp())
                })
                .unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PaymentDetails {
    #[serde(default)]
    pending: bool,
    #[serde(default)]
    status: Option<String>,
    /// Signed msat amount; negative for outgoing payments.
    amount: i64,
    #[serde(default)]
    fee: i64,
    #[serde(default)]
    memo: Option<String>,
    time: Timestamp,
    #[serde(default)]
    bolt11: String,
    #[serde(default)]
    preimage: Option<String>,
    payment_hash: String,
    #[serde(default)]
    expiry: Option<Timestamp>,
}

#[derive(Debug, Deserialize)]
struct PaymentLookup {
    paid: bool,
    #[serde(default)]
    preimage: Option<String>,
    #[serde(default)]
    details: Option<PaymentDetails>,
}

fn is_zero_preimage(preimage: &str) -> bool {
    preimage.is_empty() || preimage.bytes().all(|b| b == b'0')
}

impl PaymentDetails {
    fn is_failed(&self) -> bool {
        self.status.as_deref() == Some("failed")
    }

    fn into_transaction(self) -> Transaction {
        let settled = !self.pending && !self.is_failed();
        let created_at = self.time.unix();
        let preimage = self
            .preimage
            .filter(|p| settled && !is_zero_preimage(p))
            .unwrap_or_default();
        Transaction {
            transaction_type: if self.amount < 0 {
                TransactionType::Outgoing
            } else {
                TransactionType::Incoming
            },
            invoice: self.bolt11,
            description: self.memo.unwrap_or_default(),
            description_hash: String::new(),
            preimage,
            payment_hash: self.payment_hash,
            amount: self.amount.unsigned_abs(),
            fees_paid: self.fee.unsigned_abs(),
            created_at,
            expires_at: self.expiry.map(|e| e.unix()),
            settled_at: settled.then_some(created_at),
        }
    }
}

impl LnBitsClient {
    pub fn new(host: &str, admin_key: &str) -> BackendResult<Self> {
        if host.trim().is_empty() {
            return Err(BackendError::Configuration("LNbits host is empty".to_string()));
        }
        if admin_key.trim().is_empty() {
            return Err(BackendError::Configuration("LNbits admin key is empty".to_string()));
        }
        Ok(Self {
            host: host.trim().to_string(),
            admin_key: admin_key.trim().to_string(),
            http: build_client(DEFAULT_TIMEOUT, None)?,
        })
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> BackendResult<T> {
        let request = self
            .http
            .get(endpoint(&self.host, path))
            .header("X-Api-Key", &self.admin_key);
        send_json(request, path).await
    }

    async fn lookup(&self, payment_hash: &str) -> BackendResult<PaymentLookup> {
        self.get(&format!("/api/v1/payments/{payment_hash}")).await
    }

    async fn list_page(&self, page: usize) -> BackendResult<Vec<Transaction>> {
        let path = format!(
            "/api/v1/payments?limit={LIST_PAGE_SIZE}&offset={}",
            page * LIST_PAGE_SIZE
        );
        let details: Vec<PaymentDetails> = self.get(&path).await?;
        Ok(details.into_iter().map(PaymentDetails::into_transaction).collect())
    }
}

#[async_trait]
impl LightningBackend for LnBitsClient {
    fn kind(&self) -> BackendKind {
        BackendKind::LnBits
    }

    async fn get_balance(&self, ctx: &RequestContext) -> BackendResult<u64> {
        let wallet: WalletResponse = ctx.guard(self.get("/api/v1/wallet")).await?;
        Ok(wallet.balance.max(0) as u64)
    }

    async fn pay_invoice(
        &self,
        ctx: &RequestContext,
        invoice: &str,
        amount_msat: Option<u64>,
    ) -> BackendResult<String> {
        if amount_msat.is_some() {
            return Err(BackendError::Unsupported("paying amountless invoices"));
        }
        debug!(event_id = %ctx.event_id, "LNbits: sending payment");
        let request = self
            .http
            .post(endpoint(&self.host, "/api/v1/payments"))
            .header("X-Api-Key", &self.admin_key)
            .timeout(PAYMENT_TIMEOUT)
            .json(&json!({ "out": true, "bolt11": invoice }));
        let created: CreatedPayment = send_json(request, "/api/v1/payments").await?;

        // The payment is out of our hands now. Anything short of a definite
        // answer is reported as a timeout so the attempt stays pending.
        match self.lookup_payment(ctx, &created.payment_hash).await {
            Ok(PaymentStatus::Settled { preimage }) => Ok(preimage),
            Ok(PaymentStatus::Failed { reason }) => Err(BackendError::PaymentFailed { reason }),
            Ok(PaymentStatus::InFlight) => {
                debug!(event_id = %ctx.event_id, payment_hash = %created.payment_hash, "LNbits: payment still in flight");
                Err(BackendError::Timeout)
            }
            Err(e) => {
                warn!(
                    event_id = %ctx.event_id,
                    payment_hash = %created.payment_hash,
                    error = %e,
                    "LNbits: payment sent but status lookup failed"
                );
                Err(BackendError::Timeout)
            }
        }
    }

    async fn make_invoice(
        &self,
        ctx: &RequestContext,
        request: &MakeInvoiceRequest,
    ) -> BackendResult<Transaction> {
        // LNbits takes whole sats; refuse rather than round.
        if request.amount_msat % 1000 != 0 {
            return Err(BackendError::InvalidRequest(format!(
                "amount {} msat is not a whole number of sats",
                request.amount_msat
            )));
        }
        let mut body = json!({
            "out": false,
            "amount": request.amount_msat / 1000,
            "memo": request.description.clone().unwrap_or_default(),
        });
        if let Some(hash) = &request.description_hash {
            body["description_hash"] = Value::String(hash.clone());
        }
        if let Some(expiry) = request.expiry {
            body["expiry"] = json!(expiry);
        }

        let call = async {
            let http_request = self
                .http
                .post(endpoint(&self.host, "/api/v1/payments"))
                .header("X-Api-Key", &self.admin_key)
                .json(&body);
            send_json::<CreatedPayment>(http_request, "/api/v1/payments").await
        };
        let created = ctx.guard(call).await?;

        let created_at = Utc::now().timestamp();
        Ok(Transaction {
            transaction_type: TransactionType::Incoming,
            invoice: created.payment_request,
            description: request.description.clone().unwrap_or_default(),
            description_hash: request.description_hash.clone().unwrap_or_default(),
            preimage: String::new(),
            payment_hash: created.payment_hash,
            amount: request.amount_msat,
            fees_paid: 0,
            created_at,
            expires_at: request.expiry.map(|e| created_at + e as i64),
            settled_at: None,
        })
    }

    async fn lookup_invoice(&self, ctx: &RequestContext, payment_hash: &str) -> BackendResult<Transaction> {
        let lookup = ctx.guard(self.lookup(payment_hash)).await?;
        let details = lookup
            .details
            .ok_or_else(|| BackendError::Protocol("payment lookup without details".to_string()))?;
        Ok(details.into_transaction())
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

    async fn pay_keysend(&self, _ctx: &RequestContext, _request: &KeysendRequest) -> BackendResult<String> {
        Err(BackendError::Unsupported("pay_keysend"))
    }

    async fn get_info(&self, _ctx: &RequestContext) -> BackendResult<NodeInfo> {
        Err(BackendError::Unsupported("get_info"))
    }

    async fn lookup_payment(&self, ctx: &RequestContext, payment_hash: &str) -> BackendResult<PaymentStatus> {
        let lookup = ctx.guard(self.lookup(payment_hash)).await?;
        if lookup.paid {
            if let Some(preimage) = lookup.preimage.filter(|p| !is_zero_preimage(p)) {
                return Ok(PaymentStatus::Settled { preimage });
            }
        }
        if lookup.details.as_ref().is_some_and(PaymentDetails::is_failed) {
            return Ok(PaymentStatus::Failed {
                reason: "payment failed".to_string(),
            });
        }
        Ok(PaymentStatus::InFlight)
    }
}
