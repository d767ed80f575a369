// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! LND node adapter over the REST gateway.
//!
//! LND encodes 64-bit integers as decimal strings and byte fields as
//! base64; both are normalised here to msat integers and hex strings.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::http::{build_client, endpoint, parse_i64, parse_u64, send_json};
use super::{
    paginate, BackendError, BackendKind, BackendResult, KeysendRequest, LightningBackend,
    MakeInvoiceRequest, PaymentStatus, RequestContext, TransactionQuery, TransactionStream,
    DEFAULT_TIMEOUT, PAYMENT_TIMEOUT,
};
use crate::models::{Method, NodeInfo, Transaction, TransactionType};

/// TLV record type carrying the keysend preimage.
pub const KEYSEND_PREIMAGE_TLV: u64 = 5_482_373_484;

/// Invoices and payments pulled per listing call.
const LIST_PAGE_SIZE: usize = 100;

/// Default invoice expiry applied by LND when none is given.
const DEFAULT_INVOICE_EXPIRY_SECS: i64 = 86_400;

#[derive(Clone)]
pub struct LndClient {
    base_url: String,
    macaroon_hex: String,
    http: Client,
}

impl fmt::Debug for LndClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LndClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// REST Shapes
// =============================================================================

#[derive(Debug, Deserialize)]
struct Amount {
    #[serde(default)]
    msat: String,
}

#[derive(Debug, Deserialize)]
struct ChannelBalanceResponse {
    local_balance: Option<Amount>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    payment_error: String,
    #[serde(default)]
    payment_preimage: String,
}

#[derive(Debug, Deserialize)]
struct AddInvoiceResponse {
    r_hash: String,
    payment_request: String,
}

#[derive(Debug, Deserialize)]
struct LndInvoice {
    #[serde(default)]
    memo: String,
    #[serde(default)]
    r_preimage: String,
    #[serde(default)]
    r_hash: String,
    #[serde(default)]
    value_msat: String,
    #[serde(default)]
    amt_paid_msat: String,
    #[serde(default)]
    creation_date: String,
    #[serde(default)]
    settle_date: String,
    #[serde(default)]
    payment_request: String,
    #[serde(default)]
    description_hash: String,
    #[serde(default)]
    expiry: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct ListInvoiceResponse {
    #[serde(default)]
    invoices: Vec<LndInvoice>,
}

#[derive(Debug, Deserialize)]
struct LndPayment {
    #[serde(default)]
    payment_hash: String,
    #[serde(default)]
    payment_preimage: String,
    #[serde(default)]
    value_msat: String,
    #[serde(default)]
    fee_msat: String,
    #[serde(default)]
    creation_date: String,
    #[serde(default)]
    payment_request: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    failure_reason: String,
}

#[derive(Debug, Deserialize)]
struct ListPaymentsResponse {
    #[serde(default)]
    payments: Vec<LndPayment>,
}

#[derive(Debug, Deserialize)]
struct Chain {
    #[serde(default)]
    network: String,
}

#[derive(Debug, Deserialize)]
struct GetInfoResponse {
    #[serde(default)]
    identity_pubkey: String,
    #[serde(default)]
    alias: String,
    #[serde(default)]
    color: String,
    #[serde(default)]
    block_height: u32,
    #[serde(default)]
    block_hash: String,
    #[serde(default)]
    chains: Vec<Chain>,
}

// =============================================================================
// Conversions
// =============================================================================

fn b64_to_hex(field: &str, value: &str) -> BackendResult<String> {
    if value.is_empty() {
        return Ok(String::new());
    }
    BASE64
        .decode(value)
        .map(hex::encode)
        .map_err(|e| BackendError::Protocol(format!("{field} is not base64: {e}")))
}

fn hex_to_b64(field: &str, value: &str) -> BackendResult<String> {
    hex::decode(value.trim())
        .map(|bytes| BASE64.encode(bytes))
        .map_err(|e| BackendError::InvalidRequest(format!("{field} is not hex: {e}")))
}

impl LndInvoice {
    fn into_transaction(self) -> BackendResult<Transaction> {
        let created_at = parse_i64("creation_date", &self.creation_date)?;
        let expiry = match parse_i64("expiry", &self.expiry)? {
            0 => DEFAULT_INVOICE_EXPIRY_SECS,
            secs => secs,
        };
        let settled = self.state == "SETTLED";
        let paid = parse_u64("amt_paid_msat", &self.amt_paid_msat)?;
        let amount = match parse_u64("value_msat", &self.value_msat)? {
            0 => paid,
            value => value,
        };
        Ok(Transaction {
            transaction_type: TransactionType::Incoming,
            invoice: self.payment_request,
            description: self.memo,
            description_hash: b64_to_hex("description_hash", &self.description_hash)?,
            preimage: if settled {
                b64_to_hex("r_preimage", &self.r_preimage)?
            } else {
                String::new()
            },
            payment_hash: b64_to_hex("r_hash", &self.r_hash)?,
            amount,
            fees_paid: 0,
            created_at,
            expires_at: Some(created_at + expiry),
            settled_at: if settled {
                Some(parse_i64("settle_date", &self.settle_date)?)
            } else {
                None
            },
        })
    }
}

impl LndPayment {
    fn into_transaction(self) -> BackendResult<Transaction> {
        let created_at = parse_i64("creation_date", &self.creation_date)?;
        let settled = self.status == "SUCCEEDED";
        Ok(Transaction {
            transaction_type: TransactionType::Outgoing,
            invoice: self.payment_request,
            description: String::new(),
            description_hash: String::new(),
            preimage: if settled { self.payment_preimage } else { String::new() },
            payment_hash: self.payment_hash,
            amount: parse_u64("value_msat", &self.value_msat)?,
            fees_paid: parse_u64("fee_msat", &self.fee_msat)?,
            created_at,
            expires_at: None,
            settled_at: settled.then_some(created_at),
        })
    }
}

// =============================================================================
// Client
// =============================================================================

impl LndClient {
    /// `macaroon_hex` is the hex-encoded admin macaroon; `cert_pem` pins the
    /// node's self-signed TLS certificate.
    pub fn new(base_url: &str, macaroon_hex: &str, cert_pem: Option<&[u8]>) -> BackendResult<Self> {
        if base_url.trim().is_empty() {
            return Err(BackendError::Configuration("LND address is empty".to_string()));
        }
        if macaroon_hex.trim().is_empty() {
            return Err(BackendError::Configuration("LND macaroon is empty".to_string()));
        }
        Ok(Self {
            base_url: base_url.trim().to_string(),
            macaroon_hex: macaroon_hex.trim().to_string(),
            http: build_client(DEFAULT_TIMEOUT, cert_pem)?,
        })
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> BackendResult<T> {
        let request = self
            .http
            .get(endpoint(&self.base_url, path))
            .header("Grpc-Metadata-macaroon", &self.macaroon_hex);
        send_json(request, path).await
    }

    async fn post<T: for<'de> Deserialize<'de>>(&self, path: &str, body: &Value) -> BackendResult<T> {
        let request = self
            .http
            .post(endpoint(&self.base_url, path))
            .header("Grpc-Metadata-macaroon", &self.macaroon_hex)
            .json(body);
        send_json(request, path).await
    }

    /// Synchronous send with the payment deadline applied.
    async fn send_payment(&self, body: &Value) -> BackendResult<String> {
        let request = self
            .http
            .post(endpoint(&self.base_url, "/v1/channels/transactions"))
            .header("Grpc-Metadata-macaroon", &self.macaroon_hex)
            .timeout(PAYMENT_TIMEOUT)
            .json(body);
        let response: SendResponse = send_json(request, "/v1/channels/transactions").await?;

        if !response.payment_error.is_empty() {
            return Err(BackendError::PaymentFailed {
                reason: response.payment_error,
            });
        }
        let preimage = b64_to_hex("payment_preimage", &response.payment_preimage)?;
        if preimage.is_empty() {
            return Err(BackendError::Protocol("payment returned no preimage".to_string()));
        }
        Ok(preimage)
    }

    async fn list_invoices(&self) -> BackendResult<Vec<Transaction>> {
        let path = format!("/v1/invoices?reversed=true&num_max_invoices={LIST_PAGE_SIZE}");
        let response: ListInvoiceResponse = self.get(&path).await?;
        response
            .invoices
            .into_iter()
            .map(LndInvoice::into_transaction)
            .collect()
    }

    async fn list_payments(&self, include_incomplete: bool) -> BackendResult<Vec<LndPayment>> {
        let path = format!(
            "/v1/payments?reversed=true&include_incomplete={include_incomplete}&max_payments={LIST_PAGE_SIZE}"
        );
        let response: ListPaymentsResponse = self.get(&path).await?;
        Ok(response.payments)
    }

    /// Most recent invoices and payments merged newest-first.
    async fn recent_transactions(&self) -> BackendResult<Vec<Transaction>> {
        let mut merged = self.list_invoices().await?;
        for payment in self.list_payments(true).await? {
            merged.push(payment.into_transaction()?);
        }
        merged.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(merged)
    }
}

#[async_trait]
impl LightningBackend for LndClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Lnd
    }

    async fn get_balance(&self, ctx: &RequestContext) -> BackendResult<u64> {
        let response: ChannelBalanceResponse = ctx.guard(self.get("/v1/balance/channels")).await?;
        let local = response
            .local_balance
            .ok_or_else(|| BackendError::Protocol("missing local_balance".to_string()))?;
        parse_u64("local_balance.msat", &local.msat)
    }

    async fn pay_invoice(
        &self,
        ctx: &RequestContext,
        invoice: &str,
        amount_msat: Option<u64>,
    ) -> BackendResult<String> {
        debug!(event_id = %ctx.event_id, "LND: sending payment");
        let mut body = json!({ "payment_request": invoice });
        if let Some(amount) = amount_msat {
            body["amt_msat"] = Value::String(amount.to_string());
        }
        self.send_payment(&body).await
    }

    async fn make_invoice(
        &self,
        ctx: &RequestContext,
        request: &MakeInvoiceRequest,
    ) -> BackendResult<Transaction> {
        let mut body = json!({
            "value_msat": request.amount_msat.to_string(),
            "memo": request.description.clone().unwrap_or_default(),
        });
        if let Some(hash) = &request.description_hash {
            body["description_hash"] = Value::String(hex_to_b64("description_hash", hash)?);
        }
        if let Some(expiry) = request.expiry {
            body["expiry"] = Value::String(expiry.to_string());
        }

        let response: AddInvoiceResponse = ctx.guard(self.post("/v1/invoices", &body)).await?;
        let created_at = Utc::now().timestamp();
        let expiry = request.expiry.map(|e| e as i64).unwrap_or(DEFAULT_INVOICE_EXPIRY_SECS);
        Ok(Transaction {
            transaction_type: TransactionType::Incoming,
            invoice: response.payment_request,
            description: request.description.clone().unwrap_or_default(),
            description_hash: request.description_hash.clone().unwrap_or_default(),
            preimage: String::new(),
            payment_hash: b64_to_hex("r_hash", &response.r_hash)?,
            amount: request.amount_msat,
            fees_paid: 0,
            created_at,
            expires_at: Some(created_at + expiry),
            settled_at: None,
        })
    }

    async fn lookup_invoice(&self, ctx: &RequestContext, payment_hash: &str) -> BackendResult<Transaction> {
        if hex::decode(payment_hash).is_err() {
            return Err(BackendError::InvalidRequest("payment hash is not hex".to_string()));
        }
        let path = format!("/v1/invoice/{payment_hash}");
        let invoice: LndInvoice = ctx.guard(self.get(&path)).await?;
        invoice.into_transaction()
    }

    async fn list_transactions(
        &self,
        _ctx: &RequestContext,
        query: TransactionQuery,
    ) -> BackendResult<TransactionStream> {
        let client = self.clone();
        // Both listings are merged into one page, so the stream ends after it.
        Ok(paginate(query, usize::MAX, move |_page| {
            let client = client.clone();
            async move { client.recent_transactions().await }
        }))
    }

    async fn pay_keysend(&self, ctx: &RequestContext, request: &KeysendRequest) -> BackendResult<String> {
        let preimage = hex::decode(request.preimage.trim())
            .map_err(|e| BackendError::InvalidRequest(format!("preimage is not hex: {e}")))?;
        let payment_hash = BASE64.encode(Sha256::digest(&preimage));

        let mut records: HashMap<String, String> = HashMap::new();
        for record in &request.custom_records {
            records.insert(record.tlv_type.to_string(), hex_to_b64("tlv value", &record.value)?);
        }
        records.insert(KEYSEND_PREIMAGE_TLV.to_string(), BASE64.encode(&preimage));

        let body = json!({
            "dest": hex_to_b64("destination", &request.destination)?,
            "amt_msat": request.amount_msat.to_string(),
            "payment_hash": payment_hash,
            "dest_custom_records": records,
        });
        debug!(event_id = %ctx.event_id, destination = %request.destination, "LND: sending keysend");
        self.send_payment(&body).await
    }

    async fn get_info(&self, ctx: &RequestContext) -> BackendResult<NodeInfo> {
        let info: GetInfoResponse = ctx.guard(self.get("/v1/getinfo")).await?;
        Ok(NodeInfo {
            alias: info.alias,
            color: info.color,
            pubkey: info.identity_pubkey,
            network: info
                .chains
                .into_iter()
                .next()
                .map(|c| c.network)
                .unwrap_or_else(|| "mainnet".to_string()),
            block_height: info.block_height,
            block_hash: info.block_hash,
            methods: Method::ALL.iter().map(|m| m.as_str().to_string()).collect(),
        })
    }

    async fn lookup_payment(&self, ctx: &RequestContext, payment_hash: &str) -> BackendResult<PaymentStatus> {
        let payments = ctx.guard(self.list_payments(true)).await?;
        let payment = payments
            .into_iter()
            .find(|p| p.payment_hash.eq_ignore_ascii_case(payment_hash))
            .ok_or_else(|| BackendError::NotFound(format!("payment {payment_hash}")))?;

        Ok(match payment.status.as_str() {
            "SUCCEEDED" if !payment.payment_preimage.is_empty() => PaymentStatus::Settled {
                preimage: payment.payment_preimage,
            },
            "FAILED" => PaymentStatus::Failed {
                reason: if payment.failure_reason.is_empty() {
                    "payment failed".to_string()
                } else {
                    payment.failure_reason
                },
            },
            _ => PaymentStatus::InFlight,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MACAROON: &str = "0201036c6e64";

    fn ctx() -> RequestContext {
        RequestContext::new("evt-1", "app-1", "ab".repeat(32), CancellationToken::new())
    }

    async fn client(server: &MockServer) -> LndClient {
        LndClient::new(&server.uri(), MACAROON, None).unwrap()
    }

    #[tokio::test]
    async fn balance_reads_local_msat_with_macaroon() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/balance/channels"))
            .and(header("Grpc-Metadata-macaroon", MACAROON))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "balance": "21",
                "local_balance": { "sat": "21", "msat": "21123" }
            })))
            .mount(&server)
            .await;

        assert_eq!(client(&server).await.get_balance(&ctx()).await.unwrap(), 21_123);
    }

    #[tokio::test]
    async fn pay_invoice_converts_preimage_to_hex() {
        let server = MockServer::start().await;
        let preimage = [7u8; 32];
        Mock::given(method("POST"))
            .and(path("/v1/channels/transactions"))
            .and(body_partial_json(json!({ "payment_request": "lnbcrt1test" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "payment_error": "",
                "payment_preimage": BASE64.encode(preimage),
            })))
            .mount(&server)
            .await;

        let result = client(&server)
            .await
            .pay_invoice(&ctx(), "lnbcrt1test", None)
            .await
            .unwrap();
        assert_eq!(result, hex::encode(preimage));
    }

    #[tokio::test]
    async fn pay_invoice_surfaces_payment_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/channels/transactions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "payment_error": "no_route",
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .pay_invoice(&ctx(), "lnbcrt1test", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::PaymentFailed { reason } if reason == "no_route"));
    }

    #[tokio::test]
    async fn lookup_invoice_maps_not_found() {
        let server = MockServer::start().await;
        let hash = "aa".repeat(32);
        Mock::given(method("GET"))
            .and(path(format!("/v1/invoice/{hash}")))
            .respond_with(ResponseTemplate::new(404).set_body_string("invoice not found"))
            .mount(&server)
            .await;

        let err = client(&server).await.lookup_invoice(&ctx(), &hash).await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
    }

    #[tokio::test]
    async fn settled_invoice_becomes_incoming_transaction() {
        let server = MockServer::start().await;
        let hash = [0xaa_u8; 32];
        let preimage = [0xbb_u8; 32];
        Mock::given(method("GET"))
            .and(path(format!("/v1/invoice/{}", hex::encode(hash))))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "memo": "coffee",
                "r_hash": BASE64.encode(hash),
                "r_preimage": BASE64.encode(preimage),
                "value_msat": "150000",
                "creation_date": "1700000000",
                "settle_date": "1700000100",
                "expiry": "3600",
                "payment_request": "lnbcrt1500n1...",
                "state": "SETTLED",
            })))
            .mount(&server)
            .await;

        let tx = client(&server)
            .await
            .lookup_invoice(&ctx(), &hex::encode(hash))
            .await
            .unwrap();
        assert_eq!(tx.transaction_type, TransactionType::Incoming);
        assert_eq!(tx.amount, 150_000);
        assert_eq!(tx.preimage, hex::encode(preimage));
        assert_eq!(tx.expires_at, Some(1_700_003_600));
        assert_eq!(tx.settled_at, Some(1_700_000_100));
    }

    #[tokio::test]
    async fn keysend_embeds_preimage_record() {
        let server = MockServer::start().await;
        let preimage = [9u8; 32];
        Mock::given(method("POST"))
            .and(path("/v1/channels/transactions"))
            .and(body_partial_json(json!({
                "amt_msat": "5000",
                "dest_custom_records": { "5482373484": BASE64.encode(preimage) }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "payment_preimage": BASE64.encode(preimage),
            })))
            .mount(&server)
            .await;

        let request = KeysendRequest {
            amount_msat: 5_000,
            destination: "02".repeat(33),
            preimage: hex::encode(preimage),
            custom_records: Vec::new(),
        };
        let result = client(&server).await.pay_keysend(&ctx(), &request).await.unwrap();
        assert_eq!(result, hex::encode(preimage));
    }

    #[tokio::test]
    async fn list_transactions_merges_newest_first() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/invoices"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "invoices": [{
                    "r_hash": BASE64.encode([1u8; 32]),
                    "value_msat": "1000",
                    "creation_date": "100",
                    "settle_date": "101",
                    "state": "SETTLED",
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/payments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "payments": [{
                    "payment_hash": "02".repeat(32),
                    "payment_preimage": "03".repeat(32),
                    "value_msat": "2000",
                    "fee_msat": "5",
                    "creation_date": "200",
                    "status": "SUCCEEDED",
                }]
            })))
            .mount(&server)
            .await;

        let stream = client(&server)
            .await
            .list_transactions(&ctx(), TransactionQuery::default())
            .await
            .unwrap();
        let txs: Vec<Transaction> = stream.try_collect().await.unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].transaction_type, TransactionType::Outgoing);
        assert_eq!(txs[0].fees_paid, 5);
        assert_eq!(txs[1].amount, 1_000);
    }

    #[tokio::test]
    async fn lookup_payment_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/payments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "payments": [
                    { "payment_hash": "0a".repeat(32), "status": "IN_FLIGHT" },
                    { "payment_hash": "0b".repeat(32), "status": "FAILED", "failure_reason": "FAILURE_REASON_NO_ROUTE" },
                    { "payment_hash": "0c".repeat(32), "status": "SUCCEEDED", "payment_preimage": "0d".repeat(32) }
                ]
            })))
            .mount(&server)
            .await;

        let lnd = client(&server).await;
        assert_eq!(
            lnd.lookup_payment(&ctx(), &"0a".repeat(32)).await.unwrap(),
            PaymentStatus::InFlight
        );
        assert!(matches!(
            lnd.lookup_payment(&ctx(), &"0b".repeat(32)).await.unwrap(),
            PaymentStatus::Failed { .. }
        ));
        assert_eq!(
            lnd.lookup_payment(&ctx(), &"0c".repeat(32)).await.unwrap(),
            PaymentStatus::Settled { preimage: "0d".repeat(32) }
        );
        assert!(matches!(
            lnd.lookup_payment(&ctx(), &"ff".repeat(32)).await,
            Err(BackendError::NotFound(_))
        ));
    }
}
