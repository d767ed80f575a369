// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Lightning Backends
//!
//! One capability interface ([`LightningBackend`]) over three interchangeable
//! payment backends:
//!
//! | Kind     | Transport                  | Auth                        |
//! |----------|----------------------------|-----------------------------|
//! | `LND`    | node REST API              | `Grpc-Metadata-macaroon`    |
//! | `LNBITS` | custodial wallet HTTP API  | `X-Api-Key` (admin key)     |
//! | `ALBY`   | hosted wallet HTTP API     | `Authorization: Bearer ...` |
//!
//! Amounts crossing this interface are always millisatoshis. Every adapter
//! translates its own error shapes into [`BackendError`] and never retries.

pub mod alby;
pub mod http;
pub mod lnbits;
pub mod lnd;
pub mod selector;

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::models::{ListTransactionsParams, NodeInfo, TlvRecord, Transaction, TransactionType};

pub use alby::AlbyClient;
pub use lnbits::LnBitsClient;
pub use lnd::LndClient;
pub use selector::{BackendHandle, BackendResolver, BackendSelector};

/// Timeout for ordinary backend calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for calls that send a payment.
pub const PAYMENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on upstream bodies kept for diagnostics.
pub const MAX_DIAGNOSTIC_BYTES: usize = 300;

/// Upper bound on pages pulled for a single `list_transactions` stream.
const MAX_PAGES: usize = 50;

// =============================================================================
// Backend Kind
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackendKind {
    Lnd,
    LnBits,
    Alby,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Lnd => "LND",
            BackendKind::LnBits => "LNBITS",
            BackendKind::Alby => "ALBY",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LND" => Ok(BackendKind::Lnd),
            "LNBITS" => Ok(BackendKind::LnBits),
            "ALBY" => Ok(BackendKind::Alby),
            other => Err(format!("unknown backend type: {other}")),
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend returned a malformed response: {0}")]
    Protocol(String),

    #[error("payment failed: {reason}")]
    PaymentFailed { reason: String },

    #[error("backend call timed out")]
    Timeout,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),

    #[error("backend configuration error: {0}")]
    Configuration(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("request cancelled")]
    Cancelled,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Truncate an upstream body to at most [`MAX_DIAGNOSTIC_BYTES`], ellipsis
/// included, on a char boundary.
pub fn truncate_diagnostic(body: &str) -> String {
    const ELLIPSIS: &str = "...";
    let body = body.trim();
    if body.len() <= MAX_DIAGNOSTIC_BYTES {
        return body.to_string();
    }
    let mut end = MAX_DIAGNOSTIC_BYTES - ELLIPSIS.len();
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{ELLIPSIS}", &body[..end])
}

/// Hex sha256 of a hex preimage, or `None` when the preimage is not hex.
pub fn payment_hash_of(preimage_hex: &str) -> Option<String> {
    let bytes = hex::decode(preimage_hex.trim()).ok()?;
    Some(hex::encode(Sha256::digest(&bytes)))
}

// =============================================================================
// Request Context
// =============================================================================

/// Per-request data threaded through every backend call.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub event_id: String,
    pub app_id: String,
    pub requester_pubkey: String,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(
        event_id: impl Into<String>,
        app_id: impl Into<String>,
        requester_pubkey: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            app_id: app_id.into(),
            requester_pubkey: requester_pubkey.into(),
            cancel,
        }
    }

    /// Context for a payment call that must outlive its request.
    pub fn detached(&self) -> Self {
        Self {
            cancel: CancellationToken::new(),
            ..self.clone()
        }
    }

    /// Race a backend call against cancellation of this request.
    pub async fn guard<T, F>(&self, call: F) -> BackendResult<T>
    where
        F: Future<Output = BackendResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BackendError::Cancelled),
            result = call => result,
        }
    }
}

// =============================================================================
// Operation Inputs & Outputs
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakeInvoiceRequest {
    pub amount_msat: u64,
    pub description: Option<String>,
    pub description_hash: Option<String>,
    /// Seconds until the invoice expires.
    pub expiry: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeysendRequest {
    pub amount_msat: u64,
    /// Destination node public key (hex).
    pub destination: String,
    /// Hex preimage chosen by the sender.
    pub preimage: String,
    pub custom_records: Vec<TlvRecord>,
}

/// Outcome of a previously sent payment, as seen by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentStatus {
    Settled { preimage: String },
    Failed { reason: String },
    InFlight,
}

/// Filters applied to a transaction stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionQuery {
    pub from: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub unpaid: bool,
    pub transaction_type: Option<TransactionType>,
}

impl TransactionQuery {
    pub fn matches(&self, tx: &Transaction) -> bool {
        if let Some(kind) = self.transaction_type {
            if tx.transaction_type != kind {
                return false;
            }
        }
        if !self.unpaid && !tx.is_settled() {
            return false;
        }
        if self.from.is_some_and(|from| tx.created_at < from) {
            return false;
        }
        if self.until.is_some_and(|until| tx.created_at > until) {
            return false;
        }
        true
    }
}

impl From<ListTransactionsParams> for TransactionQuery {
    fn from(params: ListTransactionsParams) -> Self {
        Self {
            from: params.from.map(|v| v as i64),
            until: params.until.map(|v| v as i64),
            limit: params.limit.map(|v| v as usize),
            offset: params.offset.unwrap_or(0) as usize,
            unpaid: params.unpaid.unwrap_or(false),
            transaction_type: params.transaction_type,
        }
    }
}

/// Lazy, finite, newest-first transaction stream. Consumed once.
pub type TransactionStream = BoxStream<'static, BackendResult<Transaction>>;

/// Build a [`TransactionStream`] over a paginated upstream listing.
///
/// `fetch(page)` returns one page of newest-first transactions; a short or
/// empty page ends the stream. Filtering, offset and limit are applied over
/// the flattened stream so pages are only fetched as they are consumed.
pub(crate) fn paginate<F, Fut>(query: TransactionQuery, page_size: usize, fetch: F) -> TransactionStream
where
    F: FnMut(usize) -> Fut + Send + 'static,
    Fut: Future<Output = BackendResult<Vec<Transaction>>> + Send + 'static,
{
    let pages = stream::try_unfold((fetch, 0usize, false), move |(mut fetch, page, exhausted)| async move {
        if exhausted || page >= MAX_PAGES {
            return Ok(None);
        }
        let batch = fetch(page).await?;
        if batch.is_empty() {
            return Ok(None);
        }
        let exhausted = batch.len() < page_size;
        let items = stream::iter(batch.into_iter().map(Ok::<_, BackendError>));
        Ok(Some((items, (fetch, page + 1, exhausted))))
    });

    let limit = query.limit.unwrap_or(usize::MAX);
    let offset = query.offset;
    pages
        .try_flatten()
        .try_filter(move |tx| futures::future::ready(query.matches(tx)))
        .skip(offset)
        .take(limit)
        .boxed()
}

// =============================================================================
// Capability Interface
// =============================================================================

#[async_trait]
pub trait LightningBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Spendable balance in msat.
    async fn get_balance(&self, ctx: &RequestContext) -> BackendResult<u64>;

    /// Pay a bolt11 invoice and return the hex preimage.
    ///
    /// `amount_msat` is only sent for invoices that carry no amount.
    async fn pay_invoice(
        &self,
        ctx: &RequestContext,
        invoice: &str,
        amount_msat: Option<u64>,
    ) -> BackendResult<String>;

    async fn make_invoice(
        &self,
        ctx: &RequestContext,
        request: &MakeInvoiceRequest,
    ) -> BackendResult<Transaction>;

    async fn lookup_invoice(&self, ctx: &RequestContext, payment_hash: &str) -> BackendResult<Transaction>;

    async fn list_transactions(
        &self,
        ctx: &RequestContext,
        query: TransactionQuery,
    ) -> BackendResult<TransactionStream>;

    /// Spontaneous payment; returns the hex preimage.
    async fn pay_keysend(&self, ctx: &RequestContext, request: &KeysendRequest) -> BackendResult<String>;

    async fn get_info(&self, ctx: &RequestContext) -> BackendResult<NodeInfo>;

    /// Status of an outgoing payment by hash.
    async fn lookup_payment(&self, ctx: &RequestContext, payment_hash: &str) -> BackendResult<PaymentStatus>;
}

// =============================================================================
// Closed Set of Adapters
// =============================================================================

/// Concrete adapter selected for a request.
#[derive(Debug, Clone)]
pub enum Backend {
    Lnd(LndClient),
    LnBits(LnBitsClient),
    Alby(AlbyClient),
}

#[async_trait]
impl LightningBackend for Backend {
    fn kind(&self) -> BackendKind {
        match self {
            Backend::Lnd(_) => BackendKind::Lnd,
            Backend::LnBits(_) => BackendKind::LnBits,
            Backend::Alby(_) => BackendKind::Alby,
        }
    }

    async fn get_balance(&self, ctx: &RequestContext) -> BackendResult<u64> {
        match self {
            Backend::Lnd(c) => c.get_balance(ctx).await,
            Backend::LnBits(c) => c.get_balance(ctx).await,
            Backend::Alby(c) => c.get_balance(ctx).await,
        }
    }

    async fn pay_invoice(
        &self,
        ctx: &RequestContext,
        invoice: &str,
        amount_msat: Option<u64>,
    ) -> BackendResult<String> {
        match self {
            Backend::Lnd(c) => c.pay_invoice(ctx, invoice, amount_msat).await,
            Backend::LnBits(c) => c.pay_invoice(ctx, invoice, amount_msat).await,
            Backend::Alby(c) => c.pay_invoice(ctx, invoice, amount_msat).await,
        }
    }

    async fn make_invoice(
        &self,
        ctx: &RequestContext,
        request: &MakeInvoiceRequest,
    ) -> BackendResult<Transaction> {
        match self {
            Backend::Lnd(c) => c.make_invoice(ctx, request).await,
            Backend::LnBits(c) => c.make_invoice(ctx, request).await,
            Backend::Alby(c) => c.make_invoice(ctx, request).await,
        }
    }

    async fn lookup_invoice(&self, ctx: &RequestContext, payment_hash: &str) -> BackendResult<Transaction> {
        match self {
            Backend::Lnd(c) => c.lookup_invoice(ctx, payment_hash).await,
            Backend::LnBits(c) => c.lookup_invoice(ctx, payment_hash).await,
            Backend::Alby(c) => c.lookup_invoice(ctx, payment_hash).await,
        }
    }

    async fn list_transactions(
        &self,
        ctx: &RequestContext,
        query: TransactionQuery,
    ) -> BackendResult<TransactionStream> {
        match self {
            Backend::Lnd(c) => c.list_transactions(ctx, query).await,
            Backend::LnBits(c) => c.list_transactions(ctx, query).await,
            Backend::Alby(c) => c.list_transactions(ctx, query).await,
        }
    }

    async fn pay_keysend(&self, ctx: &RequestContext, request: &KeysendRequest) -> BackendResult<String> {
        match self {
            Backend::Lnd(c) => c.pay_keysend(ctx, request).await,
            Backend::LnBits(c) => c.pay_keysend(ctx, request).await,
            Backend::Alby(c) => c.pay_keysend(ctx, request).await,
        }
    }

    async fn get_info(&self, ctx: &RequestContext) -> BackendResult<NodeInfo> {
        match self {
            Backend::Lnd(c) => c.get_info(ctx).await,
            Backend::LnBits(c) => c.get_info(ctx).await,
            Backend::Alby(c) => c.get_info(ctx).await,
        }
    }

    async fn lookup_payment(&self, ctx: &RequestContext, payment_hash: &str) -> BackendResult<PaymentStatus> {
        match self {
            Backend::Lnd(c) => c.lookup_payment(ctx, payment_hash).await,
            Backend::LnBits(c) => c.lookup_payment(ctx, payment_hash).await,
            Backend::Alby(c) => c.lookup_payment(ctx, payment_hash).await,
        }
    }
}
