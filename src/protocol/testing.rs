// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Test doubles shared by the router, reconciler and relay tests.

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use lightning_invoice::{Currency, InvoiceBuilder, PaymentSecret};
use serde_json::Value;

use super::RequestRouter;
use crate::backend::{
    paginate, BackendError, BackendHandle, BackendKind, BackendResolver, BackendResult, KeysendRequest,
    LightningBackend, MakeInvoiceRequest, PaymentStatus, RequestContext, TransactionQuery, TransactionStream,
};
use crate::models::{
    InboundEvent, Method, Nip47Request, NodeInfo, ResponseEnvelope, Transaction, TransactionType,
};
use crate::relay::{RelayError, ResponseSink};
use crate::storage::{Application, Ledger};

/// Preimage every mock payment settles with.
pub const PREIMAGE: [u8; 32] = [7; 32];
pub const PREIMAGE_HEX: &str = "0707070707070707070707070707070707070707070707070707070707070707";
/// sha256 of [`PREIMAGE`].
pub const TEST_PAYMENT_HASH: &str = "4bb06f8e4e3a7715d201d573d0aa423762e55dabd61a2c02278fa56cc6d294e0";

/// Hex payment hash of [`PREIMAGE`], computed rather than trusted.
pub fn test_payment_hash() -> String {
    sha256::Hash::hash(&PREIMAGE).to_string()
}

/// Mint a signed regtest invoice paying to [`PREIMAGE`]'s hash.
pub fn mint_invoice(amount_msat: Option<u64>) -> String {
    let key = SecretKey::from_slice(&[41; 32]).unwrap();
    let builder = InvoiceBuilder::new(Currency::Regtest)
        .description("wallet connect test".to_string())
        .payment_hash(sha256::Hash::hash(&PREIMAGE))
        .payment_secret(PaymentSecret([42; 32]))
        .current_timestamp()
        .min_final_cltv_expiry_delta(144);
    let builder = match amount_msat {
        Some(amount) => builder.amount_milli_satoshis(amount),
        None => builder,
    };
    builder
        .build_signed(|hash| Secp256k1::new().sign_ecdsa_recoverable(hash, &key))
        .unwrap()
        .to_string()
}

pub fn event(id: &str, pubkey: &str, method: &str, params: Value) -> InboundEvent {
    InboundEvent {
        id: id.to_string(),
        pubkey: pubkey.to_string(),
        content: "ciphertext".to_string(),
        request: Nip47Request {
            method: method.to_string(),
            params,
        },
    }
}

fn settled_tx(created_at: i64) -> Transaction {
    Transaction {
        transaction_type: TransactionType::Outgoing,
        invoice: String::new(),
        description: "mock".to_string(),
        description_hash: String::new(),
        preimage: PREIMAGE_HEX.to_string(),
        payment_hash: test_payment_hash(),
        amount: 1_000,
        fees_paid: 0,
        created_at,
        expires_at: None,
        settled_at: Some(created_at),
    }
}

pub struct MockBackend {
    /// Every backend call, of any kind.
    pub calls: AtomicUsize,
    pub pay_calls: AtomicUsize,
    pub lookup_calls: AtomicUsize,
    pub last_amount: Mutex<Option<Option<u64>>>,
    pub last_keysend: Mutex<Option<KeysendRequest>>,
    /// Answer to `lookup_payment`.
    pub status: Mutex<PaymentStatus>,
    failure: Option<BackendError>,
    delay: Duration,
    keysend: bool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            pay_calls: AtomicUsize::new(0),
            lookup_calls: AtomicUsize::new(0),
            last_amount: Mutex::new(None),
            last_keysend: Mutex::new(None),
            status: Mutex::new(PaymentStatus::InFlight),
            failure: None,
            delay: Duration::ZERO,
            keysend: true,
        }
    }

    /// Every payment fails with `error`.
    pub fn failing(error: BackendError) -> Self {
        Self {
            failure: Some(error),
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn without_keysend(mut self) -> Self {
        self.keysend = false;
        self
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn settle(&self, preimage: String) -> BackendResult<String> {
        self.pay_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(preimage),
        }
    }
}

#[async_trait]
impl LightningBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Lnd
    }

    async fn get_balance(&self, _ctx: &RequestContext) -> BackendResult<u64> {
        self.record_call();
        Ok(21_000_000)
    }

    async fn pay_invoice(
        &self,
        _ctx: &RequestContext,
        _invoice: &str,
        amount_msat: Option<u64>,
    ) -> BackendResult<String> {
        self.record_call();
        *self.last_amount.lock().unwrap() = Some(amount_msat);
        self.settle(PREIMAGE_HEX.to_string()).await
    }

    async fn make_invoice(
        &self,
        _ctx: &RequestContext,
        request: &MakeInvoiceRequest,
    ) -> BackendResult<Transaction> {
        self.record_call();
        let mut tx = settled_tx(1_700_000_000);
        tx.transaction_type = TransactionType::Incoming;
        tx.amount = request.amount_msat;
        tx.invoice = mint_invoice(Some(request.amount_msat));
        tx.settled_at = None;
        tx.preimage = String::new();
        Ok(tx)
    }

    async fn lookup_invoice(&self, _ctx: &RequestContext, payment_hash: &str) -> BackendResult<Transaction> {
        self.record_call();
        if payment_hash == test_payment_hash() {
            Ok(settled_tx(1_700_000_000))
        } else {
            Err(BackendError::NotFound(format!("invoice {payment_hash}")))
        }
    }

    async fn list_transactions(
        &self,
        _ctx: &RequestContext,
        query: TransactionQuery,
    ) -> BackendResult<TransactionStream> {
        self.record_call();
        let page = vec![settled_tx(1_700_000_200), settled_tx(1_700_000_100)];
        Ok(paginate(query, 10, move |index| {
            let batch = if index == 0 { page.clone() } else { Vec::new() };
            async move { Ok(batch) }
        }))
    }

    async fn pay_keysend(&self, _ctx: &RequestContext, request: &KeysendRequest) -> BackendResult<String> {
        self.record_call();
        if !self.keysend {
            return Err(BackendError::Unsupported("keysend"));
        }
        *self.last_keysend.lock().unwrap() = Some(request.clone());
        self.settle(request.preimage.clone()).await
    }

    async fn get_info(&self, _ctx: &RequestContext) -> BackendResult<NodeInfo> {
        self.record_call();
        Ok(NodeInfo {
            alias: "mock".to_string(),
            color: "#3399ff".to_string(),
            pubkey: format!("02{}", "ab".repeat(32)),
            network: "regtest".to_string(),
            block_height: 100,
            block_hash: "00".repeat(32),
            methods: Method::ALL.iter().map(|m| m.as_str().to_string()).collect(),
        })
    }

    async fn lookup_payment(&self, _ctx: &RequestContext, _payment_hash: &str) -> BackendResult<PaymentStatus> {
        self.record_call();
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.status.lock().unwrap().clone())
    }
}

/// Resolves every application to the same mock.
pub struct StaticResolver {
    pub backend: Arc<MockBackend>,
}

impl BackendResolver for StaticResolver {
    fn resolve(&self, app: &Application) -> Result<BackendHandle, BackendError> {
        Ok(BackendHandle {
            app_id: app.id.clone(),
            kind: BackendKind::Lnd,
            host: "mock".to_string(),
            backend: self.backend.clone(),
        })
    }
}

/// Collects published envelopes in memory.
#[derive(Default)]
pub struct RecordingSink {
    pub published: Mutex<Vec<ResponseEnvelope>>,
}

#[async_trait]
impl ResponseSink for RecordingSink {
    async fn publish(&self, envelope: ResponseEnvelope) -> Result<(), RelayError> {
        self.published.lock().unwrap().push(envelope);
        Ok(())
    }
}

pub struct Harness {
    pub router: Arc<RequestRouter>,
    pub ledger: Arc<Ledger>,
    pub backend: Arc<MockBackend>,
    pub resolver: Arc<StaticResolver>,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(backend: MockBackend) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(Ledger::open(&dir.path().join("ledger.redb")).unwrap());
        let backend = Arc::new(backend);
        let resolver = Arc::new(StaticResolver {
            backend: backend.clone(),
        });
        let router = Arc::new(RequestRouter::new(ledger.clone(), resolver.clone()));
        Self {
            router,
            ledger,
            backend,
            resolver,
            _dir: dir,
        }
    }

    pub fn register(&self, app: Application) -> Application {
        self.ledger.put_application(&app).unwrap();
        app
    }
}

#[test]
fn payment_hash_constant_matches_preimage() {
    assert_eq!(test_payment_hash(), TEST_PAYMENT_HASH);
    assert_eq!(hex::encode(PREIMAGE), PREIMAGE_HEX);
    let invoice = lightning_invoice::Bolt11Invoice::from_str(&mint_invoice(Some(1_000))).unwrap();
    assert_eq!(invoice.payment_hash().to_string(), TEST_PAYMENT_HASH);
}
