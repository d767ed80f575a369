// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded event/payment ledger backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `applications`: app_id → serialized Application
//! - `app_pubkey_index`: lowercase pubkey → app_id
//! - `events`: relay event id → serialized InboundEventRecord
//! - `open_events`: relay event id → created_at (events still `received`)
//! - `payments`: payment_id → serialized PaymentAttempt
//! - `event_payment_index`: relay event id → payment_id
//! - `app_payment_index`: composite key (app_id|created_at_be|payment_id) → payment_id
//! - `pending_payments`: payment_id → created_at (attempts still `pending`)
//!
//! Every write happens inside a single redb write transaction, so the
//! insert-if-absent checks below are atomic with respect to concurrent
//! workers.

use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use super::records::{
    Application, EventState, InboundEventRecord, PaymentAttempt, PaymentState,
};
use crate::models::ErrorCode;

// =============================================================================
// Table Definitions
// =============================================================================

const APPLICATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("applications");

const APP_PUBKEY_INDEX: TableDefinition<&str, &str> = TableDefinition::new("app_pubkey_index");

const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");

/// Events still in `received`, with their creation time (unix seconds).
const OPEN_EVENTS: TableDefinition<&str, i64> = TableDefinition::new("open_events");

const PAYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("payments");

const EVENT_PAYMENT_INDEX: TableDefinition<&str, &str> =
    TableDefinition::new("event_payment_index");

/// Key format: `app_id | created_at_be | payment_id` for ascending-time range scans.
const APP_PAYMENT_INDEX: TableDefinition<&[u8], &str> = TableDefinition::new("app_payment_index");

/// Attempts still in `pending`, with their creation time (unix seconds).
const PENDING_PAYMENTS: TableDefinition<&str, i64> = TableDefinition::new("pending_payments");

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state transition for {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("invalid record: {0}")]
    Invalid(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

// =============================================================================
// Index Key Helpers
// =============================================================================

/// Build a composite key for the app_payment_index table.
///
/// Format: `app_id | created_at_be_bytes | payment_id`. Timestamps are offset
/// into unsigned space so byte order matches chronological order.
fn make_payment_key(app_id: &str, created_at: i64, payment_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(app_id.len() + 1 + 8 + 1 + payment_id.len());
    key.extend_from_slice(app_id.as_bytes());
    key.push(b'|');
    key.extend_from_slice(&order_preserving(created_at).to_be_bytes());
    key.push(b'|');
    key.extend_from_slice(payment_id.as_bytes());
    key
}

/// Lower bound for all payments of `app_id` created at or after `since`.
fn make_payment_range_start(app_id: &str, since: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(app_id.len() + 1 + 8);
    key.extend_from_slice(app_id.as_bytes());
    key.push(b'|');
    key.extend_from_slice(&order_preserving(since).to_be_bytes());
    key
}

/// Upper bound for a range scan (prefix with 0xFF bytes appended).
fn make_payment_range_end(app_id: &str) -> Vec<u8> {
    let mut end = Vec::with_capacity(app_id.len() + 1 + 20);
    end.extend_from_slice(app_id.as_bytes());
    end.push(b'|');
    end.extend_from_slice(&[0xFF; 20]);
    end
}

fn order_preserving(timestamp: i64) -> u64 {
    (timestamp as u64) ^ (1 << 63)
}

fn state_name<T: std::fmt::Debug>(state: T) -> String {
    format!("{state:?}")
}

// =============================================================================
// Ledger
// =============================================================================

/// Durable record of applications, inbound events and payment attempts.
pub struct Ledger {
    db: Database,
}

impl Ledger {
    /// Open (or create) the ledger at the given path.
    pub fn open(path: &Path) -> LedgerResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(APPLICATIONS)?;
            let _ = write_txn.open_table(APP_PUBKEY_INDEX)?;
            let _ = write_txn.open_table(EVENTS)?;
            let _ = write_txn.open_table(OPEN_EVENTS)?;
            let _ = write_txn.open_table(PAYMENTS)?;
            let _ = write_txn.open_table(EVENT_PAYMENT_INDEX)?;
            let _ = write_txn.open_table(APP_PAYMENT_INDEX)?;
            let _ = write_txn.open_table(PENDING_PAYMENTS)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Verify the database answers a read transaction.
    pub fn health_check(&self) -> LedgerResult<()> {
        let read_txn = self.db.begin_read()?;
        let _ = read_txn.open_table(EVENTS)?;
        Ok(())
    }

    // =========================================================================
    // Applications
    // =========================================================================

    /// Insert or replace an application and its pubkey index entry.
    ///
    /// Fails with `AlreadyExists` when the pubkey belongs to another app.
    pub fn put_application(&self, app: &Application) -> LedgerResult<()> {
        let pubkey = app.pubkey.to_lowercase();
        let json = serde_json::to_vec(app)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut index = write_txn.open_table(APP_PUBKEY_INDEX)?;
            let owner = index.get(pubkey.as_str())?.map(|v| v.value().to_string());
            if let Some(owner) = owner {
                if owner != app.id {
                    return Err(LedgerError::AlreadyExists(format!(
                        "Application pubkey {pubkey}"
                    )));
                }
            }
            index.insert(pubkey.as_str(), app.id.as_str())?;

            let mut apps = write_txn.open_table(APPLICATIONS)?;
            apps.insert(app.id.as_str(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_application(&self, app_id: &str) -> LedgerResult<Option<Application>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(APPLICATIONS)?;
        match table.get(app_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Look up the application registered for a requester pubkey.
    pub fn find_application_by_pubkey(&self, pubkey: &str) -> LedgerResult<Option<Application>> {
        let pubkey = pubkey.to_lowercase();
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(APP_PUBKEY_INDEX)?;
        let Some(app_id) = index.get(pubkey.as_str())?.map(|v| v.value().to_string()) else {
            return Ok(None);
        };
        let apps = read_txn.open_table(APPLICATIONS)?;
        match apps.get(app_id.as_str())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Record that an application just made a request.
    pub fn touch_application(&self, app_id: &str, at: DateTime<Utc>) -> LedgerResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut apps = write_txn.open_table(APPLICATIONS)?;
            let existing_bytes = {
                let existing = apps
                    .get(app_id)?
                    .ok_or_else(|| LedgerError::NotFound(format!("Application {app_id}")))?;
                existing.value().to_vec()
            };
            let mut app: Application = serde_json::from_slice(&existing_bytes)?;
            app.last_used_at = Some(at);
            let json = serde_json::to_vec(&app)?;
            apps.insert(app_id, json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Remove an application. Its events and payments stay for auditing.
    pub fn revoke_application(&self, app_id: &str) -> LedgerResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut apps = write_txn.open_table(APPLICATIONS)?;
            let removed = apps.remove(app_id)?.map(|v| v.value().to_vec());
            let bytes =
                removed.ok_or_else(|| LedgerError::NotFound(format!("Application {app_id}")))?;
            let app: Application = serde_json::from_slice(&bytes)?;

            let mut index = write_txn.open_table(APP_PUBKEY_INDEX)?;
            index.remove(app.pubkey.to_lowercase().as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // =========================================================================
    // Inbound Events
    // =========================================================================

    /// Persist a freshly received event.
    ///
    /// The relay message id is the deduplication key: a second insert for the
    /// same id fails with `AlreadyExists` and leaves the first untouched.
    pub fn create_event(&self, event: &InboundEventRecord) -> LedgerResult<()> {
        if event.state != EventState::Received {
            return Err(LedgerError::Invalid(format!(
                "event {} must be created in received state",
                event.id
            )));
        }
        let json = serde_json::to_vec(event)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut events = write_txn.open_table(EVENTS)?;
            if events.get(event.id.as_str())?.is_some() {
                return Err(LedgerError::AlreadyExists(format!("Event {}", event.id)));
            }
            events.insert(event.id.as_str(), json.as_slice())?;

            let mut open = write_txn.open_table(OPEN_EVENTS)?;
            open.insert(event.id.as_str(), event.created_at.timestamp())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_event(&self, event_id: &str) -> LedgerResult<Option<InboundEventRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(EVENTS)?;
        match table.get(event_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Move an event from `received` to a terminal state.
    ///
    /// Terminal states are final: any further transition is rejected.
    pub fn save_event_state(
        &self,
        event_id: &str,
        state: EventState,
        error_code: Option<ErrorCode>,
    ) -> LedgerResult<InboundEventRecord> {
        if !state.is_terminal() {
            return Err(LedgerError::Invalid(format!(
                "event {event_id} can only move to a terminal state"
            )));
        }

        let write_txn = self.db.begin_write()?;
        let event = {
            let mut events = write_txn.open_table(EVENTS)?;
            let existing_bytes = {
                let existing = events
                    .get(event_id)?
                    .ok_or_else(|| LedgerError::NotFound(format!("Event {event_id}")))?;
                existing.value().to_vec()
            };

            let mut event: InboundEventRecord = serde_json::from_slice(&existing_bytes)?;
            if event.state.is_terminal() {
                return Err(LedgerError::InvalidTransition {
                    id: event_id.to_string(),
                    from: state_name(event.state),
                    to: state_name(state),
                });
            }
            event.state = state;
            event.error_code = error_code;
            event.updated_at = Utc::now();

            let json = serde_json::to_vec(&event)?;
            events.insert(event_id, json.as_slice())?;

            let mut open = write_txn.open_table(OPEN_EVENTS)?;
            open.remove(event_id)?;
            event
        };
        write_txn.commit()?;
        Ok(event)
    }

    /// Events still in `received` created at or before `cutoff` (second
    /// resolution).
    pub fn open_events_before(&self, cutoff: DateTime<Utc>) -> LedgerResult<Vec<InboundEventRecord>> {
        let cutoff = cutoff.timestamp();
        let read_txn = self.db.begin_read()?;
        let open = read_txn.open_table(OPEN_EVENTS)?;
        let events = read_txn.open_table(EVENTS)?;

        let mut results = Vec::new();
        for entry in open.iter()? {
            let (id, created_at) = entry?;
            if created_at.value() > cutoff {
                continue;
            }
            if let Some(value) = events.get(id.value())? {
                results.push(serde_json::from_slice(value.value())?);
            }
        }
        Ok(results)
    }

    // =========================================================================
    // Payment Attempts
    // =========================================================================

    /// Persist a new pending attempt.
    ///
    /// At most one attempt may exist per inbound event.
    pub fn create_payment(&self, payment: &PaymentAttempt) -> LedgerResult<()> {
        if payment.state != PaymentState::Pending {
            return Err(LedgerError::Invalid(format!(
                "payment {} must be created pending",
                payment.id
            )));
        }
        let json = serde_json::to_vec(payment)?;
        let created_at = payment.created_at.timestamp();

        let write_txn = self.db.begin_write()?;
        {
            let mut by_event = write_txn.open_table(EVENT_PAYMENT_INDEX)?;
            if by_event.get(payment.event_id.as_str())?.is_some() {
                return Err(LedgerError::AlreadyExists(format!(
                    "Payment for event {}",
                    payment.event_id
                )));
            }
            by_event.insert(payment.event_id.as_str(), payment.id.as_str())?;

            let mut payments = write_txn.open_table(PAYMENTS)?;
            payments.insert(payment.id.as_str(), json.as_slice())?;

            let mut by_app = write_txn.open_table(APP_PAYMENT_INDEX)?;
            let key = make_payment_key(&payment.app_id, created_at, &payment.id);
            by_app.insert(key.as_slice(), payment.id.as_str())?;

            let mut pending = write_txn.open_table(PENDING_PAYMENTS)?;
            pending.insert(payment.id.as_str(), created_at)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_payment(&self, payment_id: &str) -> LedgerResult<Option<PaymentAttempt>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PAYMENTS)?;
        match table.get(payment_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// The attempt owned by an inbound event, if any.
    pub fn payment_for_event(&self, event_id: &str) -> LedgerResult<Option<PaymentAttempt>> {
        let read_txn = self.db.begin_read()?;
        let by_event = read_txn.open_table(EVENT_PAYMENT_INDEX)?;
        let Some(payment_id) = by_event.get(event_id)?.map(|v| v.value().to_string()) else {
            return Ok(None);
        };
        let payments = read_txn.open_table(PAYMENTS)?;
        match payments.get(payment_id.as_str())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Mark a pending attempt settled. The preimage must be non-empty.
    pub fn settle_payment(&self, payment_id: &str, preimage: &str) -> LedgerResult<PaymentAttempt> {
        if preimage.trim().is_empty() {
            return Err(LedgerError::Invalid(format!(
                "payment {payment_id} cannot settle without a preimage"
            )));
        }
        self.finish_payment(payment_id, PaymentState::Settled, |payment| {
            let now = Utc::now();
            payment.preimage = Some(preimage.to_string());
            payment.settled_at = Some(now);
            payment.updated_at = now;
        })
    }

    /// Mark a pending attempt failed, keeping the (already truncated) reason.
    pub fn fail_payment(&self, payment_id: &str, reason: &str) -> LedgerResult<PaymentAttempt> {
        self.finish_payment(payment_id, PaymentState::Failed, |payment| {
            payment.failure_reason = Some(reason.to_string());
            payment.updated_at = Utc::now();
        })
    }

    fn finish_payment(
        &self,
        payment_id: &str,
        state: PaymentState,
        apply: impl FnOnce(&mut PaymentAttempt),
    ) -> LedgerResult<PaymentAttempt> {
        let write_txn = self.db.begin_write()?;
        let payment = {
            let mut payments = write_txn.open_table(PAYMENTS)?;

            // Read existing value and deserialize before mutating
            let existing_bytes = {
                let existing = payments
                    .get(payment_id)?
                    .ok_or_else(|| LedgerError::NotFound(format!("Payment {payment_id}")))?;
                existing.value().to_vec()
            };

            let mut payment: PaymentAttempt = serde_json::from_slice(&existing_bytes)?;
            if payment.state != PaymentState::Pending {
                return Err(LedgerError::InvalidTransition {
                    id: payment_id.to_string(),
                    from: state_name(payment.state),
                    to: state_name(state),
                });
            }
            payment.state = state;
            apply(&mut payment);

            let json = serde_json::to_vec(&payment)?;
            payments.insert(payment_id, json.as_slice())?;

            let mut pending = write_txn.open_table(PENDING_PAYMENTS)?;
            pending.remove(payment_id)?;
            payment
        };
        write_txn.commit()?;
        Ok(payment)
    }

    /// Sum (msat) of an app's attempts created at or after `since` that hold
    /// budget: settled ones, and pending ones whose outcome is not yet known.
    pub fn committed_total_since(&self, app_id: &str, since: DateTime<Utc>) -> LedgerResult<u64> {
        let read_txn = self.db.begin_read()?;
        let by_app = read_txn.open_table(APP_PAYMENT_INDEX)?;
        let payments = read_txn.open_table(PAYMENTS)?;

        let start = make_payment_range_start(app_id, since.timestamp());
        let end = make_payment_range_end(app_id);

        let mut total: u64 = 0;
        for entry in by_app.range(start.as_slice()..end.as_slice())? {
            let (_, payment_id) = entry?;
            if let Some(value) = payments.get(payment_id.value())? {
                let payment: PaymentAttempt = serde_json::from_slice(value.value())?;
                if matches!(payment.state, PaymentState::Settled | PaymentState::Pending) {
                    total = total.saturating_add(payment.amount_msat);
                }
            }
        }
        Ok(total)
    }

    /// Pending attempts created at or before `cutoff`, oldest first.
    pub fn pending_payments_before(&self, cutoff: DateTime<Utc>) -> LedgerResult<Vec<PaymentAttempt>> {
        let cutoff = cutoff.timestamp();
        let read_txn = self.db.begin_read()?;
        let pending = read_txn.open_table(PENDING_PAYMENTS)?;
        let payments = read_txn.open_table(PAYMENTS)?;

        let mut results: Vec<PaymentAttempt> = Vec::new();
        for entry in pending.iter()? {
            let (id, created_at) = entry?;
            if created_at.value() > cutoff {
                continue;
            }
            if let Some(value) = payments.get(id.value())? {
                results.push(serde_json::from_slice(value.value())?);
            }
        }
        results.sort_by_key(|p| p.created_at);
        Ok(results)
    }
}

// =============================================================================
// Tests
// =============================================================================
