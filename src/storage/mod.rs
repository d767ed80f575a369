// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Storage Module
//!
//! Durable state of the bridge, kept in a single embedded redb database
//! shared by every request worker.
//!
//! ## Layout
//!
//! ```text
//! $DATA_DIR/
//!   ledger.redb     # applications, inbound events, payment attempts
//! ```
//!
//! - [`records`]: persisted record types and their state machines
//! - [`ledger`]: the redb-backed ledger and its indexes
//! - [`seed`]: startup loading of applications from a JSON file

pub mod ledger;
pub mod records;
pub mod seed;

pub use ledger::{Ledger, LedgerError, LedgerResult};
pub use records::{
    Application, BackendOptions, BudgetRenewal, EventState, InboundEventRecord, PaymentAttempt,
    PaymentState, PaymentTarget, PermissionGrant,
};
pub use seed::seed_applications;
