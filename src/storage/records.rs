// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Persisted records: applications, grants, inbound events and payment
//! attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::BackendKind;
use crate::models::{ErrorCode, Method};

// =============================================================================
// Applications & Grants
// =============================================================================

/// How often a spending budget resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BudgetRenewal {
    Daily,
    Weekly,
    Monthly,
    Yearly,
    /// Budget is consumed once and never renewed.
    #[default]
    Never,
}

/// Permission for one method, optionally capped by a renewable budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub method: Method,
    /// Maximum amount in msat per renewal window. `None` means unlimited.
    #[serde(default)]
    pub max_amount_msat: Option<u64>,
    #[serde(default)]
    pub budget_renewal: BudgetRenewal,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl PermissionGrant {
    pub fn unlimited(method: Method) -> Self {
        Self {
            method,
            max_amount_msat: None,
            budget_renewal: BudgetRenewal::Never,
            created_at: Utc::now(),
        }
    }

    pub fn with_budget(method: Method, max_amount_msat: u64, renewal: BudgetRenewal) -> Self {
        Self {
            method,
            max_amount_msat: Some(max_amount_msat),
            budget_renewal: renewal,
            created_at: Utc::now(),
        }
    }
}

/// Per-application override of the service backend.
///
/// Any field left unset falls back to the service default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendOptions {
    #[serde(default)]
    pub backend: Option<BackendKind>,
    #[serde(default)]
    pub host: Option<String>,
    /// Macaroon (LND), admin key (LNbits) or access token (Alby).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// A registered third party granted wallet access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    /// Identity public key (hex) the application signs requests with.
    pub pubkey: String,
    pub name: String,
    #[serde(default)]
    pub backend: BackendOptions,
    #[serde(default)]
    pub grants: Vec<PermissionGrant>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Application {
    pub fn new(pubkey: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            pubkey: pubkey.into().to_lowercase(),
            name: name.into(),
            backend: BackendOptions::default(),
            grants: Vec::new(),
            expires_at: None,
            created_at: now,
            updated_at: now,
            last_used_at: None,
        }
    }

    pub fn with_grant(mut self, grant: PermissionGrant) -> Self {
        self.grants.retain(|g| g.method != grant.method);
        self.grants.push(grant);
        self
    }

    pub fn grant_for(&self, method: Method) -> Option<&PermissionGrant> {
        self.grants.iter().find(|g| g.method == method)
    }
}

// =============================================================================
// Inbound Events
// =============================================================================

/// Lifecycle state of an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    Received,
    Executed,
    HandlerError,
    Unauthorized,
}

impl EventState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventState::Received)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEventRecord {
    /// Relay message id.
    pub id: String,
    pub app_id: String,
    pub requester_pubkey: String,
    /// Method name as sent, including unknown ones.
    pub method: String,
    pub content: String,
    pub state: EventState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InboundEventRecord {
    pub fn received(
        id: impl Into<String>,
        app_id: impl Into<String>,
        requester_pubkey: impl Into<String>,
        method: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            app_id: app_id.into(),
            requester_pubkey: requester_pubkey.into(),
            method: method.into(),
            content: content.into(),
            state: EventState::Received,
            error_code: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// Payment Attempts
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentState {
    Pending,
    Settled,
    Failed,
}

/// What a payment attempt pays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentTarget {
    Invoice { bolt11: String },
    Keysend { destination: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub id: String,
    pub app_id: String,
    pub event_id: String,
    pub target: PaymentTarget,
    /// Hex payment hash.
    pub payment_hash: String,
    pub amount_msat: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preimage: Option<String>,
    pub state: PaymentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<DateTime<Utc>>,
}

impl PaymentAttempt {
    pub fn pending(
        app_id: impl Into<String>,
        event_id: impl Into<String>,
        target: PaymentTarget,
        payment_hash: impl Into<String>,
        amount_msat: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            app_id: app_id.into(),
            event_id: event_id.into(),
            target,
            payment_hash: payment_hash.into(),
            amount_msat,
            preimage: None,
            state: PaymentState::Pending,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            settled_at: None,
        }
    }
}
