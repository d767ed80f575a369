// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Permission Engine
//!
//! Decides whether an application may run a method for a given amount.
//!
//! Checks, in order:
//! 1. the application has not expired,
//! 2. the method is granted,
//! 3. the amount fits in what is left of the grant's budget window.
//!
//! Budget consumption is the sum of settled and still-pending payment attempts
//! created in the current window, read from the ledger on every call. A
//! pending attempt reserves its amount until it settles or fails. Callers that
//! spend must hold the application's lock from `authorize` until the attempt
//! is recorded, otherwise two requests can both fit the same remaining budget.

mod window;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::{ErrorCode, Method};
use crate::storage::{Application, Ledger, LedgerError};

pub use window::window_start;

/// Reason a request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Allowed,
    Denied(Denial),
}

impl Authorization {
    fn denied(code: ErrorCode, message: impl Into<String>) -> Self {
        Authorization::Denied(Denial {
            code,
            message: message.into(),
        })
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Authorization::Allowed)
    }
}

#[derive(Clone)]
pub struct PermissionEngine {
    ledger: Arc<Ledger>,
}

impl PermissionEngine {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    /// The `EXPIRED` denial, if the application has expired by `now`.
    pub fn expiry(&self, app: &Application, now: DateTime<Utc>) -> Option<Denial> {
        app.expires_at.filter(|expires_at| *expires_at <= now).map(|_| Denial {
            code: ErrorCode::Expired,
            message: "This app has expired".to_string(),
        })
    }

    pub fn authorize(
        &self,
        app: &Application,
        method: Method,
        amount_msat: u64,
        now: DateTime<Utc>,
    ) -> Result<Authorization, LedgerError> {
        if let Some(denial) = self.expiry(app, now) {
            return Ok(Authorization::Denied(denial));
        }

        let Some(grant) = app.grant_for(method) else {
            return Ok(Authorization::denied(
                ErrorCode::Restricted,
                format!("This app does not have permission to request {method}"),
            ));
        };

        let Some(limit) = grant.max_amount_msat else {
            return Ok(Authorization::Allowed);
        };

        let since = window_start(grant.budget_renewal, grant.created_at, now);
        let consumed = self.ledger.committed_total_since(&app.id, since)?;
        if consumed.saturating_add(amount_msat) > limit {
            return Ok(Authorization::denied(
                ErrorCode::QuotaExceeded,
                "Insufficient budget remaining to make payment",
            ));
        }

        Ok(Authorization::Allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BudgetRenewal, PaymentAttempt, PaymentTarget, PermissionGrant};
    use chrono::Duration;

    fn engine() -> (PermissionEngine, Arc<Ledger>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(Ledger::open(&dir.path().join("ledger.redb")).unwrap());
        (PermissionEngine::new(ledger.clone()), ledger, dir)
    }

    fn budgeted_app(limit: u64) -> Application {
        Application::new("ab".repeat(32), "budgeted").with_grant(PermissionGrant::with_budget(
            Method::PayInvoice,
            limit,
            BudgetRenewal::Never,
        ))
    }

    fn settle(ledger: &Ledger, app: &Application, event_id: &str, amount_msat: u64) {
        let payment = PaymentAttempt::pending(
            &app.id,
            event_id,
            PaymentTarget::Invoice {
                bolt11: "lnbcrt".to_string(),
            },
            "00".repeat(32),
            amount_msat,
        );
        ledger.create_payment(&payment).unwrap();
        ledger.settle_payment(&payment.id, "11").unwrap();
    }

    #[test]
    fn ungranted_method_is_restricted() {
        let (engine, _ledger, _dir) = engine();
        let app = budgeted_app(1_000);
        let decision = engine.authorize(&app, Method::GetBalance, 0, Utc::now()).unwrap();
        assert!(matches!(
            decision,
            Authorization::Denied(Denial { code: ErrorCode::Restricted, .. })
        ));
    }

    #[test]
    fn expired_app_is_denied_before_grants() {
        let (engine, _ledger, _dir) = engine();
        let mut app = budgeted_app(1_000);
        let now = Utc::now();
        app.expires_at = Some(now);
        let decision = engine.authorize(&app, Method::PayInvoice, 1, now).unwrap();
        assert!(matches!(
            decision,
            Authorization::Denied(Denial { code: ErrorCode::Expired, .. })
        ));
    }

    #[test]
    fn unlimited_grant_always_allows() {
        let (engine, _ledger, _dir) = engine();
        let app = Application::new("cd".repeat(32), "unlimited")
            .with_grant(PermissionGrant::unlimited(Method::PayInvoice));
        assert!(engine
            .authorize(&app, Method::PayInvoice, u64::MAX, Utc::now())
            .unwrap()
            .is_allowed());
    }

    #[test]
    fn allows_iff_amount_fits_remaining_budget() {
        let (engine, ledger, _dir) = engine();
        let app = budgeted_app(10_000);
        let now = Utc::now();

        assert!(engine.authorize(&app, Method::PayInvoice, 10_000, now).unwrap().is_allowed());
        assert!(!engine.authorize(&app, Method::PayInvoice, 10_001, now).unwrap().is_allowed());

        settle(&ledger, &app, "evt-1", 4_000);
        assert!(engine.authorize(&app, Method::PayInvoice, 6_000, now).unwrap().is_allowed());
        let decision = engine.authorize(&app, Method::PayInvoice, 6_001, now).unwrap();
        assert!(matches!(
            decision,
            Authorization::Denied(Denial { code: ErrorCode::QuotaExceeded, .. })
        ));
    }

    #[test]
    fn pending_attempts_reserve_budget_until_failed() {
        let (engine, ledger, _dir) = engine();
        let app = budgeted_app(1_000);
        let pending = PaymentAttempt::pending(
            &app.id,
            "evt-p",
            PaymentTarget::Invoice { bolt11: "lnbcrt".to_string() },
            "00".repeat(32),
            600,
        );
        ledger.create_payment(&pending).unwrap();

        let now = Utc::now();
        assert!(engine.authorize(&app, Method::PayInvoice, 400, now).unwrap().is_allowed());
        let decision = engine.authorize(&app, Method::PayInvoice, 401, now).unwrap();
        assert!(matches!(
            decision,
            Authorization::Denied(Denial { code: ErrorCode::QuotaExceeded, .. })
        ));

        ledger.fail_payment(&pending.id, "no route").unwrap();
        assert!(engine.authorize(&app, Method::PayInvoice, 1_000, now).unwrap().is_allowed());
    }

    #[test]
    fn spending_before_window_start_is_forgotten() {
        let (engine, ledger, _dir) = engine();
        let mut app = budgeted_app(1_000);
        app.grants[0].budget_renewal = BudgetRenewal::Daily;

        let mut old = PaymentAttempt::pending(
            &app.id,
            "evt-old",
            PaymentTarget::Invoice { bolt11: "lnbcrt".to_string() },
            "00".repeat(32),
            1_000,
        );
        old.created_at = Utc::now() - Duration::days(2);
        ledger.create_payment(&old).unwrap();
        ledger.settle_payment(&old.id, "11").unwrap();

        assert!(engine.authorize(&app, Method::PayInvoice, 1_000, Utc::now()).unwrap().is_allowed());
    }
}
