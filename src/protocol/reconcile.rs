// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Reconciler
//!
//! Background sweep that finishes work a request left behind: a payment
//! still `pending` after its request was cancelled or the process
//! restarted, or an event stuck in `received`.
//!
//! ## Strategy
//!
//! Every `interval` (and once at startup) the reconciler:
//! 1. Asks the backend about every pending payment attempt older than the
//!    grace period. Settled and failed payments are recorded, their event is
//!    finished and the response published. In-flight payments are left alone.
//!    A payment the backend has never heard of is failed.
//! 2. Finishes every `received` event older than the grace period that has
//!    no pending attempt: from its settled or failed attempt if one exists,
//!    otherwise with `INTERNAL` "request interrupted".
//!
//! The grace period must exceed the request deadline so live requests are
//! never touched.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::handlers::record_payment;
use super::{finish_event, Completion};
use crate::backend::{BackendError, BackendResolver, PaymentStatus, RequestContext};
use crate::models::{ErrorCode, Method, Nip47Response};
use crate::relay::ResponseSink;
use crate::storage::{
    EventState, InboundEventRecord, Ledger, LedgerError, PaymentAttempt, PaymentState, PaymentTarget,
};

/// Default minimum age before a pending item is reconciled.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(300);

/// Counts from one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub settled: usize,
    pub failed: usize,
    pub in_flight: usize,
    pub events_finished: usize,
}

pub struct Reconciler {
    ledger: Arc<Ledger>,
    backends: Arc<dyn BackendResolver>,
    sink: Arc<dyn ResponseSink>,
    interval: Duration,
    grace: Duration,
}

fn method_for(target: &PaymentTarget) -> Method {
    match target {
        PaymentTarget::Invoice { .. } => Method::PayInvoice,
        PaymentTarget::Keysend { .. } => Method::PayKeysend,
    }
}

impl Reconciler {
    pub fn new(
        ledger: Arc<Ledger>,
        backends: Arc<dyn BackendResolver>,
        sink: Arc<dyn ResponseSink>,
        interval: Duration,
    ) -> Self {
        Self {
            ledger,
            backends,
            sink,
            interval,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run sweeps until the cancellation token is triggered.
    ///
    /// ```rust,ignore
    /// tokio::spawn(reconciler.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            grace_secs = self.grace.as_secs(),
            "Reconciler starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Reconciler shutting down");
                return;
            }

            let report = self.run_once().await;
            if report != ReconcileReport::default() {
                info!(
                    settled = report.settled,
                    failed = report.failed,
                    in_flight = report.in_flight,
                    events_finished = report.events_finished,
                    "Reconciler sweep complete"
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Reconciler shutting down");
                    return;
                }
            }
        }
    }

    /// One sweep over stale payments, then stale events.
    pub async fn run_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let cutoff = Utc::now() - chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::zero());

        match self.ledger.pending_payments_before(cutoff) {
            Ok(pending) => {
                for attempt in pending {
                    if let Err(e) = self.reconcile_payment(&attempt, &mut report).await {
                        error!(payment_id = %attempt.id, error = %e, "Reconciler: failed to record payment");
                    }
                }
            }
            Err(e) => error!(error = %e, "Reconciler: failed to list pending payments"),
        }

        match self.ledger.open_events_before(cutoff) {
            Ok(events) => {
                for event in events {
                    if let Err(e) = self.reconcile_event(&event, &mut report).await {
                        error!(event_id = %event.id, error = %e, "Reconciler: failed to finish event");
                    }
                }
            }
            Err(e) => error!(error = %e, "Reconciler: failed to list open events"),
        }

        report
    }

    async fn reconcile_payment(
        &self,
        attempt: &PaymentAttempt,
        report: &mut ReconcileReport,
    ) -> Result<(), LedgerError> {
        let Some(app) = self.ledger.get_application(&attempt.app_id)? else {
            warn!(payment_id = %attempt.id, app_id = %attempt.app_id, "Reconciler: application no longer exists");
            return Ok(());
        };
        let handle = match self.backends.resolve(&app) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(payment_id = %attempt.id, error = %e, "Reconciler: failed to select backend");
                return Ok(());
            }
        };

        let ctx = RequestContext::new(&attempt.event_id, &app.id, &app.pubkey, CancellationToken::new());
        let outcome = match handle.backend.lookup_payment(&ctx, &attempt.payment_hash).await {
            Ok(PaymentStatus::Settled { preimage }) => Ok(preimage),
            Ok(PaymentStatus::Failed { reason }) => Err(BackendError::PaymentFailed { reason }),
            Ok(PaymentStatus::InFlight) => {
                report.in_flight += 1;
                return Ok(());
            }
            Err(BackendError::NotFound(_)) => Err(BackendError::PaymentFailed {
                reason: "payment unknown to backend".to_string(),
            }),
            Err(e) => {
                warn!(payment_id = %attempt.id, error = %e, "Reconciler: payment lookup failed");
                return Ok(());
            }
        };
        if outcome.is_ok() {
            report.settled += 1;
        } else {
            report.failed += 1;
        }

        let method = method_for(&attempt.target);
        let Completion::Done { state, response } = record_payment(&self.ledger, attempt, method, outcome)? else {
            return Ok(());
        };
        info!(event_id = %attempt.event_id, payment_hash = %attempt.payment_hash, state = ?state, "Reconciler: payment resolved");

        match self.ledger.get_event(&attempt.event_id)? {
            Some(event) if event.state == EventState::Received => {
                self.finish(&event, state, response, report).await
            }
            _ => Ok(()),
        }
    }

    async fn reconcile_event(
        &self,
        event: &InboundEventRecord,
        report: &mut ReconcileReport,
    ) -> Result<(), LedgerError> {
        let (state, response) = match self.ledger.payment_for_event(&event.id)? {
            Some(attempt) => match attempt.state {
                PaymentState::Pending => return Ok(()),
                PaymentState::Settled => (
                    EventState::Executed,
                    Nip47Response::success(
                        event.method.as_str(),
                        serde_json::json!({ "preimage": attempt.preimage.unwrap_or_default() }),
                    ),
                ),
                PaymentState::Failed => (
                    EventState::HandlerError,
                    Nip47Response::error(
                        event.method.as_str(),
                        ErrorCode::Internal,
                        format!(
                            "Something went wrong while paying: {}",
                            attempt.failure_reason.unwrap_or_default()
                        ),
                    ),
                ),
            },
            None => (
                EventState::HandlerError,
                Nip47Response::error(event.method.as_str(), ErrorCode::Internal, "request interrupted"),
            ),
        };
        self.finish(event, state, response, report).await
    }

    async fn finish(
        &self,
        event: &InboundEventRecord,
        state: EventState,
        response: Nip47Response,
        report: &mut ReconcileReport,
    ) -> Result<(), LedgerError> {
        let envelope = finish_event(&self.ledger, &event.id, &event.requester_pubkey, state, response)?;
        report.events_finished += 1;
        if let Err(e) = self.sink.publish(envelope).await {
            error!(event_id = %event.id, error = %e, "Reconciler: failed to publish response");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::{Harness, MockBackend, RecordingSink, PREIMAGE_HEX, TEST_PAYMENT_HASH};
    use crate::storage::{Application, PermissionGrant};

    struct Fixture {
        h: Harness,
        sink: Arc<RecordingSink>,
        reconciler: Reconciler,
        app: Application,
    }

    fn fixture() -> Fixture {
        let h = Harness::new(MockBackend::new());
        let app = h.register(
            Application::new("aa".repeat(32), "payer").with_grant(PermissionGrant::unlimited(Method::PayInvoice)),
        );
        let sink = Arc::new(RecordingSink::default());
        let reconciler = Reconciler::new(h.ledger.clone(), h.resolver.clone(), sink.clone(), Duration::from_secs(60))
            .with_grace(Duration::ZERO);
        Fixture { h, sink, reconciler, app }
    }

    /// A received event with a pending attempt, as left by a crash mid-payment.
    fn interrupted_payment(f: &Fixture, event_id: &str) -> PaymentAttempt {
        let event = InboundEventRecord::received(event_id, &f.app.id, &f.app.pubkey, "pay_invoice", "");
        f.h.ledger.create_event(&event).unwrap();
        let attempt = PaymentAttempt::pending(
            &f.app.id,
            event_id,
            PaymentTarget::Invoice {
                bolt11: "lnbcrt1".to_string(),
            },
            TEST_PAYMENT_HASH,
            1_000,
        );
        f.h.ledger.create_payment(&attempt).unwrap();
        attempt
    }

    #[tokio::test]
    async fn settles_pending_payment_and_publishes() {
        let f = fixture();
        let attempt = interrupted_payment(&f, "e1");
        *f.h.backend.status.lock().unwrap() = PaymentStatus::Settled {
            preimage: PREIMAGE_HEX.to_string(),
        };

        let report = f.reconciler.run_once().await;
        assert_eq!(report.settled, 1);
        assert_eq!(report.events_finished, 1);

        let payment = f.h.ledger.get_payment(&attempt.id).unwrap().unwrap();
        assert_eq!(payment.state, PaymentState::Settled);
        assert_eq!(f.h.ledger.get_event("e1").unwrap().unwrap().state, EventState::Executed);

        let published = f.sink.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].recipient, f.app.pubkey);
        assert_eq!(
            published[0].response.result,
            Some(serde_json::json!({ "preimage": PREIMAGE_HEX }))
        );
    }

    #[tokio::test]
    async fn failed_payment_finishes_with_internal_error() {
        let f = fixture();
        interrupted_payment(&f, "e1");
        *f.h.backend.status.lock().unwrap() = PaymentStatus::Failed {
            reason: "no route".to_string(),
        };

        let report = f.reconciler.run_once().await;
        assert_eq!(report.failed, 1);
        let record = f.h.ledger.get_event("e1").unwrap().unwrap();
        assert_eq!(record.state, EventState::HandlerError);
        assert_eq!(record.error_code, Some(ErrorCode::Internal));
    }

    #[tokio::test]
    async fn in_flight_payment_is_left_alone() {
        let f = fixture();
        let attempt = interrupted_payment(&f, "e1");

        let report = f.reconciler.run_once().await;
        assert_eq!(report.in_flight, 1);
        assert_eq!(report.events_finished, 0);
        assert_eq!(
            f.h.ledger.get_payment(&attempt.id).unwrap().unwrap().state,
            PaymentState::Pending
        );
        assert_eq!(f.h.ledger.get_event("e1").unwrap().unwrap().state, EventState::Received);
        assert!(f.sink.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn event_without_attempt_is_interrupted() {
        let f = fixture();
        let event = InboundEventRecord::received("e1", &f.app.id, &f.app.pubkey, "get_balance", "");
        f.h.ledger.create_event(&event).unwrap();

        f.reconciler.run_once().await;

        let published = f.sink.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let error = published[0].response.error.clone().unwrap();
        assert_eq!(error.code, ErrorCode::Internal);
        assert_eq!(error.message, "request interrupted");
    }

    #[tokio::test]
    async fn event_with_settled_attempt_is_executed() {
        let f = fixture();
        let attempt = interrupted_payment(&f, "e1");
        f.h.ledger.settle_payment(&attempt.id, PREIMAGE_HEX).unwrap();

        let report = f.reconciler.run_once().await;
        assert_eq!(report.events_finished, 1);
        assert_eq!(f.h.backend.lookup_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(f.h.ledger.get_event("e1").unwrap().unwrap().state, EventState::Executed);
    }

    #[tokio::test]
    async fn young_items_wait_for_the_grace_period() {
        let f = fixture();
        interrupted_payment(&f, "e1");
        let reconciler = Reconciler::new(
            f.h.ledger.clone(),
            f.h.resolver.clone(),
            f.sink.clone(),
            Duration::from_secs(60),
        );

        assert_eq!(reconciler.run_once().await, ReconcileReport::default());
        assert_eq!(f.h.backend.lookup_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let f = fixture();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), f.reconciler.run(shutdown))
            .await
            .unwrap();
    }
}
