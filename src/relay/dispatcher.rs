// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-event worker tasks.
//!
//! Every accepted event runs on its own tracked task; there is no global
//! sequencer. At shutdown the tracker is closed so no new events are
//! accepted, and [`Dispatcher::drain`] waits for the running ones.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use super::ResponseSink;
use crate::models::InboundEvent;
use crate::protocol::{Outcome, RequestRouter};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

pub struct Dispatcher {
    router: Arc<RequestRouter>,
    sink: Arc<dyn ResponseSink>,
    deadline: Duration,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(router: Arc<RequestRouter>, sink: Arc<dyn ResponseSink>, deadline: Duration) -> Self {
        Self {
            router,
            sink,
            deadline,
            tracker: TaskTracker::new(),
        }
    }

    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    /// Start handling an event in the background.
    pub fn dispatch(&self, event: InboundEvent) -> Result<(), DispatchError> {
        if self.tracker.is_closed() {
            return Err(DispatchError::ShuttingDown);
        }
        let router = self.router.clone();
        let sink = self.sink.clone();
        let deadline = self.deadline;
        self.tracker.spawn(async move {
            process(router, sink, event, deadline).await;
        });
        Ok(())
    }

    pub fn is_accepting(&self) -> bool {
        !self.tracker.is_closed()
    }

    /// Number of events currently being handled.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting events and wait for the running ones to finish.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn process(
    router: Arc<RequestRouter>,
    sink: Arc<dyn ResponseSink>,
    event: InboundEvent,
    deadline: Duration,
) {
    let event_id = event.id.clone();
    let cancel = CancellationToken::new();

    let handling = router.handle(event, cancel.clone());
    tokio::pin!(handling);
    let result = tokio::select! {
        result = &mut handling => result,
        _ = tokio::time::sleep(deadline) => {
            warn!(event_id = %event_id, deadline_secs = deadline.as_secs(), "Request deadline exceeded");
            cancel.cancel();
            handling.await
        }
    };

    match result {
        Ok(Outcome::Respond(envelope)) => {
            if let Err(e) = sink.publish(envelope).await {
                error!(event_id = %event_id, error = %e, "Failed to publish response");
            }
        }
        Ok(outcome) => debug!(event_id = %event_id, outcome = ?outcome, "No response to publish"),
        Err(e) => error!(event_id = %event_id, error = %e, "Failed to record request; no response sent"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Method;
    use crate::protocol::testing::{event, mint_invoice, Harness, MockBackend, RecordingSink};
    use crate::storage::{Application, BudgetRenewal, EventState, PermissionGrant};
    use serde_json::json;

    fn app() -> Application {
        Application::new("aa".repeat(32), "payer")
            .with_grant(PermissionGrant::with_budget(Method::PayInvoice, 10_000, BudgetRenewal::Never))
            .with_grant(PermissionGrant::unlimited(Method::GetBalance))
    }

    #[tokio::test]
    async fn publishes_one_response_per_event() {
        let h = Harness::new(MockBackend::new());
        let app = h.register(app());
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Dispatcher::new(h.router.clone(), sink.clone(), Duration::from_secs(5));

        dispatcher
            .dispatch(event("e1", &app.pubkey, "get_balance", json!({})))
            .unwrap();
        dispatcher
            .dispatch(event("e1", &app.pubkey, "get_balance", json!({})))
            .unwrap();
        dispatcher
            .dispatch(event("e2", &app.pubkey, "pay_invoice", json!({ "invoice": mint_invoice(Some(1_000)) })))
            .unwrap();
        dispatcher.drain().await;

        let published = sink.published.lock().unwrap();
        assert_eq!(published.len(), 2);
        assert!(published.iter().any(|e| e.event_id == "e1"));
        assert!(published.iter().any(|e| e.event_id == "e2"));
    }

    #[tokio::test]
    async fn refuses_events_after_drain() {
        let h = Harness::new(MockBackend::new());
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Dispatcher::new(h.router.clone(), sink, Duration::from_secs(5));

        dispatcher.drain().await;
        assert!(!dispatcher.is_accepting());
        let result = dispatcher.dispatch(event("e1", &"aa".repeat(32), "get_balance", json!({})));
        assert!(matches!(result, Err(DispatchError::ShuttingDown)));
    }

    #[tokio::test]
    async fn deadline_defers_slow_payment() {
        let h = Harness::new(MockBackend::new().with_delay(Duration::from_millis(300)));
        let app = h.register(app());
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Dispatcher::new(h.router.clone(), sink.clone(), Duration::from_millis(30));

        dispatcher
            .dispatch(event("e1", &app.pubkey, "pay_invoice", json!({ "invoice": mint_invoice(Some(1_000)) })))
            .unwrap();
        dispatcher.drain().await;

        assert!(sink.published.lock().unwrap().is_empty());
        assert_eq!(h.ledger.get_event("e1").unwrap().unwrap().state, EventState::Received);
    }
}
