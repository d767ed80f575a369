// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::relay::Dispatcher;
use crate::storage::Ledger;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,
    pub dispatcher: Arc<Dispatcher>,
    /// sha256 of the relay ingress token; compared digest to digest.
    ingress_token_digest: [u8; 32],
}

impl AppState {
    pub fn new(ledger: Arc<Ledger>, dispatcher: Arc<Dispatcher>, ingress_token: &str) -> Self {
        Self {
            ledger,
            dispatcher,
            ingress_token_digest: Sha256::digest(ingress_token.as_bytes()).into(),
        }
    }

    /// Whether `presented` matches the configured relay token.
    pub fn is_relay_token(&self, presented: &str) -> bool {
        let digest: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
        digest == self.ingress_token_digest
    }
}
