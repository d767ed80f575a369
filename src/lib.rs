// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Relational Wallet Connect - Lightning Wallet Connect Bridge
//!
//! Authorizes wallet-connect requests from third-party applications against
//! per-application permissions and spending budgets, and executes them
//! against a Lightning backend (LND, LNbits or Alby).
//!
//! ## Modules
//!
//! - `api` - HTTP surface (Axum): relay ingress and health probes
//! - `backend` - Lightning backend adapters and per-request selection
//! - `permissions` - Grant and budget checks
//! - `protocol` - Request router, per-app locks and reconciliation
//! - `relay` - Boundary with the relay sidecar
//! - `storage` - Event/payment ledger (redb)

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod models;
pub mod permissions;
pub mod protocol;
pub mod relay;
pub mod state;
pub mod storage;
pub mod telemetry;
