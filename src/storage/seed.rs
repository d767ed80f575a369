// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Load applications from a JSON file at startup.
//!
//! The file holds a JSON array of applications. Entries whose pubkey is
//! already registered are skipped, so the same file can be applied on every
//! boot.

use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use super::{Application, BackendOptions, Ledger, LedgerError, PermissionGrant};

/// One application entry in the seed file.
#[derive(Debug, Deserialize)]
struct SeedApplication {
    pubkey: String,
    name: String,
    #[serde(default)]
    backend: BackendOptions,
    #[serde(default)]
    grants: Vec<PermissionGrant>,
    #[serde(default)]
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Returns the number of applications inserted.
pub fn seed_applications(ledger: &Ledger, path: &Path) -> Result<usize, LedgerError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| LedgerError::Invalid(format!("failed to read {}: {e}", path.display())))?;
    let entries: Vec<SeedApplication> = serde_json::from_str(&raw)?;

    let mut inserted = 0;
    for entry in entries {
        if ledger.find_application_by_pubkey(&entry.pubkey)?.is_some() {
            continue;
        }
        if !matches!(hex::decode(&entry.pubkey), Ok(bytes) if bytes.len() == 32) {
            warn!(name = %entry.name, "Skipping seed application with malformed pubkey");
            continue;
        }

        let mut app = Application::new(entry.pubkey, entry.name);
        app.backend = entry.backend;
        app.expires_at = entry.expires_at;
        for grant in entry.grants {
            app = app.with_grant(grant);
        }
        ledger.put_application(&app)?;
        info!(app_id = %app.id, name = %app.name, "Seeded application");
        inserted += 1;
    }
    Ok(inserted)
}
