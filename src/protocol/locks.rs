// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-application mutual exclusion for paying methods.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async lock per application id. Different applications never contend.
#[derive(Default)]
pub struct AppLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl AppLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, app_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(app_id.to_string()).or_default().clone()
    }

    /// Wait for the application's lock.
    ///
    /// The guard is owned so it can move into a detached payment task and be
    /// released only once the outcome is recorded.
    pub async fn acquire(&self, app_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(app_id).lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_app_serializes() {
        let locks = AppLocks::new();
        let guard = locks.acquire("app-a").await;
        let second = tokio::time::timeout(Duration::from_millis(50), locks.acquire("app-a")).await;
        assert!(second.is_err());
        drop(guard);
        let third = tokio::time::timeout(Duration::from_millis(50), locks.acquire("app-a")).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn different_apps_do_not_contend() {
        let locks = AppLocks::new();
        let _a = locks.acquire("app-a").await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.acquire("app-b")).await;
        assert!(b.is_ok());
    }
}
