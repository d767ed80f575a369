// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-request backend resolution with a pooled set of adapters.
//!
//! Resolution order for each parameter (kind, host, credential):
//! 1. the application's own backend options,
//! 2. the service default for that kind,
//! 3. a well-known local address, only when `ALLOW_LOCAL_BACKEND_FALLBACK`
//!    is enabled.
//!
//! An application that overrides the host must bring its own credential.
//!
//! Adapters are cached in an LRU keyed by `(kind, host, sha256(credential))`
//! with a TTL, so credentials never appear in cache keys or logs.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{
    AlbyClient, Backend, BackendError, BackendKind, LightningBackend, LnBitsClient, LndClient,
};
use crate::config::LightningConfig;
use crate::storage::Application;

/// Local LND REST address used when fallback is enabled.
pub const LOCAL_LND_ADDRESS: &str = "https://localhost:8080";

/// Local LNbits address used when fallback is enabled.
pub const LOCAL_LNBITS_HOST: &str = "http://localhost:3007";

const DEFAULT_POOL_CAPACITY: usize = 64;
const DEFAULT_POOL_TTL: Duration = Duration::from_secs(600);

/// Request-scoped adapter selection. Never persisted.
#[derive(Clone)]
pub struct BackendHandle {
    pub app_id: String,
    pub kind: BackendKind,
    pub host: String,
    pub backend: Arc<dyn LightningBackend>,
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("app_id", &self.app_id)
            .field("kind", &self.kind)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

/// Seam between the request router and adapter construction.
pub trait BackendResolver: Send + Sync {
    fn resolve(&self, app: &Application) -> Result<BackendHandle, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    kind: BackendKind,
    host: String,
    credential_digest: [u8; 32],
}

struct PoolEntry {
    backend: Arc<Backend>,
    inserted_at: Instant,
}

/// Resolved connection parameters before an adapter is built.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    kind: BackendKind,
    host: String,
    credential: String,
    /// Pinned certificate, only for the service's own LND node.
    cert_pem: Option<Vec<u8>>,
}

pub struct BackendSelector {
    config: LightningConfig,
    pool: Mutex<LruCache<PoolKey, PoolEntry>>,
    ttl: Duration,
}

/// The app's own credential, or the service's when the host also comes from
/// the service. Service credentials are never sent to an app-chosen host.
fn credential_for<'a>(
    app_host: Option<&str>,
    app_credential: Option<&'a str>,
    service_credential: Option<&'a str>,
) -> Option<&'a str> {
    match app_host {
        Some(_) => app_credential,
        None => app_credential.or(service_credential),
    }
}

impl BackendSelector {
    pub fn new(config: LightningConfig) -> Self {
        Self::with_pool(config, DEFAULT_POOL_CAPACITY, DEFAULT_POOL_TTL)
    }

    pub fn with_pool(config: LightningConfig, capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            pool: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn target(&self, app: &Application) -> Result<Target, BackendError> {
        let options = &app.backend;
        let kind = options.backend.unwrap_or(self.config.default_backend);
        let app_host = options.host.as_deref().map(str::trim).filter(|h| !h.is_empty());
        let app_credential = options
            .credential
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());
        let allow_local = self.config.allow_local_fallback;

        let missing = |what: &str| {
            BackendError::Configuration(format!("no {what} configured for {kind} backend"))
        };
        let missing_credential = |what: &str| match app_host {
            Some(_) => BackendError::Configuration(format!("no {what} configured for app {kind} host")),
            None => missing(what),
        };

        match kind {
            BackendKind::Lnd => {
                let service_host = self.config.lnd_address.as_deref();
                let host = app_host
                    .or(service_host)
                    .or(allow_local.then_some(LOCAL_LND_ADDRESS))
                    .ok_or_else(|| missing("address"))?;
                let credential = credential_for(app_host, app_credential, self.config.lnd_macaroon_hex.as_deref())
                    .ok_or_else(|| missing_credential("macaroon"))?;
                let cert_pem = if app_host.is_none() {
                    self.config.lnd_cert_pem.clone()
                } else {
                    None
                };
                Ok(Target {
                    kind,
                    host: host.to_string(),
                    credential: credential.to_string(),
                    cert_pem,
                })
            }
            BackendKind::LnBits => {
                let host = app_host
                    .or(self.config.lnbits_host.as_deref())
                    .or(allow_local.then_some(LOCAL_LNBITS_HOST))
                    .ok_or_else(|| missing("host"))?;
                let credential = credential_for(app_host, app_credential, self.config.lnbits_admin_key.as_deref())
                    .ok_or_else(|| missing_credential("admin key"))?;
                Ok(Target {
                    kind,
                    host: host.to_string(),
                    credential: credential.to_string(),
                    cert_pem: None,
                })
            }
            BackendKind::Alby => {
                let host = app_host.unwrap_or(self.config.alby_api_url.as_str());
                let credential = credential_for(app_host, app_credential, self.config.alby_access_token.as_deref())
                    .ok_or_else(|| missing_credential("access token"))?;
                Ok(Target {
                    kind,
                    host: host.to_string(),
                    credential: credential.to_string(),
                    cert_pem: None,
                })
            }
        }
    }

    fn build(target: &Target) -> Result<Backend, BackendError> {
        Ok(match target.kind {
            BackendKind::Lnd => Backend::Lnd(LndClient::new(
                &target.host,
                &target.credential,
                target.cert_pem.as_deref(),
            )?),
            BackendKind::LnBits => Backend::LnBits(LnBitsClient::new(&target.host, &target.credential)?),
            BackendKind::Alby => Backend::Alby(AlbyClient::new(&target.host, &target.credential)?),
        })
    }

    fn pooled(&self, target: &Target) -> Result<Arc<Backend>, BackendError> {
        let key = PoolKey {
            kind: target.kind,
            host: target.host.clone(),
            credential_digest: Sha256::digest(target.credential.as_bytes()).into(),
        };

        if let Ok(mut pool) = self.pool.lock() {
            if let Some(entry) = pool.get(&key) {
                if entry.inserted_at.elapsed() < self.ttl {
                    return Ok(entry.backend.clone());
                }
                // Expired
                pool.pop(&key);
            }
        }

        let backend = Arc::new(Self::build(target)?);
        debug!(kind = %target.kind, host = %target.host, "Built backend adapter");
        if let Ok(mut pool) = self.pool.lock() {
            pool.put(
                key,
                PoolEntry {
                    backend: backend.clone(),
                    inserted_at: Instant::now(),
                },
            );
        }
        Ok(backend)
    }

    #[cfg(test)]
    fn pool_len(&self) -> usize {
        self.pool.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl BackendResolver for BackendSelector {
    fn resolve(&self, app: &Application) -> Result<BackendHandle, BackendError> {
        let target = self.target(app)?;
        let backend = self.pooled(&target)?;
        Ok(BackendHandle {
            app_id: app.id.clone(),
            kind: target.kind,
            host: target.host,
            backend,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BackendOptions;

    fn config() -> LightningConfig {
        LightningConfig {
            default_backend: BackendKind::LnBits,
            lnd_address: None,
            lnd_macaroon_hex: Some("0201".to_string()),
            lnd_cert_pem: None,
            lnbits_host: Some("https://lnbits.service".to_string()),
            lnbits_admin_key: Some("service-key".to_string()),
            alby_api_url: "https://api.getalby.com".to_string(),
            alby_access_token: None,
            allow_local_fallback: false,
        }
    }

    fn app_with(options: BackendOptions) -> Application {
        let mut app = Application::new("ab".repeat(32), "app");
        app.backend = options;
        app
    }

    #[test]
    fn app_host_overrides_service_default() {
        let selector = BackendSelector::new(config());
        let app = app_with(BackendOptions {
            backend: None,
            host: Some("https://lnbits.app".to_string()),
            credential: Some("app-key".to_string()),
        });

        let handle = selector.resolve(&app).unwrap();
        assert_eq!(handle.kind, BackendKind::LnBits);
        assert_eq!(handle.host, "https://lnbits.app");
        assert_eq!(handle.app_id, app.id);
    }

    #[test]
    fn service_credential_never_follows_app_host() {
        let selector = BackendSelector::new(config());
        let app = app_with(BackendOptions {
            backend: None,
            host: Some("https://elsewhere.example".to_string()),
            credential: None,
        });
        match selector.resolve(&app) {
            Err(BackendError::Configuration(message)) => assert!(message.contains("app"), "{message}"),
            other => panic!("expected configuration error, got {other:?}"),
        }

        let lnd = app_with(BackendOptions {
            backend: Some(BackendKind::Lnd),
            host: Some("https://lnd.elsewhere.example:8080".to_string()),
            credential: None,
        });
        assert!(matches!(
            selector.resolve(&lnd),
            Err(BackendError::Configuration(_))
        ));
        assert_eq!(selector.pool_len(), 0);
    }

    #[test]
    fn app_credential_may_use_service_host() {
        let selector = BackendSelector::new(config());
        let app = app_with(BackendOptions {
            backend: None,
            host: None,
            credential: Some("app-key".to_string()),
        });
        assert_eq!(selector.resolve(&app).unwrap().host, "https://lnbits.service");
    }

    #[test]
    fn service_default_used_when_app_has_none() {
        let selector = BackendSelector::new(config());
        let handle = selector.resolve(&app_with(BackendOptions::default())).unwrap();
        assert_eq!(handle.host, "https://lnbits.service");
    }

    #[test]
    fn missing_host_is_configuration_error_without_fallback() {
        let selector = BackendSelector::new(config());
        let app = app_with(BackendOptions {
            backend: Some(BackendKind::Lnd),
            ..Default::default()
        });
        assert!(matches!(
            selector.resolve(&app),
            Err(BackendError::Configuration(_))
        ));
    }

    #[test]
    fn local_fallback_only_when_enabled() {
        let mut cfg = config();
        cfg.allow_local_fallback = true;
        let selector = BackendSelector::new(cfg);
        let app = app_with(BackendOptions {
            backend: Some(BackendKind::Lnd),
            ..Default::default()
        });
        assert_eq!(selector.resolve(&app).unwrap().host, LOCAL_LND_ADDRESS);
    }

    #[test]
    fn alby_requires_a_token() {
        let selector = BackendSelector::new(config());
        let app = app_with(BackendOptions {
            backend: Some(BackendKind::Alby),
            ..Default::default()
        });
        assert!(matches!(
            selector.resolve(&app),
            Err(BackendError::Configuration(_))
        ));

        let app = app_with(BackendOptions {
            backend: Some(BackendKind::Alby),
            host: None,
            credential: Some("token".to_string()),
        });
        assert_eq!(selector.resolve(&app).unwrap().host, "https://api.getalby.com");
    }

    #[test]
    fn adapters_are_pooled_per_credential() {
        let selector = BackendSelector::new(config());
        let first = app_with(BackendOptions::default());
        let second = app_with(BackendOptions::default());
        let other_key = app_with(BackendOptions {
            credential: Some("another-key".to_string()),
            ..Default::default()
        });

        let a = selector.resolve(&first).unwrap();
        let b = selector.resolve(&second).unwrap();
        assert!(Arc::ptr_eq(&a.backend, &b.backend));
        assert_eq!(selector.pool_len(), 1);

        let c = selector.resolve(&other_key).unwrap();
        assert!(!Arc::ptr_eq(&a.backend, &c.backend));
        assert_eq!(selector.pool_len(), 2);
    }

    #[test]
    fn expired_pool_entries_are_rebuilt() {
        let selector = BackendSelector::with_pool(config(), 4, Duration::from_millis(1));
        let app = app_with(BackendOptions::default());
        let a = selector.resolve(&app).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let b = selector.resolve(&app).unwrap();
        assert!(!Arc::ptr_eq(&a.backend, &b.backend));
    }
}
