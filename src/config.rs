// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Configuration is loaded from the environment once at startup by
//! [`ServiceConfig::from_env`].
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `DATA_DIR` | Directory holding `ledger.redb` | `./data` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |
//! | `RELAY_PUBLISH_URL` | Relay sidecar endpoint receiving response envelopes | Required |
//! | `RELAY_INGRESS_TOKEN` | Bearer token the sidecar presents on ingress | Required |
//! | `REQUEST_TIMEOUT_SECS` | Deadline for one inbound request | `90` |
//! | `RECONCILE_INTERVAL_SECS` | Interval between reconciliation sweeps | `60` |
//! | `APPS_SEED_PATH` | JSON file of applications loaded at startup | Optional |
//! | `LN_BACKEND_TYPE` | Default backend (`LND`, `LNBITS`, `ALBY`) | `ALBY` |
//! | `LND_ADDRESS` | LND REST address | Optional |
//! | `LND_MACAROON_FILE` | Path to the LND admin macaroon | Optional |
//! | `LND_CERT_FILE` | Path to the LND TLS certificate | Optional |
//! | `LNBITS_HOST` | LNbits base URL | Optional |
//! | `LNBITS_ADMIN_KEY` | LNbits wallet admin key | Optional |
//! | `ALBY_API_URL` | Alby API base URL | `https://api.getalby.com` |
//! | `ALBY_ACCESS_TOKEN` | Alby OAuth access token | Optional |
//! | `ALLOW_LOCAL_BACKEND_FALLBACK` | Fall back to well-known local backend addresses | `false` |

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::backend::{alby, BackendKind};

pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";

/// Environment variable name for the ledger data directory.
pub const DATA_DIR_ENV: &str = "DATA_DIR";

pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";
pub const RELAY_PUBLISH_URL_ENV: &str = "RELAY_PUBLISH_URL";
pub const RELAY_INGRESS_TOKEN_ENV: &str = "RELAY_INGRESS_TOKEN";
pub const REQUEST_TIMEOUT_ENV: &str = "REQUEST_TIMEOUT_SECS";
pub const RECONCILE_INTERVAL_ENV: &str = "RECONCILE_INTERVAL_SECS";
pub const APPS_SEED_PATH_ENV: &str = "APPS_SEED_PATH";
pub const LN_BACKEND_TYPE_ENV: &str = "LN_BACKEND_TYPE";
pub const LND_ADDRESS_ENV: &str = "LND_ADDRESS";
pub const LND_MACAROON_FILE_ENV: &str = "LND_MACAROON_FILE";
pub const LND_CERT_FILE_ENV: &str = "LND_CERT_FILE";
pub const LNBITS_HOST_ENV: &str = "LNBITS_HOST";
pub const LNBITS_ADMIN_KEY_ENV: &str = "LNBITS_ADMIN_KEY";
pub const ALBY_API_URL_ENV: &str = "ALBY_API_URL";
pub const ALBY_ACCESS_TOKEN_ENV: &str = "ALBY_ACCESS_TOKEN";
pub const ALLOW_LOCAL_FALLBACK_ENV: &str = "ALLOW_LOCAL_BACKEND_FALLBACK";

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 90;
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 60;

/// File name of the ledger inside `DATA_DIR`.
pub const LEDGER_FILE: &str = "ledger.redb";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("failed to read {path}: {reason}")]
    File { path: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

impl LogFormat {
    /// Anything other than `json` (case-insensitive) means pretty output.
    pub fn from_env() -> Self {
        match env_optional(LOG_FORMAT_ENV) {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Service-wide Lightning backend defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightningConfig {
    pub default_backend: BackendKind,
    pub lnd_address: Option<String>,
    /// Hex-encoded admin macaroon read from `LND_MACAROON_FILE`.
    pub lnd_macaroon_hex: Option<String>,
    pub lnd_cert_pem: Option<Vec<u8>>,
    pub lnbits_host: Option<String>,
    pub lnbits_admin_key: Option<String>,
    pub alby_api_url: String,
    pub alby_access_token: Option<String>,
    pub allow_local_fallback: bool,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub log_format: LogFormat,
    pub relay_publish_url: String,
    pub relay_ingress_token: String,
    pub request_timeout: Duration,
    pub reconcile_interval: Duration,
    pub apps_seed_path: Option<PathBuf>,
    pub lightning: LightningConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env_or_default(HOST_ENV, DEFAULT_HOST);
        let port = env_parse(PORT_ENV, DEFAULT_PORT)?;
        let bind_addr: SocketAddr =
            format!("{host}:{port}")
                .parse()
                .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                    name: HOST_ENV,
                    reason: e.to_string(),
                })?;

        let relay_publish_url = env_required(RELAY_PUBLISH_URL_ENV)?;
        url::Url::parse(&relay_publish_url).map_err(|e| ConfigError::Invalid {
            name: RELAY_PUBLISH_URL_ENV,
            reason: e.to_string(),
        })?;

        Ok(Self {
            bind_addr,
            data_dir: PathBuf::from(env_or_default(DATA_DIR_ENV, DEFAULT_DATA_DIR)),
            log_format: LogFormat::from_env(),
            relay_publish_url,
            relay_ingress_token: env_required(RELAY_INGRESS_TOKEN_ENV)?,
            request_timeout: Duration::from_secs(env_parse(
                REQUEST_TIMEOUT_ENV,
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?),
            reconcile_interval: Duration::from_secs(env_parse(
                RECONCILE_INTERVAL_ENV,
                DEFAULT_RECONCILE_INTERVAL_SECS,
            )?),
            apps_seed_path: env_optional(APPS_SEED_PATH_ENV).map(PathBuf::from),
            lightning: LightningConfig::from_env()?,
        })
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(LEDGER_FILE)
    }
}

impl LightningConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let default_backend = match env_optional(LN_BACKEND_TYPE_ENV) {
            Some(raw) => raw.parse::<BackendKind>().map_err(|reason| ConfigError::Invalid {
                name: LN_BACKEND_TYPE_ENV,
                reason,
            })?,
            None => BackendKind::Alby,
        };

        let lnd_macaroon_hex = env_optional(LND_MACAROON_FILE_ENV)
            .map(|path| read_file(&path).map(hex::encode))
            .transpose()?;
        let lnd_cert_pem = env_optional(LND_CERT_FILE_ENV)
            .map(|path| read_file(&path))
            .transpose()?;

        Ok(Self {
            default_backend,
            lnd_address: env_optional(LND_ADDRESS_ENV).map(normalize_lnd_address),
            lnd_macaroon_hex,
            lnd_cert_pem,
            lnbits_host: env_optional(LNBITS_HOST_ENV),
            lnbits_admin_key: env_optional(LNBITS_ADMIN_KEY_ENV),
            alby_api_url: env_or_default(ALBY_API_URL_ENV, alby::DEFAULT_API_URL),
            alby_access_token: env_optional(ALBY_ACCESS_TOKEN_ENV),
            allow_local_fallback: env_flag(ALLOW_LOCAL_FALLBACK_ENV)?,
        })
    }
}

/// LND addresses are often given as bare `host:port`; the REST gateway is HTTPS.
fn normalize_lnd_address(address: String) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address
    } else {
        format!("https://{address}")
    }
}

fn read_file(path: &str) -> Result<Vec<u8>, ConfigError> {
    fs::read(path).map_err(|e| ConfigError::File {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

fn env_optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_required(name: &'static str) -> Result<String, ConfigError> {
    env_optional(name).ok_or(ConfigError::Missing(name))
}

fn env_or_default(name: &str, default: &str) -> String {
    env_optional(name).unwrap_or_else(|| default.to_string())
}

fn env_parse<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_optional(name) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn env_flag(name: &'static str) -> Result<bool, ConfigError> {
    match env_optional(name).map(|v| v.to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                name,
                reason: format!("expected a boolean, got {v}"),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lnd_address_gets_https_scheme() {
        assert_eq!(normalize_lnd_address("node:8080".to_string()), "https://node:8080");
        assert_eq!(
            normalize_lnd_address("http://node:8080".to_string()),
            "http://node:8080"
        );
    }

    #[test]
    fn unset_variables_fall_back_to_defaults() {
        let name = "RWC_TEST_UNSET_VARIABLE";
        assert_eq!(env_or_default(name, "fallback"), "fallback");
        assert_eq!(env_parse::<u64>(name, 42).unwrap(), 42);
        assert!(!env_flag(name).unwrap());
        assert!(matches!(env_required(name), Err(ConfigError::Missing(_))));
    }

    #[test]
    fn missing_macaroon_file_is_reported() {
        let err = read_file("/nonexistent/admin.macaroon").unwrap_err();
        assert!(matches!(err, ConfigError::File { .. }));
    }
}
