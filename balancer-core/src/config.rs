//! # Configuration Module for Balancer Core
//!
//! This module provides the construction-time configuration for the balancer:
//! the listening transport, the backend worker pool, the balancing strategy,
//! and the status-poller tuning knobs with their defaults.
//!
//! Loading configuration from files or the environment is the host program's
//! concern; this crate only consumes an already-built [`BalancerConfig`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Every dispatched target and every status probe addresses workers on the
/// loopback interface.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Default poll period for the worker status poller, in milliseconds.
pub const DEFAULT_STATUS_CHECK_INTERVAL_MS: u64 = 5_000;

/// Default per-probe timeout, in milliseconds.
pub const DEFAULT_CHECK_STATUS_TIMEOUT_MS: u64 = 10_000;

/// Default path of the status endpoint on each worker.
pub const DEFAULT_STATUS_URL: &str = "/~status";

/// Listener transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

/// TLS material for the HTTPS listener.
///
/// # Fields
///
/// * `cert_path` - Path to the certificate PEM file
/// * `key_path` - Path to the private key file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsOptions {
    pub cert_path: String,
    pub key_path: String,
}

/// A single backend worker, identified by its local port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Worker {
    pub port: u16,
}

/// A resolved per-request destination. The host component is always the
/// loopback address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn loopback(port: u16) -> Self {
        Target {
            host: LOOPBACK_HOST.to_string(),
            port,
        }
    }
}

/// Balancer construction configuration.
///
/// # Fields
///
/// * `protocol` - Listener transport (`http` or `https`)
/// * `protocol_options` - TLS key/certificate pair, required for `https`
/// * `source_port` - TCP port the public listener binds
/// * `host` - Advertised host name (metadata only; routing always uses loopback)
/// * `workers` - Ordered backend pool, one entry per worker port
/// * `use_smart_balancing` - `true` selects session/quota balancing, `false`
///   selects deterministic client-IP hashing
/// * `data_key` - Opaque token included in every status-probe POST body
/// * `status_check_interval_ms` - Poll period (default 5000)
/// * `check_status_timeout_ms` - Per-probe timeout (default 10000)
/// * `status_url` - Status endpoint path on each worker (default `/~status`)
/// * `balancer_count` - Number of cooperating balancer processes; divisor
///   applied when computing quotas (minimum 1)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BalancerConfig {
    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default)]
    pub protocol_options: Option<TlsOptions>,

    pub source_port: u16,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub workers: Vec<Worker>,

    #[serde(default)]
    pub use_smart_balancing: bool,

    #[serde(default)]
    pub data_key: String,

    #[serde(default = "default_status_check_interval_ms")]
    pub status_check_interval_ms: u64,

    #[serde(default = "default_check_status_timeout_ms")]
    pub check_status_timeout_ms: u64,

    #[serde(default = "default_status_url")]
    pub status_url: String,

    #[serde(default = "default_balancer_count")]
    pub balancer_count: u32,
}

fn default_status_check_interval_ms() -> u64 {
    DEFAULT_STATUS_CHECK_INTERVAL_MS
}

fn default_check_status_timeout_ms() -> u64 {
    DEFAULT_CHECK_STATUS_TIMEOUT_MS
}

fn default_status_url() -> String {
    DEFAULT_STATUS_URL.to_string()
}

fn default_balancer_count() -> u32 {
    1
}

impl Default for BalancerConfig {
    fn default() -> Self {
        BalancerConfig {
            protocol: Protocol::Http,
            protocol_options: None,
            source_port: 0,
            host: None,
            workers: Vec::new(),
            use_smart_balancing: false,
            data_key: String::new(),
            status_check_interval_ms: DEFAULT_STATUS_CHECK_INTERVAL_MS,
            check_status_timeout_ms: DEFAULT_CHECK_STATUS_TIMEOUT_MS,
            status_url: DEFAULT_STATUS_URL.to_string(),
            balancer_count: 1,
        }
    }
}

impl BalancerConfig {
    pub fn status_check_interval(&self) -> Duration {
        Duration::from_millis(self.status_check_interval_ms)
    }

    pub fn check_status_timeout(&self) -> Duration {
        Duration::from_millis(self.check_status_timeout_ms)
    }

    /// `balancer_count` as a quota divisor; a misconfigured zero behaves as 1.
    pub fn effective_balancer_count(&self) -> u32 {
        self.balancer_count.max(1)
    }
}
