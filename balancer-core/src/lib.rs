//! # Balancer Core
//!
//! Session-aware reverse proxy and load balancer fronting a fixed pool of
//! backend worker processes listening on distinct loopback ports. Incoming
//! HTTP(S) requests and WebSocket upgrade handshakes are accepted on a single
//! public port, routed to a worker by one of two strategies, and streamed in
//! both directions until either side closes.
//!
//! ## Architecture
//!
//! The crate is built from the following components:
//! - **Registry**: the immutable-per-reconfiguration list of backend workers
//! - **Balance Layer**: client-IP hashing, session-route extraction, and the
//!   quota selector fed by the status poller
//! - **Status Poller**: periodic worker-status collection driving quotas
//! - **Middleware**: ordered request/upgrade handler chains run before dispatch
//! - **App Layer**: the per-exchange dispatcher wired into the streaming proxy
//! - **Service Layer**: TCP/TLS listening service construction
//!
//! ## Usage
//!
//! The [`Balancer`] handle owns all shared state. The host program constructs
//! it from a [`BalancerConfig`], optionally registers middleware, an error
//! observer, and a [`BalancerController`], then calls [`Balancer::start`],
//! which blocks and serves forever.

pub mod app;
pub mod balance;
pub mod balancer;
pub mod config;
pub mod error;
pub mod middleware;
pub mod registry;
pub mod service;
pub mod status;

pub use balance::quota::QuotaEntry;
pub use balancer::{Balancer, BalancerController};
pub use config::{BalancerConfig, Protocol, Target, TlsOptions, Worker};
pub use error::BalancerError;
pub use middleware::{Middleware, MiddlewarePhase};
pub use status::{StatusReport, WorkerStatus};
