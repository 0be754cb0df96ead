//! # Application Module
//!
//! The per-exchange dispatch logic of the balancer.
//!
//! ## Module Structure
//!
//! * `dispatch`: the `ProxyHttp` application that runs the middleware chain,
//!   resolves a worker target by the configured strategy, and hands the
//!   exchange to the streaming proxy
//!
//! ## Responsibility
//!
//! This module owns everything that happens between accepting an exchange and
//! opening the upstream connection: phase selection (request vs upgrade),
//! middleware execution, target resolution, forwarded-header stamping, and
//! the proxy-error response when an exchange dies before any bytes reached
//! the client.

pub mod dispatch;
