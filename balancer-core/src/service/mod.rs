//! # Service Module
//!
//! Construction of the Pingora listening services that carry the balancer:
//! a plain TCP listener for `http` and a TLS listener for `https`. Both feed
//! the same dispatch application, so ordinary exchanges and upgrade
//! handshakes share one public port.

pub mod dispatch;
