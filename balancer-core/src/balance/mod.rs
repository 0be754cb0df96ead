//! # Balance Module
//!
//! Target-selection strategies for the dispatcher.
//!
//! ## Module Structure
//!
//! * `ip_hash`: deterministic client-IP hashing (the non-smart strategy)
//! * `session`: session-route extraction from query string or cookie
//! * `quota`: the least-busy quota table fed by the status poller, with
//!   uniform-random fallback
//!
//! Under smart balancing a session route wins whenever it names a registered
//! worker; otherwise the quota selector (or, for WebSocket upgrades with a
//! stale route, a uniform random pick) decides. Without smart balancing the
//! client IP hash alone decides.

pub mod ip_hash;
pub mod quota;
pub mod session;
