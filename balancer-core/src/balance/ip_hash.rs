//! # Client-IP Hashing
//!
//! The non-smart balancing strategy: a deterministic string hash of the
//! client IP indexes the worker list, so a given client always lands on the
//! same worker as long as the registry is unchanged.
//!
//! The client IP is the prefix of `x-forwarded-for` before the first comma
//! when the header is present, otherwise the transport-level remote address.

use crate::config::Target;
use crate::registry::WorkerRegistry;
use pingora::http::RequestHeader;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// 32-bit string hash: `h = h * 31 + c` over UTF-16 code units with signed
/// wrap-around. The empty string hashes to 0.
pub fn hash_str(s: &str) -> i32 {
    let mut h: i32 = 0;
    for unit in s.encode_utf16() {
        h = h
            .wrapping_shl(5)
            .wrapping_sub(h)
            .wrapping_add(unit as i32);
    }
    h
}

/// Index into a pool of `n` workers. `n` must be non-zero.
pub fn worker_index(s: &str, n: usize) -> usize {
    ((hash_str(s) as i64).unsigned_abs() % n as u64) as usize
}

/// Derive the hashable client IP from the request.
pub fn client_ip(req: &RequestHeader, remote_addr: Option<String>) -> String {
    if let Some(value) = req.headers.get(X_FORWARDED_FOR) {
        if let Ok(forwarded) = value.to_str() {
            if let Some(first) = forwarded.split(',').next() {
                return first.trim().to_string();
            }
        }
    }
    remote_addr.unwrap_or_default()
}

/// Hash `ip` into the registry. Returns no target when the registry is empty;
/// the caller aborts the request.
pub fn pick_worker(ip: &str, registry: &WorkerRegistry) -> Option<Target> {
    if registry.is_empty() {
        return None;
    }
    let index = worker_index(ip, registry.len());
    registry.port_at(index).map(Target::loopback)
}
