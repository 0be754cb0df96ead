//! # Session-Route Extraction
//!
//! The primary strategy under smart balancing. An external session source
//! embeds the destination worker inside the session identifier: a token named
//! `sid` or `ssid`, carried in the URL query string or the `Cookie` header,
//! whose value's second underscore-separated field is the decimal worker
//! port.
//!
//! The query string is the source when it is non-empty; only an absent or
//! empty query falls back to the cookie. The regex literals below are kept
//! loose on purpose so unusual cookie separators keep matching; do not
//! replace them with a strict cookie parser.

use crate::config::Target;
use pingora::http::RequestHeader;
use regex::Regex;
use std::sync::LazyLock;

// Boundary character (or start of string), then sid= or ssid=, value up to a
// semicolon.
static SESSION_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([^A-Za-z0-9]|^)s?sid=([^;]*)").unwrap());

// First three underscore-separated fields of the session value.
static ROUTE_FIELDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^_]*)_([^_]*)_([^_]*)_").unwrap());

/// Extract the session-embedded route from a request, if any.
pub fn route_from_request(req: &RequestHeader) -> Option<Target> {
    match req.uri.query().filter(|q| !q.is_empty()) {
        Some(query) => route_from_source(query),
        None => {
            let cookie = req.headers.get(http::header::COOKIE)?.to_str().ok()?;
            route_from_source(cookie)
        }
    }
}

/// Apply the token and field patterns to a raw source string. The second
/// field must parse as a positive base-10 port.
pub fn route_from_source(source: &str) -> Option<Target> {
    let token = SESSION_TOKEN.captures(source)?;
    let value = token.get(2)?.as_str();
    let fields = ROUTE_FIELDS.captures(value)?;
    let port = fields
        .get(2)?
        .as_str()
        .parse::<u16>()
        .ok()
        .filter(|p| *p > 0)?;
    Some(Target::loopback(port))
}
