//! # Dispatch Application
//!
//! The per-exchange orchestrator, implemented as a Pingora `ProxyHttp`
//! application. One listening service serves both ordinary HTTP exchanges and
//! WebSocket upgrade handshakes; the proxy engine tunnels upgraded
//! connections transparently, so this application only decides *where* each
//! exchange goes.
//!
//! ## Processing Steps
//!
//! 1. Classify the exchange (request vs upgrade) and run the matching
//!    middleware chain; a failing handler aborts the exchange without a
//!    generated response.
//! 2. Resolve the target worker:
//!    - smart balancing: the session-embedded route wins whenever it names a
//!      registered worker; a stale route falls back to the quota selector for
//!      HTTP but to a uniform random member for upgrades; a missing route
//!      always asks the quota selector
//!    - otherwise: deterministic client-IP hashing
//! 3. Hand the exchange to the streaming proxy, stamping the standard
//!    forwarded headers on the HTTP path.
//!
//! A proxy failure before any response bytes were written is answered with a
//! 500 `text/html` diagnostic page; after that, the connection just closes.

use crate::balance::{ip_hash, session};
use crate::balancer::Balancer;
use crate::config::{Protocol, Target};
use crate::error::BalancerError;
use crate::middleware::MiddlewarePhase;
use async_trait::async_trait;
use bytes::Bytes;
use http::header;
use pingora::http::{RequestHeader, ResponseHeader};
use pingora::prelude::HttpPeer;
use pingora::proxy::{FailToProxy, ProxyHttp, Session};
use pingora::{Error, ErrorType};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

// Tag for chain failures so the proxy-error page is not generated for them.
const MIDDLEWARE_REJECTED_TAG: &str = "middleware rejected";

fn is_middleware_rejection(e: &Error) -> bool {
    matches!(e.etype(), ErrorType::Custom(tag) if *tag == MIDDLEWARE_REJECTED_TAG)
}

/// Whether this request is an upgrade handshake (`Connection: upgrade` plus
/// an `Upgrade` header).
pub fn is_upgrade_request(req: &RequestHeader) -> bool {
    if req.headers.get(header::UPGRADE).is_none() {
        return false;
    }
    req.headers.get_all(header::CONNECTION).iter().any(|value| {
        value
            .to_str()
            .map(|tokens| {
                tokens
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
            })
            .unwrap_or(false)
    })
}

/// Per-exchange state threaded through the proxy callbacks.
pub struct ExchangeCtx {
    upgrade: bool,
    remote_addr: Option<String>,
    target: Option<Target>,
}

/// The balancing dispatcher.
pub struct BalancerApp {
    balancer: Balancer,
}

impl BalancerApp {
    pub fn new(balancer: Balancer) -> Self {
        BalancerApp { balancer }
    }

    /// Resolve the destination worker for one exchange, or `None` when no
    /// worker can serve it (the exchange is then aborted).
    pub fn resolve_target(
        &self,
        req: &RequestHeader,
        upgrade: bool,
        remote_addr: Option<String>,
    ) -> Option<Target> {
        let registry = self.balancer.registry();
        if !self.balancer.config().use_smart_balancing {
            let ip = ip_hash::client_ip(req, remote_addr);
            return ip_hash::pick_worker(&ip, &registry);
        }

        let quota = self.balancer.quota();
        match session::route_from_request(req) {
            Some(route) if registry.contains(route.port) => Some(route),
            Some(_) => {
                // Session names a worker we do not know. HTTP traffic drains
                // the quota table; upgrades take a uniform random member.
                let port = if upgrade {
                    quota.random_port(&registry)?
                } else {
                    quota.choose_target_port(&registry)?
                };
                Some(Target::loopback(port))
            }
            None => quota
                .choose_target_port(&registry)
                .map(Target::loopback),
        }
    }
}

#[async_trait]
impl ProxyHttp for BalancerApp {
    type CTX = ExchangeCtx;

    fn new_ctx(&self) -> Self::CTX {
        ExchangeCtx {
            upgrade: false,
            remote_addr: None,
            target: None,
        }
    }

    /// Classify the exchange and run the matching middleware chain before any
    /// routing decision is made.
    async fn request_filter(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<bool>
    where
        Self::CTX: Send + Sync,
    {
        ctx.upgrade = is_upgrade_request(session.req_header());
        ctx.remote_addr = session
            .client_addr()
            .and_then(|addr| addr.as_inet())
            .map(|inet| inet.ip().to_string());

        let phase = if ctx.upgrade {
            MiddlewarePhase::Upgrade
        } else {
            MiddlewarePhase::Request
        };
        if let Err(err) = self
            .balancer
            .middleware()
            .run(phase, session.req_header_mut())
            .await
        {
            self.balancer.sink().emit(&err);
            return Err(Error::explain(
                ErrorType::Custom(MIDDLEWARE_REJECTED_TAG),
                err.to_string(),
            ));
        }
        Ok(false)
    }

    /// The routing core: pick the worker this exchange streams to.
    async fn upstream_peer(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<Box<HttpPeer>> {
        let target = self
            .resolve_target(session.req_header(), ctx.upgrade, ctx.remote_addr.clone())
            .ok_or_else(|| Error::new(ErrorType::ConnectNoRoute))?;

        log::debug!(
            "dispatching {} {} to {}:{}",
            session.req_header().method,
            session.req_header().uri.path(),
            target.host,
            target.port
        );
        let peer = HttpPeer::new((target.host.as_str(), target.port), false, String::new());
        ctx.target = Some(target);
        Ok(Box::new(peer))
    }

    /// Stamp the standard forwarded headers on proxied HTTP requests. The
    /// upgrade path is passed through untouched so WebSocket semantics are
    /// preserved end to end.
    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<()> {
        if ctx.upgrade {
            return Ok(());
        }

        if let Some(remote) = ctx.remote_addr.as_deref() {
            let forwarded = match upstream_request
                .headers
                .get(X_FORWARDED_FOR)
                .and_then(|value| value.to_str().ok())
            {
                Some(existing) => format!("{existing}, {remote}"),
                None => remote.to_string(),
            };
            upstream_request.insert_header(X_FORWARDED_FOR, forwarded)?;
        }
        let proto = match self.balancer.config().protocol {
            Protocol::Https => "https",
            Protocol::Http => "http",
        };
        upstream_request.insert_header(X_FORWARDED_PROTO, proto)?;
        Ok(())
    }

    /// Route the failure to the error sink, then answer with the diagnostic
    /// page when the client has not seen any bytes yet. Middleware rejections
    /// and already-started responses close without a generated response.
    async fn fail_to_proxy(
        &self,
        session: &mut Session,
        e: &Error,
        _ctx: &mut Self::CTX,
    ) -> FailToProxy
    where
        Self::CTX: Send + Sync,
    {
        let middleware_rejected = is_middleware_rejection(e);
        if !middleware_rejected {
            // Chain failures were already emitted when the chain halted.
            self.balancer
                .sink()
                .emit(&BalancerError::Proxy(e.to_string()));
        }

        if middleware_rejected || session.response_written().is_some() {
            return FailToProxy {
                error_code: 0,
                can_reuse_downstream: false,
            };
        }

        let body = Bytes::from(format!("Proxy error - {e}"));
        let header = proxy_error_header(body.len());
        let written: pingora::Result<()> = async {
            session.write_response_header(Box::new(header), false).await?;
            session.write_response_body(Some(body), true).await
        }
        .await;
        if let Err(write_err) = written {
            log::debug!("failed to write proxy error response: {write_err}");
        }

        FailToProxy {
            error_code: 500,
            can_reuse_downstream: false,
        }
    }

    /// Record the completed exchange.
    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        let response_code = session
            .response_written()
            .map_or(0, |resp| resp.status.as_u16());
        let target = ctx
            .target
            .as_ref()
            .map(|t| t.port.to_string())
            .unwrap_or_else(|| "-".to_string());
        match e {
            Some(err) => log::info!(
                "{} {} -> worker {target}, response code: {response_code}, error: {err}",
                session.req_header().method,
                session.req_header().uri.path(),
            ),
            None => log::info!(
                "{} {} -> worker {target}, response code: {response_code}",
                session.req_header().method,
                session.req_header().uri.path(),
            ),
        }
    }
}

fn proxy_error_header(body_len: usize) -> ResponseHeader {
    // Two headers, built from constants; construction cannot fail.
    let mut header = ResponseHeader::build(500, Some(2)).expect("valid status");
    header
        .insert_header(header::CONTENT_TYPE, "text/html")
        .expect("valid header");
    header
        .insert_header(header::CONTENT_LENGTH, body_len.to_string())
        .expect("valid header");
    header
}
