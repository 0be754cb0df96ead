//! # Middleware Chains
//!
//! Two independent, append-only chains of handlers keyed by phase: one for
//! ordinary HTTP requests, one for WebSocket upgrade handshakes. A chain runs
//! its handlers strictly in insertion order, one at a time; the first failure
//! halts the chain and the request is not proxied. Handlers may mutate the
//! request headers on their way through.

use crate::error::BalancerError;
use async_trait::async_trait;
use pingora::http::RequestHeader;
use std::sync::{Arc, RwLock};

/// Which chain a handler belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MiddlewarePhase {
    Request,
    Upgrade,
}

/// A single chain handler.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        phase: MiddlewarePhase,
        req: &mut RequestHeader,
    ) -> Result<(), BalancerError>;
}

/// The per-balancer pair of chains.
#[derive(Default)]
pub struct MiddlewareChains {
    request: RwLock<Vec<Arc<dyn Middleware>>>,
    upgrade: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl MiddlewareChains {
    fn chain(&self, phase: MiddlewarePhase) -> &RwLock<Vec<Arc<dyn Middleware>>> {
        match phase {
            MiddlewarePhase::Request => &self.request,
            MiddlewarePhase::Upgrade => &self.upgrade,
        }
    }

    /// Append a handler to the end of a phase chain.
    pub fn append(&self, phase: MiddlewarePhase, handler: Arc<dyn Middleware>) {
        self.chain(phase).write().unwrap().push(handler);
    }

    pub fn len(&self, phase: MiddlewarePhase) -> usize {
        self.chain(phase).read().unwrap().len()
    }

    pub fn is_empty(&self, phase: MiddlewarePhase) -> bool {
        self.len(phase) == 0
    }

    /// Run the phase chain in insertion order, aborting on the first error.
    /// The lock is released before any handler runs so a handler may itself
    /// register middleware.
    pub async fn run(
        &self,
        phase: MiddlewarePhase,
        req: &mut RequestHeader,
    ) -> Result<(), BalancerError> {
        let handlers: Vec<Arc<dyn Middleware>> = self.chain(phase).read().unwrap().clone();
        for handler in handlers {
            handler.handle(phase, req).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        tag: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn handle(
            &self,
            _phase: MiddlewarePhase,
            _req: &mut RequestHeader,
        ) -> Result<(), BalancerError> {
            self.seen.lock().unwrap().push(self.tag);
            if self.fail {
                return Err(BalancerError::Middleware(format!("{} refused", self.tag)));
            }
            Ok(())
        }
    }

    struct TagHeader;

    #[async_trait]
    impl Middleware for TagHeader {
        async fn handle(
            &self,
            _phase: MiddlewarePhase,
            req: &mut RequestHeader,
        ) -> Result<(), BalancerError> {
            req.insert_header("x-chain", "passed")
                .map_err(|e| BalancerError::Middleware(e.to_string()))
        }
    }

    fn request() -> RequestHeader {
        RequestHeader::build("GET", b"/", None).unwrap()
    }

    #[tokio::test]
    async fn handlers_run_in_insertion_order() {
        let chains = MiddlewareChains::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            chains.append(
                MiddlewarePhase::Request,
                Arc::new(Recorder {
                    tag,
                    seen: Arc::clone(&seen),
                    fail: false,
                }),
            );
        }

        let mut req = request();
        chains.run(MiddlewarePhase::Request, &mut req).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn a_failing_handler_halts_the_chain() {
        let chains = MiddlewareChains::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        chains.append(
            MiddlewarePhase::Request,
            Arc::new(Recorder {
                tag: "first",
                seen: Arc::clone(&seen),
                fail: false,
            }),
        );
        chains.append(
            MiddlewarePhase::Request,
            Arc::new(Recorder {
                tag: "second",
                seen: Arc::clone(&seen),
                fail: true,
            }),
        );
        chains.append(
            MiddlewarePhase::Request,
            Arc::new(Recorder {
                tag: "third",
                seen: Arc::clone(&seen),
                fail: false,
            }),
        );

        let mut req = request();
        let err = chains
            .run(MiddlewarePhase::Request, &mut req)
            .await
            .unwrap_err();
        assert!(matches!(err, BalancerError::Middleware(_)));
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn phases_are_independent() {
        let chains = MiddlewareChains::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        chains.append(
            MiddlewarePhase::Upgrade,
            Arc::new(Recorder {
                tag: "upgrade-only",
                seen: Arc::clone(&seen),
                fail: false,
            }),
        );

        let mut req = request();
        chains.run(MiddlewarePhase::Request, &mut req).await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(chains.len(MiddlewarePhase::Upgrade), 1);
        assert!(chains.is_empty(MiddlewarePhase::Request));
    }

    #[tokio::test]
    async fn handlers_may_mutate_request_headers() {
        let chains = MiddlewareChains::default();
        chains.append(MiddlewarePhase::Request, Arc::new(TagHeader));

        let mut req = request();
        chains.run(MiddlewarePhase::Request, &mut req).await.unwrap();
        assert_eq!(req.headers.get("x-chain").unwrap(), "passed");
    }
}
