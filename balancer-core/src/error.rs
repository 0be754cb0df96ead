//! # Error Module
//!
//! Defines [`BalancerError`], the error type surfaced by every fallible
//! operation in this crate, and [`ErrorSink`], the single process-wide channel
//! that asynchronous errors from the listener, the proxy, and the status
//! poller are funneled into.
//!
//! The sink applies the benign-transport filter before emitting: connection
//! resets and broken pipes from clients that simply went away are logged at
//! debug level and never reach the registered observer.

use std::io;
use std::sync::RwLock;
use thiserror::Error;

/// Any error that can occur while constructing or running the balancer.
#[derive(Debug, Error)]
pub enum BalancerError {
    /// Invalid or incomplete construction configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A middleware handler rejected the request; the chain was halted and
    /// the request was not proxied.
    #[error("middleware rejected request: {0}")]
    Middleware(String),

    /// The streaming proxy failed while serving an exchange.
    #[error("proxy error - {0}")]
    Proxy(String),

    /// A status probe could not produce a usable report for a worker. The
    /// worker is marked unknown for the cycle; this is never fatal.
    #[error("status probe failed for worker {port}: {reason}")]
    StatusProbe { port: u16, reason: String },

    /// Transport-level failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl BalancerError {
    /// Whether this is one of the benign client-disconnect transport errors
    /// that the sink suppresses (connection reset, broken pipe, and their
    /// upstream spellings).
    pub fn is_benign_transport(&self) -> bool {
        if let BalancerError::Io(err) = self {
            if matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
            ) {
                return true;
            }
        }
        let message = self.to_string();
        message.contains("read ECONNRESET")
            || message.contains("socket hang up")
            || message.contains("Connection reset by peer")
            || message.contains("broken pipe")
    }
}

type ErrorHandler = dyn Fn(&BalancerError) + Send + Sync;

/// Process-wide error channel.
///
/// The host program registers at most one observer; errors emitted while no
/// observer is installed fall through to `log::error!` so nothing is lost.
#[derive(Default)]
pub struct ErrorSink {
    handler: RwLock<Option<Box<ErrorHandler>>>,
}

impl ErrorSink {
    /// Install the observer, replacing any previous one.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&BalancerError) + Send + Sync + 'static,
    {
        *self.handler.write().unwrap() = Some(Box::new(handler));
    }

    /// Route an error to the observer, applying the benign-transport filter.
    pub fn emit(&self, err: &BalancerError) {
        if err.is_benign_transport() {
            log::debug!("suppressed benign transport error: {err}");
            return;
        }
        match self.handler.read().unwrap().as_ref() {
            Some(handler) => handler(err),
            None => log::error!("{err}"),
        }
    }
}
