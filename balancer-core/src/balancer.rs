//! # Balancer Handle
//!
//! [`Balancer`] is the public entry point: it owns all shared state (the
//! worker registry, the quota table, the collected worker statuses, the
//! middleware chains, and the error sink) behind an `Arc`, so clones of the
//! handle are cheap and every component sees the same state.
//!
//! [`Balancer::start`] performs the full wiring: it invokes the registered
//! controller once, builds the listening service for the configured
//! transport, attaches the status poller under smart balancing, and runs the
//! server until shutdown.

use crate::app::dispatch::BalancerApp;
use crate::balance::quota::{QuotaEntry, QuotaSelector};
use crate::config::{BalancerConfig, Protocol, TlsOptions, Worker};
use crate::error::{BalancerError, ErrorSink};
use crate::middleware::{Middleware, MiddlewareChains, MiddlewarePhase};
use crate::registry::WorkerRegistry;
use crate::service;
use crate::status::{StatusPoller, WorkerStatus};
use pingora::prelude::Opt;
use pingora::server::{RunArgs, Server};
use pingora::services::background::background_service;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Startup hook supplied by the host program. Invoked exactly once, before
/// the listener starts, with a handle to the balancer's public operations
/// (typically to register middleware).
pub trait BalancerController: Send + Sync {
    fn configure(&self, balancer: &Balancer) -> Result<(), BalancerError>;
}

struct Shared {
    config: BalancerConfig,
    registry: RwLock<WorkerRegistry>,
    quota: QuotaSelector,
    statuses: RwLock<HashMap<u16, WorkerStatus>>,
    chains: MiddlewareChains,
    sink: ErrorSink,
    controller: Mutex<Option<Box<dyn BalancerController>>>,
}

/// The session-aware balancer. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Balancer {
    shared: Arc<Shared>,
}

impl Balancer {
    pub fn new(config: BalancerConfig) -> Self {
        let registry = WorkerRegistry::new(config.workers.clone());
        Balancer {
            shared: Arc::new(Shared {
                config,
                registry: RwLock::new(registry),
                quota: QuotaSelector::default(),
                statuses: RwLock::new(HashMap::new()),
                chains: MiddlewareChains::default(),
                sink: ErrorSink::default(),
                controller: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.shared.config
    }

    /// Append a handler to the `request` or `upgrade` chain.
    pub fn add_middleware(&self, phase: MiddlewarePhase, handler: Arc<dyn Middleware>) {
        self.shared.chains.append(phase, handler);
    }

    /// Replace the worker pool and its known-port set atomically. In-flight
    /// dispatches finish against the registry they already resolved.
    pub fn set_workers(&self, workers: Vec<Worker>) {
        *self.shared.registry.write().unwrap() = WorkerRegistry::new(workers);
    }

    /// Register the startup hook. Replaces any previously registered one.
    pub fn set_controller(&self, controller: Box<dyn BalancerController>) {
        *self.shared.controller.lock().unwrap() = Some(controller);
    }

    /// Register the error observer forming the single error channel. Benign
    /// client-disconnect transport errors never reach it.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&BalancerError) + Send + Sync + 'static,
    {
        self.shared.sink.set_handler(handler);
    }

    /// Snapshot of the most recently collected worker statuses. Workers that
    /// failed their last probe are present with [`WorkerStatus::Unknown`].
    pub fn worker_statuses(&self) -> HashMap<u16, WorkerStatus> {
        self.shared.statuses.read().unwrap().clone()
    }

    /// Snapshot of the current quota table, ascending by quota.
    pub fn quota_snapshot(&self) -> Vec<QuotaEntry> {
        self.shared.quota.snapshot()
    }

    /// Ports of the current registry, in construction order.
    pub fn worker_ports(&self) -> Vec<u16> {
        self.shared.registry.read().unwrap().ports()
    }

    /// Per-request snapshot of the registry.
    pub(crate) fn registry(&self) -> WorkerRegistry {
        self.shared.registry.read().unwrap().clone()
    }

    pub(crate) fn quota(&self) -> &QuotaSelector {
        &self.shared.quota
    }

    pub(crate) fn middleware(&self) -> &MiddlewareChains {
        &self.shared.chains
    }

    pub(crate) fn sink(&self) -> &ErrorSink {
        &self.shared.sink
    }

    pub(crate) fn record_status(&self, port: u16, status: WorkerStatus) {
        self.shared.statuses.write().unwrap().insert(port, status);
    }

    pub(crate) fn publish_quota(&self, entries: Vec<QuotaEntry>) {
        self.shared.quota.publish(entries);
    }

    /// The TLS material required by the `https` transport.
    fn tls_material(&self) -> Result<&TlsOptions, BalancerError> {
        self.config().protocol_options.as_ref().ok_or_else(|| {
            BalancerError::Config(
                "https requires protocol_options with certificate and key paths".to_string(),
            )
        })
    }

    /// Run the controller hook, bind the listener, and serve until shutdown.
    ///
    /// Controller failures are routed to the error sink and do not prevent
    /// startup; configuration failures (missing TLS material, unbindable
    /// socket) are returned.
    pub fn start(&self) -> Result<(), BalancerError> {
        if let Some(controller) = self.shared.controller.lock().unwrap().take() {
            if let Err(err) = controller.configure(self) {
                self.shared.sink.emit(&err);
            }
        }

        let config = self.config();
        let mut server = Server::new(Some(Opt::default()))
            .map_err(|e| BalancerError::Config(format!("failed to create server: {e}")))?;
        server.bootstrap();

        let app = BalancerApp::new(self.clone());
        let addr = format!("0.0.0.0:{}", config.source_port);
        let proxy = match config.protocol {
            Protocol::Http => service::dispatch::balancer_service(&server.configuration, app, &addr),
            Protocol::Https => {
                let tls = self.tls_material()?;
                service::dispatch::balancer_service_tls(
                    &server.configuration,
                    app,
                    &addr,
                    &tls.cert_path,
                    &tls.key_path,
                )?
            }
        };
        server.add_service(proxy);

        if config.use_smart_balancing {
            let poller = background_service("worker status poller", StatusPoller::new(self.clone()));
            server.add_service(poller);
        }

        log::info!(
            "balancer listening on {addr} ({} workers, {})",
            self.shared.registry.read().unwrap().len(),
            if config.use_smart_balancing {
                "smart balancing"
            } else {
                "ip hashing"
            }
        );
        server.run(RunArgs::default());
        Ok(())
    }
}
