//! # Status Poller
//!
//! Periodic worker-status collection. Each tick the poller POSTs a small JSON
//! payload to every registered worker's status endpoint in parallel, with a
//! per-probe timeout, and records each outcome: a parsed report, or the
//! **unknown** sentinel when the worker produced no usable JSON in time.
//! When every probe of a cycle has settled the quota table is rebuilt from
//! that cycle's results and published atomically.
//!
//! Cycles may overlap: a slow cycle never delays the next tick, each cycle
//! owns its own counters, and both the status map and the published table are
//! write-wins.

use crate::balance::quota;
use crate::balancer::Balancer;
use crate::config::LOOPBACK_HOST;
use crate::error::BalancerError;
use async_trait::async_trait;
use pingora::server::ShutdownWatch;
use pingora::services::background::BackgroundService;
use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// A worker's parsed status response. Fields beyond `clientCount` are
/// retained verbatim.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StatusReport {
    #[serde(rename = "clientCount")]
    pub client_count: u64,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Outcome of one probe. A worker that did not return parseable JSON within
/// the timeout is **unknown** for the cycle, which counts as infinitely busy
/// for quota purposes.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerStatus {
    Known(StatusReport),
    Unknown,
}

impl WorkerStatus {
    pub fn client_count(&self) -> Option<u64> {
        match self {
            WorkerStatus::Known(report) => Some(report.client_count),
            WorkerStatus::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, WorkerStatus::Unknown)
    }
}

/// The background poller. Runs for the lifetime of the server under smart
/// balancing; IP-hash mode never consumes its output.
#[derive(Clone)]
pub struct StatusPoller {
    balancer: Balancer,
    client: reqwest::Client,
}

impl StatusPoller {
    pub fn new(balancer: Balancer) -> Self {
        StatusPoller {
            balancer,
            client: reqwest::Client::new(),
        }
    }

    /// Probe a single worker's status endpoint.
    async fn probe(&self, port: u16) -> WorkerStatus {
        let config = self.balancer.config();
        let url = format!("http://{LOOPBACK_HOST}:{port}{}", config.status_url);
        let body = serde_json::json!({ "dataKey": config.data_key });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .timeout(config.check_status_timeout())
            .send()
            .await;

        match response {
            Ok(response) => match response.json::<StatusReport>().await {
                Ok(report) => WorkerStatus::Known(report),
                Err(err) => {
                    log::debug!("worker {port} returned an unreadable status: {err}");
                    WorkerStatus::Unknown
                }
            },
            Err(err) => {
                self.balancer.sink().emit(&BalancerError::StatusProbe {
                    port,
                    reason: err.to_string(),
                });
                WorkerStatus::Unknown
            }
        }
    }

    /// Run one full collection cycle: probe every registered worker in
    /// parallel, record every outcome, then rebuild and publish the quota
    /// table from this cycle's results.
    pub async fn run_cycle(&self) {
        let ports = self.balancer.worker_ports();
        let probes = ports.iter().map(|port| self.probe(*port));
        let outcomes = futures::future::join_all(probes).await;

        let cycle: Vec<(u16, WorkerStatus)> = ports.into_iter().zip(outcomes).collect();
        for (port, status) in &cycle {
            self.balancer.record_status(*port, status.clone());
        }

        let table = quota::rebuild(&cycle, self.balancer.config().effective_balancer_count());
        log::debug!(
            "poll cycle complete: {} workers, {} quota entries",
            cycle.len(),
            table.len()
        );
        self.balancer.publish_quota(table);
    }
}

#[async_trait]
impl BackgroundService for StatusPoller {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        let period = self.balancer.config().status_check_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    log::debug!("status poller shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    // Every cycle runs as its own task so a stalled worker
                    // never delays the next tick.
                    let poller = self.clone();
                    tokio::spawn(async move { poller.run_cycle().await });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::quota::QuotaEntry;
    use crate::config::{BalancerConfig, Worker};
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn balancer_for(ports: Vec<u16>, timeout_ms: u64) -> Balancer {
        let _ = env_logger::builder().is_test(true).try_init();
        Balancer::new(BalancerConfig {
            source_port: 0,
            workers: ports.into_iter().map(|port| Worker { port }).collect(),
            use_smart_balancing: true,
            data_key: "secret".to_string(),
            check_status_timeout_ms: timeout_ms,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn a_cycle_records_reports_and_rebuilds_quotas() {
        let busy = MockServer::start().await;
        let idle = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/~status"))
            .and(body_json(json!({ "dataKey": "secret" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "clientCount": 7 })))
            .mount(&busy)
            .await;
        Mock::given(method("POST"))
            .and(path("/~status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "clientCount": 2 })))
            .mount(&idle)
            .await;

        let busy_port = busy.address().port();
        let idle_port = idle.address().port();
        let balancer = balancer_for(vec![busy_port, idle_port], 2_000);
        StatusPoller::new(balancer.clone()).run_cycle().await;

        let statuses = balancer.worker_statuses();
        assert_eq!(statuses[&busy_port].client_count(), Some(7));
        assert_eq!(statuses[&idle_port].client_count(), Some(2));
        assert_eq!(
            balancer.quota_snapshot(),
            vec![QuotaEntry { port: idle_port, quota: 5 }]
        );
    }

    #[tokio::test]
    async fn extra_report_fields_are_retained() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/~status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "clientCount": 0,
                "build": "v2",
                "uptime": 120
            })))
            .mount(&server)
            .await;

        let port = server.address().port();
        let balancer = balancer_for(vec![port], 2_000);
        StatusPoller::new(balancer.clone()).run_cycle().await;

        let statuses = balancer.worker_statuses();
        let WorkerStatus::Known(report) = &statuses[&port] else {
            panic!("expected a known status");
        };
        assert_eq!(report.client_count, 0);
        assert_eq!(report.extra["build"], json!("v2"));
        assert_eq!(report.extra["uptime"], json!(120));
    }

    #[tokio::test]
    async fn non_json_responses_are_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/~status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let port = server.address().port();
        let balancer = balancer_for(vec![port], 2_000);
        StatusPoller::new(balancer.clone()).run_cycle().await;

        assert!(balancer.worker_statuses()[&port].is_unknown());
        assert!(balancer.quota_snapshot().is_empty());
    }

    #[tokio::test]
    async fn a_timed_out_probe_is_unknown_and_the_cycle_still_completes() {
        let slow = MockServer::start().await;
        let fast = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/~status"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "clientCount": 3 }))
                    .set_delay(std::time::Duration::from_millis(800)),
            )
            .mount(&slow)
            .await;
        Mock::given(method("POST"))
            .and(path("/~status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "clientCount": 3 })))
            .mount(&fast)
            .await;

        let slow_port = slow.address().port();
        let fast_port = fast.address().port();
        let balancer = balancer_for(vec![slow_port, fast_port], 150);
        StatusPoller::new(balancer.clone()).run_cycle().await;

        let statuses = balancer.worker_statuses();
        assert!(statuses[&slow_port].is_unknown());
        assert_eq!(statuses[&fast_port].client_count(), Some(3));
        // The only known worker is the baseline, so no quota survives and
        // selection falls through to uniform random.
        assert!(balancer.quota_snapshot().is_empty());
    }

    #[tokio::test]
    async fn an_unreachable_worker_is_unknown_and_reported() {
        // Bind-then-drop leaves a port with nothing listening on it.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let balancer = balancer_for(vec![port], 500);
        let probe_failures = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = std::sync::Arc::clone(&probe_failures);
        balancer.on_error(move |err| {
            if matches!(err, BalancerError::StatusProbe { .. }) {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        });

        StatusPoller::new(balancer.clone()).run_cycle().await;
        assert!(balancer.worker_statuses()[&port].is_unknown());
        assert_eq!(probe_failures.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
