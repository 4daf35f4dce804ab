//! Scheduler module for running probes and aggregating data.
//!
//! Every active endpoint gets its own probe loop driven by its own timer.
//! Probes run as detached tasks bounded by a global worker pool, and a
//! per-endpoint recorder persists their results strictly in dispatch order
//! before handing them to the outage detector.

mod backoff;
mod retention;
mod rollup;

pub use backoff::*;
pub use retention::*;
pub use rollup::*;

use crate::config::ServerConfig;
use crate::db::{DbError, Endpoint, HealthCheckResult, Store};
use crate::outage::OutageDetector;
use crate::probe::{run_probe, ProbeConfig, ProbeMethod};

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock, Semaphore};
use tokio::task::JoinHandle;

/// Probes of one endpoint allowed in flight at once. A stuck probe can
/// cost at most one missed cycle.
const MAX_IN_FLIGHT_PER_ENDPOINT: usize = 2;

const PERSIST_BACKOFF_BASE_MS: u64 = 100;
const PERSIST_BACKOFF_MAX_MS: u64 = 5_000;

/// Shared state every probe loop needs.
#[derive(Clone)]
struct ProbeContext {
    store: Arc<Store>,
    detector: Arc<OutageDetector>,
    client: reqwest::Client,
    workers: Arc<Semaphore>,
    method: ProbeMethod,
    soft_latency_ms: u64,
    persist_retries: u32,
}

/// A running probe loop and the recorder draining its results.
struct ProbeHandle {
    stop_tx: broadcast::Sender<()>,
    recorder: JoinHandle<()>,
}

/// The main scheduler that orchestrates probe execution.
pub struct Scheduler {
    ctx: ProbeContext,
    running: Arc<RwLock<HashMap<i64, ProbeHandle>>>,
    aggregator: Arc<UptimeAggregator>,
    retention_manager: Arc<RetentionManager>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        detector: Arc<OutageDetector>,
        client: reqwest::Client,
        config: &ServerConfig,
    ) -> Self {
        let persist_retries = config.persist_retries.max(1);
        let aggregator = Arc::new(
            UptimeAggregator::new(store.clone(), Duration::from_secs(config.aggregation_interval_secs.max(1)))
                .with_persist_budget(retry_budget(persist_retries, PERSIST_BACKOFF_BASE_MS, PERSIST_BACKOFF_MAX_MS)),
        );
        let retention_manager = Arc::new(RetentionManager::new(store.clone(), config.raw_retention_days));

        Self {
            ctx: ProbeContext {
                store,
                detector,
                client,
                workers: Arc::new(Semaphore::new(config.worker_pool_size.max(1))),
                method: config.probe_method,
                soft_latency_ms: config.soft_latency_ms,
                persist_retries,
            },
            running: Arc::new(RwLock::new(HashMap::new())),
            aggregator,
            retention_manager,
        }
    }

    /// Rebuild the probe registry from persisted active endpoints and start
    /// the background aggregation and retention loops.
    pub async fn start(&self) -> Result<usize, DbError> {
        let endpoints = self.ctx.store.all_endpoints(true)?;
        let count = endpoints.len();

        tracing::info!("Starting scheduler with {} endpoints", count);

        for endpoint in endpoints {
            self.add_endpoint(endpoint).await;
        }

        self.aggregator.start();
        self.retention_manager.start();

        Ok(count)
    }

    pub fn aggregator(&self) -> Arc<UptimeAggregator> {
        self.aggregator.clone()
    }

    /// Start probing an endpoint. No-op if inactive or already running.
    pub async fn add_endpoint(&self, endpoint: Endpoint) {
        if !endpoint.is_active {
            return;
        }

        let mut running = self.running.write().await;
        if running.contains_key(&endpoint.id) {
            return;
        }

        tracing::info!(
            tenant = %endpoint.tenant_id,
            endpoint_id = endpoint.id,
            "Scheduler: Adding endpoint {} every {}s",
            endpoint.name,
            endpoint.interval_secs
        );

        let id = endpoint.id;
        let (stop_tx, _) = broadcast::channel(1);
        let (order_tx, order_rx) = mpsc::unbounded_channel();
        let recorder = tokio::spawn(run_recorder(order_rx, stop_tx.subscribe(), self.ctx.clone()));
        tokio::spawn(run_probe_loop(endpoint, self.ctx.clone(), order_tx, stop_tx.subscribe()));
        running.insert(id, ProbeHandle { stop_tx, recorder });
    }

    /// Stop probing an endpoint. In-flight probes finish; their results are discarded.
    ///
    /// Returns once the recorder has exited, so no result of this endpoint
    /// is written afterwards.
    pub async fn remove_endpoint(&self, id: i64) {
        let handle = self.running.write().await.remove(&id);

        if let Some(handle) = handle {
            let _ = handle.stop_tx.send(());
            if let Err(e) = handle.recorder.await {
                tracing::warn!("Scheduler: recorder for endpoint {} ended abnormally: {}", id, e);
            }
            self.ctx.detector.forget(id);
            tracing::info!("Scheduler: Removed endpoint {}", id);
        }
    }

    /// Apply a changed configuration: restart the loop, or stop it when inactive.
    pub async fn reschedule(&self, endpoint: Endpoint) {
        self.remove_endpoint(endpoint.id).await;
        self.add_endpoint(endpoint).await;
    }

    pub async fn is_scheduled(&self, id: i64) -> bool {
        self.running.read().await.contains_key(&id)
    }

    pub async fn scheduled_count(&self) -> usize {
        self.running.read().await.len()
    }
}

/// Run the probe loop for a single endpoint.
async fn run_probe_loop(
    endpoint: Endpoint,
    ctx: ProbeContext,
    order_tx: mpsc::UnboundedSender<oneshot::Receiver<HealthCheckResult>>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let config = ProbeConfig::for_endpoint(&endpoint, ctx.method, ctx.soft_latency_ms);
    let in_flight = Arc::new(Semaphore::new(MAX_IN_FLIGHT_PER_ENDPOINT));

    let mut interval = tokio::time::interval(Duration::from_secs(u64::from(endpoint.interval_secs.max(1))));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                break;
            }
            _ = interval.tick() => {
                let permit = match in_flight.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        tracing::warn!("Skipping probe for {} due to overlap limit", endpoint.name);
                        continue;
                    }
                };

                // Queue the result slot now so the recorder sees dispatch order.
                let (result_tx, result_rx) = oneshot::channel();
                if order_tx.send(result_rx).is_err() {
                    break;
                }

                let ctx = ctx.clone();
                let config = config.clone();
                let endpoint_id = endpoint.id;
                let tenant_id = endpoint.tenant_id.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    let _worker = match ctx.workers.acquire_owned().await {
                        Ok(w) => w,
                        Err(_) => return,
                    };

                    let checked_at = Utc::now();
                    let outcome = run_probe(&ctx.client, &config).await;
                    tracing::debug!(
                        endpoint_id,
                        status = %outcome.status,
                        latency_ms = ?outcome.latency_ms,
                        "Probe finished"
                    );

                    let _ = result_tx.send(HealthCheckResult {
                        id: 0,
                        endpoint_id,
                        tenant_id,
                        status: outcome.status,
                        latency_ms: outcome.latency_ms,
                        status_code: outcome.status_code,
                        error_message: outcome.error_message,
                        checked_at,
                    });
                });
            }
        }
    }
}

/// Persist and observe results for one endpoint in dispatch order.
async fn run_recorder(
    mut order_rx: mpsc::UnboundedReceiver<oneshot::Receiver<HealthCheckResult>>,
    mut stop_rx: broadcast::Receiver<()>,
    ctx: ProbeContext,
) {
    loop {
        let pending = tokio::select! {
            biased;
            _ = stop_rx.recv() => break,
            next = order_rx.recv() => match next {
                Some(p) => p,
                None => break,
            },
        };

        let check = tokio::select! {
            biased;
            _ = stop_rx.recv() => break,
            result = pending => match result {
                Ok(c) => c,
                // Probe task vanished without a result.
                Err(_) => continue,
            },
        };

        record(&ctx, check).await;
    }
}

async fn record(ctx: &ProbeContext, mut check: HealthCheckResult) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match ctx.store.add_health_check(&mut check) {
            Ok(_) => break,
            Err(DbError::NotFound) => {
                tracing::debug!(endpoint_id = check.endpoint_id, "Endpoint deleted, discarding health check");
                return;
            }
            Err(e) if attempt < ctx.persist_retries => {
                let delay = calculate_backoff(attempt, PERSIST_BACKOFF_BASE_MS, PERSIST_BACKOFF_MAX_MS);
                tracing::warn!(
                    endpoint_id = check.endpoint_id,
                    "Failed to persist health check (attempt {}), retrying in {:?}: {}",
                    attempt,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                tracing::error!(
                    endpoint_id = check.endpoint_id,
                    checked_at = %check.checked_at,
                    status = %check.status,
                    "Dropping health check after {} attempts: {}",
                    attempt,
                    e
                );
                break;
            }
        }
    }

    if let Err(e) = ctx.detector.observe(&check) {
        tracing::error!(endpoint_id = check.endpoint_id, "Outage detection failed: {}", e);
    }
}
