//! Health monitor: heartbeats every running endpoint in the discovery store
//! and marks the ones that stop answering as `stopped`.
//!
//! The monitor never restarts anything. Its only effect is on directory state,
//! which keeps dead endpoints out of discovery results.

use aip_types::agent::AgentId;
use aip_types::config::HealthConfig;
use aip_types::discovery::{DiscoveryStore, RecordFilter, ServerState};
use aip_types::error::AipResult;
use aip_types::message::Interaction;
use aip_wire::WorkerRuntime;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Something that can ask an endpoint whether it is alive.
#[async_trait]
pub trait HeartbeatProbe: Send + Sync {
    /// Fails with a timeout error if `target` has not answered within `timeout`.
    async fn probe(&self, sender: &AgentId, target: &AgentId, timeout: Duration) -> AipResult<()>;
}

#[async_trait]
impl HeartbeatProbe for WorkerRuntime {
    async fn probe(&self, sender: &AgentId, target: &AgentId, timeout: Duration) -> AipResult<()> {
        self.send_message(
            &Interaction::heartbeat(sender.kind.clone()),
            target.clone(),
            sender.clone(),
            Some(timeout),
        )
        .await
        .map(|_| ())
    }
}

/// What one pass over the store did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: usize,
    pub healthy: usize,
    pub failed: usize,
    /// Records flipped to `stopped` this cycle.
    pub stopped: Vec<String>,
    /// Records deleted because they had been stopped too long.
    pub purged: Vec<String>,
}

/// Periodic liveness checker.
///
/// The consecutive-failure counters live here and are only touched by the
/// task driving the monitor.
pub struct HealthMonitor {
    store: Arc<dyn DiscoveryStore>,
    probe: Arc<dyn HeartbeatProbe>,
    identity: AgentId,
    config: HealthConfig,
    failures: HashMap<String, u32>,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn DiscoveryStore>,
        probe: Arc<dyn HeartbeatProbe>,
        identity: AgentId,
        config: HealthConfig,
    ) -> Self {
        Self {
            store,
            probe,
            identity,
            config,
            failures: HashMap::new(),
        }
    }

    /// Consecutive failures currently counted for `name`.
    pub fn failure_count(&self, name: &str) -> u32 {
        self.failures.get(name).copied().unwrap_or(0)
    }

    /// Probe every running record once.
    pub async fn run_cycle(&mut self) -> AipResult<CycleReport> {
        let running = self
            .store
            .query(&RecordFilter::with_state(ServerState::Running))
            .await?;
        let timeout = Duration::from_secs(self.config.heartbeat_timeout_secs);

        // Probes run concurrently so one dead endpoint can't delay the rest.
        let probes = running.iter().map(|record| {
            let target = AgentId::singleton(record.name.clone());
            let probe = Arc::clone(&self.probe);
            let sender = self.identity.clone();
            async move {
                let outcome = probe.probe(&sender, &target, timeout).await;
                (target.kind, outcome)
            }
        });
        let outcomes = futures::future::join_all(probes).await;

        // Counters for records that are no longer running are dropped.
        let live: std::collections::HashSet<&str> =
            running.iter().map(|r| r.name.as_str()).collect();
        self.failures.retain(|name, _| live.contains(name.as_str()));

        let mut report = CycleReport {
            checked: outcomes.len(),
            ..Default::default()
        };
        for (name, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    debug!(server = %name, "Heartbeat OK");
                    self.failures.remove(&name);
                    report.healthy += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    let count = self.failures.entry(name.clone()).or_insert(0);
                    *count += 1;
                    warn!(
                        server = %name,
                        failures = *count,
                        threshold = self.config.failure_threshold,
                        error = %e,
                        "Heartbeat failed"
                    );
                    if *count >= self.config.failure_threshold {
                        self.failures.remove(&name);
                        match self.store.set_state(&name, ServerState::Stopped).await {
                            Ok(()) => {
                                warn!(server = %name, "Marked server as stopped");
                                report.stopped.push(name);
                            }
                            Err(e) => warn!(server = %name, error = %e, "Failed to mark server stopped"),
                        }
                    }
                }
            }
        }

        if let Some(after) = self.config.purge_stopped_after_secs {
            report.purged = self.purge_stopped(after).await?;
        }
        Ok(report)
    }

    async fn purge_stopped(&self, after_secs: u64) -> AipResult<Vec<String>> {
        let now = Utc::now();
        let max_age = chrono::Duration::seconds(after_secs.min(i64::MAX as u64) as i64);
        let stopped = self
            .store
            .query(&RecordFilter::with_state(ServerState::Stopped))
            .await?;
        let mut purged = Vec::new();
        for record in stopped {
            let Some(stopped_at) = record.config.stopped_at else {
                continue;
            };
            if now - stopped_at >= max_age && self.store.remove(&record.name).await? {
                info!(server = %record.name, %stopped_at, "Purged stale server record");
                purged.push(record.name);
            }
        }
        Ok(purged)
    }

    /// Run cycles every `check_interval_secs` until `shutdown` turns true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Health monitor disabled");
            return;
        }
        let period = Duration::from_secs(self.config.check_interval_secs.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_secs = period.as_secs(),
            threshold = self.config.failure_threshold,
            "Health monitor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(report) => debug!(
                            checked = report.checked,
                            failed = report.failed,
                            stopped = report.stopped.len(),
                            "Health check cycle complete"
                        ),
                        Err(e) => warn!(error = %e, "Health check cycle failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Health monitor stopped");
    }
}
