use crate::state::AppState;
use anyhow::Result;
use chrono::{DateTime, Utc};
use hostwatch_alert::HostPassReport;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Totals of one evaluation pass over all hosts.
#[derive(Debug, Clone, Default)]
pub struct PassSummary {
    pub hosts: usize,
    pub failed: usize,
    pub reports: Vec<HostPassReport>,
}

impl PassSummary {
    pub fn opened(&self) -> usize {
        self.reports.iter().map(|r| r.opened).sum()
    }

    pub fn severity_changed(&self) -> usize {
        self.reports.iter().map(|r| r.severity_changed).sum()
    }

    pub fn resolved(&self) -> usize {
        self.reports.iter().map(|r| r.resolved).sum()
    }
}

/// Periodically evaluates every host that has active rules. Hosts run in
/// parallel up to `max_concurrent`; the rules of one host run in order.
pub struct EvaluationScheduler {
    state: AppState,
    tick_secs: u64,
    max_concurrent: usize,
}

impl EvaluationScheduler {
    pub fn new(state: AppState) -> Self {
        let tick_secs = state.config.evaluation.interval_secs;
        let max_concurrent = state.config.evaluation.max_concurrent_hosts;
        Self {
            state,
            tick_secs,
            max_concurrent,
        }
    }

    pub async fn run(&self) {
        tracing::info!(
            tick_secs = self.tick_secs,
            max_concurrent = self.max_concurrent,
            "Evaluation scheduler started"
        );

        let mut tick = interval(Duration::from_secs(self.tick_secs));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            match self.run_pass(Utc::now()).await {
                Ok(summary) => {
                    let changes =
                        summary.opened() + summary.severity_changed() + summary.resolved();
                    if changes > 0 || summary.failed > 0 {
                        tracing::info!(
                            hosts = summary.hosts,
                            failed = summary.failed,
                            opened = summary.opened(),
                            severity_changed = summary.severity_changed(),
                            resolved = summary.resolved(),
                            "Evaluation pass finished"
                        );
                    } else {
                        tracing::debug!(hosts = summary.hosts, "Evaluation pass finished");
                    }
                }
                Err(e) => tracing::error!(error = %e, "Evaluation pass failed"),
            }
        }
    }

    /// One pass at `now`. A failing host is logged and counted; the other
    /// hosts still complete.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<PassSummary> {
        let snapshot = self.state.registry.snapshot();
        self.state.engine.refresh(&snapshot).await;

        let targeted: HashSet<String> = snapshot.active_hosts().into_iter().collect();
        if targeted.is_empty() {
            return Ok(PassSummary::default());
        }
        let hosts: Vec<_> = self
            .state
            .store
            .list_hosts()
            .await?
            .into_iter()
            .filter(|h| targeted.contains(&h.uuid))
            .collect();

        let mut summary = PassSummary {
            hosts: hosts.len(),
            ..Default::default()
        };
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut handles = Vec::with_capacity(hosts.len());

        for host in hosts {
            let permit = semaphore.clone().acquire_owned().await?;
            let snapshot = snapshot.clone();
            let engine = self.state.engine.clone();
            let samples = self.state.samples.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let result = engine.run_host(&snapshot, &host, samples.as_ref(), now).await;
                (host.uuid, result)
            });
            handles.push(handle);
        }

        for handle in handles {
            match handle.await {
                Ok((_, Ok(report))) => summary.reports.push(report),
                Ok((host_uuid, Err(e))) => {
                    tracing::error!(host_uuid = %host_uuid, error = %e, "Host evaluation failed");
                    summary.failed += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Host evaluation task panicked");
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }
}
