use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hostwatch_common::alert::Alert;
use hostwatch_common::types::{Host, MetricSample, SampleKind};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::debounce::Transition;
use crate::error::{BoxError, EngineError, IncidentError};
use crate::evaluate::{evaluate, Evaluation, Status};
use crate::evaluator::Evaluator;
use crate::incident::{BreachOutcome, IncidentManager, IncidentStore};
use crate::registry::{RuleSnapshot, Scope};
use crate::rule::CompiledRule;

/// Read side of the sample store.
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Samples of `kind` for the host captured at or after `since`, oldest
    /// first.
    async fn recent_samples(
        &self,
        host_uuid: &str,
        kind: SampleKind,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, BoxError>;
}

/// Outcome of one pass over a host's rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostPassReport {
    pub host_uuid: String,
    pub evaluated: usize,
    pub skipped: usize,
    pub opened: usize,
    pub severity_changed: usize,
    pub resolved: usize,
}

/// Rule definitions the engine has seen, by id, at `revision`.
#[derive(Default)]
struct SeenRules {
    revision: u64,
    definitions: HashMap<i64, Alert>,
}

pub struct AlertEngine<S> {
    evaluator: Evaluator,
    incidents: IncidentManager<S>,
    max_lookback: Duration,
    seen: Mutex<SeenRules>,
}

impl<S: IncidentStore> AlertEngine<S> {
    pub fn new(store: S, max_lookback: Duration) -> Self {
        Self {
            evaluator: Evaluator::new(),
            incidents: IncidentManager::new(store),
            max_lookback,
            seen: Mutex::new(SeenRules::default()),
        }
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    pub fn incidents(&self) -> &IncidentManager<S> {
        &self.incidents
    }

    /// Syncs cached state with `snapshot`: debounce state and cached incidents
    /// of rules that were removed, deactivated or redefined are dropped.
    pub async fn refresh(&self, snapshot: &RuleSnapshot) {
        let stale: Vec<i64> = {
            let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
            if seen.revision == snapshot.revision() {
                return;
            }
            let stale = seen
                .definitions
                .iter()
                .filter(|(id, alert)| {
                    snapshot
                        .get(**id)
                        .map_or(true, |rule| !rule.alert.active || rule.alert != **alert)
                })
                .map(|(id, _)| *id)
                .collect();
            seen.definitions = snapshot
                .iter()
                .filter(|r| r.alert.active)
                .map(|r| (r.id(), r.alert.clone()))
                .collect();
            seen.revision = snapshot.revision();
            stale
        };

        for id in &stale {
            self.evaluator.forget_rule(*id);
            self.incidents.forget_rule(*id).await;
        }
        tracing::debug!(
            revision = snapshot.revision(),
            dropped = stale.len(),
            "Alert rule snapshot refreshed"
        );
    }

    /// Evaluates every active rule of `host` in id order. A sample or
    /// incident store failure aborts the remainder of this host's pass.
    pub async fn run_host(
        &self,
        snapshot: &RuleSnapshot,
        host: &Host,
        source: &dyn SampleSource,
        now: DateTime<Utc>,
    ) -> Result<HostPassReport, EngineError> {
        let mut report = HostPassReport {
            host_uuid: host.uuid.clone(),
            ..Default::default()
        };
        let scope = Scope::Host(host.uuid.clone());

        for rule in snapshot.active(&scope) {
            let lookback = rule.lookback().min(self.max_lookback);
            let samples = source
                .recent_samples(&host.uuid, rule.kind, now - lookback)
                .await
                .map_err(|source| EngineError::Samples {
                    host_uuid: host.uuid.clone(),
                    table: rule.kind.table(),
                    source,
                })?;

            let evaluation = evaluate(rule, &samples, now);
            let value = match &evaluation {
                Evaluation::Skipped(reason) => {
                    tracing::debug!(
                        rule_id = rule.id(),
                        host_uuid = %host.uuid,
                        reason = %reason,
                        "Alert evaluation skipped"
                    );
                    report.skipped += 1;
                    continue;
                }
                Evaluation::Observed { value, .. } => *value,
            };
            report.evaluated += 1;

            if !self.evaluator.is_tracked(rule.id(), &host.uuid) {
                let restored = self
                    .incidents
                    .open_incident(rule.id(), &host.uuid)
                    .await?
                    .map(|i| Status::from(i.severity))
                    .unwrap_or_default();
                self.evaluator.seed(rule.id(), &host.uuid, restored);
            }

            let previous = self.evaluator.state(rule.id(), &host.uuid);
            let Some(transition) = self.evaluator.observe(rule, &host.uuid, &evaluation, now)
            else {
                continue;
            };

            // The transition only counts once the incident write went
            // through; otherwise the next pass reports it again.
            if let Err(e) = self
                .apply(rule, &host.uuid, transition, value, now, &mut report)
                .await
            {
                if let Some(previous) = previous {
                    self.evaluator.restore(rule.id(), &host.uuid, previous);
                }
                return Err(e.into());
            }
        }

        Ok(report)
    }

    async fn apply(
        &self,
        rule: &CompiledRule,
        host_uuid: &str,
        transition: Transition,
        value: Option<f64>,
        now: DateTime<Utc>,
        report: &mut HostPassReport,
    ) -> Result<(), IncidentError> {
        match transition.to.severity() {
            Some(severity) => {
                let result = describe(rule, value, transition.to);
                match self
                    .incidents
                    .on_breach(&rule.alert, host_uuid, severity, result, now)
                    .await?
                {
                    BreachOutcome::Opened(_) => report.opened += 1,
                    BreachOutcome::SeverityChanged { .. } => report.severity_changed += 1,
                    BreachOutcome::Unchanged(_) => {}
                }
            }
            None => {
                if self
                    .incidents
                    .on_resolve(&rule.alert, host_uuid, now)
                    .await?
                    .is_some()
                {
                    report.resolved += 1;
                }
            }
        }
        Ok(())
    }
}

fn describe(rule: &CompiledRule, value: Option<f64>, status: Status) -> String {
    let threshold = match status {
        Status::Critical => rule.thresholds.crit,
        _ => rule.thresholds.warn,
    };
    match value {
        Some(v) => format!(
            "{}: {}.{} = {:.2} ({} {})",
            rule.alert.name, rule.alert.table, rule.alert.lookup, v, status, threshold
        ),
        None => format!("{}: {}", rule.alert.name, status),
    }
}
