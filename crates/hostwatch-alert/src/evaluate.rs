use chrono::{DateTime, Utc};
use hostwatch_common::types::{MetricSample, Severity};
use serde::{Deserialize, Serialize};

use crate::rule::CompiledRule;

/// Signal produced by one evaluation of a rule on a host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Normal,
    Warning,
    Critical,
}

impl Status {
    pub fn severity(self) -> Option<Severity> {
        match self {
            Status::Normal => None,
            Status::Warning => Some(Severity::Warning),
            Status::Critical => Some(Severity::Critical),
        }
    }
}

impl From<Severity> for Status {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Warning => Status::Warning,
            Severity::Critical => Status::Critical,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Normal => write!(f, "normal"),
            Status::Warning => write!(f, "warning"),
            Status::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoSample,
    MissingField(String),
    MalformedValue(String),
    DivisionByZero,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NoSample => write!(f, "no sample in range"),
            SkipReason::MissingField(field) => write!(f, "field '{field}' missing from sample"),
            SkipReason::MalformedValue(field) => write!(f, "field '{field}' is not a finite number"),
            SkipReason::DivisionByZero => write!(f, "divisor is zero"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// `value` is `None` when no sample satisfied the where clause.
    Observed { status: Status, value: Option<f64> },
    Skipped(SkipReason),
}

impl Evaluation {
    pub fn status(&self) -> Option<Status> {
        match self {
            Evaluation::Observed { status, .. } => Some(*status),
            Evaluation::Skipped(_) => None,
        }
    }
}

/// Evaluates `rule` against `samples`.
///
/// Samples of other hosts or tables are ignored, so callers may pass a wider
/// batch. The critical threshold is checked before the warning one.
pub fn evaluate(rule: &CompiledRule, samples: &[MetricSample], now: DateTime<Utc>) -> Evaluation {
    let candidates: Vec<&MetricSample> = samples
        .iter()
        .filter(|s| s.host_uuid == rule.alert.host_uuid && s.kind() == rule.kind)
        .filter(|s| s.created_at <= now)
        .collect();
    if candidates.is_empty() {
        return Evaluation::Skipped(SkipReason::NoSample);
    }

    let matching = match &rule.clause {
        None => candidates,
        Some(clause) => {
            let mut matching = Vec::with_capacity(candidates.len());
            for sample in candidates {
                match clause.matches(sample) {
                    Some(true) => matching.push(sample),
                    Some(false) => {}
                    None => {
                        return Evaluation::Skipped(SkipReason::MalformedValue(
                            rule.alert.where_clause.clone().unwrap_or_default(),
                        ))
                    }
                }
            }
            if matching.is_empty() {
                return Evaluation::Observed {
                    status: Status::Normal,
                    value: None,
                };
            }
            matching
        }
    };

    let value = match rule.lookup.value(&matching, now) {
        Ok(value) => value,
        Err(reason) => return Evaluation::Skipped(reason),
    };

    let status = if rule.thresholds.crit.breached_by(value) {
        Status::Critical
    } else if rule.thresholds.warn.breached_by(value) {
        Status::Warning
    } else {
        Status::Normal
    };
    Evaluation::Observed {
        status,
        value: Some(value),
    }
}
