use chrono::Duration;
use hostwatch_common::alert::Alert;
use hostwatch_common::types::SampleKind;

use crate::clause::WhereClause;
use crate::error::ValidationError;
use crate::lookup::Lookup;
use crate::threshold::Thresholds;

/// How far back a plain field lookup looks for its latest sample.
pub const FIELD_LOOKBACK_SECS: i64 = 300;

/// An [`Alert`] whose expressions have been parsed and validated.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRule {
    pub alert: Alert,
    pub kind: SampleKind,
    pub lookup: Lookup,
    pub thresholds: Thresholds,
    pub clause: Option<WhereClause>,
}

impl CompiledRule {
    pub fn compile(alert: Alert) -> Result<Self, ValidationError> {
        let kind = SampleKind::from_table(&alert.table)
            .ok_or_else(|| ValidationError::UnknownTable(alert.table.clone()))?;
        if alert.timing < 0 {
            return Err(ValidationError::NegativeTiming(alert.timing));
        }
        let lookup = Lookup::parse(&alert.lookup, kind)?;
        let thresholds = Thresholds::parse(&alert.warn, &alert.crit, alert.direction)?;
        let clause = match alert.where_clause.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => Some(WhereClause::parse(text, kind)?),
            _ => None,
        };
        Ok(Self {
            alert,
            kind,
            lookup,
            thresholds,
            clause,
        })
    }

    pub fn id(&self) -> i64 {
        self.alert.id
    }

    pub fn timing(&self) -> Duration {
        Duration::seconds(i64::from(self.alert.timing))
    }

    /// Sample history needed to evaluate the rule once.
    pub fn lookback(&self) -> Duration {
        self.lookup
            .window()
            .unwrap_or_else(|| Duration::seconds(FIELD_LOOKBACK_SECS))
    }

    /// Registry identity: two documents with the same key describe the same
    /// rule.
    pub fn key(&self) -> RuleKey {
        RuleKey::of(&self.alert, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey {
    pub cid: uuid::Uuid,
    pub table: &'static str,
    pub lookup: String,
    pub host_uuid: String,
    pub where_clause: Option<String>,
}

impl RuleKey {
    pub fn of(alert: &Alert, kind: SampleKind) -> Self {
        Self {
            cid: alert.cid,
            table: kind.table(),
            lookup: alert.lookup.split_whitespace().collect::<Vec<_>>().join(" "),
            host_uuid: alert.host_uuid.clone(),
            where_clause: alert
                .where_clause
                .as_deref()
                .map(str::trim)
                .filter(|w| !w.is_empty())
                .map(str::to_string),
        }
    }
}
