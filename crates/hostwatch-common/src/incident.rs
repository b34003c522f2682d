use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alert::Alert;
use crate::types::Severity;

/// Lifecycle status of an incident, persisted as its ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Acknowledged,
    Resolved,
}

impl IncidentStatus {
    pub fn ordinal(self) -> i32 {
        match self {
            IncidentStatus::Open => 0,
            IncidentStatus::Acknowledged => 1,
            IncidentStatus::Resolved => 2,
        }
    }

    pub fn from_ordinal(value: i32) -> Option<Self> {
        match value {
            0 => Some(IncidentStatus::Open),
            1 => Some(IncidentStatus::Acknowledged),
            2 => Some(IncidentStatus::Resolved),
            _ => None,
        }
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IncidentStatus::Open => write!(f, "open"),
            IncidentStatus::Acknowledged => write!(f, "acknowledged"),
            IncidentStatus::Resolved => write!(f, "resolved"),
        }
    }
}

/// One breach episode of an alert rule on a host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: i64,
    /// Human readable summary of the last observation.
    pub result: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub host_uuid: String,
    pub hostname: String,
    pub status: IncidentStatus,
    pub severity: Severity,
    pub alerts_id: i64,
    pub cid: Uuid,
}

impl Incident {
    /// An incident is open until `resolved_at` is set, acknowledged or not.
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// Fields of an incident that does not have a row id yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewIncident {
    pub result: String,
    pub started_at: DateTime<Utc>,
    pub host_uuid: String,
    pub hostname: String,
    pub severity: Severity,
    pub alerts_id: i64,
    pub cid: Uuid,
}

/// Incident paired with the rule that raised it. `alert` is `None` once the
/// rule has been deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentsJoined {
    pub incident: Incident,
    pub alert: Option<Alert>,
}
