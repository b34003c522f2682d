use hostwatch_common::alert::MissingField;

/// Boxed error returned by the sample and incident store adapters.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A rule document that cannot be compiled into an evaluable rule.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("unknown sample table '{0}'")]
    UnknownTable(String),

    #[error("table '{table}' has no field '{field}'")]
    UnknownField { table: String, field: String },

    #[error("field '{field}' of table '{table}' is not numeric")]
    NotNumeric { table: String, field: String },

    #[error("invalid lookup '{lookup}': {reason}")]
    Lookup { lookup: String, reason: String },

    #[error("invalid {which} threshold '{expr}': {reason}")]
    Threshold {
        which: &'static str,
        expr: String,
        reason: String,
    },

    #[error("warn and crit thresholds point in opposite directions")]
    MixedDirections,

    #[error("crit threshold {crit} is less severe than warn threshold {warn}")]
    ThresholdOrder { warn: f64, crit: f64 },

    #[error("timing must be zero or positive, got {0}")]
    NegativeTiming(i32),

    #[error("invalid where clause '{clause}': {reason}")]
    WhereClause { clause: String, reason: String },

    #[error("alert rule {existing} already watches the same metric")]
    DuplicateKey { existing: i64 },
}

impl From<MissingField> for ValidationError {
    fn from(e: MissingField) -> Self {
        ValidationError::MissingField(e.0)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("alert rule {0} not found")]
    NotFound(i64),
}

#[derive(Debug, thiserror::Error)]
pub enum IncidentError {
    /// The store refused an insert because an open incident already exists
    /// for the pair.
    #[error("an open incident already exists for alert {alerts_id} on host {host_uuid}")]
    Conflict { alerts_id: i64, host_uuid: String },

    #[error("incident store error: {0}")]
    Store(#[source] BoxError),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to read {table} samples for host {host_uuid}: {source}")]
    Samples {
        host_uuid: String,
        table: &'static str,
        #[source]
        source: BoxError,
    },

    #[error(transparent)]
    Incident(#[from] IncidentError),
}
