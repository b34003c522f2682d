use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Which way a metric gets worse.
///
/// `Above` suits usage figures (load, used memory), `Below` suits headroom
/// figures (idle CPU, free disk space).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Above,
    Below,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Above => write!(f, "above"),
            Direction::Below => write!(f, "below"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "above" | "higher" | "gt" => Ok(Direction::Above),
            "below" | "lower" | "lt" => Ok(Direction::Below),
            _ => Err(format!("unknown direction: {s}")),
        }
    }
}

/// A threshold alert rule, bound to one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub active: bool,
    pub name: String,
    /// Sample table the rule watches (e.g. `cputimes`, `disks`).
    pub table: String,
    /// Field name (`idle`) or aggregation query
    /// (`avg pct 10m of avail_space over total_space`).
    pub lookup: String,
    /// Seconds a status change must persist before it is reported.
    pub timing: i32,
    /// Warning threshold: a bare number (`20`) or an expression (`$this < 20`).
    pub warn: String,
    /// Critical threshold, same grammar as `warn`.
    pub crit: String,
    pub info: Option<String>,
    pub host_uuid: String,
    pub hostname: String,
    pub cid: Uuid,
    /// Row filter such as `mount_point = '/'`.
    pub where_clause: Option<String>,
    #[serde(default)]
    pub direction: Direction,
}

/// One explicitly set field of a partial alert document.
///
/// For the nullable columns, `Info(None)` and `WhereClause(None)` mean
/// "clear the value"; leaving the field out of [`AlertChanges`] means
/// "keep the current value".
#[derive(Debug, Clone, PartialEq)]
pub enum AlertField {
    Active(bool),
    Name(String),
    Table(String),
    Lookup(String),
    Timing(i32),
    Warn(String),
    Crit(String),
    Info(Option<String>),
    HostUuid(String),
    Hostname(String),
    Cid(Uuid),
    WhereClause(Option<String>),
    Direction(Direction),
}

impl AlertField {
    pub fn name(&self) -> &'static str {
        match self {
            AlertField::Active(_) => "active",
            AlertField::Name(_) => "name",
            AlertField::Table(_) => "table",
            AlertField::Lookup(_) => "lookup",
            AlertField::Timing(_) => "timing",
            AlertField::Warn(_) => "warn",
            AlertField::Crit(_) => "crit",
            AlertField::Info(_) => "info",
            AlertField::HostUuid(_) => "host_uuid",
            AlertField::Hostname(_) => "hostname",
            AlertField::Cid(_) => "cid",
            AlertField::WhereClause(_) => "where_clause",
            AlertField::Direction(_) => "direction",
        }
    }

    fn apply(&self, alert: &mut Alert) {
        match self {
            AlertField::Active(v) => alert.active = *v,
            AlertField::Name(v) => alert.name = v.clone(),
            AlertField::Table(v) => alert.table = v.clone(),
            AlertField::Lookup(v) => alert.lookup = v.clone(),
            AlertField::Timing(v) => alert.timing = *v,
            AlertField::Warn(v) => alert.warn = v.clone(),
            AlertField::Crit(v) => alert.crit = v.clone(),
            AlertField::Info(v) => alert.info = v.clone(),
            AlertField::HostUuid(v) => alert.host_uuid = v.clone(),
            AlertField::Hostname(v) => alert.hostname = v.clone(),
            AlertField::Cid(v) => alert.cid = *v,
            AlertField::WhereClause(v) => alert.where_clause = v.clone(),
            AlertField::Direction(v) => alert.direction = *v,
        }
    }
}

/// A required field was absent from a creation document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("missing required field '{0}'")]
pub struct MissingField(pub &'static str);

/// Malformed JSON partial-update document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChangesError {
    #[error("unknown alert field '{0}'")]
    UnknownField(String),
    #[error("invalid value for alert field '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Fields a creation document must carry.
pub const REQUIRED_FIELDS: [&str; 8] = [
    "name",
    "table",
    "lookup",
    "timing",
    "warn",
    "crit",
    "host_uuid",
    "cid",
];

/// Tagged field set describing a create or partial-update of an [`Alert`].
///
/// Deserializes from the JSON `AlertsDTOUpdate` shape: an absent key leaves the
/// field unchanged, `null` clears `info`/`where_clause` and is ignored for the
/// non-nullable fields.
///
/// # Examples
///
/// ```
/// use hostwatch_common::alert::{AlertChanges, AlertField};
///
/// let changes: AlertChanges =
///     serde_json::from_str(r#"{"warn": "75", "info": null, "name": null}"#).unwrap();
/// assert_eq!(changes.len(), 2);
/// assert_eq!(changes.get("warn"), Some(&AlertField::Warn("75".into())));
/// assert_eq!(changes.get("info"), Some(&AlertField::Info(None)));
/// assert!(changes.get("name").is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertChanges {
    fields: Vec<AlertField>,
}

impl AlertChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field, replacing an earlier value for the same field.
    pub fn set(&mut self, field: AlertField) -> &mut Self {
        let name = field.name();
        match self.fields.iter_mut().find(|f| f.name() == name) {
            Some(slot) => *slot = field,
            None => self.fields.push(field),
        }
        self
    }

    /// Builder-style variant of [`AlertChanges::set`].
    pub fn with(mut self, field: AlertField) -> Self {
        self.set(field);
        self
    }

    pub fn get(&self, name: &str) -> Option<&AlertField> {
        self.fields.iter().find(|f| f.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AlertField> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Applies every set field on top of `alert`.
    pub fn apply_to(&self, alert: &mut Alert) {
        for field in &self.fields {
            field.apply(alert);
        }
    }

    /// Builds a new rule from a creation document.
    ///
    /// `hostname` defaults to the host uuid, `active` to `true` and
    /// `direction` to [`Direction::Above`].
    pub fn build(&self, id: i64) -> Result<Alert, MissingField> {
        if let Some(missing) = REQUIRED_FIELDS.iter().find(|name| !self.contains(name)) {
            return Err(MissingField(missing));
        }
        let mut alert = Alert {
            id,
            active: true,
            name: String::new(),
            table: String::new(),
            lookup: String::new(),
            timing: 0,
            warn: String::new(),
            crit: String::new(),
            info: None,
            host_uuid: String::new(),
            hostname: String::new(),
            cid: Uuid::nil(),
            where_clause: None,
            direction: Direction::default(),
        };
        self.apply_to(&mut alert);
        if !self.contains("hostname") {
            alert.hostname = alert.host_uuid.clone();
        }
        Ok(alert)
    }

    /// Parses a JSON object in the `AlertsDTOUpdate` shape.
    pub fn from_json_map(map: Map<String, Value>) -> Result<Self, ChangesError> {
        let mut changes = AlertChanges::new();
        for (key, value) in map {
            let nullable = matches!(key.as_str(), "info" | "where_clause");
            if value.is_null() && !nullable {
                if !is_known_field(&key) {
                    return Err(ChangesError::UnknownField(key));
                }
                continue;
            }
            let field = match key.as_str() {
                "active" => AlertField::Active(typed(&key, value)?),
                "name" => AlertField::Name(typed(&key, value)?),
                "table" => AlertField::Table(typed(&key, value)?),
                "lookup" => AlertField::Lookup(typed(&key, value)?),
                "timing" => AlertField::Timing(typed(&key, value)?),
                "warn" => AlertField::Warn(threshold_text(&key, value)?),
                "crit" => AlertField::Crit(threshold_text(&key, value)?),
                "info" => AlertField::Info(typed(&key, value)?),
                "host_uuid" => AlertField::HostUuid(typed(&key, value)?),
                "hostname" => AlertField::Hostname(typed(&key, value)?),
                "cid" => AlertField::Cid(typed(&key, value)?),
                "where_clause" => AlertField::WhereClause(typed(&key, value)?),
                "direction" => AlertField::Direction(typed(&key, value)?),
                _ => return Err(ChangesError::UnknownField(key)),
            };
            changes.set(field);
        }
        Ok(changes)
    }
}

impl From<&Alert> for AlertChanges {
    fn from(alert: &Alert) -> Self {
        AlertChanges::new()
            .with(AlertField::Active(alert.active))
            .with(AlertField::Name(alert.name.clone()))
            .with(AlertField::Table(alert.table.clone()))
            .with(AlertField::Lookup(alert.lookup.clone()))
            .with(AlertField::Timing(alert.timing))
            .with(AlertField::Warn(alert.warn.clone()))
            .with(AlertField::Crit(alert.crit.clone()))
            .with(AlertField::Info(alert.info.clone()))
            .with(AlertField::HostUuid(alert.host_uuid.clone()))
            .with(AlertField::Hostname(alert.hostname.clone()))
            .with(AlertField::Cid(alert.cid))
            .with(AlertField::WhereClause(alert.where_clause.clone()))
            .with(AlertField::Direction(alert.direction))
    }
}

fn is_known_field(key: &str) -> bool {
    matches!(
        key,
        "active"
            | "name"
            | "table"
            | "lookup"
            | "timing"
            | "warn"
            | "crit"
            | "info"
            | "host_uuid"
            | "hostname"
            | "cid"
            | "where_clause"
            | "direction"
    )
}

fn typed<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, ChangesError> {
    serde_json::from_value(value).map_err(|e| ChangesError::InvalidValue {
        field: key.to_string(),
        reason: e.to_string(),
    })
}

/// Thresholds are stored as text but documents often carry plain numbers.
fn threshold_text(key: &str, value: Value) -> Result<String, ChangesError> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(ChangesError::InvalidValue {
            field: key.to_string(),
            reason: format!("expected a string or a number, got {other}"),
        }),
    }
}

impl<'de> Deserialize<'de> for AlertChanges {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = Map::<String, Value>::deserialize(deserializer)?;
        AlertChanges::from_json_map(map).map_err(serde::de::Error::custom)
    }
}

impl Serialize for AlertChanges {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for field in &self.fields {
            let name = field.name();
            match field {
                AlertField::Active(v) => map.serialize_entry(name, v)?,
                AlertField::Timing(v) => map.serialize_entry(name, v)?,
                AlertField::Cid(v) => map.serialize_entry(name, v)?,
                AlertField::Direction(v) => map.serialize_entry(name, v)?,
                AlertField::Info(v) | AlertField::WhereClause(v) => {
                    map.serialize_entry(name, v)?
                }
                AlertField::Name(v)
                | AlertField::Table(v)
                | AlertField::Lookup(v)
                | AlertField::Warn(v)
                | AlertField::Crit(v)
                | AlertField::HostUuid(v)
                | AlertField::Hostname(v) => map.serialize_entry(name, v)?,
            }
        }
        map.end()
    }
}

/// Which hosts a seed rule document applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostTargeted {
    All,
    Specific(String),
}

/// Alert rule seed document, as found in a rules directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    pub name: String,
    pub table: String,
    pub lookup: String,
    pub timing: i32,
    #[serde(deserialize_with = "de_threshold")]
    pub warn: String,
    #[serde(deserialize_with = "de_threshold")]
    pub crit: String,
    #[serde(default)]
    pub info: Option<String>,
    #[serde(default)]
    pub where_clause: Option<String>,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub host_targeted: Option<HostTargeted>,
}

impl AlertsConfig {
    /// Turns the seed document into a creation document for one host.
    pub fn to_changes(&self, host_uuid: &str, hostname: &str, cid: Uuid) -> AlertChanges {
        AlertChanges::new()
            .with(AlertField::Name(self.name.clone()))
            .with(AlertField::Table(self.table.clone()))
            .with(AlertField::Lookup(self.lookup.clone()))
            .with(AlertField::Timing(self.timing))
            .with(AlertField::Warn(self.warn.clone()))
            .with(AlertField::Crit(self.crit.clone()))
            .with(AlertField::Info(self.info.clone()))
            .with(AlertField::WhereClause(self.where_clause.clone()))
            .with(AlertField::Direction(self.direction))
            .with(AlertField::HostUuid(host_uuid.to_string()))
            .with(AlertField::Hostname(hostname.to_string()))
            .with(AlertField::Cid(cid))
    }
}

fn de_threshold<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Value::deserialize(deserializer)?;
    threshold_text("threshold", value).map_err(serde::de::Error::custom)
}
