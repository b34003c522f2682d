//! Value extraction for a rule.
//!
//! A lookup is either a plain field name, read from the most recent sample,
//! or an aggregation query:
//!
//! ```text
//! <avg|sum|min|max> <abs|pct> <interval> of <field>[,<field>..] [over <field>[,<field>..]]
//! ```
//!
//! `abs` yields the sum of the aggregated `of` fields. `pct` divides it by the
//! sum of the aggregated `over` fields and scales to a percentage, so
//! `avg pct 10m of avail_space over total_space` is the ten-minute average
//! share of free disk space.

use chrono::{DateTime, Duration, Utc};
use hostwatch_common::types::{FieldValue, MetricSample, SampleKind};
use std::str::FromStr;

use crate::error::ValidationError;
use crate::evaluate::SkipReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Avg,
    Sum,
    Min,
    Max,
}

impl FromStr for Aggregate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "avg" | "average" | "mean" => Ok(Self::Avg),
            "sum" => Ok(Self::Sum),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            _ => Err(format!("unknown aggregate '{s}'")),
        }
    }
}

impl Aggregate {
    fn apply(self, values: &[f64]) -> f64 {
        match self {
            Self::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Self::Sum => values.iter().sum(),
            Self::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Abs,
    Pct,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub aggregate: Aggregate,
    pub mode: Mode,
    pub interval: Duration,
    pub fields: Vec<String>,
    pub over: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Field(String),
    Query(Query),
}

/// Parses an interval such as `30s`, `10m`, `1h` or `2d`. A bare number is
/// taken as seconds.
pub fn parse_interval(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let n: i64 = digits.parse().ok()?;
    let secs = match unit {
        "" | "s" => n,
        "m" => n.checked_mul(60)?,
        "h" => n.checked_mul(3600)?,
        "d" => n.checked_mul(86_400)?,
        _ => return None,
    };
    (secs > 0).then(|| Duration::seconds(secs))
}

impl Lookup {
    /// Parses `lookup` and checks every referenced field against `kind`.
    pub fn parse(lookup: &str, kind: SampleKind) -> Result<Self, ValidationError> {
        let invalid = |reason: String| ValidationError::Lookup {
            lookup: lookup.to_string(),
            reason,
        };

        let normalized = lookup.replace(',', " , ");
        let tokens: Vec<&str> = normalized.split_whitespace().collect();
        let parsed = match tokens.as_slice() {
            [] => return Err(invalid("empty lookup".into())),
            [field] => Lookup::Field(field.to_string()),
            [aggregate, mode, interval, of, rest @ ..] if of.eq_ignore_ascii_case("of") => {
                let aggregate: Aggregate = aggregate.parse().map_err(invalid)?;
                let mode = match mode.to_lowercase().as_str() {
                    "abs" => Mode::Abs,
                    "pct" => Mode::Pct,
                    other => return Err(invalid(format!("unknown mode '{other}'"))),
                };
                let interval = parse_interval(interval)
                    .ok_or_else(|| invalid(format!("invalid interval '{interval}'")))?;

                let split = rest.iter().position(|t| t.eq_ignore_ascii_case("over"));
                let (fields, over) = match split {
                    Some(i) => (field_list(&rest[..i]), field_list(&rest[i + 1..])),
                    None => (field_list(rest), Some(Vec::new())),
                };
                let fields = fields.ok_or_else(|| invalid("malformed field list".into()))?;
                let over = over.ok_or_else(|| invalid("malformed 'over' list".into()))?;
                if fields.is_empty() {
                    return Err(invalid("no field after 'of'".into()));
                }
                match (mode, over.is_empty(), split.is_some()) {
                    (Mode::Pct, true, _) => {
                        return Err(invalid("'pct' needs an 'over' field list".into()))
                    }
                    (Mode::Abs, _, true) => {
                        return Err(invalid("'abs' does not take an 'over' list".into()))
                    }
                    _ => {}
                }
                Lookup::Query(Query {
                    aggregate,
                    mode,
                    interval,
                    fields,
                    over,
                })
            }
            _ => return Err(invalid("expected a field name or an aggregation query".into())),
        };

        for field in parsed.referenced_fields() {
            if !kind.has_field(field) {
                return Err(ValidationError::UnknownField {
                    table: kind.table().to_string(),
                    field: field.to_string(),
                });
            }
            if !kind.numeric_fields().contains(&field) {
                return Err(ValidationError::NotNumeric {
                    table: kind.table().to_string(),
                    field: field.to_string(),
                });
            }
        }
        Ok(parsed)
    }

    pub fn referenced_fields(&self) -> Vec<&str> {
        match self {
            Lookup::Field(f) => vec![f.as_str()],
            Lookup::Query(q) => q.fields.iter().chain(&q.over).map(String::as_str).collect(),
        }
    }

    /// How far back samples are needed, when the lookup itself says so.
    pub fn window(&self) -> Option<Duration> {
        match self {
            Lookup::Field(_) => None,
            Lookup::Query(q) => Some(q.interval),
        }
    }

    /// Extracts the value from `samples`, which are already filtered to the
    /// rule's table, host and where clause.
    pub fn value(&self, samples: &[&MetricSample], now: DateTime<Utc>) -> Result<f64, SkipReason> {
        match self {
            Lookup::Field(field) => {
                let latest = samples
                    .iter()
                    .max_by_key(|s| s.created_at)
                    .ok_or(SkipReason::NoSample)?;
                number(latest, field)
            }
            Lookup::Query(q) => {
                let cutoff = now - q.interval;
                let window: Vec<&MetricSample> = samples
                    .iter()
                    .copied()
                    .filter(|s| s.created_at >= cutoff && s.created_at <= now)
                    .collect();
                if window.is_empty() {
                    return Err(SkipReason::NoSample);
                }

                let numerator = aggregate_fields(q.aggregate, &q.fields, &window)?;
                match q.mode {
                    Mode::Abs => Ok(numerator),
                    Mode::Pct => {
                        let divisor = aggregate_fields(q.aggregate, &q.over, &window)?;
                        if divisor == 0.0 {
                            return Err(SkipReason::DivisionByZero);
                        }
                        Ok(numerator / divisor * 100.0)
                    }
                }
            }
        }
    }
}

fn field_list(tokens: &[&str]) -> Option<Vec<String>> {
    let mut fields = Vec::new();
    let mut expect_field = true;
    for token in tokens {
        match (*token, expect_field) {
            (",", false) => expect_field = true,
            (",", true) => return None,
            (name, true) => {
                fields.push(name.to_string());
                expect_field = false;
            }
            (_, false) => return None,
        }
    }
    if expect_field && !fields.is_empty() {
        return None;
    }
    Some(fields)
}

fn number(sample: &MetricSample, field: &str) -> Result<f64, SkipReason> {
    match sample.field(field) {
        Some(FieldValue::Number(v)) if v.is_finite() => Ok(v),
        Some(_) => Err(SkipReason::MalformedValue(field.to_string())),
        None => Err(SkipReason::MissingField(field.to_string())),
    }
}

fn aggregate_fields(
    aggregate: Aggregate,
    fields: &[String],
    window: &[&MetricSample],
) -> Result<f64, SkipReason> {
    let mut total = 0.0;
    for field in fields {
        let values = window
            .iter()
            .map(|s| number(s, field))
            .collect::<Result<Vec<f64>, _>>()?;
        total += aggregate.apply(&values);
    }
    Ok(total)
}
