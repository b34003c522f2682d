use hostwatch_common::alert::Direction;
use std::str::FromStr;

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    GreaterThan,
    LessThan,
    GreaterEqual,
    LessEqual,
    Equal,
    NotEqual,
}

impl FromStr for CompareOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ">" | "greater_than" | "gt" => Ok(Self::GreaterThan),
            "<" | "less_than" | "lt" => Ok(Self::LessThan),
            ">=" | "greater_equal" | "gte" => Ok(Self::GreaterEqual),
            "<=" | "less_equal" | "lte" => Ok(Self::LessEqual),
            "=" | "==" | "equal" | "eq" => Ok(Self::Equal),
            "!=" | "<>" | "not_equal" | "ne" => Ok(Self::NotEqual),
            _ => Err(format!("unknown compare operator: {s}")),
        }
    }
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GreaterThan => write!(f, ">"),
            Self::LessThan => write!(f, "<"),
            Self::GreaterEqual => write!(f, ">="),
            Self::LessEqual => write!(f, "<="),
            Self::Equal => write!(f, "="),
            Self::NotEqual => write!(f, "!="),
        }
    }
}

impl CompareOp {
    pub fn check(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => value > threshold,
            Self::LessThan => value < threshold,
            Self::GreaterEqual => value >= threshold,
            Self::LessEqual => value <= threshold,
            Self::Equal => value == threshold,
            Self::NotEqual => value != threshold,
        }
    }

    pub fn check_text(&self, value: &str, literal: &str) -> Option<bool> {
        match self {
            Self::Equal => Some(value == literal),
            Self::NotEqual => Some(value != literal),
            _ => None,
        }
    }

    /// Direction in which a value breaches this operator, if it has one.
    pub fn direction(&self) -> Option<Direction> {
        match self {
            Self::GreaterThan | Self::GreaterEqual => Some(Direction::Above),
            Self::LessThan | Self::LessEqual => Some(Direction::Below),
            Self::Equal | Self::NotEqual => None,
        }
    }

    fn strict(direction: Direction) -> Self {
        match direction {
            Direction::Above => Self::GreaterThan,
            Direction::Below => Self::LessThan,
        }
    }
}

/// A threshold expression as written in a rule: `50`, `> 50`, `$this <= 10`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdExpr {
    pub op: Option<CompareOp>,
    pub value: f64,
}

impl FromStr for ThresholdExpr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rest = s.trim();
        if let Some(stripped) = rest.strip_prefix("$this") {
            rest = stripped.trim_start();
            if rest.is_empty() {
                return Err("missing operator after $this".into());
            }
        }

        let op_len = rest
            .chars()
            .take_while(|c| matches!(c, '<' | '>' | '=' | '!'))
            .count();
        let (op, number) = if op_len == 0 {
            (None, rest)
        } else {
            let op: CompareOp = rest[..op_len].parse()?;
            if op.direction().is_none() {
                return Err(format!("operator '{op}' cannot express a threshold"));
            }
            (Some(op), rest[op_len..].trim_start())
        };

        let value: f64 = number
            .trim()
            .parse()
            .map_err(|_| format!("'{}' is not a number", number.trim()))?;
        if !value.is_finite() {
            return Err("threshold must be finite".into());
        }
        Ok(Self { op, value })
    }
}

/// One resolved threshold: operator and bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub op: CompareOp,
    pub value: f64,
}

impl Threshold {
    pub fn breached_by(&self, value: f64) -> bool {
        self.op.check(value, self.value)
    }
}

impl std::fmt::Display for Threshold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.op, self.value)
    }
}

/// The warn/crit pair of a rule, resolved against the rule's direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub direction: Direction,
    pub warn: Threshold,
    pub crit: Threshold,
}

impl Thresholds {
    /// Parses both expressions. An explicit operator wins over `direction`;
    /// a bare number takes the direction of the other expression if that one
    /// has an operator, else `direction`.
    pub fn parse(warn: &str, crit: &str, direction: Direction) -> Result<Self, ValidationError> {
        let warn_expr = parse_expr("warn", warn)?;
        let crit_expr = parse_expr("crit", crit)?;

        let explicit = |e: &ThresholdExpr| e.op.and_then(|op| op.direction());
        let direction = match (explicit(&warn_expr), explicit(&crit_expr)) {
            (Some(w), Some(c)) if w != c => return Err(ValidationError::MixedDirections),
            (Some(d), _) | (None, Some(d)) => d,
            (None, None) => direction,
        };

        let resolve = |e: ThresholdExpr| Threshold {
            op: e.op.unwrap_or(CompareOp::strict(direction)),
            value: e.value,
        };
        let (warn, crit) = (resolve(warn_expr), resolve(crit_expr));

        let ordered = match direction {
            Direction::Above => crit.value >= warn.value,
            Direction::Below => crit.value <= warn.value,
        };
        if !ordered {
            return Err(ValidationError::ThresholdOrder {
                warn: warn.value,
                crit: crit.value,
            });
        }

        Ok(Self {
            direction,
            warn,
            crit,
        })
    }
}

fn parse_expr(which: &'static str, expr: &str) -> Result<ThresholdExpr, ValidationError> {
    expr.parse().map_err(|reason| ValidationError::Threshold {
        which,
        expr: expr.to_string(),
        reason,
    })
}
