//! Aggregate Expression Language
//!
//! Rollup strategies are written as `function(field)` expressions such as
//! `mean(out_temperature)` or `sum(rain_rain)`. Expressions are parsed into a
//! closed set of functions so backends never splice user text into queries.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Result, StoreError};

/// Supported aggregate functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFn {
    Mean,
    Sum,
    Min,
    Max,
    Count,
    First,
    Last,
}

impl AggregateFn {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "mean" | "avg" => Some(Self::Mean),
            "sum" => Some(Self::Sum),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "count" => Some(Self::Count),
            "first" => Some(Self::First),
            "last" => Some(Self::Last),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Count => "count",
            Self::First => "first",
            Self::Last => "last",
        }
    }

    /// SQL aggregate for set functions; `None` for order-dependent ones
    pub fn sql_name(&self) -> Option<&'static str> {
        match self {
            Self::Mean => Some("avg"),
            Self::Sum => Some("sum"),
            Self::Min => Some("min"),
            Self::Max => Some("max"),
            Self::Count => Some("count"),
            Self::First | Self::Last => None,
        }
    }

    /// Apply to samples already sorted by time
    pub fn apply(&self, samples: &[f64]) -> Option<f64> {
        if samples.is_empty() {
            return None;
        }
        match self {
            Self::Mean => Some(samples.iter().sum::<f64>() / samples.len() as f64),
            Self::Sum => Some(samples.iter().sum()),
            Self::Min => samples.iter().copied().reduce(f64::min),
            Self::Max => samples.iter().copied().reduce(f64::max),
            Self::Count => Some(samples.len() as f64),
            Self::First => samples.first().copied(),
            Self::Last => samples.last().copied(),
        }
    }
}

/// Parsed `function(field)` expression
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregateExpr {
    pub func: AggregateFn,
    pub field: String,
}

impl FromStr for AggregateExpr {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || StoreError::InvalidExpression(s.to_string());

        let text = s.trim();
        let open = text.find('(').ok_or_else(invalid)?;
        if !text.ends_with(')') {
            return Err(invalid());
        }

        let func = AggregateFn::from_name(text[..open].trim()).ok_or_else(invalid)?;
        let field = text[open + 1..text.len() - 1].trim();
        if !is_identifier(field) {
            return Err(invalid());
        }

        Ok(Self {
            func,
            field: field.to_string(),
        })
    }
}

impl fmt::Display for AggregateExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.func.name(), self.field)
    }
}

/// One entry of an aggregation strategy: the observation type produced and
/// the expression producing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationRule {
    pub obs_type: String,
    #[serde(alias = "subsample")]
    pub expression: String,
}

impl AggregationRule {
    pub fn new(obs_type: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            obs_type: obs_type.into(),
            expression: expression.into(),
        }
    }

    /// Parse the expression and check the alias is a plain identifier
    pub fn parse(&self) -> Result<AggregateExpr> {
        if !is_identifier(&self.obs_type) {
            return Err(StoreError::InvalidExpression(format!(
                "{} as {}",
                self.expression, self.obs_type
            )));
        }
        self.expression.parse()
    }
}

pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
