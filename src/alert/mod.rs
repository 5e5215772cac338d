//! Threshold alerting on the live reading.
//!
//! The evaluator compares the latest sample against each active rule,
//! records a trigger and hands the event to the dispatcher, which runs the
//! rule's configured actions.

mod actions;
mod dispatcher;
mod evaluator;

pub use actions::*;
pub use dispatcher::*;
pub use evaluator::*;

use crate::db::{DbError, Sample};

use std::str::FromStr;
use thiserror::Error;

/// Two values closer than this are considered equal by `eq` rules.
pub const EQ_TOLERANCE: f64 = 0.01;

/// Errors that stop one rule from being evaluated.
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("unknown metric: {0}")]
    UnknownMetric(String),
    #[error("unknown condition: {0}")]
    UnknownCondition(String),
    #[error("invalid threshold: {0}")]
    InvalidThreshold(f64),
    #[error("store error: {0}")]
    Store(#[from] DbError),
}

/// The sample field a rule watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Power,
    Voltage,
    Current,
}

impl Metric {
    /// Read this metric from a sample. Non-finite values count as absent.
    pub fn value_of(self, sample: &Sample) -> Option<f64> {
        let value = match self {
            Metric::Power => sample.power,
            Metric::Voltage => sample.voltage,
            Metric::Current => sample.current,
        };
        value.is_finite().then_some(value)
    }
}

impl FromStr for Metric {
    type Err = AlertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "power" => Ok(Metric::Power),
            "voltage" => Ok(Metric::Voltage),
            "current" => Ok(Metric::Current),
            other => Err(AlertError::UnknownMetric(other.to_string())),
        }
    }
}

/// Comparison between the observed value and a rule's threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
}

impl Condition {
    pub fn matches(self, value: f64, threshold: f64) -> bool {
        match self {
            Condition::Gt => value > threshold,
            Condition::Lt => value < threshold,
            Condition::Gte => value >= threshold,
            Condition::Lte => value <= threshold,
            Condition::Eq => (value - threshold).abs() < EQ_TOLERANCE,
        }
    }
}

impl FromStr for Condition {
    type Err = AlertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gt" => Ok(Condition::Gt),
            "lt" => Ok(Condition::Lt),
            "gte" => Ok(Condition::Gte),
            "lte" => Ok(Condition::Lte),
            "eq" => Ok(Condition::Eq),
            other => Err(AlertError::UnknownCondition(other.to_string())),
        }
    }
}
