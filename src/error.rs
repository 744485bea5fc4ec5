//! Row-level violation taxonomy.
//!
//! Every rule a candidate row can break is a [`Violation`]. Violations are
//! collected into reports, never propagated as `Err` out of the engine. The
//! [`ErrorClass`] of a violation decides whether the staging engine keeps the
//! row around for another pass or moves it to the permanent error list.

use std::fmt;

use itertools::Itertools;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// May heal once more referenced data has been staged.
    Retryable,
    /// Requires the source row itself to be fixed.
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FkFailure {
    NotFound,
    Ambiguous { matches: usize },
    /// The source columns feeding the lookup are blank.
    MissingKey,
}

impl fmt::Display for FkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FkFailure::NotFound => write!(f, "no matching row"),
            FkFailure::Ambiguous { matches } => write!(f, "{matches} rows match"),
            FkFailure::MissingKey => write!(f, "lookup value is blank"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XorProblem {
    NoneSet,
    MultipleSet(Vec<String>),
}

impl fmt::Display for XorProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XorProblem::NoneSet => write!(f, "but none is set"),
            XorProblem::MultipleSet(set) => write!(f, "but {} are all set", set.join(", ")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("invalid identifier '{value}' for {field}")]
    InvalidIdentifierFormat { field: String, value: String },

    #[error("invalid integer '{value}' for {field}")]
    InvalidInteger { field: String, value: String },

    #[error("invalid decimal '{value}' for {field}")]
    InvalidDecimal { field: String, value: String },

    #[error("invalid boolean '{value}' for {field}")]
    InvalidBoolean { field: String, value: String },

    #[error("cannot parse timestamp '{value}' for {field}")]
    InvalidTimestamp { field: String, value: String },

    #[error("invalid enum value '{value}' for {field}; allowed: {}", .allowed.join(", "))]
    InvalidEnumValue {
        field: String,
        value: String,
        allowed: Vec<String>,
    },

    #[error("unique constraint '{constraint}' violated: {}", format_pairs(.values))]
    DuplicateUniqueConstraint {
        constraint: String,
        values: Vec<(String, String)>,
    },

    #[error("exactly one of {} must be set, {problem}", .fields.join(", "))]
    XorConstraintViolated {
        fields: Vec<String>,
        problem: XorProblem,
    },

    #[error("dedup key ({}) has a blank component", .fields.join(", "))]
    EmptyDedupKey { fields: Vec<String> },

    #[error("could not resolve FK '{field}' to {target} by {}: {reason}", format_pairs(.lookup))]
    FkUnresolved {
        field: String,
        target: String,
        lookup: Vec<(String, String)>,
        reason: FkFailure,
    },

    #[error("required field '{field}' is missing")]
    MissingRequiredField { field: String },

    #[error("{message}")]
    DataClass { message: String },
}

impl Violation {
    pub fn class(&self) -> ErrorClass {
        match self {
            Violation::FkUnresolved {
                reason: FkFailure::NotFound,
                ..
            } => ErrorClass::Retryable,
            _ => ErrorClass::Terminal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Violation::InvalidIdentifierFormat { .. } => "InvalidIdentifierFormat",
            Violation::InvalidInteger { .. } => "InvalidInteger",
            Violation::InvalidDecimal { .. } => "InvalidDecimal",
            Violation::InvalidBoolean { .. } => "InvalidBoolean",
            Violation::InvalidTimestamp { .. } => "InvalidTimestamp",
            Violation::InvalidEnumValue { .. } => "InvalidEnumValue",
            Violation::DuplicateUniqueConstraint { .. } => "DuplicateUniqueConstraint",
            Violation::XorConstraintViolated { .. } => "XorConstraintViolated",
            Violation::EmptyDedupKey { .. } => "EmptyDedupKey",
            Violation::FkUnresolved { .. } => "FkUnresolved",
            Violation::MissingRequiredField { .. } => "MissingRequiredField",
            Violation::DataClass { .. } => "DataClassError",
        }
    }
}

/// The class of a violation set: retryable as soon as one member is.
pub fn classify(violations: &[Violation]) -> ErrorClass {
    if violations.iter().any(Violation::is_retryable) {
        ErrorClass::Retryable
    } else {
        ErrorClass::Terminal
    }
}

fn format_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(field, value)| format!("{field}={value}"))
        .join(", ")
}
