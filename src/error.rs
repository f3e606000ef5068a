//! Error types for the pgBackRest operator

use std::fmt;

use thiserror::Error;

use crate::k8s::{ExecError, StoreError};

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error outside the store adapter
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Resource store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Desired object or spec rejected
    #[error("Validation error: {0}")]
    Validation(String),

    /// Observed state is inconsistent, usually a stale cache
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// pgBackRest command failed inside a container
    #[error("External command error: {0}")]
    ExternalCommand(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Several independent failures from one step
    #[error("{0}")]
    Aggregate(AggregateError),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a consistency error
    pub fn consistency(msg: impl Into<String>) -> Self {
        Error::Consistency(msg.into())
    }

    /// Fold a list of errors into a single result.
    ///
    /// An empty list is success and a single error is returned unwrapped.
    pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(AggregateError(errors))),
        }
    }

    /// Whether the error (or any aggregated error) is a consistency error
    pub fn is_consistency(&self) -> bool {
        match self {
            Error::Consistency(_) => true,
            Error::Aggregate(agg) => agg.0.iter().any(Error::is_consistency),
            _ => false,
        }
    }
}

impl From<ExecError> for Error {
    fn from(e: ExecError) -> Self {
        Error::ExternalCommand(e.to_string())
    }
}

/// Errors collected while continuing past individual failures
#[derive(Debug)]
pub struct AggregateError(pub Vec<Error>);

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", e)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_of_nothing_is_ok() {
        assert!(Error::aggregate(vec![]).is_ok());
    }

    #[test]
    fn aggregate_of_one_is_unwrapped() {
        let err = Error::aggregate(vec![Error::validation("bad repo")]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn aggregate_of_many_lists_all() {
        let err = Error::aggregate(vec![
            Error::config("first"),
            Error::consistency("second"),
        ])
        .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("first"));
        assert!(msg.contains("second"));
        assert!(err.is_consistency());
    }
}
