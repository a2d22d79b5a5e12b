//! Error types for the domset controller

use thiserror::Error;

/// Failure reported by the CASU driver
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HalError {
    /// Worth logging, the next tick may succeed
    #[error("transient device failure: {0}")]
    Transient(String),

    /// The device cannot be reached; the run loop must stop
    #[error("device unreachable: {0}")]
    Unreachable(String),
}

impl HalError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, HalError::Unreachable(_))
    }
}

/// Combined domset error
#[derive(Debug, Error)]
pub enum DomsetError {
    #[error("hal error: {0}")]
    Hal(#[from] HalError),

    #[error("bridge payload missing or invalid field '{field}': {payload}")]
    BridgeParse { field: String, payload: String },

    #[error("invalid group report: {0}")]
    Report(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl DomsetError {
    /// True when the error must end the control loop
    pub fn is_fatal(&self) -> bool {
        match self {
            DomsetError::Hal(e) => e.is_fatal(),
            DomsetError::Io(_) | DomsetError::Csv(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DomsetError>;
