//! Error types for infra-validator

use std::time::Duration;
use thiserror::Error;

/// Result type for infra-validator operations
pub type ValidatorResult<T> = Result<T, ValidatorError>;

/// Main error type for infra-validator
#[derive(Error, Debug)]
pub enum ValidatorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model path error: {0}")]
    ModelPath(String),

    #[error("Runner error: {0}")]
    Runner(String),

    #[error("Client error: {0}")]
    Client(String),

    #[error("Request error: {0}")]
    Request(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ONNX Runtime error: {0}")]
    OnnxRuntime(#[from] ort::Error),
}

impl ValidatorError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn model_path(msg: impl Into<String>) -> Self {
        Self::ModelPath(msg.into())
    }

    pub fn runner(msg: impl Into<String>) -> Self {
        Self::Runner(msg.into())
    }

    pub fn client(msg: impl Into<String>) -> Self {
        Self::Client(msg.into())
    }

    pub fn request(msg: impl Into<String>) -> Self {
        Self::Request(msg.into())
    }

    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference(msg.into())
    }

    pub fn timeout(what: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            waited,
        }
    }

    /// Whether this error rejects the run before any attempt is made.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_) | Self::ModelPath(_))
    }
}
