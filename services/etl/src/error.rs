use thiserror::Error;

use crate::model::Field;

/// Failure taxonomy of a pipeline invocation.
///
/// Row-level problems never surface here: the cleaner drops or repairs rows
/// silently. Only structural problems and failed collaborator calls do.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("source '{name}' not found in container '{container}'")]
    NotFound { name: String, container: String },

    #[error("missing required columns: {}", join_fields(.missing))]
    Schema { missing: Vec<Field> },

    #[error("source is not readable as delimited text: {0}")]
    Parse(String),

    #[error("{operation} failed: {detail}")]
    TransientIo {
        operation: &'static str,
        detail: String,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl EtlError {
    pub fn io(operation: &'static str, err: impl std::fmt::Display) -> Self {
        EtlError::TransientIo {
            operation,
            detail: err.to_string(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        EtlError::Config(msg.into())
    }
}

fn join_fields(fields: &[Field]) -> String {
    fields
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, EtlError>;
