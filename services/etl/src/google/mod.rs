//! REST adapters for the Google services behind each collaborator:
//! Drive (document repository), Cloud Storage (object store) and
//! BigQuery (warehouse).

mod auth;
mod bigquery;
mod drive;
mod storage;

pub use auth::{token_source_from_env, MetadataServerToken, StaticToken, TokenSource};
pub use bigquery::BigQueryWarehouse;
pub use drive::DriveRepository;
pub use storage::GcsObjectStore;

use crate::error::EtlError;

/// Turn a non-success response into `TransientIo`, keeping the body text
/// since Google puts the useful message there.
async fn check_status(
    resp: reqwest::Response,
    operation: &'static str,
) -> Result<reqwest::Response, EtlError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(EtlError::io(
        operation,
        format!("HTTP {}: {}", status, body.trim()),
    ))
}
