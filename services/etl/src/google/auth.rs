use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::{EtlError, Result};

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Supplies OAuth bearer tokens to the REST adapters.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// A token obtained out of band (e.g. `gcloud auth print-access-token`).
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Default service-account token from the GCE/Cloud Run metadata server.
pub struct MetadataServerToken {
    client: reqwest::Client,
}

impl MetadataServerToken {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[async_trait]
impl TokenSource for MetadataServerToken {
    async fn token(&self) -> Result<String> {
        let resp = self
            .client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| EtlError::io("credential lookup", e))?;
        let resp = super::check_status(resp, "credential lookup").await?;
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| EtlError::io("credential lookup", e))?;
        Ok(body.access_token)
    }
}

/// `GCP_ACCESS_TOKEN` when set, the metadata server otherwise.
pub fn token_source_from_env(client: reqwest::Client) -> Arc<dyn TokenSource> {
    match std::env::var("GCP_ACCESS_TOKEN") {
        Ok(token) if !token.trim().is_empty() => Arc::new(StaticToken::new(token.trim())),
        _ => Arc::new(MetadataServerToken::new(client)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token_is_returned_as_is() {
        let source = StaticToken::new("ya29.token");
        assert_eq!(source.token().await.unwrap(), "ya29.token");
    }
}
