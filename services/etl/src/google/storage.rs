use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::info;

use super::{check_status, TokenSource};
use crate::artifact::{ArtifactRef, ObjectStore};
use crate::error::{EtlError, Result};
use crate::source::content_hash;

const STORAGE_UPLOAD_URL: &str = "https://storage.googleapis.com/upload/storage/v1";

/// Cloud Storage bucket as the artifact store. Simple media uploads replace
/// any existing object at the same name.
pub struct GcsObjectStore {
    client: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    bucket: String,
    base_url: String,
}

impl GcsObjectStore {
    pub fn new(client: reqwest::Client, tokens: Arc<dyn TokenSource>, bucket: &str) -> Self {
        Self {
            client,
            tokens,
            bucket: bucket.to_string(),
            base_url: STORAGE_UPLOAD_URL.to_string(),
        }
    }
}

fn gcs_uri(bucket: &str, path: &str) -> String {
    format!("gs://{}/{}", bucket, path.trim_start_matches('/'))
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    async fn put(&self, path: &str, bytes: Bytes) -> Result<ArtifactRef> {
        let token = self.tokens.token().await?;
        let object = path.trim_start_matches('/');
        let size_bytes = bytes.len();
        let hash = content_hash(&bytes);

        let resp = self
            .client
            .post(format!("{}/b/{}/o", self.base_url, self.bucket))
            .bearer_auth(token)
            .query(&[("uploadType", "media"), ("name", object)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(|e| EtlError::io("artifact upload", e))?;
        check_status(resp, "artifact upload").await?;

        let artifact = ArtifactRef {
            uri: gcs_uri(&self.bucket, object),
            size_bytes,
            content_hash: hash,
        };
        info!(uri = %artifact.uri, bytes = size_bytes, "artifact uploaded");
        Ok(artifact)
    }
}
