use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;

use super::{check_status, TokenSource};
use crate::error::{EtlError, Result};
use crate::source::{ChunkedDownload, DocumentRepository, ObjectHandle};

const DRIVE_BASE_URL: &str = "https://www.googleapis.com/drive/v3";

/// Google Drive v3 as the document repository. The container is a folder id.
pub struct DriveRepository {
    client: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    base_url: String,
}

impl DriveRepository {
    pub fn new(client: reqwest::Client, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            client,
            tokens,
            base_url: DRIVE_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
    name: String,
}

fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Drive search expression for a file name inside one folder.
fn search_query(name: &str, folder_id: &str) -> String {
    format!(
        "name='{}' and '{}' in parents and trashed=false",
        escape_literal(name),
        escape_literal(folder_id)
    )
}

struct DriveDownload {
    response: reqwest::Response,
}

#[async_trait]
impl ChunkedDownload for DriveDownload {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.response
            .chunk()
            .await
            .map_err(|e| EtlError::io("source download", e))
    }
}

#[async_trait]
impl DocumentRepository for DriveRepository {
    async fn find(&self, name: &str, container_id: &str) -> Result<Option<ObjectHandle>> {
        let token = self.tokens.token().await?;
        let resp = self
            .client
            .get(format!("{}/files", self.base_url))
            .bearer_auth(token)
            .query(&[
                ("q", search_query(name, container_id).as_str()),
                ("fields", "files(id, name)"),
                ("pageSize", "1"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ])
            .send()
            .await
            .map_err(|e| EtlError::io("source lookup", e))?;
        let resp = check_status(resp, "source lookup").await?;
        let list: FileList = resp
            .json()
            .await
            .map_err(|e| EtlError::io("source lookup", e))?;

        Ok(list.files.into_iter().next().map(|f| ObjectHandle {
            id: f.id,
            name: f.name,
        }))
    }

    async fn download(&self, handle: &ObjectHandle) -> Result<Box<dyn ChunkedDownload>> {
        let token = self.tokens.token().await?;
        let resp = self
            .client
            .get(format!("{}/files/{}", self.base_url, handle.id))
            .bearer_auth(token)
            .query(&[("alt", "media"), ("supportsAllDrives", "true")])
            .send()
            .await
            .map_err(|e| EtlError::io("source download", e))?;
        let response = check_status(resp, "source download").await?;
        Ok(Box::new(DriveDownload { response }))
    }
}
