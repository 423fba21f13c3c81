//! Source location and chunked download from the document repository.

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::future::Future;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use crate::config::WaitPolicy;
use crate::error::{EtlError, Result};

/// A located object in the document repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHandle {
    pub id: String,
    pub name: String,
}

/// One in-progress download. `next_chunk` returns `None` once the transfer
/// reports completion.
#[async_trait]
pub trait ChunkedDownload: Send {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Zero or one match for `name` inside `container_id`.
    async fn find(&self, name: &str, container_id: &str) -> Result<Option<ObjectHandle>>;

    async fn download(&self, handle: &ObjectHandle) -> Result<Box<dyn ChunkedDownload>>;
}

/// Fetched source content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBytes {
    pub handle: ObjectHandle,
    pub bytes: Vec<u8>,
    pub content_hash: String,
}

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

/// Resolve `name` in `container_id`, failing with `NotFound` when absent.
pub async fn locate(
    repository: &dyn DocumentRepository,
    name: &str,
    container_id: &str,
) -> Result<ObjectHandle> {
    match repository.find(name, container_id).await? {
        Some(handle) => {
            info!(object_id = %handle.id, name = %handle.name, "located source");
            Ok(handle)
        }
        None => Err(EtlError::NotFound {
            name: name.to_string(),
            container: container_id.to_string(),
        }),
    }
}

/// Await `fut`, failing as a timed-out download once `deadline` passes.
async fn within<T>(
    deadline: Option<Instant>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(deadline) => timeout_at(deadline, fut)
            .await
            .map_err(|_| EtlError::io("source download", "timed out before transfer completed"))?,
        None => fut.await,
    }
}

/// Drain the download into memory. The request and the whole transfer
/// share one deadline when the policy has a timeout.
pub async fn fetch(
    repository: &dyn DocumentRepository,
    handle: &ObjectHandle,
    wait: &WaitPolicy,
) -> Result<SourceBytes> {
    let deadline = wait.timeout.map(|t| Instant::now() + t);
    let mut download = within(deadline, repository.download(handle)).await?;
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunks = 0usize;

    while let Some(chunk) = within(deadline, download.next_chunk()).await? {
        chunks += 1;
        buffer.extend_from_slice(&chunk);
        debug!(chunk = chunks, total_bytes = buffer.len(), "received chunk");
    }

    let hash = content_hash(&buffer);
    info!(bytes = buffer.len(), chunks, hash = %hash, "downloaded source");
    Ok(SourceBytes {
        handle: handle.clone(),
        bytes: buffer,
        content_hash: hash,
    })
}
