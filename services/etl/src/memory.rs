//! In-memory collaborators for tests and local experiments.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use crate::artifact::{ArtifactRef, ObjectStore};
use crate::error::{EtlError, Result};
use crate::source::{content_hash, ChunkedDownload, DocumentRepository, ObjectHandle};
use crate::warehouse::{ColumnSpec, JobHandle, JobStatus, TableRef, Warehouse};

// =============================================================================
// Document repository
// =============================================================================

pub struct MemoryRepository {
    container: String,
    files: Vec<(String, Vec<u8>)>,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
    download_delay: Option<Duration>,
    download_error: Option<String>,
}

impl MemoryRepository {
    pub fn new(container: &str) -> Self {
        Self {
            container: container.to_string(),
            files: Vec::new(),
            chunk_size: 64 * 1024,
            chunk_delay: None,
            download_delay: None,
            download_error: None,
        }
    }

    pub fn with_file(mut self, name: &str, content: &[u8]) -> Self {
        self.files.push((name.to_string(), content.to_vec()));
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Delay before the download request itself answers.
    pub fn with_download_delay(mut self, delay: Duration) -> Self {
        self.download_delay = Some(delay);
        self
    }

    pub fn failing_download(mut self, detail: &str) -> Self {
        self.download_error = Some(detail.to_string());
        self
    }
}

struct MemoryDownload {
    chunks: std::vec::IntoIter<Bytes>,
    delay: Option<Duration>,
}

#[async_trait]
impl ChunkedDownload for MemoryDownload {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.chunks.next())
    }
}

#[async_trait]
impl DocumentRepository for MemoryRepository {
    async fn find(&self, name: &str, container_id: &str) -> Result<Option<ObjectHandle>> {
        if container_id != self.container {
            return Ok(None);
        }
        Ok(self
            .files
            .iter()
            .position(|(n, _)| n == name)
            .map(|idx| ObjectHandle {
                id: format!("mem-{}", idx),
                name: name.to_string(),
            }))
    }

    async fn download(&self, handle: &ObjectHandle) -> Result<Box<dyn ChunkedDownload>> {
        if let Some(delay) = self.download_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(detail) = &self.download_error {
            return Err(EtlError::io("source download", detail));
        }
        let (_, content) = self
            .files
            .iter()
            .find(|(n, _)| *n == handle.name)
            .ok_or_else(|| EtlError::io("source download", format!("no object {}", handle.id)))?;
        let chunks: Vec<Bytes> = content
            .chunks(self.chunk_size)
            .map(Bytes::copy_from_slice)
            .collect();
        Ok(Box::new(MemoryDownload {
            chunks: chunks.into_iter(),
            delay: self.chunk_delay,
        }))
    }
}

// =============================================================================
// Object store
// =============================================================================

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
    writes: Mutex<usize>,
    error: Option<String>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(detail: &str) -> Self {
        Self {
            error: Some(detail.to_string()),
            ..Self::default()
        }
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.objects.lock().ok()?.get(path).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn writes(&self) -> usize {
        self.writes.lock().map(|w| *w).unwrap_or(0)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, path: &str, bytes: Bytes) -> Result<ArtifactRef> {
        if let Some(detail) = &self.error {
            return Err(EtlError::io("artifact write", detail));
        }
        let artifact = ArtifactRef {
            uri: format!("mem://{}", path),
            size_bytes: bytes.len(),
            content_hash: content_hash(&bytes),
        };
        self.objects
            .lock()
            .map_err(|e| EtlError::io("artifact write", e))?
            .insert(path.to_string(), bytes);
        *self.writes.lock().map_err(|e| EtlError::io("artifact write", e))? += 1;
        Ok(artifact)
    }
}

// =============================================================================
// Warehouse
// =============================================================================

/// A submitted job as the warehouse saw it.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmittedJob {
    Load {
        uri: String,
        table: String,
        schema: Vec<ColumnSpec>,
    },
    Query {
        sql: String,
    },
}

struct PendingJob {
    polls_left: usize,
    effect: Option<(String, String)>,
    failure: Option<String>,
}

#[derive(Default)]
struct WarehouseState {
    submitted: Vec<SubmittedJob>,
    pending: HashMap<String, PendingJob>,
    /// Table id -> artifact uri (landing) or defining SQL (derived tables).
    tables: BTreeMap<String, String>,
    polls: usize,
}

/// Load jobs replace the target table's contents with the artifact uri;
/// `CREATE OR REPLACE TABLE` statements replace the named table's definition.
#[derive(Default)]
pub struct MemoryWarehouse {
    state: Mutex<WarehouseState>,
    pending_polls: usize,
    job_failure: Option<String>,
    query_failure: Option<String>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every job reports `Pending` this many times before finishing.
    pub fn with_pending_polls(mut self, polls: usize) -> Self {
        self.pending_polls = polls;
        self
    }

    pub fn fail_jobs_with(mut self, reason: &str) -> Self {
        self.job_failure = Some(reason.to_string());
        self
    }

    pub fn fail_queries_with(mut self, reason: &str) -> Self {
        self.query_failure = Some(reason.to_string());
        self
    }

    pub fn submitted(&self) -> Vec<SubmittedJob> {
        self.state
            .lock()
            .map(|s| s.submitted.clone())
            .unwrap_or_default()
    }

    pub fn tables(&self) -> BTreeMap<String, String> {
        self.state.lock().map(|s| s.tables.clone()).unwrap_or_default()
    }

    pub fn table_source(&self, table: &TableRef) -> Option<String> {
        self.state.lock().ok()?.tables.get(&table.to_string()).cloned()
    }

    pub fn status_polls(&self) -> usize {
        self.state.lock().map(|s| s.polls).unwrap_or(0)
    }

    fn submit(
        &self,
        job: SubmittedJob,
        effect: Option<(String, String)>,
        failure: Option<String>,
    ) -> Result<JobHandle> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| EtlError::io("warehouse submit", e))?;
        let id = format!("job-{}", state.submitted.len() + 1);
        state.submitted.push(job);
        state.pending.insert(
            id.clone(),
            PendingJob {
                polls_left: self.pending_polls,
                effect,
                failure,
            },
        );
        Ok(JobHandle { id, location: None })
    }
}

/// Target of a `CREATE OR REPLACE TABLE` statement, without backticks.
fn replaced_table(sql: &str) -> Option<String> {
    let rest = sql.trim_start().strip_prefix("CREATE OR REPLACE TABLE")?;
    let name = rest.split_whitespace().next()?;
    Some(name.trim_matches('`').to_string())
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn load_parquet(
        &self,
        uri: &str,
        table: &TableRef,
        schema: &[ColumnSpec],
    ) -> Result<JobHandle> {
        self.submit(
            SubmittedJob::Load {
                uri: uri.to_string(),
                table: table.to_string(),
                schema: schema.to_vec(),
            },
            Some((table.to_string(), uri.to_string())),
            self.job_failure.clone(),
        )
    }

    async fn execute(&self, sql: &str) -> Result<JobHandle> {
        self.submit(
            SubmittedJob::Query {
                sql: sql.to_string(),
            },
            replaced_table(sql).map(|t| (t, sql.to_string())),
            self.job_failure.clone().or_else(|| self.query_failure.clone()),
        )
    }

    async fn job_status(&self, job: &JobHandle) -> Result<JobStatus> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| EtlError::io("warehouse poll", e))?;
        state.polls += 1;
        let pending = state
            .pending
            .get_mut(&job.id)
            .ok_or_else(|| EtlError::io("warehouse poll", format!("unknown job {}", job.id)))?;

        if pending.polls_left > 0 {
            pending.polls_left -= 1;
            return Ok(JobStatus::Pending);
        }
        if let Some(reason) = pending.failure.clone() {
            return Ok(JobStatus::Failed(reason));
        }
        if let Some((table, source)) = pending.effect.take() {
            state.tables.insert(table, source);
        }
        Ok(JobStatus::Done)
    }
}
