use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use super::{check_status, TokenSource};
use crate::error::{EtlError, Result};
use crate::warehouse::{ColumnSpec, JobHandle, JobStatus, TableRef, Warehouse};

const BIGQUERY_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// BigQuery jobs API as the warehouse. Jobs run in `project`.
pub struct BigQueryWarehouse {
    client: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    project: String,
    location: Option<String>,
    base_url: String,
}

impl BigQueryWarehouse {
    pub fn new(
        client: reqwest::Client,
        tokens: Arc<dyn TokenSource>,
        project: &str,
        location: Option<String>,
    ) -> Self {
        Self {
            client,
            tokens,
            project: project.to_string(),
            location,
            base_url: BIGQUERY_BASE_URL.to_string(),
        }
    }

    fn job_reference(&self, prefix: &str) -> Value {
        let mut reference = json!({
            "projectId": self.project,
            "jobId": format!("{}_{}", prefix, Uuid::new_v4().simple()),
        });
        if let Some(location) = &self.location {
            reference["location"] = json!(location);
        }
        reference
    }

    async fn insert_job(&self, body: Value, operation: &'static str) -> Result<JobHandle> {
        let token = self.tokens.token().await?;
        let resp = self
            .client
            .post(format!("{}/projects/{}/jobs", self.base_url, self.project))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| EtlError::io(operation, e))?;
        let resp = check_status(resp, operation).await?;
        let job: JobResource = resp.json().await.map_err(|e| EtlError::io(operation, e))?;

        // An insert can already carry a terminal failure
        if let JobStatus::Failed(reason) = job_status_of(&job) {
            return Err(EtlError::io(operation, reason));
        }
        Ok(JobHandle {
            id: job.job_reference.job_id,
            location: job.job_reference.location,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResource {
    job_reference: JobReference,
    #[serde(default)]
    status: Option<JobState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobState {
    state: String,
    #[serde(default)]
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn job_status_of(job: &JobResource) -> JobStatus {
    let Some(status) = &job.status else {
        return JobStatus::Pending;
    };
    match status.state.as_str() {
        "DONE" => match &status.error_result {
            Some(err) => JobStatus::Failed(format!(
                "{}: {}",
                err.reason.as_deref().unwrap_or("error"),
                err.message.as_deref().unwrap_or("job failed")
            )),
            None => JobStatus::Done,
        },
        "RUNNING" => JobStatus::Running,
        _ => JobStatus::Pending,
    }
}

fn load_configuration(uri: &str, table: &TableRef, schema: &[ColumnSpec]) -> Value {
    json!({
        "load": {
            "sourceUris": [uri],
            "sourceFormat": "PARQUET",
            "writeDisposition": "WRITE_TRUNCATE",
            "createDisposition": "CREATE_IF_NEEDED",
            "autodetect": false,
            "schema": { "fields": schema },
            "destinationTable": {
                "projectId": table.project,
                "datasetId": table.dataset,
                "tableId": table.table,
            },
        }
    })
}

fn query_configuration(sql: &str) -> Value {
    json!({
        "query": {
            "query": sql,
            "useLegacySql": false,
        }
    })
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn load_parquet(
        &self,
        uri: &str,
        table: &TableRef,
        schema: &[ColumnSpec],
    ) -> Result<JobHandle> {
        let body = json!({
            "jobReference": self.job_reference("etl_load"),
            "configuration": load_configuration(uri, table, schema),
        });
        self.insert_job(body, "landing load").await
    }

    async fn execute(&self, sql: &str) -> Result<JobHandle> {
        let body = json!({
            "jobReference": self.job_reference("etl_query"),
            "configuration": query_configuration(sql),
        });
        self.insert_job(body, "fact rebuild").await
    }

    async fn job_status(&self, job: &JobHandle) -> Result<JobStatus> {
        let token = self.tokens.token().await?;
        let mut request = self
            .client
            .get(format!(
                "{}/projects/{}/jobs/{}",
                self.base_url, self.project, job.id
            ))
            .bearer_auth(token);
        if let Some(location) = job.location.as_ref().or(self.location.as_ref()) {
            request = request.query(&[("location", location.as_str())]);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| EtlError::io("job poll", e))?;
        let resp = check_status(resp, "job poll").await?;
        let resource: JobResource = resp.json().await.map_err(|e| EtlError::io("job poll", e))?;
        Ok(job_status_of(&resource))
    }
}
