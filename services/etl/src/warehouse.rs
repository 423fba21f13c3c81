//! Landing-table load and fact-table rebuild against the analytical
//! warehouse. Both are remote jobs the pipeline blocks on.

use async_trait::async_trait;
use chrono::Datelike;
use serde::Serialize;
use std::fmt;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::config::WaitPolicy;
use crate::error::{EtlError, Result};
use crate::model::{ColumnSet, Field, SalesRecord};

// =============================================================================
// Collaborator contract
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(project: &str, dataset: &str, table: &str) -> Self {
        Self {
            project: project.to_string(),
            dataset: dataset.to_string(),
            table: table.to_string(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    Int64,
    Float64,
    String,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnMode {
    Required,
    Nullable,
}

/// One column of a hand-specified load schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub mode: ColumnMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed(String),
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Start a full-replace load of the Parquet artifact at `uri` into `table`.
    async fn load_parquet(
        &self,
        uri: &str,
        table: &TableRef,
        schema: &[ColumnSpec],
    ) -> Result<JobHandle>;

    /// Start a standard SQL statement.
    async fn execute(&self, sql: &str) -> Result<JobHandle>;

    async fn job_status(&self, job: &JobHandle) -> Result<JobStatus>;
}

/// Block until the job is terminal. A job still pending when the policy's
/// timeout elapses is a `TransientIo` failure.
pub async fn wait_for_job(
    warehouse: &dyn Warehouse,
    job: &JobHandle,
    wait: &WaitPolicy,
    operation: &'static str,
) -> Result<()> {
    let started = Instant::now();
    loop {
        match warehouse.job_status(job).await? {
            JobStatus::Done => return Ok(()),
            JobStatus::Failed(reason) => return Err(EtlError::io(operation, reason)),
            state => debug!(job_id = %job.id, ?state, "job not finished"),
        }
        if let Some(limit) = wait.timeout {
            if started.elapsed() >= limit {
                return Err(EtlError::io(
                    operation,
                    format!("job {} still pending after {:?}", job.id, limit),
                ));
            }
        }
        sleep(wait.poll_interval).await;
    }
}

// =============================================================================
// Loader
// =============================================================================

fn column_spec(field: Field) -> ColumnSpec {
    let column_type = match field {
        Field::Id | Field::Cantidad => ColumnType::Int64,
        Field::PrecioUnitario | Field::TotalVenta => ColumnType::Float64,
        Field::Fecha => ColumnType::Timestamp,
        _ => ColumnType::String,
    };
    let mode = if field.is_categorical() {
        ColumnMode::Required
    } else {
        ColumnMode::Nullable
    };
    ColumnSpec {
        name: field.as_str().to_string(),
        column_type,
        mode,
    }
}

/// Explicit landing schema, matching the artifact column for column.
pub fn landing_schema(columns: ColumnSet) -> Vec<ColumnSpec> {
    columns.fields().into_iter().map(column_spec).collect()
}

/// Replace the landing table with the artifact's contents.
pub async fn load_landing(
    warehouse: &dyn Warehouse,
    artifact_uri: &str,
    landing: &TableRef,
    columns: ColumnSet,
    wait: &WaitPolicy,
) -> Result<JobHandle> {
    let schema = landing_schema(columns);
    let job = warehouse.load_parquet(artifact_uri, landing, &schema).await?;
    info!(job_id = %job.id, table = %landing, uri = artifact_uri, "load job started");
    wait_for_job(warehouse, &job, wait, "landing load").await?;
    info!(job_id = %job.id, table = %landing, "landing table replaced");
    Ok(job)
}

// =============================================================================
// Transformer
// =============================================================================

/// Full rebuild of the fact table from the landing table.
pub fn fact_table_sql(landing: &TableRef, fact: &TableRef, high_value_threshold: f64) -> String {
    format!(
        r#"CREATE OR REPLACE TABLE `{fact}`
PARTITION BY DATE(fecha)
CLUSTER BY region
AS
SELECT
  *,
  precio_unitario * cantidad AS total,
  EXTRACT(MONTH FROM fecha) AS mes,
  CASE WHEN precio_unitario * cantidad > {threshold} THEN 'Alta' ELSE 'Baja' END AS tipo_venta
FROM `{landing}`"#,
        fact = fact,
        landing = landing,
        threshold = high_value_threshold,
    )
}

pub async fn rebuild_fact_table(
    warehouse: &dyn Warehouse,
    landing: &TableRef,
    fact: &TableRef,
    high_value_threshold: f64,
    wait: &WaitPolicy,
) -> Result<JobHandle> {
    let sql = fact_table_sql(landing, fact, high_value_threshold);
    let job = warehouse.execute(&sql).await?;
    info!(job_id = %job.id, table = %fact, "fact rebuild started");
    wait_for_job(warehouse, &job, wait, "fact rebuild").await?;
    info!(job_id = %job.id, table = %fact, "fact table rebuilt");
    Ok(job)
}

/// In-process rendition of the rebuild's derived columns, used for dry-run
/// previews. Must agree with [`fact_table_sql`].
#[derive(Debug, Clone, PartialEq)]
pub struct FactRow {
    pub record: SalesRecord,
    pub total: Option<f64>,
    pub mes: Option<u32>,
    pub tipo_venta: &'static str,
}

impl FactRow {
    pub fn derive(record: &SalesRecord, high_value_threshold: f64) -> Self {
        let total = match (record.precio_unitario, record.cantidad) {
            (Some(price), Some(qty)) => Some(price * qty as f64),
            _ => None,
        };
        // SQL CASE falls through to ELSE when total is NULL
        let tipo_venta = match total {
            Some(t) if t > high_value_threshold => "Alta",
            _ => "Baja",
        };
        Self {
            record: record.clone(),
            total,
            mes: record.fecha.map(|f| f.month()),
            tipo_venta,
        }
    }
}
