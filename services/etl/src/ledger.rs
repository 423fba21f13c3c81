//! Optional run ledger in Postgres (`job_runs` table, see `sql/job_runs.sql`).
//!
//! Ledger writes never decide a run's outcome: failures are logged and the
//! run carries on.

use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::pipeline::RunOutcome;

const COMPONENT: &str = "etl";

async fn create_job_run(pool: &PgPool, source_id: &str) -> sqlx::Result<Uuid> {
    let job_run_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO job_runs (job_run_id, component, source_id, status, detail)
        VALUES ($1, $2, $3, 'running', '{}')
        "#,
    )
    .bind(job_run_id)
    .bind(COMPONENT)
    .bind(source_id)
    .execute(pool)
    .await?;

    Ok(job_run_id)
}

async fn finish_job_run(
    pool: &PgPool,
    job_run_id: Uuid,
    status: &str,
    detail: &Value,
    error: Option<&str>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE job_runs
        SET finished_at = now(), status = $2, detail = $3, error = $4
        WHERE job_run_id = $1
        "#,
    )
    .bind(job_run_id)
    .bind(status)
    .bind(detail)
    .bind(error)
    .execute(pool)
    .await?;

    Ok(())
}

/// Counters stored in `job_runs.detail`.
pub fn outcome_detail(outcome: &RunOutcome) -> Value {
    match outcome {
        RunOutcome::Success(summary) => json!({
            "run_id": summary.run_id,
            "source_id": summary.source_id,
            "source_hash": summary.source_hash,
            "source_bytes": summary.source_bytes,
            "rows_parsed": summary.rows_parsed,
            "duplicates_dropped": summary.duplicates_dropped,
            "invalid_dropped": summary.invalid_dropped,
            "sentinel_fills": summary.sentinel_fills,
            "invalid_dates": summary.invalid_dates,
            "rows_written": summary.rows_written,
            "artifact_uri": summary.artifact.as_ref().map(|a| a.uri.clone()),
            "landing_job": summary.landing_job,
            "fact_job": summary.fact_job,
        }),
        RunOutcome::NotFound { name, container } => json!({
            "name": name,
            "container": container,
        }),
        RunOutcome::SchemaInvalid(missing) => json!({ "missing": missing }),
        RunOutcome::Failed { stage, .. } => json!({ "last_stage": stage.as_str() }),
    }
}

/// Handle on the ledger; a ledger without a pool records nothing.
#[derive(Clone, Default)]
pub struct RunLedger {
    pool: Option<PgPool>,
}

impl RunLedger {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool: Some(pool) }
    }

    /// Connect when a URL is configured. A failed connection disables the
    /// ledger instead of failing startup.
    pub async fn connect(db_url: Option<&str>) -> Self {
        let Some(url) = db_url else {
            return Self::disabled();
        };
        match PgPoolOptions::new().max_connections(5).connect(url).await {
            Ok(pool) => {
                info!("run ledger connected");
                Self::new(pool)
            }
            Err(e) => {
                warn!(error = %e, "run ledger unavailable, continuing without it");
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    pub async fn start(&self, source_id: &str) -> Option<Uuid> {
        let pool = self.pool.as_ref()?;
        match create_job_run(pool, source_id).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "failed to record job run start");
                None
            }
        }
    }

    pub async fn finish(&self, job_run_id: Option<Uuid>, outcome: &RunOutcome) {
        let (Some(pool), Some(id)) = (self.pool.as_ref(), job_run_id) else {
            return;
        };
        let detail = outcome_detail(outcome);
        let error = outcome.error_detail();
        if let Err(e) = finish_job_run(pool, id, outcome.status(), &detail, error.as_deref()).await
        {
            warn!(job_run_id = %id, error = %e, "failed to record job run finish");
        }
    }
}
