//! Wiring from process settings to concrete collaborators.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::artifact::{FsObjectStore, ObjectStore};
use crate::config::{ArtifactStoreKind, Settings};
use crate::error::{EtlError, Result};
use crate::google::{token_source_from_env, BigQueryWarehouse, DriveRepository, GcsObjectStore};
use crate::pipeline::{Pipeline, PipelineTargets};

const USER_AGENT: &str = "ventas-etl/0.1 (sales ingest pipeline)";

/// No total request timeout: streamed downloads are bounded by the wait
/// policy, stalled connections by the read timeout.
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .read_timeout(Duration::from_secs(120))
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| EtlError::config(format!("failed to build HTTP client: {}", e)))
}

/// BigQuery loads only from `gs://` URIs, so a local artifact store is
/// usable for dry runs only.
pub fn check_artifact_store(settings: &Settings, dry_run: bool) -> Result<()> {
    if settings.artifact_store == ArtifactStoreKind::Fs && !dry_run {
        return Err(EtlError::config(
            "ARTIFACT_STORE=fs cannot feed the BigQuery landing load; use gcs or --dry-run",
        ));
    }
    Ok(())
}

/// Build the production pipeline: Drive source, GCS or local artifact
/// store, BigQuery warehouse.
pub async fn build_pipeline(settings: &Settings, dry_run: bool) -> Result<Pipeline> {
    check_artifact_store(settings, dry_run)?;
    let config = settings.pipeline_config().await?;
    let client = http_client()?;
    let tokens = token_source_from_env(client.clone());

    let store: Arc<dyn ObjectStore> = match settings.artifact_store {
        ArtifactStoreKind::Gcs => Arc::new(GcsObjectStore::new(
            client.clone(),
            tokens.clone(),
            &settings.artifact_bucket,
        )),
        ArtifactStoreKind::Fs => Arc::new(FsObjectStore::new(settings.artifact_fs_dir.clone())),
    };

    info!(
        variant = %config.name,
        source = %settings.source_file,
        store = ?settings.artifact_store,
        project = %settings.warehouse_project,
        dataset = %settings.warehouse_dataset,
        "pipeline configured"
    );

    Ok(Pipeline::new(
        config,
        PipelineTargets::from_settings(settings),
        Arc::new(DriveRepository::new(client.clone(), tokens.clone())),
        store,
        Arc::new(BigQueryWarehouse::new(
            client,
            tokens,
            &settings.warehouse_project,
            settings.warehouse_location.clone(),
        )),
    ))
}
