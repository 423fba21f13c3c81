//! Orchestrator: one pipeline invocation from source lookup to fact rebuild.
//!
//! Stages run strictly in order and any error ends the run. Side effects
//! that already happened (artifact write, landing load) are not undone when
//! a later stage fails.

use std::fmt;
use std::sync::Arc;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::artifact::{encode_parquet, ArtifactRef, ObjectStore};
use crate::clean::clean;
use crate::config::{PipelineConfig, Settings, WaitPolicy};
use crate::error::{EtlError, Result};
use crate::model::{ColumnSet, Field};
use crate::normalize::normalize;
use crate::parse::{map_columns, parse_table, validate_schema};
use crate::source::{fetch, locate, DocumentRepository};
use crate::warehouse::{load_landing, rebuild_fact_table, FactRow, TableRef, Warehouse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Located,
    Fetched,
    Parsed,
    Mapped,
    Validated,
    Cleaned,
    Normalized,
    Written,
    Loaded,
    Transformed,
    Done,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Located => "located",
            Stage::Fetched => "fetched",
            Stage::Parsed => "parsed",
            Stage::Mapped => "mapped",
            Stage::Validated => "validated",
            Stage::Cleaned => "cleaned",
            Stage::Normalized => "normalized",
            Stage::Written => "written",
            Stage::Loaded => "loaded",
            Stage::Transformed => "transformed",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where one invocation reads from and writes to.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineTargets {
    pub source_name: String,
    pub source_container: String,
    pub artifact_path: String,
    pub landing: TableRef,
    pub fact: TableRef,
    pub wait: WaitPolicy,
}

impl PipelineTargets {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            source_name: settings.source_file.clone(),
            source_container: settings.source_folder.clone(),
            artifact_path: settings.artifact_path.clone(),
            landing: TableRef::new(
                &settings.warehouse_project,
                &settings.warehouse_dataset,
                &settings.landing_table,
            ),
            fact: TableRef::new(
                &settings.warehouse_project,
                &settings.warehouse_dataset,
                &settings.fact_table,
            ),
            wait: settings.wait,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Stop after normalization; nothing is written anywhere.
    pub dry_run: bool,
    /// Number of derived fact rows kept in the summary.
    pub preview_rows: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub source_hash: String,
    pub source_bytes: usize,
    pub rows_parsed: usize,
    pub duplicates_dropped: usize,
    pub invalid_dropped: usize,
    pub sentinel_fills: usize,
    pub invalid_dates: usize,
    pub rows_written: usize,
    pub artifact: Option<ArtifactRef>,
    pub landing_job: Option<String>,
    pub fact_job: Option<String>,
    pub preview: Vec<FactRow>,
}

/// Terminal result of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Success(RunSummary),
    NotFound { name: String, container: String },
    SchemaInvalid(Vec<Field>),
    Failed { stage: Stage, detail: String },
}

impl RunOutcome {
    fn from_error(err: EtlError, stage: Stage) -> Self {
        match err {
            EtlError::NotFound { name, container } => RunOutcome::NotFound { name, container },
            EtlError::Schema { missing } => RunOutcome::SchemaInvalid(missing),
            other => RunOutcome::Failed {
                stage,
                detail: other.to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success(_))
    }

    /// Short status used by the run ledger.
    pub fn status(&self) -> &'static str {
        match self {
            RunOutcome::Success(_) => "ok",
            RunOutcome::NotFound { .. } => "not_found",
            RunOutcome::SchemaInvalid(_) => "schema_invalid",
            RunOutcome::Failed { .. } => "failed",
        }
    }

    /// Human-readable detail for anything but success.
    pub fn error_detail(&self) -> Option<String> {
        match self {
            RunOutcome::Success(_) => None,
            RunOutcome::NotFound { name, container } => Some(
                EtlError::NotFound {
                    name: name.clone(),
                    container: container.clone(),
                }
                .to_string(),
            ),
            RunOutcome::SchemaInvalid(missing) => Some(
                EtlError::Schema {
                    missing: missing.clone(),
                }
                .to_string(),
            ),
            RunOutcome::Failed { stage, detail } => {
                Some(format!("{} (after stage '{}')", detail, stage))
            }
        }
    }
}

/// Tracks the state machine of one run for logging and failure reports.
struct Progress {
    reached: Option<Stage>,
}

impl Progress {
    fn reach(&mut self, stage: Stage) {
        self.reached = Some(stage);
        info!(stage = %stage, "stage reached");
    }

    /// Last completed stage; `Located` is reported for failures before it.
    fn last(&self) -> Stage {
        self.reached.unwrap_or(Stage::Located)
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    targets: PipelineTargets,
    repository: Arc<dyn DocumentRepository>,
    store: Arc<dyn ObjectStore>,
    warehouse: Arc<dyn Warehouse>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        targets: PipelineTargets,
        repository: Arc<dyn DocumentRepository>,
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self {
            config,
            targets,
            repository,
            store,
            warehouse,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn targets(&self) -> &PipelineTargets {
        &self.targets
    }

    /// Run one invocation. Never fails: every error becomes a `RunOutcome`.
    pub async fn run(&self, options: RunOptions) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id, variant = %self.config.name);
        async {
            let mut progress = Progress { reached: None };
            let outcome = match self.execute(run_id, options, &mut progress).await {
                Ok(summary) => RunOutcome::Success(summary),
                Err(err) => {
                    warn!(stage = %progress.last(), error = %err, "run failed");
                    RunOutcome::from_error(err, progress.last())
                }
            };
            info!(status = outcome.status(), "run finished");
            outcome
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        options: RunOptions,
        progress: &mut Progress,
    ) -> Result<RunSummary> {
        let targets = &self.targets;
        let config = &self.config;

        let handle = locate(
            self.repository.as_ref(),
            &targets.source_name,
            &targets.source_container,
        )
        .await?;
        progress.reach(Stage::Located);

        let source = fetch(self.repository.as_ref(), &handle, &targets.wait).await?;
        progress.reach(Stage::Fetched);

        let raw = parse_table(&source.bytes)?;
        progress.reach(Stage::Parsed);

        let mapped = map_columns(&raw, &config.mapping);
        progress.reach(Stage::Mapped);

        validate_schema(&mapped, &config.contract)?;
        progress.reach(Stage::Validated);

        let columns = ColumnSet::from_columns(&mapped.columns);
        let (rows, stats) = clean(mapped, config);
        if stats.invalid_dropped > 0 {
            warn!(dropped = stats.invalid_dropped, "rows failed numeric constraints");
        }
        progress.reach(Stage::Cleaned);

        let (table, invalid_dates) = normalize(rows, columns, config);
        if invalid_dates > 0 {
            warn!(invalid_dates, "unparseable fecha values set to null");
        }
        progress.reach(Stage::Normalized);

        let mut summary = RunSummary {
            run_id,
            source_id: handle.id.clone(),
            source_hash: source.content_hash.clone(),
            source_bytes: source.bytes.len(),
            rows_parsed: stats.rows_in,
            duplicates_dropped: stats.duplicates_dropped,
            invalid_dropped: stats.invalid_dropped,
            sentinel_fills: stats.sentinel_fills,
            invalid_dates,
            rows_written: table.len(),
            artifact: None,
            landing_job: None,
            fact_job: None,
            preview: table
                .records
                .iter()
                .take(options.preview_rows)
                .map(|r| FactRow::derive(r, config.high_value_threshold))
                .collect(),
        };

        if options.dry_run {
            info!(rows = table.len(), "dry run - skipping artifact, load and rebuild");
            return Ok(summary);
        }

        let bytes = encode_parquet(&table)?;
        let artifact = self.store.put(&targets.artifact_path, bytes).await?;
        progress.reach(Stage::Written);

        let landing_job = load_landing(
            self.warehouse.as_ref(),
            &artifact.uri,
            &targets.landing,
            table.columns,
            &targets.wait,
        )
        .await?;
        summary.artifact = Some(artifact);
        summary.landing_job = Some(landing_job.id);
        progress.reach(Stage::Loaded);

        let fact_job = rebuild_fact_table(
            self.warehouse.as_ref(),
            &targets.landing,
            &targets.fact,
            config.high_value_threshold,
            &targets.wait,
        )
        .await?;
        summary.fact_job = Some(fact_job.id);
        progress.reach(Stage::Transformed);

        progress.reach(Stage::Done);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryObjectStore, MemoryRepository, MemoryWarehouse, SubmittedJob};
    use arrow::array::{Array, Int64Array, StringArray};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::time::Duration;

    const FOLDER: &str = "17CFr15ij";
    const FILE: &str = "ventas_2025.csv";

    const SCENARIO: &str = "\
id,fecha,producto,categoria,region,cliente,vendedor,cantidad,precio_unitario,total_venta
1,2025-01-10,silla,muebles,norte,ana,luis,2,50.0,100
1,2025-01-10,silla,muebles,norte,ana,luis,2,50.0,100
2,2025-01-11,mesa,muebles,sur,eva,rita,-1,80.0,80
";

    struct Harness {
        repository: Arc<MemoryRepository>,
        store: Arc<MemoryObjectStore>,
        warehouse: Arc<MemoryWarehouse>,
    }

    impl Harness {
        fn new(content: Option<&str>) -> Self {
            let mut repo = MemoryRepository::new(FOLDER).with_chunk_size(16);
            if let Some(content) = content {
                repo = repo.with_file(FILE, content.as_bytes());
            }
            Self {
                repository: Arc::new(repo),
                store: Arc::new(MemoryObjectStore::new()),
                warehouse: Arc::new(MemoryWarehouse::new()),
            }
        }

        fn with_store(mut self, store: MemoryObjectStore) -> Self {
            self.store = Arc::new(store);
            self
        }

        fn with_warehouse(mut self, warehouse: MemoryWarehouse) -> Self {
            self.warehouse = Arc::new(warehouse);
            self
        }

        fn pipeline(&self, config: PipelineConfig) -> Pipeline {
            let targets = PipelineTargets {
                source_name: FILE.to_string(),
                source_container: FOLDER.to_string(),
                artifact_path: "ventas/facturas/actual/ventas_2025.parquet".to_string(),
                landing: TableRef::new("proj", "ventas", "ventas_raw"),
                fact: TableRef::new("proj", "ventas", "fact_ventas"),
                wait: WaitPolicy {
                    poll_interval: Duration::from_millis(1),
                    timeout: Some(Duration::from_secs(5)),
                },
            };
            Pipeline::new(
                config,
                targets,
                self.repository.clone(),
                self.store.clone(),
                self.warehouse.clone(),
            )
        }

        fn artifact(&self) -> Option<bytes::Bytes> {
            self.store.get("ventas/facturas/actual/ventas_2025.parquet")
        }

        fn no_writes(&self) -> bool {
            self.store.writes() == 0 && self.warehouse.submitted().is_empty()
        }
    }

    fn summary(outcome: RunOutcome) -> RunSummary {
        match outcome {
            RunOutcome::Success(summary) => summary,
            other => panic!("expected success, got {other:?}"),
        }
    }

    // -------------------------------------------------------------------------
    // HAPPY PATH
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_scenario_dedup_filter_and_normalize() {
        let harness = Harness::new(Some(SCENARIO));
        let outcome = harness
            .pipeline(PipelineConfig::facturas())
            .run(RunOptions::default())
            .await;
        let summary = summary(outcome);

        assert_eq!(summary.rows_parsed, 3);
        assert_eq!(summary.duplicates_dropped, 1);
        assert_eq!(summary.invalid_dropped, 1);
        assert_eq!(summary.rows_written, 1);

        let reader = ParquetRecordBatchReaderBuilder::try_new(harness.artifact().unwrap())
            .unwrap()
            .build()
            .unwrap();
        let batch = reader.into_iter().next().unwrap().unwrap();
        assert_eq!(batch.num_rows(), 1);

        let col = |name: &str| batch.column(batch.schema().index_of(name).unwrap()).clone();
        let ids = col("id");
        let ids = ids.as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(ids.value(0), 1);
        let productos = col("producto");
        let productos = productos.as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(productos.value(0), "SILLA");
        let cantidades = col("cantidad");
        let cantidades = cantidades.as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(cantidades.value(0), 2);
        assert!(col("fecha").is_valid(0));
    }

    #[tokio::test]
    async fn test_success_runs_load_then_rebuild() {
        let harness = Harness::new(Some(SCENARIO));
        let summary = summary(
            harness
                .pipeline(PipelineConfig::facturas())
                .run(RunOptions::default())
                .await,
        );

        let artifact = summary.artifact.unwrap();
        assert_eq!(artifact.uri, "mem://ventas/facturas/actual/ventas_2025.parquet");
        assert!(summary.landing_job.is_some());
        assert!(summary.fact_job.is_some());

        let jobs = harness.warehouse.submitted();
        assert_eq!(jobs.len(), 2);
        match &jobs[0] {
            SubmittedJob::Load { uri, table, schema } => {
                assert_eq!(uri, &artifact.uri);
                assert_eq!(table, "proj.ventas.ventas_raw");
                assert_eq!(schema.len(), 10);
            }
            other => panic!("expected load first, got {other:?}"),
        }
        match &jobs[1] {
            SubmittedJob::Query { sql } => {
                assert!(sql.contains("`proj.ventas.fact_ventas`"));
                assert!(sql.contains("FROM `proj.ventas.ventas_raw`"));
            }
            other => panic!("expected rebuild second, got {other:?}"),
        }

        let tables = harness.warehouse.tables();
        assert_eq!(tables["proj.ventas.ventas_raw"], artifact.uri);
        assert!(tables.contains_key("proj.ventas.fact_ventas"));
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let harness = Harness::new(Some(SCENARIO));
        let pipeline = harness.pipeline(PipelineConfig::facturas());

        let first = summary(pipeline.run(RunOptions::default()).await);
        let artifact_after_first = harness.artifact().unwrap();
        let tables_after_first = harness.warehouse.tables();

        let second = summary(pipeline.run(RunOptions::default()).await);
        assert_eq!(harness.artifact().unwrap(), artifact_after_first);
        assert_eq!(harness.warehouse.tables(), tables_after_first);
        assert_eq!(harness.store.object_count(), 1);
        assert_eq!(first.artifact, second.artifact);
        assert_eq!(first.rows_written, second.rows_written);
    }

    #[tokio::test]
    async fn test_title_case_variant_with_null_fill() {
        let csv = "Fecha,Producto,Categoría,Región,Cliente,Vendedor,Cantidad,Precio Unitario\n\
                   2025-03-01,,sillas,norte,juan PEREZ,maria lopez,3,600\n\
                   2025-03-02,lampara,,sur,,ana ruiz,2,10\n";
        let harness = Harness::new(Some(csv));
        let outcome = harness
            .pipeline(PipelineConfig::ventas())
            .run(RunOptions {
                dry_run: true,
                preview_rows: 10,
            })
            .await;
        let summary = summary(outcome);

        assert_eq!(summary.rows_written, 2);
        assert_eq!(summary.sentinel_fills, 3);
        let first = &summary.preview[0];
        assert_eq!(first.record.producto, "DESCONOCIDO");
        assert_eq!(first.record.cliente, "Juan Perez");
        assert_eq!(first.total, Some(1800.0));
        assert_eq!(first.tipo_venta, "Alta");
        let second = &summary.preview[1];
        assert_eq!(second.record.categoria, "SIN CATEGORIA");
        assert_eq!(second.record.cliente, "Desconocido");
        assert_eq!(second.tipo_venta, "Baja");
    }

    #[tokio::test]
    async fn test_dry_run_performs_no_writes() {
        let harness = Harness::new(Some(SCENARIO));
        let summary = summary(
            harness
                .pipeline(PipelineConfig::facturas())
                .run(RunOptions {
                    dry_run: true,
                    preview_rows: 5,
                })
                .await,
        );
        assert!(summary.artifact.is_none());
        assert_eq!(summary.preview.len(), 1);
        assert!(harness.no_writes());
    }

    // -------------------------------------------------------------------------
    // FAILURE PATHS
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_missing_source_is_not_found_without_writes() {
        let harness = Harness::new(None);
        let outcome = harness
            .pipeline(PipelineConfig::facturas())
            .run(RunOptions::default())
            .await;
        assert_eq!(
            outcome,
            RunOutcome::NotFound {
                name: FILE.to_string(),
                container: FOLDER.to_string()
            }
        );
        assert_eq!(outcome.status(), "not_found");
        assert!(harness.no_writes());
    }

    #[tokio::test]
    async fn test_missing_columns_is_schema_invalid_without_writes() {
        let csv = "fecha,producto,categoria,region,cliente,vendedor,cantidad,precio_unitario\n\
                   2025-01-10,silla,muebles,norte,ana,luis,2,50\n";
        let harness = Harness::new(Some(csv));
        let outcome = harness
            .pipeline(PipelineConfig::facturas())
            .run(RunOptions::default())
            .await;
        assert_eq!(
            outcome,
            RunOutcome::SchemaInvalid(vec![Field::Id, Field::TotalVenta])
        );
        assert!(outcome
            .error_detail()
            .unwrap()
            .contains("id, total_venta"));
        assert!(harness.no_writes());
    }

    #[tokio::test]
    async fn test_empty_source_is_parse_failure() {
        let harness = Harness::new(Some(""));
        let outcome = harness
            .pipeline(PipelineConfig::facturas())
            .run(RunOptions::default())
            .await;
        match outcome {
            RunOutcome::Failed { stage, detail } => {
                assert_eq!(stage, Stage::Fetched);
                assert!(detail.contains("empty"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(harness.no_writes());
    }

    #[tokio::test]
    async fn test_download_failure_is_reported() {
        let harness = Harness {
            repository: Arc::new(
                MemoryRepository::new(FOLDER)
                    .with_file(FILE, SCENARIO.as_bytes())
                    .failing_download("connection reset"),
            ),
            ..Harness::new(None)
        };
        let outcome = harness
            .pipeline(PipelineConfig::facturas())
            .run(RunOptions::default())
            .await;
        match outcome {
            RunOutcome::Failed { stage, detail } => {
                assert_eq!(stage, Stage::Located);
                assert!(detail.contains("connection reset"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_artifact_write_failure_stops_before_load() {
        let harness =
            Harness::new(Some(SCENARIO)).with_store(MemoryObjectStore::failing("bucket missing"));
        let outcome = harness
            .pipeline(PipelineConfig::facturas())
            .run(RunOptions::default())
            .await;
        match outcome {
            RunOutcome::Failed { stage, detail } => {
                assert_eq!(stage, Stage::Normalized);
                assert!(detail.contains("bucket missing"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(harness.warehouse.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_failure_keeps_earlier_side_effects() {
        let harness = Harness::new(Some(SCENARIO))
            .with_warehouse(MemoryWarehouse::new().fail_queries_with("syntax error"));
        let outcome = harness
            .pipeline(PipelineConfig::facturas())
            .run(RunOptions::default())
            .await;
        match &outcome {
            RunOutcome::Failed { stage, detail } => {
                assert_eq!(*stage, Stage::Loaded);
                assert!(detail.contains("fact rebuild failed: syntax error"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        // No rollback: artifact and landing table stay as written
        assert!(harness.artifact().is_some());
        let tables = harness.warehouse.tables();
        assert!(tables.contains_key("proj.ventas.ventas_raw"));
        assert!(!tables.contains_key("proj.ventas.fact_ventas"));
    }
}
