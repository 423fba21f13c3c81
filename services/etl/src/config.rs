//! Process settings (environment) and pipeline variants (JSON or presets).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::error::{EtlError, Result};
use crate::model::Field;

// =============================================================================
// Pipeline variant
// =============================================================================

/// Case transform applied to a categorical field by the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseFold {
    Upper,
    Title,
    Preserve,
}

/// Everything that differs between the sales pipeline variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    /// Raw header -> canonical field. Headers are matched trimmed and
    /// case-insensitively.
    pub mapping: BTreeMap<String, Field>,
    /// Fields that must be present after mapping, in reporting order.
    pub contract: Vec<Field>,
    /// Numeric fields whose null or non-positive values drop the row.
    #[serde(default)]
    pub constrained: Vec<Field>,
    #[serde(default = "default_sentinels")]
    pub sentinels: BTreeMap<Field, String>,
    #[serde(default = "default_case_fold")]
    pub case_fold: BTreeMap<Field, CaseFold>,
    /// chrono formats tried in order; RFC 3339 is always accepted.
    #[serde(default = "default_date_formats")]
    pub date_formats: Vec<String>,
    /// `tipo_venta` is "Alta" above this total.
    #[serde(default = "default_high_value_threshold")]
    pub high_value_threshold: f64,
}

fn default_sentinels() -> BTreeMap<Field, String> {
    BTreeMap::from([
        (Field::Producto, "Desconocido".to_string()),
        (Field::Categoria, "Sin Categoria".to_string()),
        (Field::Region, "Desconocido".to_string()),
        (Field::Cliente, "Desconocido".to_string()),
        (Field::Vendedor, "Desconocido".to_string()),
    ])
}

fn default_case_fold() -> BTreeMap<Field, CaseFold> {
    Field::CATEGORICAL
        .into_iter()
        .map(|f| (f, CaseFold::Upper))
        .collect()
}

fn default_date_formats() -> Vec<String> {
    ["%Y-%m-%d", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%d/%m/%Y", "%d-%m-%Y"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_high_value_threshold() -> f64 {
    1000.0
}

/// Header spellings seen in the sales exports, shared by both presets.
fn sales_mapping(with_id: bool, with_total: bool) -> BTreeMap<String, Field> {
    let mut mapping: BTreeMap<String, Field> = [
        ("fecha", Field::Fecha),
        ("fecha venta", Field::Fecha),
        ("fecha_venta", Field::Fecha),
        ("producto", Field::Producto),
        ("categoria", Field::Categoria),
        ("categoría", Field::Categoria),
        ("region", Field::Region),
        ("región", Field::Region),
        ("cliente", Field::Cliente),
        ("vendedor", Field::Vendedor),
        ("cantidad", Field::Cantidad),
        ("precio_unitario", Field::PrecioUnitario),
        ("precio unitario", Field::PrecioUnitario),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    if with_id {
        mapping.insert("id".to_string(), Field::Id);
        mapping.insert("id_venta".to_string(), Field::Id);
    }
    if with_total {
        mapping.insert("total_venta".to_string(), Field::TotalVenta);
        mapping.insert("total venta".to_string(), Field::TotalVenta);
    }
    mapping
}

impl PipelineConfig {
    /// Invoice export: carries `id` and a sourced `total_venta`; every
    /// categorical field is upper-cased.
    pub fn facturas() -> Self {
        Self {
            name: "facturas".to_string(),
            mapping: sales_mapping(true, true),
            contract: Field::ALL.to_vec(),
            constrained: vec![Field::PrecioUnitario, Field::Cantidad, Field::TotalVenta],
            sentinels: default_sentinels(),
            case_fold: default_case_fold(),
            date_formats: default_date_formats(),
            high_value_threshold: default_high_value_threshold(),
        }
    }

    /// Plain sales export: no `id`, no sourced total; people are title-cased.
    pub fn ventas() -> Self {
        let mut case_fold = default_case_fold();
        case_fold.insert(Field::Cliente, CaseFold::Title);
        case_fold.insert(Field::Vendedor, CaseFold::Title);
        Self {
            name: "ventas".to_string(),
            mapping: sales_mapping(false, false),
            contract: vec![
                Field::Fecha,
                Field::Producto,
                Field::Categoria,
                Field::Region,
                Field::Cliente,
                Field::Vendedor,
                Field::Cantidad,
                Field::PrecioUnitario,
            ],
            constrained: vec![Field::PrecioUnitario, Field::Cantidad],
            sentinels: default_sentinels(),
            case_fold,
            date_formats: default_date_formats(),
            high_value_threshold: default_high_value_threshold(),
        }
    }

    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "facturas" => Ok(Self::facturas()),
            "ventas" => Ok(Self::ventas()),
            other => Err(EtlError::config(format!(
                "unknown pipeline variant '{}' (expected facturas or ventas)",
                other
            ))),
        }
    }

    pub fn contract_includes(&self, field: Field) -> bool {
        self.contract.contains(&field)
    }

    pub fn case_fold_for(&self, field: Field) -> CaseFold {
        self.case_fold
            .get(&field)
            .copied()
            .unwrap_or(CaseFold::Preserve)
    }

    /// Reject variants the pipeline cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.contract.is_empty() {
            return Err(EtlError::config(format!(
                "variant '{}' has an empty schema contract",
                self.name
            )));
        }

        for field in &self.constrained {
            if !field.is_numeric() {
                return Err(EtlError::config(format!(
                    "constrained field '{}' is not numeric",
                    field
                )));
            }
            // A constraint on an absent column would drop every row
            if !self.contract_includes(*field) {
                return Err(EtlError::config(format!(
                    "constrained field '{}' is not in the schema contract",
                    field
                )));
            }
        }

        for field in &self.contract {
            if !self.mapping.values().any(|f| f == field) {
                return Err(EtlError::config(format!(
                    "contract field '{}' is not produced by any mapping entry",
                    field
                )));
            }
        }

        for field in Field::CATEGORICAL {
            if !self.sentinels.contains_key(&field) {
                return Err(EtlError::config(format!(
                    "no sentinel configured for '{}'",
                    field
                )));
            }
        }

        if self.date_formats.is_empty() {
            return Err(EtlError::config("at least one date format is required"));
        }

        Ok(())
    }
}

/// Load a variant from a JSON file and validate it.
pub async fn load_pipeline_config(path: &Path) -> Result<PipelineConfig> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        EtlError::config(format!("failed to read {}: {}", path.display(), e))
    })?;
    let config: PipelineConfig = serde_json::from_str(&content).map_err(|e| {
        EtlError::config(format!("failed to parse {}: {}", path.display(), e))
    })?;
    config.validate()?;
    Ok(config)
}

// =============================================================================
// Blocking waits
// =============================================================================

/// Bounds applied at every suspension point (chunked download, job polling).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    /// `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            timeout: None,
        }
    }
}

// =============================================================================
// Process settings
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactStoreKind {
    Gcs,
    Fs,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub source_file: String,
    pub source_folder: String,
    pub artifact_store: ArtifactStoreKind,
    pub artifact_bucket: String,
    pub artifact_path: String,
    pub artifact_fs_dir: PathBuf,
    pub warehouse_project: String,
    pub warehouse_dataset: String,
    pub warehouse_location: Option<String>,
    pub landing_table: String,
    pub fact_table: String,
    pub wait: WaitPolicy,
    pub variant: String,
    pub pipeline_config: Option<PathBuf>,
    pub db_url: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| EtlError::config(format!("{} env var missing", key)))
        };
        let or_default = |key: &str, default: &str| {
            lookup(key).unwrap_or_else(|| default.to_string())
        };

        let artifact_store = match or_default("ARTIFACT_STORE", "gcs").as_str() {
            "gcs" => ArtifactStoreKind::Gcs,
            "fs" => ArtifactStoreKind::Fs,
            other => {
                return Err(EtlError::config(format!(
                    "ARTIFACT_STORE must be 'gcs' or 'fs', got '{}'",
                    other
                )))
            }
        };

        let poll_ms: u64 = or_default("JOB_POLL_INTERVAL_MS", "1000")
            .parse()
            .unwrap_or(1000);
        let timeout = lookup("JOB_TIMEOUT_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Self {
            source_file: or_default("SOURCE_FILE_NAME", "ventas_2025.csv"),
            source_folder: required("SOURCE_FOLDER_ID")?,
            artifact_store,
            artifact_bucket: or_default("ARTIFACT_BUCKET", "data-dev-test-processed"),
            artifact_path: or_default(
                "ARTIFACT_PATH",
                "ventas/facturas/actual/ventas_2025.parquet",
            ),
            artifact_fs_dir: PathBuf::from(or_default("ARTIFACT_FS_DIR", "./data/artifacts")),
            warehouse_project: required("BQ_PROJECT")?,
            warehouse_dataset: or_default("BQ_DATASET", "ventas"),
            warehouse_location: lookup("BQ_LOCATION"),
            landing_table: or_default("BQ_LANDING_TABLE", "ventas_raw"),
            fact_table: or_default("BQ_FACT_TABLE", "fact_ventas"),
            wait: WaitPolicy {
                poll_interval: Duration::from_millis(poll_ms),
                timeout,
            },
            variant: or_default("PIPELINE_VARIANT", "facturas"),
            pipeline_config: lookup("PIPELINE_CONFIG").map(PathBuf::from),
            db_url: lookup("DB_URL").filter(|v| !v.is_empty()),
        })
    }

    /// Resolve the active variant: the JSON file wins over the preset name.
    pub async fn pipeline_config(&self) -> Result<PipelineConfig> {
        match &self.pipeline_config {
            Some(path) => load_pipeline_config(path).await,
            None => {
                let config = PipelineConfig::preset(&self.variant)?;
                config.validate()?;
                Ok(config)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_presets_are_valid() {
        PipelineConfig::facturas().validate().unwrap();
        PipelineConfig::ventas().validate().unwrap();
    }

    #[test]
    fn test_unknown_preset_fails() {
        let err = PipelineConfig::preset("compras").unwrap_err();
        assert!(err.to_string().contains("compras"));
    }

    #[test]
    fn test_validate_rejects_non_numeric_constraint() {
        let mut config = PipelineConfig::ventas();
        config.constrained.push(Field::Region);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("region"));
    }

    #[test]
    fn test_validate_rejects_constraint_outside_contract() {
        let mut config = PipelineConfig::ventas();
        config
            .mapping
            .insert("total_venta".to_string(), Field::TotalVenta);
        config.constrained.push(Field::TotalVenta);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, EtlError::Config(_)));
        assert!(err.to_string().contains("'total_venta' is not in the schema contract"));
    }

    #[test]
    fn test_validate_rejects_unmapped_contract_field() {
        let mut config = PipelineConfig::ventas();
        config.contract.push(Field::Id);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("'id'"));
    }

    #[test]
    fn test_variant_json_uses_defaults() {
        let json = r#"{
            "name": "minimal",
            "mapping": {"Producto": "producto", "Cant": "cantidad"},
            "contract": ["producto", "cantidad"],
            "constrained": ["cantidad"]
        }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.mapping["Cant"], Field::Cantidad);
        assert_eq!(config.sentinels[&Field::Categoria], "Sin Categoria");
        assert_eq!(config.case_fold_for(Field::Cliente), CaseFold::Upper);
        assert_eq!(config.high_value_threshold, 1000.0);
        config.validate().unwrap();
    }

    #[test]
    fn test_settings_require_folder_and_project() {
        let err = Settings::from_lookup(lookup(&[("BQ_PROJECT", "p")])).unwrap_err();
        assert!(err.to_string().contains("SOURCE_FOLDER_ID"));

        let err = Settings::from_lookup(lookup(&[("SOURCE_FOLDER_ID", "f")])).unwrap_err();
        assert!(err.to_string().contains("BQ_PROJECT"));
    }

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::from_lookup(lookup(&[
            ("SOURCE_FOLDER_ID", "folder-1"),
            ("BQ_PROJECT", "proj"),
        ]))
        .unwrap();
        assert_eq!(settings.source_file, "ventas_2025.csv");
        assert_eq!(settings.artifact_store, ArtifactStoreKind::Gcs);
        assert_eq!(settings.artifact_path, "ventas/facturas/actual/ventas_2025.parquet");
        assert_eq!(settings.wait.timeout, None);
        assert_eq!(settings.variant, "facturas");
        assert!(settings.db_url.is_none());
    }

    #[test]
    fn test_settings_timeout_and_store() {
        let settings = Settings::from_lookup(lookup(&[
            ("SOURCE_FOLDER_ID", "folder-1"),
            ("BQ_PROJECT", "proj"),
            ("ARTIFACT_STORE", "fs"),
            ("JOB_TIMEOUT_SECS", "30"),
            ("JOB_POLL_INTERVAL_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(settings.artifact_store, ArtifactStoreKind::Fs);
        assert_eq!(settings.wait.timeout, Some(Duration::from_secs(30)));
        assert_eq!(settings.wait.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_settings_reject_unknown_store() {
        let err = Settings::from_lookup(lookup(&[
            ("SOURCE_FOLDER_ID", "folder-1"),
            ("BQ_PROJECT", "proj"),
            ("ARTIFACT_STORE", "s3"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("s3"));
    }

    #[tokio::test]
    async fn test_sample_variant_file_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/pipeline.json");
        let config = load_pipeline_config(&path).await.unwrap();
        assert_eq!(config.name, "ventas-regional");
        assert_eq!(config.case_fold_for(Field::Cliente), CaseFold::Title);
        assert_eq!(config.high_value_threshold, 2500.0);
        assert!(!config.contract_includes(Field::TotalVenta));
    }

    #[tokio::test]
    async fn test_load_pipeline_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("variant.json");
        let json = serde_json::to_string(&PipelineConfig::ventas()).unwrap();
        tokio::fs::write(&path, json).await.unwrap();

        let config = load_pipeline_config(&path).await.unwrap();
        assert_eq!(config, PipelineConfig::ventas());
    }
}
