//! Columnar artifact: Parquet serialization of the final table and the
//! object store it is persisted to.

use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field as ArrowField, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::info;

use crate::error::{EtlError, Result};
use crate::model::{Field, SalesRecord, SalesTable};
use crate::source::content_hash;

/// Where the artifact ended up. `uri` is what the warehouse loads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub uri: String,
    pub size_bytes: usize,
    pub content_hash: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `bytes` at `path`, replacing whatever is there.
    async fn put(&self, path: &str, bytes: Bytes) -> Result<ArtifactRef>;
}

// =============================================================================
// Parquet encoding
// =============================================================================

fn arrow_type(field: Field) -> DataType {
    match field {
        Field::Id | Field::Cantidad => DataType::Int64,
        Field::PrecioUnitario | Field::TotalVenta => DataType::Float64,
        Field::Fecha => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        Field::Producto
        | Field::Categoria
        | Field::Region
        | Field::Cliente
        | Field::Vendedor => DataType::Utf8,
    }
}

/// Arrow schema of the artifact. Categoricals are non-null; the rest may be.
pub fn artifact_schema(fields: &[Field]) -> Arc<Schema> {
    Arc::new(Schema::new(
        fields
            .iter()
            .map(|f| ArrowField::new(f.as_str(), arrow_type(*f), !f.is_categorical()))
            .collect::<Vec<_>>(),
    ))
}

fn text_column<'a>(values: impl Iterator<Item = &'a str>) -> ArrayRef {
    Arc::new(StringArray::from(values.collect::<Vec<_>>()))
}

fn column(field: Field, records: &[SalesRecord]) -> ArrayRef {
    match field {
        Field::Id => Arc::new(Int64Array::from(
            records.iter().map(|r| r.id).collect::<Vec<_>>(),
        )),
        Field::Fecha => Arc::new(
            TimestampMicrosecondArray::from(
                records
                    .iter()
                    .map(|r| r.fecha.map(|d| d.and_utc().timestamp_micros()))
                    .collect::<Vec<_>>(),
            )
            .with_timezone("UTC"),
        ),
        Field::Producto => text_column(records.iter().map(|r| r.producto.as_str())),
        Field::Categoria => text_column(records.iter().map(|r| r.categoria.as_str())),
        Field::Region => text_column(records.iter().map(|r| r.region.as_str())),
        Field::Cliente => text_column(records.iter().map(|r| r.cliente.as_str())),
        Field::Vendedor => text_column(records.iter().map(|r| r.vendedor.as_str())),
        Field::Cantidad => Arc::new(Int64Array::from(
            records.iter().map(|r| r.cantidad).collect::<Vec<_>>(),
        )),
        Field::PrecioUnitario => Arc::new(Float64Array::from(
            records.iter().map(|r| r.precio_unitario).collect::<Vec<_>>(),
        )),
        Field::TotalVenta => Arc::new(Float64Array::from(
            records.iter().map(|r| r.total_venta).collect::<Vec<_>>(),
        )),
    }
}

/// Serialize the table in stable column order with no index column.
pub fn encode_parquet(table: &SalesTable) -> Result<Bytes> {
    let fields = table.columns.fields();
    let schema = artifact_schema(&fields);
    let columns: Vec<ArrayRef> = fields.iter().map(|f| column(*f, &table.records)).collect();

    let batch = RecordBatch::try_new(schema.clone(), columns)
        .map_err(|e| EtlError::io("artifact encode", e))?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut buffer: Vec<u8> = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema, Some(props))
        .map_err(|e| EtlError::io("artifact encode", format!("parquet writer init failed: {e}")))?;
    writer
        .write(&batch)
        .map_err(|e| EtlError::io("artifact encode", format!("parquet write failed: {e}")))?;
    writer
        .close()
        .map_err(|e| EtlError::io("artifact encode", format!("parquet close failed: {e}")))?;

    Ok(Bytes::from(buffer))
}

// =============================================================================
// Filesystem store
// =============================================================================

/// Artifact store rooted at a local directory, for runs without cloud access.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, path: &str, bytes: Bytes) -> Result<ArtifactRef> {
        let target = self.root.join(path.trim_start_matches('/'));
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| EtlError::io("artifact write", e))?;
        }
        fs::write(&target, &bytes)
            .await
            .map_err(|e| EtlError::io("artifact write", e))?;

        let artifact = ArtifactRef {
            uri: format!("file://{}", target.display()),
            size_bytes: bytes.len(),
            content_hash: content_hash(&bytes),
        };
        info!(uri = %artifact.uri, bytes = artifact.size_bytes, "artifact written");
        Ok(artifact)
    }
}
