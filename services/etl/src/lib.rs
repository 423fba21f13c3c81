//! Sales ingest pipeline: locate a CSV export in Drive, clean and normalize
//! it, persist it as Parquet, replace the warehouse landing table and rebuild
//! the fact table from it.

pub mod artifact;
pub mod bootstrap;
pub mod clean;
pub mod config;
pub mod error;
pub mod google;
pub mod ledger;
pub mod logging;
pub mod memory;
pub mod model;
pub mod normalize;
pub mod parse;
pub mod pipeline;
pub mod source;
pub mod warehouse;

pub use config::{PipelineConfig, Settings, WaitPolicy};
pub use error::{EtlError, Result};
pub use ledger::RunLedger;
pub use model::Field;
pub use pipeline::{Pipeline, PipelineTargets, RunOptions, RunOutcome, RunSummary, Stage};
