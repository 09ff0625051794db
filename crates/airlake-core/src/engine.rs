// crates/airlake-core/src/engine.rs

use std::time::Instant;

use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{CurationConfig, StoreConfig};
use crate::db::{self, DbPool, PostgresSink, PostgresSource};
use crate::error::{CurationError, Result};
use crate::features::derive_features;
use crate::merge::merge_tables;
use crate::normalize::normalize_table;
use crate::parquet::ParquetDirStore;
use crate::schema::{ColumnRole, SchemaRegistry};
use crate::store::{TableSink, TableSource, WriteMode};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    LoadFailed,
    Empty,
    Unusable,
    NoRows,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedTable {
    pub table: String,
    pub reason: SkipReason,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableSummary {
    pub table: String,
    pub rows_in: usize,
    pub rows_out: usize,
    pub dropped_missing_values: usize,
    pub dropped_duplicates: usize,
    pub coerced_cells: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurationReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub tables_listed: usize,
    pub tables: Vec<TableSummary>,
    pub skipped: Vec<SkippedTable>,
    pub rows: usize,
    pub columns: usize,
    pub complete_rows: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
}

/// Frames produced by one run, before anything is written.
#[derive(Debug, Clone)]
pub struct CurationOutput {
    pub curated: DataFrame,
    /// Rows where every pollutant had a measured value before the mean fill.
    pub complete: Option<DataFrame>,
    pub registry: SchemaRegistry,
    pub report: CurationReport,
}

pub struct CurationEngine {
    config: CurationConfig,
}

impl CurationEngine {
    pub fn new(config: CurationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CurationConfig {
        &self.config
    }

    fn output_tables(&self) -> Vec<&str> {
        let output = &self.config.output;
        std::iter::once(output.table.trim())
            .chain(output.complete_table())
            .collect()
    }

    /// Loads, normalizes, merges and derives features. Tables that cannot be
    /// used are skipped with a warning; the run fails only when nothing is left.
    /// Tables carrying the configured output names are never read back.
    pub async fn curate(&self, source: &dyn TableSource) -> Result<CurationOutput> {
        let clock = Instant::now();
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let outputs = self.output_tables();
        let names: Vec<String> = source
            .list_table_names()
            .await?
            .into_iter()
            .filter(|name| {
                let is_output = outputs.contains(&name.as_str());
                if is_output {
                    debug!(table = name.as_str(), "output table not read as a source");
                }
                !is_output
            })
            .collect();
        if names.is_empty() {
            return Err(CurationError::NoTables);
        }
        info!(%run_id, tables = names.len(), "curation started");

        let mut registry = SchemaRegistry::new();
        let mut frames = Vec::with_capacity(names.len());
        let mut tables = Vec::new();
        let mut skipped = Vec::new();
        let mut skip = |table: &str, reason: SkipReason, detail: String| {
            warn!(table, ?reason, detail = detail.as_str(), "table skipped");
            skipped.push(SkippedTable {
                table: table.to_string(),
                reason,
                detail,
            });
        };

        for name in &names {
            let raw = match source.load_table(name).await {
                Ok(frame) => frame,
                Err(err) => {
                    skip(name, SkipReason::LoadFailed, err.to_string());
                    continue;
                }
            };
            if raw.height() == 0 {
                skip(name, SkipReason::Empty, "table has no rows".into());
                continue;
            }
            let normalized = match normalize_table(name, &raw) {
                Ok(normalized) => normalized,
                Err(err) => {
                    skip(name, SkipReason::Unusable, err.to_string());
                    continue;
                }
            };
            if normalized.frame.height() == 0 {
                skip(
                    name,
                    SkipReason::NoRows,
                    "no rows left after normalization".into(),
                );
                continue;
            }

            tables.push(TableSummary {
                table: name.clone(),
                rows_in: raw.height(),
                rows_out: normalized.frame.height(),
                dropped_missing_values: normalized.dropped_missing_values,
                dropped_duplicates: normalized.dropped_duplicates,
                coerced_cells: normalized.coerced_cells,
            });
            registry.register_table(normalized.schema);
            frames.push(normalized.frame);
        }

        if frames.is_empty() {
            return Err(CurationError::NoData);
        }

        let merged = merge_tables(frames)?;
        info!(rows = merged.height(), columns = merged.width(), "tables merged");

        let mask = complete_rows_mask(&merged, &registry)?;
        let mut curated = merged;
        derive_features(&mut curated, &mut registry, &self.config.features)?;

        let complete = match self.config.output.complete_table() {
            Some(_) => Some(curated.filter(&mask)?),
            None => None,
        };

        let report = CurationReport {
            run_id,
            started_at,
            elapsed_ms: clock.elapsed().as_millis() as u64,
            tables_listed: names.len(),
            tables,
            skipped,
            rows: curated.height(),
            columns: curated.width(),
            complete_rows: complete.as_ref().map_or(0, DataFrame::height),
            outputs: Vec::new(),
        };

        Ok(CurationOutput {
            curated,
            complete,
            registry,
            report,
        })
    }

    /// Curates and replaces the output tables in the sink.
    pub async fn run(
        &self,
        source: &dyn TableSource,
        sink: &dyn TableSink,
    ) -> Result<CurationReport> {
        let clock = Instant::now();
        let output = self.curate(source).await?;
        let mut report = output.report;

        let table = self.config.output.table.trim();
        sink.write_table(table, &output.curated, WriteMode::Replace)
            .await?;
        report.outputs.push(table.to_string());

        if let (Some(name), Some(frame)) = (self.config.output.complete_table(), &output.complete) {
            sink.write_table(name, frame, WriteMode::Replace).await?;
            report.outputs.push(name.to_string());
        }

        report.elapsed_ms = clock.elapsed().as_millis() as u64;
        info!(
            run_id = %report.run_id,
            rows = report.rows,
            columns = report.columns,
            complete_rows = report.complete_rows,
            skipped = report.skipped.len(),
            elapsed_ms = report.elapsed_ms,
            "curation finished"
        );
        Ok(report)
    }
}

/// True where every pollutant's measured value is present.
pub fn complete_rows_mask(df: &DataFrame, registry: &SchemaRegistry) -> PolarsResult<BooleanChunked> {
    let mut keep = vec![true; df.height()];
    for name in registry.columns_with_role(ColumnRole::Value) {
        let Ok(column) = df.column(name) else {
            continue;
        };
        let present = column.is_not_null();
        for (slot, present) in keep.iter_mut().zip(&present) {
            *slot &= present.unwrap_or(false);
        }
    }
    Ok(BooleanChunked::from_slice("complete".into(), &keep))
}

/// Source and sink built from the configuration.
pub struct Stores {
    pub source: Box<dyn TableSource>,
    pub sink: Box<dyn TableSink>,
}

pub async fn open_stores(config: &CurationConfig) -> Result<Stores> {
    let pool = if config.uses_postgres() {
        let url = config.postgres.connection_url()?;
        Some(db::connect(&url, config.postgres.max_connections).await?)
    } else {
        None
    };

    let source: Box<dyn TableSource> = match &config.source {
        StoreConfig::Postgres { schema } => Box::new(PostgresSource::new(require(&pool)?, schema)),
        StoreConfig::Parquet { directory } => Box::new(ParquetDirStore::new(directory)),
    };
    let sink: Box<dyn TableSink> = match &config.sink {
        StoreConfig::Postgres { schema } => Box::new(PostgresSink::new(require(&pool)?, schema)),
        StoreConfig::Parquet { directory } => Box::new(ParquetDirStore::new(directory)),
    };
    Ok(Stores { source, sink })
}

fn require(pool: &Option<DbPool>) -> Result<DbPool> {
    pool.clone()
        .ok_or_else(|| CurationError::Config("postgres store configured without a pool".into()))
}
