// crates/airlake-core/src/parquet.rs

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use polars::io::parquet::write::{ParquetCompression, ParquetWriter, StatisticsOptions};
use polars::prelude::{DataFrame, ParquetReader, SerReader};
use tracing::{debug, info};

use crate::error::Result;
use crate::store::{TableSink, TableSource, WriteMode};

const EXTENSION: &str = "parquet";

/// One `<table>.parquet` file per table, all in one directory.
#[derive(Debug, Clone)]
pub struct ParquetDirStore {
    directory: PathBuf,
}

impl ParquetDirStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn path_for(&self, table: &str) -> PathBuf {
        self.directory.join(format!("{table}.{EXTENSION}"))
    }
}

#[async_trait]
impl TableSource for ParquetDirStore {
    async fn list_table_names(&self) -> Result<Vec<String>> {
        if !self.directory.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn load_table(&self, name: &str) -> Result<DataFrame> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(DataFrame::default());
        }
        let frame = tokio::task::spawn_blocking(move || read_parquet(&path)).await??;
        debug!(table = name, rows = frame.height(), "loaded parquet table");
        Ok(frame)
    }
}

#[async_trait]
impl TableSink for ParquetDirStore {
    async fn write_table(&self, name: &str, frame: &DataFrame, mode: WriteMode) -> Result<()> {
        match mode {
            WriteMode::Replace => {
                let path = self.path_for(name);
                let mut frame = frame.clone();
                let (rows, columns) = (frame.height(), frame.width());
                tokio::task::spawn_blocking(move || replace_file(&path, &mut frame)).await??;
                info!(table = name, rows, columns, "parquet table replaced");
            }
        }
        Ok(())
    }
}

fn read_parquet(path: &Path) -> Result<DataFrame> {
    let file = File::open(path)?;
    Ok(ParquetReader::new(file).finish()?)
}

/// Writes next to the target and renames over it, so readers never see a partial file.
fn replace_file(path: &Path, frame: &mut DataFrame) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
    {
        let mut file = File::create(&tmp)?;
        ParquetWriter::new(&mut file)
            .with_compression(ParquetCompression::Zstd(None))
            .with_statistics(StatisticsOptions::default())
            .finish(frame)?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
