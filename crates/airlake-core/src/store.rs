//! Seams between the curation engine and the stores it reads from and writes to.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use polars::prelude::DataFrame;

use crate::error::{CurationError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Drop whatever is stored under the name and recreate it from the frame.
    #[default]
    Replace,
}

#[async_trait]
pub trait TableSource: Send + Sync {
    async fn list_table_names(&self) -> Result<Vec<String>>;
    /// Materializes one table fully in memory. An empty frame is a valid answer.
    async fn load_table(&self, name: &str) -> Result<DataFrame>;
}

#[async_trait]
pub trait TableSink: Send + Sync {
    async fn write_table(&self, name: &str, frame: &DataFrame, mode: WriteMode) -> Result<()>;
}

/// Tables held in memory. Serves as both source and sink.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<String, DataFrame>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = (S, DataFrame)>,
        S: Into<String>,
    {
        let tables = tables
            .into_iter()
            .map(|(name, frame)| (name.into(), frame))
            .collect();
        Self {
            tables: Mutex::new(tables),
        }
    }

    pub fn get(&self, name: &str) -> Option<DataFrame> {
        self.tables
            .lock()
            .ok()
            .and_then(|tables| tables.get(name).cloned())
    }

    fn poisoned() -> CurationError {
        CurationError::Config("memory store lock poisoned".into())
    }
}

#[async_trait]
impl TableSource for MemoryStore {
    async fn list_table_names(&self) -> Result<Vec<String>> {
        let tables = self.tables.lock().map_err(|_| Self::poisoned())?;
        Ok(tables.keys().cloned().collect())
    }

    async fn load_table(&self, name: &str) -> Result<DataFrame> {
        let tables = self.tables.lock().map_err(|_| Self::poisoned())?;
        Ok(tables.get(name).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl TableSink for MemoryStore {
    async fn write_table(&self, name: &str, frame: &DataFrame, mode: WriteMode) -> Result<()> {
        let mut tables = self.tables.lock().map_err(|_| Self::poisoned())?;
        match mode {
            WriteMode::Replace => {
                tables.insert(name.to_string(), frame.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::*;

    #[tokio::test]
    async fn replace_overwrites_previous_contents() {
        let store = MemoryStore::new();
        let first = df!["a" => [1i64, 2, 3]].unwrap();
        let second = df!["b" => [9i64]].unwrap();

        store.write_table("curated", &first, WriteMode::Replace).await.unwrap();
        store.write_table("curated", &second, WriteMode::Replace).await.unwrap();

        let stored = store.get("curated").unwrap();
        assert!(stored.equals(&second));
        assert_eq!(store.list_table_names().await.unwrap(), vec!["curated"]);
    }

    #[tokio::test]
    async fn unknown_table_loads_empty() {
        let store = MemoryStore::new();
        let frame = store.load_table("nope").await.unwrap();
        assert_eq!(frame.height(), 0);
    }
}
