// crates/airlake-core/src/config.rs

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CurationError, Result};
use crate::features::FeatureOptions;

/// Everything a curation run needs. Built once by the caller and passed to
/// [`crate::engine::CurationEngine::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurationConfig {
    pub source: StoreConfig,
    pub sink: StoreConfig,
    pub postgres: PostgresConfig,
    pub output: OutputConfig,
    pub features: FeatureOptions,
}

impl Default for CurationConfig {
    fn default() -> Self {
        Self {
            source: StoreConfig::Postgres {
                schema: DEFAULT_SOURCE_SCHEMA.to_string(),
            },
            sink: StoreConfig::Postgres {
                schema: DEFAULT_SINK_SCHEMA.to_string(),
            },
            postgres: PostgresConfig::default(),
            output: OutputConfig::default(),
            features: FeatureOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StoreConfig {
    Postgres {
        /// Empty means the default for the store's role.
        #[serde(default)]
        schema: String,
    },
    Parquet {
        directory: PathBuf,
    },
}

pub const DEFAULT_SOURCE_SCHEMA: &str = "staging";
pub const DEFAULT_SINK_SCHEMA: &str = "public";

impl StoreConfig {
    fn fill_default_schema(&mut self, default: &str) {
        if let StoreConfig::Postgres { schema } = self {
            if schema.trim().is_empty() {
                *schema = default.to_string();
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub max_connections: u32,
    /// Full connection URL; wins over the individual fields when set.
    #[serde(skip_serializing)]
    pub url: Option<String>,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "airlake".to_string(),
            max_connections: 5,
            url: None,
        }
    }
}

impl PostgresConfig {
    /// Connection URL from `url`, or assembled from host/port/database and the
    /// `POSTGRES_USER` / `POSTGRES_PASSWORD` environment variables.
    pub fn connection_url(&self) -> Result<String> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }
        let user = env::var("POSTGRES_USER")
            .map_err(|_| CurationError::Config("POSTGRES_USER must be set".into()))?;
        let password = env::var("POSTGRES_PASSWORD").unwrap_or_default();
        Ok(format!(
            "postgres://{user}:{password}@{}:{}/{}",
            self.host, self.port, self.database
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub table: String,
    /// Rows observed by every pollutant. Empty disables the second table.
    pub complete_table: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            table: "curated".to_string(),
            complete_table: "curated_all_valeur".to_string(),
        }
    }
}

impl OutputConfig {
    pub fn complete_table(&self) -> Option<&str> {
        let name = self.complete_table.trim();
        (!name.is_empty()).then_some(name)
    }
}

impl CurationConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(contents)?;
        config.source.fill_default_schema(DEFAULT_SOURCE_SCHEMA);
        config.sink.fill_default_schema(DEFAULT_SINK_SCHEMA);
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file and applies environment overrides. Without a path
    /// the defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_toml_str(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// `DATABASE_URL` (or `AIRLAKE_DATABASE_URL`) overrides the configured Postgres location.
    pub fn apply_env(&mut self) {
        if let Ok(url) = env::var("DATABASE_URL").or_else(|_| env::var("AIRLAKE_DATABASE_URL")) {
            self.postgres.url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.output.table.trim().is_empty() {
            return Err(CurationError::Config("output.table must not be empty".into()));
        }
        if self.output.complete_table() == Some(self.output.table.trim()) {
            return Err(CurationError::Config(
                "output.complete_table must differ from output.table".into(),
            ));
        }
        if self.source == self.sink {
            return Err(CurationError::Config(
                "source and sink must not share a schema or directory".into(),
            ));
        }
        if self.features.lag == 0 {
            return Err(CurationError::Config("features.lag must be at least 1".into()));
        }
        Ok(())
    }

    pub fn uses_postgres(&self) -> bool {
        matches!(self.source, StoreConfig::Postgres { .. })
            || matches!(self.sink, StoreConfig::Postgres { .. })
    }
}
