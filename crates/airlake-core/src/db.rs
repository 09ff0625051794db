// crates/airlake-core/src/db.rs

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use polars::prelude::*;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Pool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info};

use crate::error::{CurationError, Result};
use crate::store::{TableSink, TableSource, WriteMode};

pub type DbPool = Pool<Postgres>;

/// Postgres caps a statement at this many bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

pub async fn connect(database_url: &str, max_connections: u32) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Double-quotes an identifier, doubling any embedded quote.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// How a column travels between Postgres and polars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SqlKind {
    Float,
    Int,
    Bool,
    Timestamp,
    Text,
}

impl SqlKind {
    fn from_pg(data_type: &str) -> Self {
        match data_type {
            "double precision" | "real" | "numeric" | "decimal" => SqlKind::Float,
            "smallint" | "integer" | "bigint" => SqlKind::Int,
            "boolean" => SqlKind::Bool,
            "timestamp without time zone" | "timestamp with time zone" | "date" => {
                SqlKind::Timestamp
            }
            _ => SqlKind::Text,
        }
    }

    fn from_dtype(dtype: &DataType) -> Self {
        match dtype {
            DataType::Float32 | DataType::Float64 => SqlKind::Float,
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64 => SqlKind::Int,
            DataType::Boolean => SqlKind::Bool,
            DataType::Datetime(_, _) | DataType::Date => SqlKind::Timestamp,
            _ => SqlKind::Text,
        }
    }

    fn sql_type(self) -> &'static str {
        match self {
            SqlKind::Float => "DOUBLE PRECISION",
            SqlKind::Int => "BIGINT",
            SqlKind::Bool => "BOOLEAN",
            SqlKind::Timestamp => "TIMESTAMP",
            SqlKind::Text => "TEXT",
        }
    }
}

/// Reads every base table of one schema.
#[derive(Debug, Clone)]
pub struct PostgresSource {
    pool: DbPool,
    schema: String,
}

impl PostgresSource {
    pub fn new(pool: DbPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    async fn columns(&self, table: &str) -> Result<Vec<(String, SqlKind)>> {
        let rows = sqlx::query(
            r#"
                SELECT column_name::text AS column_name, data_type::text AS data_type
                FROM information_schema.columns
                WHERE table_schema = $1 AND table_name = $2
                ORDER BY ordinal_position
            "#,
        )
        .bind(&self.schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let name: String = row.try_get("column_name")?;
                let data_type: String = row.try_get("data_type")?;
                Ok((name, SqlKind::from_pg(&data_type)))
            })
            .collect()
    }
}

#[async_trait]
impl TableSource for PostgresSource {
    async fn list_table_names(&self) -> Result<Vec<String>> {
        let names = sqlx::query_scalar(
            r#"
                SELECT table_name::text
                FROM information_schema.tables
                WHERE table_schema = $1 AND table_type = 'BASE TABLE'
                ORDER BY table_name
            "#,
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn load_table(&self, name: &str) -> Result<DataFrame> {
        let columns = self.columns(name).await?;
        if columns.is_empty() {
            return Ok(DataFrame::default());
        }

        let select_list = columns
            .iter()
            .map(|(column, kind)| {
                let cast = match kind {
                    SqlKind::Float => "double precision",
                    SqlKind::Int => "bigint",
                    SqlKind::Bool => "boolean",
                    SqlKind::Timestamp => "timestamp",
                    SqlKind::Text => "text",
                };
                format!("{}::{cast} AS {}", quote_ident(column), quote_ident(column))
            })
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {select_list} FROM {}", qualified(&self.schema, name));
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut series = Vec::with_capacity(columns.len());
        for (idx, (column, kind)) in columns.iter().enumerate() {
            series.push(decode_column(&rows, idx, column, *kind)?.into());
        }
        let frame = DataFrame::new(series)?;
        debug!(table = name, rows = frame.height(), "loaded table from postgres");
        Ok(frame)
    }
}

fn decode_column(rows: &[PgRow], idx: usize, name: &str, kind: SqlKind) -> Result<Series> {
    let series = match kind {
        SqlKind::Float => {
            let values = rows
                .iter()
                .map(|row| row.try_get::<Option<f64>, _>(idx))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Series::new(name.into(), values)
        }
        SqlKind::Int => {
            let values = rows
                .iter()
                .map(|row| row.try_get::<Option<i64>, _>(idx))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Series::new(name.into(), values)
        }
        SqlKind::Bool => {
            let values = rows
                .iter()
                .map(|row| row.try_get::<Option<bool>, _>(idx))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Series::new(name.into(), values)
        }
        SqlKind::Timestamp => {
            let values = rows
                .iter()
                .map(|row| {
                    row.try_get::<Option<NaiveDateTime>, _>(idx)
                        .map(|value| value.map(|ts| ts.and_utc().timestamp_micros()))
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Series::new(name.into(), values)
                .cast(&DataType::Datetime(TimeUnit::Microseconds, None))?
        }
        SqlKind::Text => {
            let values = rows
                .iter()
                .map(|row| row.try_get::<Option<String>, _>(idx))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Series::new(name.into(), values)
        }
    };
    Ok(series)
}

/// Writes frames as tables of one schema, replacing any previous table.
#[derive(Debug, Clone)]
pub struct PostgresSink {
    pool: DbPool,
    schema: String,
}

impl PostgresSink {
    pub fn new(pool: DbPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    async fn replace_table(&self, name: &str, frame: &DataFrame) -> Result<()> {
        let columns = frame
            .get_columns()
            .iter()
            .map(ColumnValues::from_column)
            .collect::<Result<Vec<_>>>()?;
        let target = qualified(&self.schema, name);

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(&self.schema)
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {target}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&create_table_sql(&target, &columns))
            .execute(&mut *tx)
            .await?;

        insert_rows(&mut tx, &target, &columns, frame.height()).await?;
        tx.commit().await?;

        info!(
            table = name,
            schema = self.schema.as_str(),
            rows = frame.height(),
            columns = frame.width(),
            "table replaced"
        );
        Ok(())
    }
}

#[async_trait]
impl TableSink for PostgresSink {
    async fn write_table(&self, name: &str, frame: &DataFrame, mode: WriteMode) -> Result<()> {
        match mode {
            WriteMode::Replace => self.replace_table(name, frame).await.map_err(|err| {
                CurationError::Sink {
                    table: name.to_string(),
                    message: err.to_string(),
                }
            }),
        }
    }
}

fn create_table_sql(target: &str, columns: &[ColumnValues]) -> String {
    let definitions = columns
        .iter()
        .map(|column| format!("{} {}", quote_ident(&column.name), column.kind().sql_type()))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {target} ({definitions})")
}

async fn insert_rows(
    tx: &mut Transaction<'_, Postgres>,
    target: &str,
    columns: &[ColumnValues],
    height: usize,
) -> Result<()> {
    if columns.is_empty() || height == 0 {
        return Ok(());
    }

    let column_list = columns
        .iter()
        .map(|column| quote_ident(&column.name))
        .collect::<Vec<_>>()
        .join(", ");
    let batch_rows = (MAX_BIND_PARAMS / columns.len()).max(1);

    let mut start = 0;
    while start < height {
        let end = (start + batch_rows).min(height);
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO {target} ({column_list}) "));
        builder.push_values(start..end, |mut row, idx| {
            for column in columns {
                match &column.values {
                    Values::Float(values) => row.push_bind(values[idx]),
                    Values::Int(values) => row.push_bind(values[idx]),
                    Values::Bool(values) => row.push_bind(values[idx]),
                    Values::Timestamp(values) => row.push_bind(values[idx]),
                    Values::Text(values) => row.push_bind(values[idx].clone()),
                };
            }
        });
        builder.build().execute(&mut **tx).await?;
        debug!(target, rows = end - start, "inserted batch");
        start = end;
    }
    Ok(())
}

#[derive(Debug)]
enum Values {
    Float(Vec<Option<f64>>),
    Int(Vec<Option<i64>>),
    Bool(Vec<Option<bool>>),
    Timestamp(Vec<Option<NaiveDateTime>>),
    Text(Vec<Option<String>>),
}

#[derive(Debug)]
struct ColumnValues {
    name: String,
    values: Values,
}

impl ColumnValues {
    fn from_column(column: &Column) -> Result<Self> {
        let values = match SqlKind::from_dtype(column.dtype()) {
            SqlKind::Float => {
                let cast = column.cast(&DataType::Float64)?;
                Values::Float(cast.f64()?.into_iter().collect())
            }
            SqlKind::Int => {
                let cast = column.cast(&DataType::Int64)?;
                Values::Int(cast.i64()?.into_iter().collect())
            }
            SqlKind::Bool => Values::Bool(column.bool()?.into_iter().collect()),
            SqlKind::Timestamp => {
                let micros = column
                    .cast(&DataType::Datetime(TimeUnit::Microseconds, None))?
                    .cast(&DataType::Int64)?;
                Values::Timestamp(
                    micros
                        .i64()?
                        .into_iter()
                        .map(|value| {
                            value
                                .and_then(DateTime::from_timestamp_micros)
                                .map(|ts| ts.naive_utc())
                        })
                        .collect(),
                )
            }
            SqlKind::Text => {
                let cast = column.cast(&DataType::String)?;
                Values::Text(
                    cast.str()?
                        .into_iter()
                        .map(|value| value.map(str::to_string))
                        .collect(),
                )
            }
        };
        Ok(Self {
            name: column.name().to_string(),
            values,
        })
    }

    fn kind(&self) -> SqlKind {
        match self.values {
            Values::Float(_) => SqlKind::Float,
            Values::Int(_) => SqlKind::Int,
            Values::Bool(_) => SqlKind::Bool,
            Values::Timestamp(_) => SqlKind::Timestamp,
            Values::Text(_) => SqlKind::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("no2_valeur"), "\"no2_valeur\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualified("staging", "o3"), "\"staging\".\"o3\"");
    }

    #[test]
    fn pg_types_map_to_transfer_kinds() {
        assert_eq!(SqlKind::from_pg("double precision"), SqlKind::Float);
        assert_eq!(SqlKind::from_pg("integer"), SqlKind::Int);
        assert_eq!(SqlKind::from_pg("timestamp with time zone"), SqlKind::Timestamp);
        assert_eq!(SqlKind::from_pg("character varying"), SqlKind::Text);
    }

    #[test]
    fn create_table_follows_frame_dtypes() {
        let frame = DataFrame::new(vec![
            Series::new("code_site".into(), ["FR01"]).into(),
            Series::new("date_de_debut".into(), [0i64])
                .cast(&DataType::Datetime(TimeUnit::Microseconds, None))
                .unwrap()
                .into(),
            Series::new("o3_valeur".into(), [1.5f64]).into(),
            Series::new("n".into(), [3i32]).into(),
            Series::new("ok".into(), [true]).into(),
        ])
        .unwrap();
        let columns = frame
            .get_columns()
            .iter()
            .map(ColumnValues::from_column)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(
            create_table_sql("\"public\".\"curated\"", &columns),
            "CREATE TABLE \"public\".\"curated\" (\"code_site\" TEXT, \"date_de_debut\" TIMESTAMP, \
             \"o3_valeur\" DOUBLE PRECISION, \"n\" BIGINT, \"ok\" BOOLEAN)"
        );
        let Values::Timestamp(ts) = &columns[1].values else {
            panic!("expected timestamps");
        };
        assert_eq!(ts[0], DateTime::from_timestamp(0, 0).map(|t| t.naive_utc()));
    }
}
