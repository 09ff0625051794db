use std::collections::HashSet;

use chrono::NaiveDateTime;
use polars::prelude::*;
use thiserror::Error;
use tracing::{debug, warn};

use crate::schema::{
    prefixed, ColumnRole, ColumnSpec, TableSchema, DROPPED_COLUMNS, KEY_COLUMNS, SITE_COLUMN,
    TIMESTAMP_COLUMN, VALUE_COLUMN,
};

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("table {table} is missing key column {column}")]
    MissingKey { table: String, column: &'static str },
    #[error("table {table} key column {column} has unsupported type {dtype}")]
    KeyType {
        table: String,
        column: &'static str,
        dtype: String,
    },
    #[error("polars operation failed: {0}")]
    Polars(#[from] PolarsError),
}

/// One staging table after filtering and namespacing, ready to merge.
#[derive(Debug, Clone)]
pub struct NormalizedTable {
    pub table: String,
    pub frame: DataFrame,
    pub schema: TableSchema,
    pub dropped_missing_values: usize,
    pub dropped_duplicates: usize,
    pub coerced_cells: usize,
}

/// Prepares one pollutant table for the merge.
///
/// Rows without a measured value or without a full key are removed, duplicate
/// keys keep their first row, `date_de_fin`/`polluant` are dropped, and every
/// non-key column is renamed `<table>_<column>`. Measurement columns are
/// coerced to `f64` and text timestamps are parsed; cells that do not parse
/// become null.
pub fn normalize_table(table: &str, df: &DataFrame) -> Result<NormalizedTable, NormalizeError> {
    for column in KEY_COLUMNS {
        if df.get_column_index(column).is_none() {
            return Err(NormalizeError::MissingKey {
                table: table.to_string(),
                column,
            });
        }
    }

    let mut frame = df.clone();

    let mut coerced_cells = 0;
    let datetime = DataType::Datetime(TimeUnit::Microseconds, None);
    let ts_dtype = frame.column(TIMESTAMP_COLUMN)?.dtype().clone();
    let timestamps = match ts_dtype {
        DataType::Datetime(_, _) | DataType::Date => {
            frame.column(TIMESTAMP_COLUMN)?.cast(&datetime)?
        }
        DataType::String => {
            let (micros, unparsed) = parse_timestamps(frame.column(TIMESTAMP_COLUMN)?.str()?);
            coerced_cells += unparsed;
            Series::new(TIMESTAMP_COLUMN.into(), micros)
                .cast(&datetime)?
                .into()
        }
        other => {
            return Err(NormalizeError::KeyType {
                table: table.to_string(),
                column: TIMESTAMP_COLUMN,
                dtype: other.to_string(),
            })
        }
    };
    frame.with_column(timestamps)?;
    let sites = frame.column(SITE_COLUMN)?.cast(&DataType::String)?;
    frame.with_column(sites)?;

    coerced_cells += coerce_measurements(&mut frame)?;
    if coerced_cells > 0 {
        warn!(table, cells = coerced_cells, "unparseable measurements coerced to null");
    }

    let (keep, dropped_missing_values, dropped_duplicates) = row_mask(&frame)?;
    let mask = BooleanChunked::from_slice("keep".into(), &keep);
    let mut frame = frame.filter(&mask)?;

    for column in DROPPED_COLUMNS {
        if frame.get_column_index(column).is_some() {
            frame = frame.drop(column)?;
        }
    }

    let original_names: Vec<String> = frame
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();

    let mut schema = TableSchema::new(table);
    for column in original_names {
        if KEY_COLUMNS.contains(&column.as_str()) {
            continue;
        }
        let renamed = prefixed(table, &column);
        frame.rename(&column, renamed.clone().into())?;
        schema.push(ColumnSpec {
            name: renamed,
            role: ColumnRole::classify(&column),
            source_column: Some(column),
        });
    }

    if dropped_duplicates > 0 {
        warn!(table, rows = dropped_duplicates, "duplicate (site, timestamp) rows dropped");
    }
    debug!(
        table,
        rows = frame.height(),
        columns = frame.width(),
        dropped_missing_values,
        "table normalized"
    );

    Ok(NormalizedTable {
        table: table.to_string(),
        frame,
        schema,
        dropped_missing_values,
        dropped_duplicates,
        coerced_cells,
    })
}

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Microseconds since the epoch for each text timestamp, and how many did not parse.
fn parse_timestamps(values: &StringChunked) -> (Vec<Option<i64>>, usize) {
    let mut unparsed = 0;
    let micros = values
        .into_iter()
        .map(|value| {
            let value = value?.trim();
            let parsed = TIMESTAMP_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok());
            if parsed.is_none() {
                unparsed += 1;
            }
            parsed.map(|ts| ts.and_utc().timestamp_micros())
        })
        .collect();
    (micros, unparsed)
}

/// Casts every measurement column to `f64` and returns how many cells became null.
fn coerce_measurements(frame: &mut DataFrame) -> PolarsResult<usize> {
    let names: Vec<String> = frame
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();

    let mut coerced = 0;
    for name in names {
        if !ColumnRole::classify(&name).is_numeric() {
            continue;
        }
        let column = frame.column(&name)?;
        if column.dtype() == &DataType::Float64 {
            continue;
        }
        let before = column.null_count();
        let cast = column.cast(&DataType::Float64)?;
        coerced += cast.null_count().saturating_sub(before);
        frame.with_column(cast)?;
    }
    Ok(coerced)
}

/// Rows to keep, plus counts of rows dropped for a missing value and for a repeated key.
fn row_mask(frame: &DataFrame) -> PolarsResult<(Vec<bool>, usize, usize)> {
    let height = frame.height();
    let sites = frame.column(SITE_COLUMN)?.str()?;
    let timestamps = frame.column(TIMESTAMP_COLUMN)?.datetime()?;
    let missing_values = match frame.column(VALUE_COLUMN) {
        Ok(column) => Some(column.is_null()),
        Err(_) => None,
    };

    let mut keep = vec![false; height];
    let mut seen: HashSet<(&str, i64)> = HashSet::with_capacity(height);
    let mut dropped_missing = 0;
    let mut dropped_duplicates = 0;

    for (idx, slot) in keep.iter_mut().enumerate() {
        let value_missing = missing_values
            .as_ref()
            .and_then(|mask| mask.get(idx))
            .unwrap_or(false);
        let (Some(site), Some(ts)) = (sites.get(idx), timestamps.get(idx)) else {
            dropped_missing += 1;
            continue;
        };
        if value_missing {
            dropped_missing += 1;
            continue;
        }
        if !seen.insert((site, ts)) {
            dropped_duplicates += 1;
            continue;
        }
        *slot = true;
    }

    Ok((keep, dropped_missing, dropped_duplicates))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn micros_column(name: &str, values: Vec<Option<i64>>) -> Column {
        Series::new(name.into(), values)
            .cast(&DataType::Datetime(TimeUnit::Microseconds, None))
            .expect("cast to datetime")
            .into()
    }

    fn staging_frame() -> DataFrame {
        DataFrame::new(vec![
            Series::new("code_site".into(), ["FR01", "FR01", "FR02", "FR02"]).into(),
            micros_column(
                "date_de_debut",
                vec![Some(0), Some(3_600_000_000), Some(0), Some(0)],
            ),
            micros_column("date_de_fin", vec![Some(1), Some(2), Some(3), Some(4)]),
            Series::new("polluant".into(), ["NO2", "NO2", "NO2", "NO2"]).into(),
            Series::new("valeur".into(), [Some(10.0), None, Some(12.0), Some(13.0)]).into(),
            Series::new(
                "unite_de_mesure".into(),
                ["µg-m3", "µg-m3", "µg-m3", "µg-m3"],
            )
            .into(),
        ])
        .expect("build staging frame")
    }

    #[test]
    fn drops_null_values_duplicates_and_redundant_columns() {
        let normalized = normalize_table("no2", &staging_frame()).expect("normalize");
        let frame = &normalized.frame;

        assert_eq!(frame.height(), 2);
        assert_eq!(normalized.dropped_missing_values, 1);
        assert_eq!(normalized.dropped_duplicates, 1);
        assert!(frame.column("no2_date_de_fin").is_err());
        assert!(frame.column("date_de_fin").is_err());
        assert!(frame.column("no2_polluant").is_err());
        assert!(frame.column("code_site").is_ok());
        assert!(frame.column("date_de_debut").is_ok());
        assert!(frame.column("no2_valeur").is_ok());
        assert_eq!(
            normalized.schema.column(ColumnRole::Unit),
            Some("no2_unite_de_mesure")
        );
    }

    #[test]
    fn missing_key_column_is_reported() {
        let df = df!["valeur" => [1.0f64]].expect("frame");
        let err = normalize_table("o3", &df).expect_err("missing key");
        assert!(matches!(
            err,
            NormalizeError::MissingKey {
                column: "code_site",
                ..
            }
        ));
    }

    #[test]
    fn text_timestamps_are_parsed_and_unparseable_rows_dropped() {
        let df = df![
            "code_site" => ["FR01", "FR01"],
            "date_de_debut" => ["2024/03/08 01:00:00", "yesterday"],
            "valeur" => [1.0f64, 2.0],
        ]
        .expect("frame");
        let normalized = normalize_table("o3", &df).expect("normalize");

        assert_eq!(normalized.coerced_cells, 1);
        assert_eq!(normalized.dropped_missing_values, 1);
        let ts = normalized.frame.column("date_de_debut").unwrap().datetime().unwrap();
        assert_eq!(ts.get(0), Some(1_709_859_600_000_000));
    }

    #[test]
    fn numeric_timestamp_key_is_rejected() {
        let df = df![
            "code_site" => ["FR01"],
            "date_de_debut" => [1.5f64],
            "valeur" => [1.0f64],
        ]
        .expect("frame");
        let err = normalize_table("o3", &df).expect_err("bad key type");
        assert!(matches!(err, NormalizeError::KeyType { .. }));
    }

    #[test]
    fn unparseable_measurements_become_null_and_rows_are_dropped() {
        let df = DataFrame::new(vec![
            Series::new("code_site".into(), ["FR01", "FR01"]).into(),
            micros_column("date_de_debut", vec![Some(0), Some(1)]),
            Series::new("valeur".into(), ["1.5", "n/a"]).into(),
        ])
        .expect("frame");

        let normalized = normalize_table("pm10", &df).expect("normalize");
        assert_eq!(normalized.coerced_cells, 1);
        assert_eq!(normalized.frame.height(), 1);
        let values = normalized.frame.column("pm10_valeur").unwrap().f64().unwrap();
        assert_eq!(values.get(0), Some(1.5));
    }
}
