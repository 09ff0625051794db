//! Feature passes over the merged wide table.
//!
//! The passes run in a fixed order and each one reads the table left by the
//! previous pass. None of them reorders rows.

use std::collections::{BTreeSet, HashSet};

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::schema::{
    converted_name, lag_diff_name, pct_change_name, ColumnRole, ColumnSpec, SchemaRegistry,
    SITE_COLUMN, TIMESTAMP_COLUMN, TOTAL_COLUMN,
};
use crate::units::{conversion_factor, resolve_units};

pub const DEFAULT_LAG: usize = 6;

/// Rows the lag window is allowed to cross.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LagScope {
    /// The window stops at site boundaries; rows must be grouped by site and
    /// ascending by timestamp.
    #[default]
    PerSite,
    /// The window runs over the whole table in row order, crossing sites.
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureOptions {
    pub fill_missing: bool,
    pub lag: usize,
    pub lag_scope: LagScope,
}

impl Default for FeatureOptions {
    fn default() -> Self {
        Self {
            fill_missing: true,
            lag: DEFAULT_LAG,
            lag_scope: LagScope::PerSite,
        }
    }
}

/// Runs every pass in order: mean fill, unit conversion, totals, lag
/// differences, percent changes.
pub fn derive_features(
    df: &mut DataFrame,
    registry: &mut SchemaRegistry,
    options: &FeatureOptions,
) -> PolarsResult<()> {
    if options.fill_missing {
        let filled = fill_missing_with_mean(df, registry)?;
        debug!(cells = filled, "null cells filled with column mean");
    }
    convert_units(df, registry)?;
    aggregate_totals(df, registry)?;
    add_lag_differences(df, registry, options.lag, options.lag_scope)?;
    add_percent_changes(df, registry, options.lag, options.lag_scope)?;

    info!(
        rows = df.height(),
        columns = df.width(),
        "feature derivation complete"
    );
    Ok(())
}

/// Replaces nulls in every measurement column with that column's mean over
/// its non-null cells. A column with no non-null cell is left untouched.
/// Returns the number of cells filled.
pub fn fill_missing_with_mean(df: &mut DataFrame, registry: &SchemaRegistry) -> PolarsResult<usize> {
    let mut filled = 0;

    for name in registry.numeric_columns() {
        let Ok(column) = df.column(name) else {
            continue;
        };
        if column.null_count() == 0 {
            continue;
        }

        let values = column.cast(&DataType::Float64)?;
        let values = values.f64()?;
        let Some(mean) = column_mean(values) else {
            debug!(column = name, "all-null column left unfilled");
            continue;
        };

        filled += values.null_count();
        let replaced: Vec<Option<f64>> = values
            .into_iter()
            .map(|value| Some(value.unwrap_or(mean)))
            .collect();
        df.with_column(Series::new(name.into(), replaced))?;
    }

    Ok(filled)
}

fn column_mean(values: &Float64Chunked) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .flatten()
        .fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Resolves each table's unit column (forward then backward fill) and adds a
/// `<column>_g_par_l` column for its value and raw-value columns.
pub fn convert_units(df: &mut DataFrame, registry: &mut SchemaRegistry) -> PolarsResult<()> {
    let plans: Vec<(String, String, Vec<String>)> = registry
        .tables()
        .filter_map(|schema| {
            let unit_column = schema.column(ColumnRole::Unit)?;
            let targets = schema
                .columns
                .iter()
                .filter(|spec| matches!(spec.role, ColumnRole::Value | ColumnRole::RawValue))
                .map(|spec| spec.name.clone())
                .collect();
            Some((schema.table.clone(), unit_column.to_string(), targets))
        })
        .collect();

    for (table, unit_column, targets) in plans {
        let Ok(column) = df.column(&unit_column) else {
            continue;
        };
        let units = column.cast(&DataType::String)?;
        let units: Vec<Option<String>> = units
            .str()?
            .into_iter()
            .map(|unit| unit.map(str::to_string))
            .collect();
        let resolved = resolve_units(&units);

        let mut unknown: BTreeSet<&str> = BTreeSet::new();
        let factors: Vec<Option<f64>> = resolved
            .iter()
            .map(|unit| {
                let unit = unit.as_deref()?;
                let factor = conversion_factor(unit);
                if factor.is_none() {
                    unknown.insert(unit);
                }
                factor
            })
            .collect();
        if !unknown.is_empty() {
            warn!(
                table = table.as_str(),
                units = ?unknown,
                "unknown unit symbols, converted values left null"
            );
        }

        let resolved_refs: Vec<Option<&str>> = resolved.iter().map(|unit| unit.as_deref()).collect();
        df.with_column(Series::new(unit_column.as_str().into(), resolved_refs))?;

        for target in targets {
            let Some(values) = numeric_values(df, &target)? else {
                continue;
            };
            let converted: Vec<Option<f64>> = values
                .iter()
                .zip(factors.iter())
                .map(|(value, factor)| Some((*value)? * (*factor)?))
                .collect();

            let name = converted_name(&target);
            df.with_column(Series::new(name.as_str().into(), converted))?;
            registry.register_derived(
                Some(&table),
                ColumnSpec {
                    name,
                    source_column: Some(target),
                    role: ColumnRole::Converted,
                },
            );
        }
    }

    Ok(())
}

/// Adds `total_valeur_particule`, the row sum of every value and raw-value
/// column, and `total_valeur_particule_g_par_l`, the row sum of the converted
/// columns. Nulls add nothing, so an all-null row totals 0.
pub fn aggregate_totals(df: &mut DataFrame, registry: &mut SchemaRegistry) -> PolarsResult<()> {
    let mut contributing: Vec<String> = registry
        .columns_with_role(ColumnRole::Value)
        .into_iter()
        .map(str::to_string)
        .collect();
    contributing.extend(
        registry
            .columns_with_role(ColumnRole::RawValue)
            .into_iter()
            .map(str::to_string),
    );
    let converted: Vec<String> = registry
        .columns_with_role(ColumnRole::Converted)
        .into_iter()
        .map(str::to_string)
        .collect();

    let total = row_sum(df, &contributing)?;
    df.with_column(Series::new(TOTAL_COLUMN.into(), total))?;
    registry.register_derived(
        None,
        ColumnSpec {
            name: TOTAL_COLUMN.to_string(),
            source_column: None,
            role: ColumnRole::Total,
        },
    );

    let converted_total_name = converted_name(TOTAL_COLUMN);
    let converted_total = row_sum(df, &converted)?;
    df.with_column(Series::new(converted_total_name.as_str().into(), converted_total))?;
    registry.register_derived(
        None,
        ColumnSpec {
            name: converted_total_name,
            source_column: None,
            role: ColumnRole::Total,
        },
    );

    Ok(())
}

fn row_sum(df: &DataFrame, columns: &[String]) -> PolarsResult<Vec<f64>> {
    let mut totals = vec![0.0; df.height()];
    for name in columns {
        let Some(values) = numeric_values(df, name)? else {
            continue;
        };
        for (total, value) in totals.iter_mut().zip(values) {
            if let Some(value) = value.filter(|v| !v.is_nan()) {
                *total += value;
            }
        }
    }
    Ok(totals)
}

/// Adds `<column>_diff_<lag>` = current - value `lag` rows earlier, for every
/// measured-value column and the total. Where there is no earlier value the
/// current value is its own baseline, so the difference is 0.
pub fn add_lag_differences(
    df: &mut DataFrame,
    registry: &mut SchemaRegistry,
    lag: usize,
    scope: LagScope,
) -> PolarsResult<()> {
    let groups = lag_groups(df, scope)?;

    for target in lag_targets(registry) {
        let Some(values) = numeric_values(df, &target)? else {
            continue;
        };
        let shifted = shift_within_groups(&values, &groups, lag);
        let diff: Vec<Option<f64>> = values
            .iter()
            .zip(shifted.iter())
            .map(|(current, previous)| {
                let current = (*current)?;
                Some(current - previous.unwrap_or(current))
            })
            .collect();

        let name = lag_diff_name(&target, lag);
        df.with_column(Series::new(name.as_str().into(), diff))?;
        registry.register_derived(
            None,
            ColumnSpec {
                name,
                source_column: Some(target),
                role: ColumnRole::LagDiff,
            },
        );
    }

    Ok(())
}

/// Adds `<column>_pct_change_<lag>` = (current - previous) / previous * 100.
/// A null previous value gives null; a zero previous value gives an infinite
/// or NaN result, which is kept as is.
pub fn add_percent_changes(
    df: &mut DataFrame,
    registry: &mut SchemaRegistry,
    lag: usize,
    scope: LagScope,
) -> PolarsResult<()> {
    let groups = lag_groups(df, scope)?;

    for target in lag_targets(registry) {
        let Some(values) = numeric_values(df, &target)? else {
            continue;
        };
        let shifted = shift_within_groups(&values, &groups, lag);
        let pct: Vec<Option<f64>> = values
            .iter()
            .zip(shifted.iter())
            .map(|(current, previous)| {
                let (current, previous) = ((*current)?, (*previous)?);
                Some((current - previous) / previous * 100.0)
            })
            .collect();

        let name = pct_change_name(&target, lag);
        df.with_column(Series::new(name.as_str().into(), pct))?;
        registry.register_derived(
            None,
            ColumnSpec {
                name,
                source_column: Some(target),
                role: ColumnRole::PctChange,
            },
        );
    }

    Ok(())
}

fn lag_targets(registry: &SchemaRegistry) -> Vec<String> {
    let mut targets: Vec<String> = registry
        .columns_with_role(ColumnRole::Value)
        .into_iter()
        .map(str::to_string)
        .collect();
    targets.push(TOTAL_COLUMN.to_string());
    targets
}

/// Column values coerced to `f64`; cells that are not numeric become null.
fn numeric_values(df: &DataFrame, name: &str) -> PolarsResult<Option<Vec<Option<f64>>>> {
    let Ok(column) = df.column(name) else {
        return Ok(None);
    };
    let values = column.cast(&DataType::Float64)?;
    let values = values.f64()?.into_iter().collect();
    Ok(Some(values))
}

/// Group id per row. Per-site grouping requires each site's rows to be
/// contiguous and ascending by timestamp.
fn lag_groups(df: &DataFrame, scope: LagScope) -> PolarsResult<Vec<usize>> {
    let height = df.height();
    if scope == LagScope::Global {
        return Ok(vec![0; height]);
    }

    let sites = df.column(SITE_COLUMN)?.str()?;
    let timestamps = df.column(TIMESTAMP_COLUMN)?.datetime()?;

    let mut groups = Vec::with_capacity(height);
    let mut seen: HashSet<Option<&str>> = HashSet::new();
    let mut group = 0;

    for idx in 0..height {
        let site = sites.get(idx);
        if idx == 0 {
            seen.insert(site);
        } else if site != sites.get(idx - 1) {
            if !seen.insert(site) {
                return Err(PolarsError::ComputeError(
                    format!("rows for site {site:?} are not contiguous; sort before computing lags")
                        .into(),
                ));
            }
            group += 1;
        } else if timestamps.get(idx) < timestamps.get(idx - 1) {
            return Err(PolarsError::ComputeError(
                format!("rows for site {site:?} are not ascending by {TIMESTAMP_COLUMN}").into(),
            ));
        }
        groups.push(group);
    }

    Ok(groups)
}

fn shift_within_groups(values: &[Option<f64>], groups: &[usize], lag: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|idx| {
            let earlier = idx.checked_sub(lag)?;
            if groups[earlier] != groups[idx] {
                return None;
            }
            values[earlier]
        })
        .collect()
}
