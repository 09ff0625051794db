use polars::prelude::*;
use tracing::debug;

use crate::schema::{SITE_COLUMN, TIMESTAMP_COLUMN};

/// Folds the normalized tables into one wide frame with a full outer join on
/// (`code_site`, `date_de_debut`), then sorts by site and timestamp so every
/// site's rows are contiguous and in time order.
///
/// An empty input yields an empty frame.
pub fn merge_tables(frames: Vec<DataFrame>) -> PolarsResult<DataFrame> {
    let mut iter = frames.into_iter();
    let Some(first) = iter.next() else {
        return Ok(DataFrame::default());
    };

    let mut merged = first.lazy();
    for (idx, frame) in iter.enumerate() {
        debug!(step = idx + 1, rows = frame.height(), "outer join");
        merged = merged.join(
            frame.lazy(),
            [col(SITE_COLUMN), col(TIMESTAMP_COLUMN)],
            [col(SITE_COLUMN), col(TIMESTAMP_COLUMN)],
            JoinArgs::new(JoinType::Full).with_coalesce(JoinCoalesce::CoalesceColumns),
        );
    }

    merged
        .sort_by_exprs(
            [col(SITE_COLUMN), col(TIMESTAMP_COLUMN)],
            SortMultipleOptions::default().with_maintain_order(true),
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn table(site: &[&str], ts: &[i64], value_column: &str, values: &[f64]) -> DataFrame {
        DataFrame::new(vec![
            Series::new(SITE_COLUMN.into(), site).into(),
            Series::new(TIMESTAMP_COLUMN.into(), ts)
                .cast(&DataType::Datetime(TimeUnit::Microseconds, None))
                .unwrap()
                .into(),
            Series::new(value_column.into(), values).into(),
        ])
        .unwrap()
    }

    #[test]
    fn outer_join_keeps_every_key_once() {
        let a = table(&["S1", "S1"], &[1, 2], "a_valeur", &[1.0, 2.0]);
        let b = table(&["S1", "S2"], &[2, 1], "b_valeur", &[20.0, 30.0]);
        let c = table(&["S2"], &[5], "c_valeur", &[7.0]);

        let merged = merge_tables(vec![a, b, c]).unwrap();
        assert_eq!(merged.height(), 4);

        let sites = merged.column(SITE_COLUMN).unwrap().str().unwrap();
        let ts = merged.column(TIMESTAMP_COLUMN).unwrap().datetime().unwrap();
        let keys: HashSet<(String, i64)> = (0..merged.height())
            .map(|idx| (sites.get(idx).unwrap().to_string(), ts.get(idx).unwrap()))
            .collect();
        assert_eq!(keys.len(), merged.height());

        // sorted by (site, timestamp)
        assert_eq!(sites.get(0), Some("S1"));
        assert_eq!(ts.get(0), Some(1));
        assert_eq!(sites.get(3), Some("S2"));
        assert_eq!(ts.get(3), Some(5));

        let b_values = merged.column("b_valeur").unwrap().f64().unwrap();
        assert_eq!(b_values.get(0), None);
        assert_eq!(b_values.get(1), Some(20.0));
        let c_values = merged.column("c_valeur").unwrap().f64().unwrap();
        assert_eq!(c_values.null_count(), 3);
    }

    #[test]
    fn empty_input_yields_empty_frame() {
        let merged = merge_tables(Vec::new()).unwrap();
        assert_eq!(merged.height(), 0);
        assert_eq!(merged.width(), 0);
    }
}
