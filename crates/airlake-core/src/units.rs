//! Concentration units reported by the export API, normalized to grams per litre.

/// Unit symbol and the factor that converts a value in that unit to g/L.
pub const UNIT_FACTORS: [(&str, f64); 3] = [
    ("mg-m3", 1e-3),
    ("µg-m3", 1e-6),
    ("ng-m3", 1e-9),
];

/// Factor for a unit symbol; `None` for anything outside the table.
pub fn conversion_factor(symbol: &str) -> Option<f64> {
    let symbol = symbol.trim();
    UNIT_FACTORS
        .iter()
        .find(|(known, _)| *known == symbol)
        .map(|(_, factor)| *factor)
}

/// Carries the nearest known unit across gaps: forward fill, then backward fill
/// for the leading nulls.
pub fn resolve_units(units: &[Option<String>]) -> Vec<Option<String>> {
    let mut resolved: Vec<Option<String>> = Vec::with_capacity(units.len());

    let mut last: Option<&String> = None;
    for unit in units {
        if let Some(value) = unit {
            last = Some(value);
        }
        resolved.push(last.cloned());
    }

    let mut next: Option<String> = None;
    for slot in resolved.iter_mut().rev() {
        match slot {
            Some(value) => next = Some(value.clone()),
            None => *slot = next.clone(),
        }
    }

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_symbols_resolve_to_factors() {
        assert_eq!(conversion_factor("mg-m3"), Some(1e-3));
        assert_eq!(conversion_factor("µg-m3"), Some(1e-6));
        assert_eq!(conversion_factor(" ng-m3 "), Some(1e-9));
        assert_eq!(conversion_factor("ppm"), None);
    }

    #[test]
    fn resolve_units_fills_forward_then_backward() {
        let units = vec![
            None,
            Some("µg-m3".to_string()),
            None,
            Some("mg-m3".to_string()),
            None,
        ];
        let resolved = resolve_units(&units);
        assert_eq!(
            resolved,
            vec![
                Some("µg-m3".to_string()),
                Some("µg-m3".to_string()),
                Some("µg-m3".to_string()),
                Some("mg-m3".to_string()),
                Some("mg-m3".to_string()),
            ]
        );
    }

    #[test]
    fn resolve_units_leaves_all_null_column_null() {
        let resolved = resolve_units(&[None, None]);
        assert_eq!(resolved, vec![None, None]);
    }
}
