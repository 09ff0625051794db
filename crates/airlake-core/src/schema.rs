//! Column roles for the staging tables and the curated wide table.
//!
//! Every later pass looks columns up here instead of matching name suffixes.

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use serde::Serialize;

pub const SITE_COLUMN: &str = "code_site";
pub const TIMESTAMP_COLUMN: &str = "date_de_debut";
pub const KEY_COLUMNS: [&str; 2] = [SITE_COLUMN, TIMESTAMP_COLUMN];

pub const VALUE_COLUMN: &str = "valeur";
pub const RAW_VALUE_COLUMN: &str = "valeur_brute";
pub const UNIT_COLUMN: &str = "unite_de_mesure";

/// Staging columns that carry no information once tables are merged.
pub const DROPPED_COLUMNS: [&str; 2] = ["date_de_fin", "polluant"];

pub const TOTAL_COLUMN: &str = "total_valeur_particule";
pub const CONVERTED_SUFFIX: &str = "g_par_l";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    Key,
    Value,
    RawValue,
    Unit,
    QualityFlag,
    CaptureRate,
    Attribute,
    Converted,
    Total,
    LagDiff,
    PctChange,
}

static STAGING_ROLES: Lazy<HashMap<&'static str, ColumnRole>> = Lazy::new(|| {
    HashMap::from([
        (SITE_COLUMN, ColumnRole::Key),
        (TIMESTAMP_COLUMN, ColumnRole::Key),
        (VALUE_COLUMN, ColumnRole::Value),
        (RAW_VALUE_COLUMN, ColumnRole::RawValue),
        (UNIT_COLUMN, ColumnRole::Unit),
        ("code_qualite", ColumnRole::QualityFlag),
        ("validite", ColumnRole::QualityFlag),
        ("taux_de_saisie", ColumnRole::CaptureRate),
    ])
});

impl ColumnRole {
    /// Role of a column as it appears in a staging table, before prefixing.
    pub fn classify(staging_column: &str) -> Self {
        STAGING_ROLES
            .get(staging_column)
            .copied()
            .unwrap_or(ColumnRole::Attribute)
    }

    /// Roles whose cells are measurements and take part in the mean fill.
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ColumnRole::Value | ColumnRole::RawValue | ColumnRole::CaptureRate
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnSpec {
    /// Name in the wide table.
    pub name: String,
    /// Name in the staging table it came from, if any.
    pub source_column: Option<String>,
    pub role: ColumnRole,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<ColumnSpec>,
}

impl TableSchema {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
        }
    }

    pub fn push(&mut self, spec: ColumnSpec) {
        self.columns.push(spec);
    }

    /// First column of this table holding the given role.
    pub fn column(&self, role: ColumnRole) -> Option<&str> {
        self.columns
            .iter()
            .find(|spec| spec.role == role)
            .map(|spec| spec.name.as_str())
    }

    pub fn columns_with_role(&self, role: ColumnRole) -> impl Iterator<Item = &ColumnSpec> {
        self.columns.iter().filter(move |spec| spec.role == role)
    }
}

/// Table name -> column name -> role, plus the columns added by feature passes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaRegistry {
    tables: BTreeMap<String, TableSchema>,
    derived: Vec<ColumnSpec>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_table(&mut self, schema: TableSchema) {
        self.tables.insert(schema.table.clone(), schema);
    }

    /// Records a column added by a feature pass, attached to its source table when it has one.
    pub fn register_derived(&mut self, table: Option<&str>, spec: ColumnSpec) {
        match table.and_then(|name| self.tables.get_mut(name)) {
            Some(schema) => schema.push(spec),
            None => self.derived.push(spec),
        }
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// All wide-table columns with the given role, in table order.
    pub fn columns_with_role(&self, role: ColumnRole) -> Vec<&str> {
        self.tables
            .values()
            .flat_map(|schema| schema.columns.iter())
            .chain(self.derived.iter())
            .filter(|spec| spec.role == role)
            .map(|spec| spec.name.as_str())
            .collect()
    }

    pub fn numeric_columns(&self) -> Vec<&str> {
        self.tables
            .values()
            .flat_map(|schema| schema.columns.iter())
            .filter(|spec| spec.role.is_numeric())
            .map(|spec| spec.name.as_str())
            .collect()
    }

    pub fn role_of(&self, column: &str) -> Option<ColumnRole> {
        if KEY_COLUMNS.contains(&column) {
            return Some(ColumnRole::Key);
        }
        self.tables
            .values()
            .flat_map(|schema| schema.columns.iter())
            .chain(self.derived.iter())
            .find(|spec| spec.name == column)
            .map(|spec| spec.role)
    }
}

pub fn prefixed(table: &str, column: &str) -> String {
    format!("{table}_{column}")
}

pub fn converted_name(column: &str) -> String {
    format!("{column}_{CONVERTED_SUFFIX}")
}

pub fn lag_diff_name(column: &str, lag: usize) -> String {
    format!("{column}_diff_{lag}")
}

pub fn pct_change_name(column: &str, lag: usize) -> String {
    format!("{column}_pct_change_{lag}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_staging_columns_to_roles() {
        assert_eq!(ColumnRole::classify("valeur"), ColumnRole::Value);
        assert_eq!(ColumnRole::classify("valeur_brute"), ColumnRole::RawValue);
        assert_eq!(ColumnRole::classify("unite_de_mesure"), ColumnRole::Unit);
        assert_eq!(ColumnRole::classify("validite"), ColumnRole::QualityFlag);
        assert_eq!(ColumnRole::classify("taux_de_saisie"), ColumnRole::CaptureRate);
        // ends in "valeur" but is descriptive text
        assert_eq!(ColumnRole::classify("type_de_valeur"), ColumnRole::Attribute);
    }

    #[test]
    fn registry_tracks_roles_across_tables_and_derived_columns() {
        let mut registry = SchemaRegistry::new();
        for table in ["no2", "o3"] {
            let mut schema = TableSchema::new(table);
            schema.push(ColumnSpec {
                name: prefixed(table, VALUE_COLUMN),
                source_column: Some(VALUE_COLUMN.into()),
                role: ColumnRole::Value,
            });
            schema.push(ColumnSpec {
                name: prefixed(table, "nom_site"),
                source_column: Some("nom_site".into()),
                role: ColumnRole::Attribute,
            });
            registry.register_table(schema);
        }
        registry.register_derived(
            None,
            ColumnSpec {
                name: TOTAL_COLUMN.into(),
                source_column: None,
                role: ColumnRole::Total,
            },
        );

        assert_eq!(
            registry.columns_with_role(ColumnRole::Value),
            vec!["no2_valeur", "o3_valeur"]
        );
        assert_eq!(registry.numeric_columns().len(), 2);
        assert_eq!(registry.role_of(TOTAL_COLUMN), Some(ColumnRole::Total));
        assert_eq!(registry.role_of(SITE_COLUMN), Some(ColumnRole::Key));
        assert_eq!(registry.role_of("missing"), None);
        assert_eq!(
            registry.table("o3").and_then(|s| s.column(ColumnRole::Value)),
            Some("o3_valeur")
        );
    }
}
