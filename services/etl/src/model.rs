//! Table shapes that flow between pipeline stages.
//!
//! Each stage owns its own row type so a later stage can rely on the
//! invariants established by an earlier one:
//!
//! RawTable -> MappedTable -> Vec<CleanRow> -> SalesTable

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

// =============================================================================
// Canonical fields
// =============================================================================

/// Pipeline-internal column name, decoupled from the source header text.
///
/// Declaration order is the column order of every artifact and table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Id,
    Fecha,
    Producto,
    Categoria,
    Region,
    Cliente,
    Vendedor,
    Cantidad,
    PrecioUnitario,
    TotalVenta,
}

impl Field {
    pub const ALL: [Field; 10] = [
        Field::Id,
        Field::Fecha,
        Field::Producto,
        Field::Categoria,
        Field::Region,
        Field::Cliente,
        Field::Vendedor,
        Field::Cantidad,
        Field::PrecioUnitario,
        Field::TotalVenta,
    ];

    pub const CATEGORICAL: [Field; 5] = [
        Field::Producto,
        Field::Categoria,
        Field::Region,
        Field::Cliente,
        Field::Vendedor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Field::Id => "id",
            Field::Fecha => "fecha",
            Field::Producto => "producto",
            Field::Categoria => "categoria",
            Field::Region => "region",
            Field::Cliente => "cliente",
            Field::Vendedor => "vendedor",
            Field::Cantidad => "cantidad",
            Field::PrecioUnitario => "precio_unitario",
            Field::TotalVenta => "total_venta",
        }
    }

    /// Fields the cleaner coerces to numbers.
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Field::Cantidad | Field::PrecioUnitario | Field::TotalVenta
        )
    }

    pub fn is_categorical(self) -> bool {
        Field::CATEGORICAL.contains(&self)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Stage tables
// =============================================================================

/// One source line keyed by the original header text.
pub type RawRow = HashMap<String, String>;

/// Parser output: headers in source order plus the rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

/// One row after column mapping. Only canonical fields present in the
/// source row appear as keys.
pub type MappedRow = BTreeMap<Field, String>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappedTable {
    /// Canonical fields produced by at least one mapped header.
    pub columns: BTreeSet<Field>,
    pub rows: Vec<MappedRow>,
}

/// Cleaner output: numerics coerced, categoricals filled, date still raw.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanRow {
    pub id: Option<i64>,
    pub fecha: Option<String>,
    pub producto: String,
    pub categoria: String,
    pub region: String,
    pub cliente: String,
    pub vendedor: String,
    pub cantidad: Option<i64>,
    pub precio_unitario: Option<f64>,
    pub total_venta: Option<f64>,
}

/// Final canonical record written to the artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct SalesRecord {
    pub id: Option<i64>,
    pub fecha: Option<NaiveDateTime>,
    pub producto: String,
    pub categoria: String,
    pub region: String,
    pub cliente: String,
    pub vendedor: String,
    pub cantidad: Option<i64>,
    pub precio_unitario: Option<f64>,
    pub total_venta: Option<f64>,
}

/// Which optional columns the table carries. The categorical fields,
/// `fecha`, `cantidad` and `precio_unitario` are always present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnSet {
    pub id: bool,
    pub total_venta: bool,
}

impl ColumnSet {
    pub fn from_columns(columns: &BTreeSet<Field>) -> Self {
        Self {
            id: columns.contains(&Field::Id),
            total_venta: columns.contains(&Field::TotalVenta),
        }
    }

    /// Output columns in stable order.
    pub fn fields(&self) -> Vec<Field> {
        Field::ALL
            .into_iter()
            .filter(|f| match f {
                Field::Id => self.id,
                Field::TotalVenta => self.total_venta,
                _ => true,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SalesTable {
    pub columns: ColumnSet,
    pub records: Vec<SalesRecord>,
}

impl SalesTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_serde_names_match_column_names() {
        for field in Field::ALL {
            let json = serde_json::to_string(&field).unwrap();
            assert_eq!(json, format!("\"{}\"", field.as_str()));
        }
    }

    #[test]
    fn test_column_set_order_is_stable() {
        let cols = ColumnSet {
            id: true,
            total_venta: false,
        };
        let names: Vec<&str> = cols.fields().into_iter().map(Field::as_str).collect();
        assert_eq!(
            names,
            vec![
                "id",
                "fecha",
                "producto",
                "categoria",
                "region",
                "cliente",
                "vendedor",
                "cantidad",
                "precio_unitario"
            ]
        );
    }
}
