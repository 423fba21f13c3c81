//! Row cleaning: deduplicate, coerce numerics, drop invalid rows, fill
//! missing categoricals. The order of the steps is fixed.

use std::collections::HashSet;
use tracing::info;

use crate::config::PipelineConfig;
use crate::model::{CleanRow, Field, MappedRow, MappedTable};

/// Counters reported in the run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanStats {
    pub rows_in: usize,
    pub duplicates_dropped: usize,
    pub invalid_dropped: usize,
    pub sentinel_fills: usize,
}

/// Integer coercion. Whole floats ("2.0") are accepted; anything else is null.
pub fn parse_int(raw: &str) -> Option<i64> {
    let s = raw.trim();
    if let Ok(n) = s.parse::<i64>() {
        return Some(n);
    }
    parse_float(s)
        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
        .map(|f| f as i64)
}

/// Float coercion. A lone decimal comma is read as a decimal point;
/// NaN and infinities are null.
pub fn parse_float(raw: &str) -> Option<f64> {
    let s = raw.trim();
    let parsed = match s.parse::<f64>() {
        Ok(f) => Some(f),
        Err(_) if s.matches(',').count() == 1 && !s.contains('.') => {
            s.replace(',', ".").parse::<f64>().ok()
        }
        Err(_) => None,
    };
    parsed.filter(|f| f.is_finite())
}

fn dedup_key(row: &MappedRow) -> Option<String> {
    row.get(&Field::Id).map(|raw| match parse_int(raw) {
        Some(n) => n.to_string(),
        None => raw.clone(),
    })
}

/// Keep the first occurrence in source order. With `id` in the contract the
/// id decides; otherwise the whole canonical row does.
fn deduplicate(rows: Vec<MappedRow>, by_id: bool) -> Vec<MappedRow> {
    if by_id {
        let mut seen: HashSet<Option<String>> = HashSet::new();
        rows.into_iter()
            .filter(|row| seen.insert(dedup_key(row)))
            .collect()
    } else {
        let mut seen: HashSet<MappedRow> = HashSet::new();
        rows.into_iter()
            .filter(|row| seen.insert(row.clone()))
            .collect()
    }
}

/// Coerced numeric cells of one row.
struct Numerics {
    id: Option<i64>,
    cantidad: Option<i64>,
    precio_unitario: Option<f64>,
    total_venta: Option<f64>,
}

impl Numerics {
    fn coerce(row: &MappedRow) -> Self {
        Self {
            id: row.get(&Field::Id).and_then(|v| parse_int(v)),
            cantidad: row.get(&Field::Cantidad).and_then(|v| parse_int(v)),
            precio_unitario: row.get(&Field::PrecioUnitario).and_then(|v| parse_float(v)),
            total_venta: row.get(&Field::TotalVenta).and_then(|v| parse_float(v)),
        }
    }

    fn passes(&self, constrained: &[Field]) -> bool {
        constrained.iter().all(|field| match field {
            Field::Cantidad => self.cantidad.is_some_and(|v| v > 0),
            Field::PrecioUnitario => self.precio_unitario.is_some_and(|v| v > 0.0),
            Field::TotalVenta => self.total_venta.is_some_and(|v| v > 0.0),
            _ => true,
        })
    }
}

pub fn clean(mapped: MappedTable, config: &PipelineConfig) -> (Vec<CleanRow>, CleanStats) {
    let mut stats = CleanStats {
        rows_in: mapped.rows.len(),
        ..CleanStats::default()
    };

    // Blank cells are nulls from here on
    let rows: Vec<MappedRow> = mapped
        .rows
        .into_iter()
        .map(|row| row.into_iter().filter(|(_, v)| !v.is_empty()).collect())
        .collect();

    let rows = deduplicate(rows, config.contract_includes(Field::Id));
    stats.duplicates_dropped = stats.rows_in - rows.len();

    let mut cleaned = Vec::with_capacity(rows.len());
    for mut row in rows {
        let numerics = Numerics::coerce(&row);
        if !numerics.passes(&config.constrained) {
            stats.invalid_dropped += 1;
            continue;
        }

        let fecha = row.remove(&Field::Fecha);
        // Only surviving rows get sentinels
        let mut categorical = |field: Field| match row.remove(&field) {
            Some(v) => v,
            None => {
                stats.sentinel_fills += 1;
                config.sentinels.get(&field).cloned().unwrap_or_default()
            }
        };

        cleaned.push(CleanRow {
            id: numerics.id,
            fecha,
            producto: categorical(Field::Producto),
            categoria: categorical(Field::Categoria),
            region: categorical(Field::Region),
            cliente: categorical(Field::Cliente),
            vendedor: categorical(Field::Vendedor),
            cantidad: numerics.cantidad,
            precio_unitario: numerics.precio_unitario,
            total_venta: numerics.total_venta,
        });
    }

    info!(
        rows_in = stats.rows_in,
        duplicates = stats.duplicates_dropped,
        invalid = stats.invalid_dropped,
        kept = cleaned.len(),
        "cleaned rows"
    );
    (cleaned, stats)
}
