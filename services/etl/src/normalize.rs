//! Case folding of categorical fields and `fecha` parsing.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};

use crate::config::{CaseFold, PipelineConfig};
use crate::model::{CleanRow, ColumnSet, Field, SalesRecord, SalesTable};

/// Title case as spreadsheet tools do it: a letter is upper-cased when the
/// previous character is not a letter, lower-cased otherwise.
pub fn title_case(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_alpha = false;
    for c in value.chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

pub fn apply_case(value: &str, fold: CaseFold) -> String {
    match fold {
        CaseFold::Upper => value.to_uppercase(),
        CaseFold::Title => title_case(value),
        CaseFold::Preserve => value.to_string(),
    }
}

/// Parse a date or date-time. RFC 3339 is tried first (converted to UTC),
/// then each configured format as a date-time and as a plain date.
pub fn parse_fecha(raw: &str, formats: &[String]) -> Option<NaiveDateTime> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    formats.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(s, fmt).ok().or_else(|| {
            NaiveDate::parse_from_str(s, fmt)
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
    })
}

/// Produce the final table. Rows are never dropped here: an unparseable
/// `fecha` becomes null. Returns the table and the number of such dates.
pub fn normalize(rows: Vec<CleanRow>, columns: ColumnSet, config: &PipelineConfig) -> (SalesTable, usize) {
    let fold = |field: Field, value: &str| apply_case(value, config.case_fold_for(field));
    let mut invalid_dates = 0;

    let records = rows
        .into_iter()
        .map(|row| {
            let fecha = row.fecha.as_deref().and_then(|raw| {
                let parsed = parse_fecha(raw, &config.date_formats);
                if parsed.is_none() {
                    invalid_dates += 1;
                }
                parsed
            });
            SalesRecord {
                id: row.id,
                fecha,
                producto: fold(Field::Producto, &row.producto),
                categoria: fold(Field::Categoria, &row.categoria),
                region: fold(Field::Region, &row.region),
                cliente: fold(Field::Cliente, &row.cliente),
                vendedor: fold(Field::Vendedor, &row.vendedor),
                cantidad: row.cantidad,
                precio_unitario: row.precio_unitario,
                total_venta: row.total_venta,
            }
        })
        .collect();

    (SalesTable { columns, records }, invalid_dates)
}
