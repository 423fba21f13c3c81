//! Parser, column mapper and schema validator.
//!
//! These three stages are pure functions over in-memory tables. Same input
//! always yields the same output.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

use crate::error::{EtlError, Result};
use crate::model::{Field, MappedRow, MappedTable, RawRow, RawTable};

// =============================================================================
// Parser
// =============================================================================

/// Decode the fetched bytes as delimited UTF-8 text with a header row.
///
/// The delimiter is `;` when the header line has semicolons and no commas,
/// `,` otherwise. Cells are trimmed. Short rows simply lack the trailing
/// headers; lines the csv reader rejects are skipped with a warning.
pub fn parse_table(bytes: &[u8]) -> Result<RawTable> {
    let content = encoding_rs::UTF_8
        .decode_without_bom_handling_and_without_replacement(bytes)
        .ok_or_else(|| EtlError::Parse("content is not valid UTF-8".to_string()))?;

    // Remove UTF-8 BOM if present
    let content: &str = &content;
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);

    if content.trim().is_empty() {
        return Err(EtlError::Parse("source is empty".to_string()));
    }

    let header_line = content.lines().next().unwrap_or_default();
    let delimiter = if header_line.contains(';') && !header_line.contains(',') {
        b';'
    } else {
        b','
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| EtlError::Parse(format!("failed to read header row: {}", e)))?
        .iter()
        .map(|h| h.to_string())
        .collect();

    if headers.iter().all(|h| h.is_empty()) {
        return Err(EtlError::Parse("header row has no column names".to_string()));
    }

    let mut rows = Vec::new();
    for (line_idx, result) in reader.records().enumerate() {
        let line_num = line_idx + 2; // +1 for 0-index, +1 for header
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!(line = line_num, error = %e, "skipping unreadable line");
                continue;
            }
        };

        let mut row = RawRow::with_capacity(headers.len());
        for (header, value) in headers.iter().zip(record.iter()) {
            if header.is_empty() {
                continue;
            }
            // Repeated header: first cell wins
            row.entry(header.clone()).or_insert_with(|| value.to_string());
        }
        rows.push(row);
    }

    debug!(columns = headers.len(), rows = rows.len(), "parsed source table");
    Ok(RawTable { headers, rows })
}

// =============================================================================
// Column mapper
// =============================================================================

fn normalize_header(header: &str) -> String {
    header.trim().to_lowercase()
}

/// Rename raw headers to canonical fields.
///
/// Unmapped headers are dropped. When several headers map to the same
/// field, the first one in source order is used. Cells missing from a row
/// stay missing.
pub fn map_columns(raw: &RawTable, mapping: &BTreeMap<String, Field>) -> MappedTable {
    let lookup: HashMap<String, Field> = mapping
        .iter()
        .map(|(header, field)| (normalize_header(header), *field))
        .collect();

    let mut claimed: Vec<(&str, Field)> = Vec::new();
    let mut columns = BTreeSet::new();
    for header in &raw.headers {
        if let Some(field) = lookup.get(&normalize_header(header)) {
            if columns.insert(*field) {
                claimed.push((header.as_str(), *field));
            }
        }
    }

    let rows = raw
        .rows
        .iter()
        .map(|row| {
            claimed
                .iter()
                .filter_map(|(header, field)| row.get(*header).map(|v| (*field, v.clone())))
                .collect::<MappedRow>()
        })
        .collect();

    MappedTable { columns, rows }
}

// =============================================================================
// Schema validator
// =============================================================================

/// Contract fields absent from the mapped columns, in contract order.
pub fn missing_columns(columns: &BTreeSet<Field>, contract: &[Field]) -> Vec<Field> {
    let mut seen = BTreeSet::new();
    contract
        .iter()
        .copied()
        .filter(|f| !columns.contains(f) && seen.insert(*f))
        .collect()
}

/// Halt on any missing contract column. Runs once per table, not per row.
pub fn validate_schema(mapped: &MappedTable, contract: &[Field]) -> Result<()> {
    let missing = missing_columns(&mapped.columns, contract);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(EtlError::Schema { missing })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    fn mapping(pairs: &[(&str, Field)]) -> BTreeMap<String, Field> {
        pairs.iter().map(|(h, f)| (h.to_string(), *f)).collect()
    }

    // -------------------------------------------------------------------------
    // PARSER
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_basic_table() {
        let csv = "producto,cantidad\nsilla,2\nmesa,1\n";
        let table = parse_table(csv.as_bytes()).unwrap();
        assert_eq!(table.headers, vec!["producto", "cantidad"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0]["producto"], "silla");
        assert_eq!(table.rows[1]["cantidad"], "1");
    }

    #[test]
    fn test_parse_trims_cells() {
        let csv = "producto , cantidad\n  silla  ,  2 \n";
        let table = parse_table(csv.as_bytes()).unwrap();
        assert_eq!(table.rows[0]["producto"], "silla");
        assert_eq!(table.rows[0]["cantidad"], "2");
    }

    #[test]
    fn test_parse_with_bom() {
        let csv = "\u{feff}producto,cantidad\nsilla,2\n";
        let table = parse_table(csv.as_bytes()).unwrap();
        assert_eq!(table.headers[0], "producto");
    }

    #[test]
    fn test_parse_semicolon_delimiter() {
        let csv = "producto;precio_unitario\nsilla;50.5\n";
        let table = parse_table(csv.as_bytes()).unwrap();
        assert_eq!(table.rows[0]["precio_unitario"], "50.5");
    }

    #[test]
    fn test_parse_short_row_lacks_trailing_cells() {
        let csv = "producto,cantidad,region\nsilla,2\n";
        let table = parse_table(csv.as_bytes()).unwrap();
        assert_eq!(table.rows[0].get("region"), None);
        assert_eq!(table.rows[0]["cantidad"], "2");
    }

    #[test]
    fn test_parse_header_only() {
        let table = parse_table(b"producto,cantidad\n").unwrap();
        assert_eq!(table.headers.len(), 2);
        assert!(table.rows.is_empty());
    }

    #[test]
    fn test_parse_empty_stream_fails() {
        assert!(matches!(parse_table(b""), Err(EtlError::Parse(_))));
        assert!(matches!(parse_table(b"  \n\n"), Err(EtlError::Parse(_))));
    }

    #[test]
    fn test_parse_invalid_utf8_fails() {
        let bytes = b"producto,cantidad\nsill\xff,2\n";
        let err = parse_table(bytes).unwrap_err();
        assert!(err.to_string().contains("UTF-8"));
    }

    #[test]
    fn test_parse_quoted_delimiter() {
        let csv = "producto,cliente\nsilla,\"Perez, Juan\"\n";
        let table = parse_table(csv.as_bytes()).unwrap();
        assert_eq!(table.rows[0]["cliente"], "Perez, Juan");
    }

    // -------------------------------------------------------------------------
    // COLUMN MAPPER
    // -------------------------------------------------------------------------

    #[test]
    fn test_map_drops_unmapped_columns() {
        let raw = parse_table(b"Producto,Notas\nsilla,urgente\n").unwrap();
        let mapped = map_columns(&raw, &mapping(&[("producto", Field::Producto)]));
        assert_eq!(mapped.columns, BTreeSet::from([Field::Producto]));
        assert_eq!(mapped.rows[0].len(), 1);
        assert_eq!(mapped.rows[0][&Field::Producto], "silla");
    }

    #[test]
    fn test_map_matches_headers_case_insensitively() {
        let raw = parse_table("Precio Unitario,CATEGORÍA\n10,Sillas\n".as_bytes()).unwrap();
        let mapped = map_columns(&raw, &PipelineConfig::facturas().mapping);
        assert_eq!(mapped.rows[0][&Field::PrecioUnitario], "10");
        assert_eq!(mapped.rows[0][&Field::Categoria], "Sillas");
    }

    #[test]
    fn test_map_does_not_fabricate_missing_cells() {
        let raw = parse_table(b"producto,region\nsilla\n").unwrap();
        let mapped = map_columns(
            &raw,
            &mapping(&[("producto", Field::Producto), ("region", Field::Region)]),
        );
        assert!(mapped.columns.contains(&Field::Region));
        assert!(!mapped.rows[0].contains_key(&Field::Region));
    }

    #[test]
    fn test_map_first_header_wins_for_same_field() {
        let raw = parse_table(b"fecha,fecha_venta\n2025-01-10,2024-12-31\n").unwrap();
        let mapped = map_columns(
            &raw,
            &mapping(&[("fecha", Field::Fecha), ("fecha_venta", Field::Fecha)]),
        );
        assert_eq!(mapped.rows[0][&Field::Fecha], "2025-01-10");
    }

    #[test]
    fn test_map_is_deterministic() {
        let raw = parse_table(b"producto,cantidad,region\nsilla,2,norte\nmesa,1,sur\n").unwrap();
        let config = PipelineConfig::ventas();
        let baseline = map_columns(&raw, &config.mapping);
        for _ in 0..10 {
            assert_eq!(map_columns(&raw, &config.mapping), baseline);
        }
    }

    // -------------------------------------------------------------------------
    // SCHEMA VALIDATOR
    // -------------------------------------------------------------------------

    #[test]
    fn test_validate_passes_when_all_present() {
        let raw = parse_table(b"producto,cantidad\nsilla,2\n").unwrap();
        let mapped = map_columns(
            &raw,
            &mapping(&[("producto", Field::Producto), ("cantidad", Field::Cantidad)]),
        );
        validate_schema(&mapped, &[Field::Producto, Field::Cantidad]).unwrap();
    }

    #[test]
    fn test_validate_names_exactly_the_missing_columns() {
        let raw = parse_table(b"producto,cantidad\nsilla,2\n").unwrap();
        let mapped = map_columns(
            &raw,
            &mapping(&[("producto", Field::Producto), ("cantidad", Field::Cantidad)]),
        );
        let err = validate_schema(
            &mapped,
            &[Field::Id, Field::Producto, Field::Cantidad, Field::TotalVenta],
        )
        .unwrap_err();
        match err {
            EtlError::Schema { missing } => {
                assert_eq!(missing, vec![Field::Id, Field::TotalVenta]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_validate_uses_headers_for_empty_tables() {
        let raw = parse_table(b"producto,cantidad\n").unwrap();
        let mapped = map_columns(
            &raw,
            &mapping(&[("producto", Field::Producto), ("cantidad", Field::Cantidad)]),
        );
        validate_schema(&mapped, &[Field::Producto, Field::Cantidad]).unwrap();
    }
}
