use sqlgate_contracts::{CellValue, ColumnType, ErrorKind, QueryError, ResultColumn, ResultSet};

use crate::executor::{RawRows, RawValue};

/// Normalizes driver rows into a `ResultSet`. `enforced_limit` is the LIMIT
/// the statement ran under; reaching it marks the result as truncated, so
/// `LIMIT 0` always reports `truncated`.
pub fn format_result(raw: RawRows, enforced_limit: usize) -> Result<ResultSet, QueryError> {
    let columns: Vec<ResultColumn> = raw
        .columns
        .into_iter()
        .map(|column| ResultColumn {
            column_type: ColumnType::from_declared(&column.declared_type),
            name: column.name,
            declared_type: column.declared_type,
        })
        .collect();

    let mut rows = Vec::with_capacity(raw.rows.len());
    for (index, row) in raw.rows.into_iter().enumerate() {
        if row.len() != columns.len() {
            return Err(format_error(format!(
                "row {} has {} values for {} columns",
                index,
                row.len(),
                columns.len()
            )));
        }
        let cells = row
            .into_iter()
            .zip(columns.iter())
            .map(|(value, column)| normalize_cell(value, column))
            .collect::<Result<Vec<_>, _>>()?;
        rows.push(cells);
    }

    let row_count = rows.len();
    Ok(ResultSet {
        columns,
        rows,
        row_count,
        truncated: row_count == enforced_limit,
    })
}

fn normalize_cell(value: RawValue, column: &ResultColumn) -> Result<CellValue, QueryError> {
    Ok(match (value, column.column_type) {
        (RawValue::Null, _) => CellValue::Null,
        (RawValue::Float(v), ColumnType::Decimal) => {
            return Err(format_error(format!(
                "column {} is {} but the driver produced the float {}; refusing to coerce",
                column.name, column.declared_type, v
            )));
        }
        (RawValue::Float(v), _) if !v.is_finite() => CellValue::Text(v.to_string()),
        (RawValue::Float(v), _) => CellValue::Float(v),
        (RawValue::Decimal(v), _) => CellValue::Decimal(v),
        (RawValue::Int(v), ColumnType::Decimal) => CellValue::Decimal(v.to_string()),
        (RawValue::Int(v), _) => CellValue::Int(v),
        (RawValue::Bool(v), _) => CellValue::Bool(v),
        (RawValue::Text(v), _) => CellValue::Text(v),
        (RawValue::Json(v), _) => CellValue::Json(v),
        (RawValue::Bytes(v), _) => CellValue::Bytes(hex::encode(v)),
    })
}

fn format_error(message: String) -> QueryError {
    QueryError::new(ErrorKind::ExecutionError, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RawColumn;

    fn column(name: &str, declared_type: &str) -> RawColumn {
        RawColumn {
            name: name.to_string(),
            declared_type: declared_type.to_string(),
        }
    }

    #[test]
    fn count_query_formats_as_single_int_row() {
        let raw = RawRows {
            columns: vec![column("count", "INT8")],
            rows: vec![vec![RawValue::Int(1250)]],
        };

        let set = format_result(raw, 100).expect("count should format");
        assert_eq!(set.columns.len(), 1);
        assert_eq!(set.columns[0].name, "count");
        assert_eq!(set.columns[0].column_type, ColumnType::Int);
        assert_eq!(set.rows, vec![vec![CellValue::Int(1250)]]);
        assert_eq!(set.row_count, 1);
        assert!(!set.truncated);
    }

    #[test]
    fn reaching_the_limit_marks_truncated() {
        let raw = RawRows {
            columns: vec![column("id", "INT4")],
            rows: (0..3).map(|i| vec![RawValue::Int(i)]).collect(),
        };
        assert!(format_result(raw.clone(), 3).expect("format").truncated);
        assert!(!format_result(raw, 4).expect("format").truncated);
    }

    #[test]
    fn limit_zero_with_no_rows_is_truncated() {
        let raw = RawRows {
            columns: vec![column("id", "INT4")],
            rows: Vec::new(),
        };
        let set = format_result(raw, 0).expect("empty result should format");
        assert_eq!(set.row_count, 0);
        assert!(set.truncated);
    }

    #[test]
    fn empty_result_keeps_columns() {
        let raw = RawRows {
            columns: vec![column("name", "TEXT")],
            rows: Vec::new(),
        };
        let set = format_result(raw, 100).expect("empty result should format");
        assert_eq!(set.row_count, 0);
        assert_eq!(set.columns[0].column_type, ColumnType::Text);
        assert!(!set.truncated);
    }

    #[test]
    fn nulls_and_decimals_are_preserved() {
        let raw = RawRows {
            columns: vec![column("total", "NUMERIC"), column("note", "TEXT")],
            rows: vec![
                vec![
                    RawValue::Decimal("12345678901234567890.123456789".to_string()),
                    RawValue::Null,
                ],
                vec![RawValue::Null, RawValue::Text("ok".to_string())],
            ],
        };
        let set = format_result(raw, 100).expect("decimals should format");
        assert_eq!(
            set.rows[0][0],
            CellValue::Decimal("12345678901234567890.123456789".to_string())
        );
        assert!(set.rows[0][1].is_null());
        assert!(set.rows[1][0].is_null());
    }

    #[test]
    fn float_in_decimal_column_is_an_error() {
        let raw = RawRows {
            columns: vec![column("total", "NUMERIC")],
            rows: vec![vec![RawValue::Float(0.1)]],
        };
        let err = format_result(raw, 100).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExecutionError);
        assert!(err.message.contains("total"));
    }

    #[test]
    fn bytes_render_as_lowercase_hex() {
        let raw = RawRows {
            columns: vec![column("blob", "BYTEA")],
            rows: vec![vec![RawValue::Bytes(vec![0xde, 0xad, 0xBE, 0xef])]],
        };
        let set = format_result(raw, 100).expect("bytes should format");
        assert_eq!(set.rows[0][0], CellValue::Bytes("deadbeef".to_string()));
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let raw = RawRows {
            columns: vec![column("a", "INT4"), column("b", "INT4")],
            rows: vec![vec![RawValue::Int(1)]],
        };
        assert_eq!(
            format_result(raw, 100).unwrap_err().kind,
            ErrorKind::ExecutionError
        );
    }
}
