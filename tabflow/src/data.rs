//! Row model shared by all table backends: cells, rows and the table spec.

use serde::{Deserialize, Serialize};

/// A single value in a row. Closed set of types; `Missing` stands for an
/// absent value of any column type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cell {
    Int(i64),
    Double(f64),
    Str(String),
    Missing,
}

/// One table row: a stable row key plus one cell per spec column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub key: String,
    pub cells: Vec<Cell>,
}

impl Row {
    pub fn new(key: impl Into<String>, cells: Vec<Cell>) -> Self {
        Row {
            key: key.into(),
            cells,
        }
    }
}

/// Declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int,
    Double,
    Str,
}

/// Name and type of one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Column {
            name: name.into(),
            ty,
        }
    }
}

/// Schema descriptor of a table: the ordered list of its columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    columns: Vec<Column>,
}

impl TableSpec {
    pub fn new(columns: Vec<Column>) -> Self {
        TableSpec { columns }
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_column_spec() -> TableSpec {
        TableSpec::new(vec![
            Column::new("id", ColumnType::Int),
            Column::new("name", ColumnType::Str),
        ])
    }

    #[test]
    fn test_spec_accessors() {
        let spec = two_column_spec();
        assert_eq!(spec.num_columns(), 2);
        assert_eq!(spec.column(0).map(|c| c.name.as_str()), Some("id"));
        assert_eq!(spec.column(1).map(|c| c.ty), Some(ColumnType::Str));
        assert!(spec.column(2).is_none());
    }

    #[test]
    fn test_row_construction() {
        let row = Row::new("row0", vec![Cell::Int(1), Cell::Str("a".into())]);
        assert_eq!(row.key, "row0");
        assert_eq!(row.cells.len(), 2);
        assert_eq!(row.cells[1], Cell::Str("a".into()));
    }
}
