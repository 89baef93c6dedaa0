//! Tabular source data: rows, cells, and row identity.
//!
//! A [`Row`] is an ordered mapping of column name to [`CellValue`], exactly as
//! it came out of the spreadsheet. Loading and parsing the spreadsheet itself
//! is a caller concern; the engine consumes rows that are already
//! materialized.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier for a source row.
///
/// Derived at chunking time from the policy's key column, or from the row's
/// ordinal position when no key column is declared.
pub type RowId = String;

/// A single scalar cell value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Empty,
}

impl CellValue {
    /// Returns `true` for [`CellValue::Empty`] and for whitespace-only text.
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(text) => text.trim().is_empty(),
            _ => false,
        }
    }

    /// Numeric view of the cell, parsing numeric-looking text.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(value) => Some(*value),
            CellValue::Text(text) => text.trim().replace(',', "").parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Text(text) => f.write_str(text),
            CellValue::Number(value) => write!(f, "{value}"),
            CellValue::Bool(value) => write!(f, "{value}"),
            CellValue::Empty => Ok(()),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Number(value as f64)
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        CellValue::Bool(value)
    }
}

/// One record from the tabular source: an ordered column → value mapping.
///
/// Column order is preserved because it feeds the deterministic chunk
/// rendering; two rows with the same cells in a different order render
/// differently on purpose.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    cells: Vec<(String, CellValue)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a row from `(column, value)` pairs, preserving order.
    pub fn from_cells<C, V>(cells: impl IntoIterator<Item = (C, V)>) -> Self
    where
        C: Into<String>,
        V: Into<CellValue>,
    {
        Self {
            cells: cells
                .into_iter()
                .map(|(column, value)| (column.into(), value.into()))
                .collect(),
        }
    }

    /// Appends a cell, builder style.
    #[must_use]
    pub fn with_cell(mut self, column: impl Into<String>, value: impl Into<CellValue>) -> Self {
        self.cells.push((column.into(), value.into()));
        self
    }

    /// Looks up a cell by column name (case-insensitive, trimmed).
    pub fn get(&self, column: &str) -> Option<&CellValue> {
        let wanted = column.trim();
        self.cells
            .iter()
            .find(|(name, _)| name.trim().eq_ignore_ascii_case(wanted))
            .map(|(_, value)| value)
    }

    /// Iterates cells in column order.
    pub fn cells(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.cells
            .iter()
            .map(|(column, value)| (column.as_str(), value))
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }
}
