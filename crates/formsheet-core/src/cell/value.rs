//! Cell value types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents the value stored for a cell in one document
///
/// Serializes to the plain JSON scalar (`null`, number, bool or string).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    /// Empty cell (no value)
    #[default]
    Empty,

    /// Boolean value (TRUE/FALSE)
    Boolean(bool),

    /// Numeric value
    Number(f64),

    /// Text value
    Text(String),
}

impl CellValue {
    /// Create a new text value
    pub fn text<S: Into<String>>(s: S) -> Self {
        CellValue::Text(s.into())
    }

    /// Check if the cell is empty
    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    /// Try to get the value as a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            CellValue::Boolean(true) => Some(1.0),
            CellValue::Boolean(false) => Some(0.0),
            _ => None,
        }
    }

    /// Parse the raw value as a float the way stored values are read back:
    /// numbers as-is, text trimmed and parsed, everything else rejected.
    pub fn parse_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) if n.is_finite() => Some(*n),
            CellValue::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            _ => None,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Boolean(true) => write!(f, "TRUE"),
            CellValue::Boolean(false) => write!(f, "FALSE"),
            CellValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            CellValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        CellValue::Boolean(b)
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::Text(s)
    }
}

/// Per-run state of one coordinate handed to the evaluator
///
/// Only formulas of the scope under evaluation are live; every other
/// coordinate is a resolved value or the error captured for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "data", rename_all = "snake_case")]
pub enum CellState {
    /// A resolved value
    Value(CellValue),
    /// A formula to evaluate (text includes the leading `=`)
    Formula(String),
    /// An evaluation error message
    Error(String),
}

impl CellState {
    /// The formula text, if this is a live formula
    pub fn formula(&self) -> Option<&str> {
        match self {
            CellState::Formula(f) => Some(f),
            _ => None,
        }
    }

    /// The error message, if any
    pub fn error(&self) -> Option<&str> {
        match self {
            CellState::Error(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CellValue> for CellState {
    fn from(value: CellValue) -> Self {
        CellState::Value(value)
    }
}
