//! Cell-related types and utilities
//!
//! This module contains:
//! - [`CellValue`] - The value a document stores for a cell
//! - [`CellState`] - The per-run state handed to the evaluator
//! - [`CellAddress`] - A cell's location (e.g., "A1")
//! - [`CellRange`] - A range of cells (e.g., "A1:B10")

mod address;
mod value;

pub use address::{CellAddress, CellRange, CellRangeIterator};
pub use value::{CellState, CellValue};
