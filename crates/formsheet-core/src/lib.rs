//! # formsheet-core
//!
//! Core data structures for the formsheet recalculation engine.
//!
//! This crate provides the fundamental types used throughout formsheet:
//! - [`CellAddress`] and [`CellRange`] - Cell addressing and ranges
//! - [`Coordinate`] - Scope-qualified references and their normalization
//! - [`CellValue`] and [`CellState`] - Stored values and per-run evaluation state
//! - [`model`] - Periods, sheets, documents, divisions, cells and limitations
//!
//! ## Example
//!
//! ```rust
//! use formsheet_core::{coordinate, Coordinate};
//!
//! let c = Coordinate::parse("Form2!B3", None).unwrap();
//! assert_eq!(c.relative_to("Form2").to_string(), "B3");
//! assert_eq!(coordinate::normalize("Form2!B3", "Form1").unwrap(), "Form2!B3");
//! ```

pub mod cell;
pub mod coordinate;
pub mod error;
pub mod model;

// Re-exports for convenience
pub use cell::{CellAddress, CellRange, CellState, CellValue};
pub use coordinate::Coordinate;
pub use error::{Error, Result};
pub use model::{
    AggregationMethod, Cell, CellKind, CellPos, Division, DivisionId, Document, DocumentId,
    Limitation, PeriodId, Sheet, SheetId,
};

/// Maximum number of rows in a sheet
pub const MAX_ROWS: u32 = 1_048_576;

/// Maximum number of columns in a sheet
pub const MAX_COLS: u16 = 16_384;
