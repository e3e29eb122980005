//! # formsheet
//!
//! Formula dependency graph and incremental recalculation engine for
//! form-based spreadsheets.
//!
//! Organizations define *periods* (templates of sheets and cells) and each
//! division fills in a *document* per period. This crate keeps, per sheet, a
//! cached graph of which cells each formula reads, and uses it to:
//!
//! - recompute exactly the formulas affected by an edit, across sheets
//! - aggregate values of subordinate divisions' documents up the hierarchy
//! - check a period's limitations (boolean checks gating status transitions)
//!
//! Storage, the byte cache, and the formula evaluator are collaborators
//! behind the [`Storage`], [`CacheStore`] and [`FormulaEvaluator`] traits.
//!
//! ## Example
//!
//! ```rust
//! use formsheet::prelude::*;
//!
//! let mut storage = MemoryStorage::new();
//! storage
//!     .add_sheet(PeriodId(1), SheetId(1), "Form1")
//!     .add_division(DivisionId(1), None)
//!     .add_document(DocumentId(1), PeriodId(1), DivisionId(1));
//!
//! let mut engine = Engine::new(storage, MemoryCacheStore::new());
//! let at = |a1: &str| CellAddress::parse(a1).unwrap();
//!
//! engine
//!     .apply(DocumentId(1), &[CellEdit::formula(SheetId(1), at("C1"), "=A1+B1")])
//!     .unwrap();
//! let report = engine
//!     .apply(
//!         DocumentId(1),
//!         &[
//!             CellEdit::value(SheetId(1), at("A1"), 20.0),
//!             CellEdit::value(SheetId(1), at("B1"), 25.0),
//!         ],
//!     )
//!     .unwrap();
//!
//! let c1 = CellPos::new(SheetId(1), at("C1"));
//! assert_eq!(report.state(c1), Some(&CellState::Value(45.0.into())));
//! ```

pub mod aggregation;
pub mod cache;
pub mod calculation;
pub mod error;
pub mod limitation;
pub mod options;
pub mod prelude;
pub mod storage;

pub use aggregation::{compute, ReductionError};
pub use cache::{
    CacheEntry, CacheFlavor, CacheStore, DependencyCache, FormulaSource, MemoryCacheStore,
    Normalization, ScopeFormulas, LIMITATION_FORMULAS, SHEET_FORMULAS,
};
pub use calculation::{CellEdit, Change, Engine, RecalcReport};
pub use error::{Error, Result};
pub use limitation::{LimitationFailure, LIMITATION_SCOPE};
pub use options::EngineOptions;
pub use storage::{AggregationEdge, MemoryStorage, Storage};

// Re-export core and formula types
pub use formsheet_core::{
    coordinate, AggregationMethod, Cell, CellAddress, CellKind, CellPos, CellRange, CellState,
    CellValue, Coordinate, Division, DivisionId, Document, DocumentId, Limitation, PeriodId,
    Sheet, SheetId,
};
pub use formsheet_formula::{
    extract_dependencies, DependencyGraph, Environment, Evaluation, FlatEvaluator,
    FormulaError, FormulaEvaluator, CIRCULAR_REFERENCE, DIVISION_BY_ZERO,
};
