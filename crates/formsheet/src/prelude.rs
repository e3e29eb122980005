//! Prelude module - common imports for formsheet users
//!
//! ```rust
//! use formsheet::prelude::*;
//! ```

pub use crate::{
    // Engine
    CellEdit,
    Change,
    Engine,
    EngineOptions,
    RecalcReport,
    // Collaborators
    CacheStore,
    FormulaEvaluator,
    MemoryCacheStore,
    MemoryStorage,
    Storage,
    // Records
    AggregationMethod,
    Cell,
    CellAddress,
    CellKind,
    CellPos,
    CellState,
    CellValue,
    DivisionId,
    DocumentId,
    Limitation,
    LimitationFailure,
    PeriodId,
    SheetId,
    // Error types
    Error,
    Result,
};
