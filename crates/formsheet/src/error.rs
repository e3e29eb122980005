//! Error types for the formsheet engine

use formsheet_core::{CellPos, DocumentId};
use formsheet_formula::FormulaError;
use thiserror::Error;

/// Result type alias using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by caches, storage, the engine and the bulk imports
///
/// Per-cell evaluation failures are not errors: they are stored as the cell's
/// state and reported in the run's results.
#[derive(Debug, Error)]
pub enum Error {
    /// Core (address, coordinate, record) error
    #[error(transparent)]
    Core(#[from] formsheet_core::Error),

    /// Formula tokenizing, parsing, or evaluator failure
    #[error(transparent)]
    Formula(#[from] FormulaError),

    /// A dependency graph whose inversion is not the transpose of its dependencies
    #[error("Dependency graph for '{scope}' is inconsistent: {reason}")]
    GraphInconsistency { scope: String, reason: String },

    /// An aggregation edge failed validation
    #[error("Aggregation edge rejected: {reason}")]
    AggregationRejected { reason: String },

    /// Aggregation kept re-entering the engine, the division hierarchy is cyclic or too deep
    #[error("Aggregation cascade exceeded depth {depth} at document {document}")]
    AggregationDepthExceeded { depth: usize, document: DocumentId },

    /// Bulk import rejected; nothing was written
    #[error("Import failed{}: {message}", record_suffix(.position))]
    Import {
        /// 0-based index of the offending record, if the file parsed as a list
        position: Option<usize>,
        message: String,
    },

    /// Storage collaborator failure
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Unknown sheet: {0}")]
    UnknownSheet(String),

    #[error("Unknown document: {0}")]
    UnknownDocument(DocumentId),

    #[error("Unknown cell: {0}")]
    UnknownCell(CellPos),

    #[error("Sheet name already in use: {0}")]
    DuplicateSheetName(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn record_suffix(position: &Option<usize>) -> String {
    position
        .map(|p| format!(" at record {}", p))
        .unwrap_or_default()
}

impl Error {
    pub(crate) fn import<S: Into<String>>(position: usize, message: S) -> Self {
        Error::Import {
            position: Some(position),
            message: message.into(),
        }
    }

    pub(crate) fn rejected<S: Into<String>>(reason: S) -> Self {
        Error::AggregationRejected {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_message() {
        assert_eq!(
            Error::import(3, "unknown sheet 'X'").to_string(),
            "Import failed at record 3: unknown sheet 'X'"
        );
        let whole_file = Error::Import {
            position: None,
            message: "expected a list".into(),
        };
        assert_eq!(whole_file.to_string(), "Import failed: expected a list");
    }
}
