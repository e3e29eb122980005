//! Formula error types

use thiserror::Error;

/// Result type for formula operations
pub type FormulaResult<T> = std::result::Result<T, FormulaError>;

/// Message reported for a division by zero
pub const DIVISION_BY_ZERO: &str = "Division by zero";

/// Message reported for a formula that (indirectly) reads itself
pub const CIRCULAR_REFERENCE: &str = "Circular reference";

/// Errors that can occur during formula tokenizing, parsing or evaluation
///
/// The `Display` form of an evaluation error is what gets stored as a
/// cell's error, so the well-known variants render their message verbatim.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    /// Formula could not be split into tokens
    #[error("Tokenize error at {position}: {message}")]
    Tokenize { position: usize, message: String },

    /// Formula parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Division by zero
    #[error("Division by zero")]
    DivisionByZero,

    /// The formula reads its own result
    #[error("Circular reference")]
    CircularReference,

    /// A value could not be used where it appeared
    #[error("Invalid value: {0}")]
    Value(String),

    /// Unknown function
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// Wrong number of arguments
    #[error("Wrong number of arguments for {function}: expected {expected}, got {actual}")]
    ArgumentCount {
        function: String,
        expected: String,
        actual: usize,
    },

    /// Error literal written in the formula, or an error read from another cell
    #[error("{0}")]
    Propagated(String),
}
