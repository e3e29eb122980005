//! # formsheet-formula
//!
//! Formula handling for formsheet.
//!
//! This crate provides:
//! - Formula tokenizing and parsing (text → tokens with spans → AST)
//! - Dependency extraction and the per-scope [`DependencyGraph`]
//! - Reference rewriting between scopes
//! - The [`FormulaEvaluator`] boundary and the reference [`FlatEvaluator`]
//!
//! ## Example
//!
//! ```rust
//! use formsheet_core::CellState;
//! use formsheet_formula::{Environment, Evaluation, FlatEvaluator, FormulaEvaluator};
//!
//! let mut env = Environment::new();
//! env.insert("A1".into(), CellState::Value(2.0.into()));
//! env.insert("B1".into(), CellState::Formula("=A1*3".into()));
//!
//! let results = FlatEvaluator.evaluate("Form1", &env).unwrap();
//! assert_eq!(results["B1"], Evaluation::Value(6.0.into()));
//! ```

pub mod ast;
pub mod dependency;
pub mod error;
pub mod evaluator;
pub mod functions;
pub mod parser;

pub use ast::{BinaryOperator, CellReference, FormulaExpr, RangeReference, UnaryOperator};
pub use dependency::{extract_dependencies, rename_formula_scope, requalify_formula, DependencyGraph};
pub use error::{FormulaError, FormulaResult, CIRCULAR_REFERENCE, DIVISION_BY_ZERO};
pub use evaluator::{
    evaluate_formula, Environment, Evaluation, FlatEvaluator, FormulaEvaluator, FormulaValue,
};
pub use parser::{parse_formula, tokenize};
