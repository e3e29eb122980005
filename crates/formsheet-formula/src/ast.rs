//! Parsed form formulas
//!
//! A formula stored on a form cell (`=Form2!B1*2`) parses into a
//! [`FormulaExpr`]. References keep the sheet name exactly as written; it is
//! resolved case-insensitively against the period's sheets later, and a
//! missing name means the sheet that owns the formula.

use formsheet_core::{CellAddress, CellRange};

/// One node of a parsed formula
#[derive(Debug, Clone, PartialEq)]
pub enum FormulaExpr {
    Number(f64),
    String(String),
    Boolean(bool),
    /// An error written into the formula, kept as its display text (`#DIV/0!`)
    Error(String),

    /// `B1` or `Form2!B1`
    CellRef(CellReference),
    /// `A1:A10` or `Form2!A1:A10`, expanded cell by cell when evaluated
    RangeRef(RangeReference),
    /// A bare identifier that is neither a function nor a cell; forms
    /// define no names, so evaluating one fails
    NameRef(String),

    BinaryOp {
        op: BinaryOperator,
        left: Box<FormulaExpr>,
        right: Box<FormulaExpr>,
    },
    UnaryOp {
        op: UnaryOperator,
        operand: Box<FormulaExpr>,
    },

    /// Call of a registered function, name upper-cased by the parser
    Function {
        name: String,
        args: Vec<FormulaExpr>,
    },
}

impl FormulaExpr {
    /// Visit every cell the formula reads, ranges cell by cell
    ///
    /// Both branches of a conditional are visited, so this is the static
    /// read set rather than what one evaluation touches.
    pub fn for_each_cell<F>(&self, visit: &mut F)
    where
        F: FnMut(Option<&str>, CellAddress),
    {
        match self {
            FormulaExpr::CellRef(reference) => visit(reference.sheet.as_deref(), reference.address),
            FormulaExpr::RangeRef(reference) => {
                for address in reference.range.cells() {
                    visit(reference.sheet.as_deref(), address);
                }
            }
            FormulaExpr::BinaryOp { left, right, .. } => {
                left.for_each_cell(visit);
                right.for_each_cell(visit);
            }
            FormulaExpr::UnaryOp { operand, .. } => operand.for_each_cell(visit),
            FormulaExpr::Function { args, .. } => {
                for arg in args {
                    arg.for_each_cell(visit);
                }
            }
            FormulaExpr::Number(_)
            | FormulaExpr::String(_)
            | FormulaExpr::Boolean(_)
            | FormulaExpr::Error(_)
            | FormulaExpr::NameRef(_) => {}
        }
    }
}

/// Reference to one cell, on the owning sheet unless `sheet` is set
#[derive(Debug, Clone, PartialEq)]
pub struct CellReference {
    pub sheet: Option<String>,
    pub address: CellAddress,
}

/// Reference to a rectangle of cells on one sheet
#[derive(Debug, Clone, PartialEq)]
pub struct RangeReference {
    pub sheet: Option<String>,
    pub range: CellRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    /// `^`
    Power,

    /// `=`, comparing text without regard to case
    Equal,
    /// `<>`
    NotEqual,
    LessThan,
    LessEqual,
    GreaterThan,
    GreaterEqual,

    /// `&`
    Concat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    /// Leading `-`
    Negate,
    /// Trailing `%`, dividing by 100
    Percent,
}
