//! Formula evaluation
//!
//! The engine hands an evaluator one scope at a time: an [`Environment`] of
//! coordinates (normalized against that scope) mapped to live formulas,
//! resolved values, or captured errors. The evaluator returns a result for
//! every formula in the environment.
//!
//! [`FlatEvaluator`] is the reference implementation used by the engine unless
//! another evaluator is plugged in.

use crate::ast::{BinaryOperator, FormulaExpr, UnaryOperator};
use crate::error::{FormulaError, FormulaResult};
use crate::functions::FunctionRegistry;
use crate::parser::parse_formula;
use ahash::{AHashMap, AHashSet};
use formsheet_core::{CellState, CellValue, Coordinate};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Per-scope evaluation input: normalized coordinate to its state
pub type Environment = BTreeMap<String, CellState>;

/// Outcome of evaluating one formula
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Value(CellValue),
    /// Error message, e.g. [`crate::DIVISION_BY_ZERO`]
    Error(String),
}

impl Evaluation {
    pub fn is_error(&self) -> bool {
        matches!(self, Evaluation::Error(_))
    }
}

impl From<Evaluation> for CellState {
    fn from(evaluation: Evaluation) -> Self {
        match evaluation {
            Evaluation::Value(v) => CellState::Value(v),
            Evaluation::Error(e) => CellState::Error(e),
        }
    }
}

/// Evaluates every formula of one scope's environment
///
/// A per-formula failure is reported as [`Evaluation::Error`]; an `Err` return
/// means the evaluator itself failed and aborts the whole recalculation.
pub trait FormulaEvaluator: Send + Sync {
    fn evaluate(
        &self,
        scope: &str,
        environment: &Environment,
    ) -> FormulaResult<BTreeMap<String, Evaluation>>;
}

/// Global function registry (lazily initialized)
static FUNCTION_REGISTRY: OnceLock<FunctionRegistry> = OnceLock::new();

fn get_function_registry() -> &'static FunctionRegistry {
    FUNCTION_REGISTRY.get_or_init(FunctionRegistry::new)
}

/// Value types during formula evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum FormulaValue {
    Number(f64),
    String(String),
    Boolean(bool),
    /// Values of a range, row by row
    Array(Vec<FormulaValue>),
    Empty,
}

impl FormulaValue {
    /// Convert to number, if possible
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FormulaValue::Number(n) => Some(*n),
            FormulaValue::Boolean(true) => Some(1.0),
            FormulaValue::Boolean(false) => Some(0.0),
            FormulaValue::String(s) => s.trim().parse().ok(),
            FormulaValue::Empty => Some(0.0),
            FormulaValue::Array(_) => None,
        }
    }

    /// Force conversion to number for arithmetic
    pub fn to_number(&self) -> FormulaResult<f64> {
        self.as_number()
            .ok_or_else(|| FormulaError::Value(format!("expected a number, got {}", self.describe())))
    }

    /// Convert to boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FormulaValue::Boolean(b) => Some(*b),
            FormulaValue::Number(n) => Some(*n != 0.0),
            FormulaValue::Empty => Some(false),
            FormulaValue::String(s) => {
                if s.eq_ignore_ascii_case("TRUE") {
                    Some(true)
                } else if s.eq_ignore_ascii_case("FALSE") {
                    Some(false)
                } else {
                    None
                }
            }
            FormulaValue::Array(_) => None,
        }
    }

    /// Force conversion to boolean for conditions
    pub fn to_bool(&self) -> FormulaResult<bool> {
        self.as_bool()
            .ok_or_else(|| FormulaError::Value(format!("expected a condition, got {}", self.describe())))
    }

    /// Convert to string
    pub fn as_string(&self) -> String {
        match self {
            FormulaValue::Array(_) => String::new(),
            scalar => CellValue::from(scalar.clone()).to_string(),
        }
    }

    fn describe(&self) -> String {
        match self {
            FormulaValue::String(s) => format!("text \"{}\"", s),
            FormulaValue::Array(_) => "a range".to_string(),
            other => other.as_string(),
        }
    }
}

impl From<CellValue> for FormulaValue {
    fn from(value: CellValue) -> Self {
        match value {
            CellValue::Empty => FormulaValue::Empty,
            CellValue::Number(n) => FormulaValue::Number(n),
            CellValue::Text(s) => FormulaValue::String(s),
            CellValue::Boolean(b) => FormulaValue::Boolean(b),
        }
    }
}

impl From<FormulaValue> for CellValue {
    fn from(value: FormulaValue) -> Self {
        match value {
            FormulaValue::Empty => CellValue::Empty,
            FormulaValue::Number(n) => CellValue::Number(n),
            FormulaValue::String(s) => CellValue::Text(s),
            FormulaValue::Boolean(b) => CellValue::Boolean(b),
            // A single-cell range reads as its cell
            FormulaValue::Array(mut values) if values.len() == 1 => values.remove(0).into(),
            FormulaValue::Array(_) => CellValue::Empty,
        }
    }
}

/// Reference evaluator
///
/// Evaluates each formula at most once per call, reading other formulas of
/// the scope on demand. Errors read from another cell propagate verbatim;
/// a formula that reaches itself evaluates to [`crate::CIRCULAR_REFERENCE`].
/// Coordinates absent from the environment read as empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatEvaluator;

impl FlatEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl FormulaEvaluator for FlatEvaluator {
    fn evaluate(
        &self,
        scope: &str,
        environment: &Environment,
    ) -> FormulaResult<BTreeMap<String, Evaluation>> {
        let mut session = Session {
            scope,
            environment,
            memo: AHashMap::new(),
            in_progress: AHashSet::new(),
            parsed: AHashMap::new(),
        };

        let mut results = BTreeMap::new();
        for (coord, state) in environment {
            if state.formula().is_none() {
                continue;
            }
            let evaluation = match session.resolve(coord) {
                Ok(value) => Evaluation::Value(value.into()),
                Err(e) => Evaluation::Error(e.to_string()),
            };
            results.insert(coord.clone(), evaluation);
        }
        Ok(results)
    }
}

/// Evaluate a standalone formula that reads no cells
///
/// ```rust
/// use formsheet_formula::{evaluate_formula, FormulaValue};
///
/// assert_eq!(evaluate_formula("=1+2*3").unwrap(), FormulaValue::Number(7.0));
/// ```
pub fn evaluate_formula(formula: &str) -> FormulaResult<FormulaValue> {
    let environment = Environment::new();
    let mut session = Session {
        scope: "",
        environment: &environment,
        memo: AHashMap::new(),
        in_progress: AHashSet::new(),
        parsed: AHashMap::new(),
    };
    let ast = parse_formula(formula)?;
    session.evaluate(&ast)
}

struct Session<'a> {
    scope: &'a str,
    environment: &'a Environment,
    memo: AHashMap<String, FormulaResult<FormulaValue>>,
    in_progress: AHashSet<String>,
    parsed: AHashMap<String, FormulaResult<FormulaExpr>>,
}

impl Session<'_> {
    fn resolve(&mut self, key: &str) -> FormulaResult<FormulaValue> {
        if let Some(done) = self.memo.get(key) {
            return done.clone();
        }

        match self.environment.get(key) {
            None => return Ok(FormulaValue::Empty),
            Some(CellState::Value(v)) => return Ok(v.clone().into()),
            Some(CellState::Error(e)) => return Err(FormulaError::Propagated(e.clone())),
            Some(CellState::Formula(_)) => {}
        }
        if self.in_progress.contains(key) {
            return Err(FormulaError::CircularReference);
        }

        self.settle(key);
        match self.memo.get(key) {
            Some(done) => done.clone(),
            None => Err(FormulaError::CircularReference),
        }
    }

    /// Evaluate the formula at `root` and every unevaluated formula it reads,
    /// dependencies first
    ///
    /// Walks with an explicit stack so chain length never turns into call
    /// depth. A formula is in `in_progress` from the moment its references
    /// are expanded until its value is memoized; reading such a formula is a
    /// cycle.
    fn settle(&mut self, root: &str) {
        let environment = self.environment;
        let mut stack: Vec<(String, bool)> = vec![(root.to_string(), false)];
        while let Some((key, expanded)) = stack.pop() {
            if expanded {
                self.compute(&key);
                continue;
            }
            if self.memo.contains_key(&key) || self.in_progress.contains(&key) {
                continue;
            }
            let Some(CellState::Formula(formula)) = environment.get(&key) else {
                continue;
            };

            let parsed = parse_formula(formula);
            let mut references = Vec::new();
            if let Ok(ast) = &parsed {
                self.collect_references(ast, &mut references);
            }
            self.parsed.insert(key.clone(), parsed);
            self.in_progress.insert(key.clone());

            stack.push((key, true));
            for reference in references {
                if !self.memo.contains_key(&reference) && !self.in_progress.contains(&reference) {
                    stack.push((reference, false));
                }
            }
        }
    }

    /// Evaluate one expanded formula; what it reads is already memoized or
    /// still in progress
    fn compute(&mut self, key: &str) {
        let result = match self.parsed.remove(key) {
            Some(Ok(ast)) => self.evaluate(&ast),
            Some(Err(e)) => Err(e),
            None => return,
        };
        self.in_progress.remove(key);

        let result = match result {
            Ok(FormulaValue::Array(values)) if values.len() != 1 => Err(FormulaError::Value(
                "a range cannot be a cell's value".into(),
            )),
            Ok(FormulaValue::Array(mut values)) => Ok(values.remove(0)),
            other => other,
        };
        self.memo.insert(key.to_string(), result);
    }

    /// Keys of the formula cells of this environment an expression reads
    fn collect_references(&self, expr: &FormulaExpr, out: &mut Vec<String>) {
        expr.for_each_cell(&mut |sheet, address| {
            let key = self.key(sheet, address);
            if matches!(self.environment.get(&key), Some(CellState::Formula(_))) {
                out.push(key);
            }
        });
    }

    fn key(&self, sheet: Option<&str>, address: formsheet_core::CellAddress) -> String {
        Coordinate {
            scope: sheet.map(str::to_string),
            address,
        }
        .relative_to(self.scope)
        .to_string()
    }

    fn evaluate(&mut self, expr: &FormulaExpr) -> FormulaResult<FormulaValue> {
        match expr {
            // === Literals ===
            FormulaExpr::Number(n) => Ok(FormulaValue::Number(*n)),
            FormulaExpr::String(s) => Ok(FormulaValue::String(s.clone())),
            FormulaExpr::Boolean(b) => Ok(FormulaValue::Boolean(*b)),
            FormulaExpr::Error(e) => Err(FormulaError::Propagated(e.clone())),

            // === References ===
            FormulaExpr::CellRef(cell_ref) => {
                let key = self.key(cell_ref.sheet.as_deref(), cell_ref.address);
                self.resolve(&key)
            }

            FormulaExpr::RangeRef(range_ref) => {
                let mut values = Vec::with_capacity(range_ref.range.cell_count() as usize);
                for address in range_ref.range.cells() {
                    let key = self.key(range_ref.sheet.as_deref(), address);
                    values.push(self.resolve(&key)?);
                }
                Ok(FormulaValue::Array(values))
            }

            FormulaExpr::NameRef(name) => Err(FormulaError::Value(format!("unknown name '{}'", name))),

            // === Operators ===
            FormulaExpr::BinaryOp { op, left, right } => {
                let left = self.scalar(left)?;
                let right = self.scalar(right)?;
                evaluate_binary_op(*op, &left, &right)
            }

            FormulaExpr::UnaryOp { op, operand } => {
                let n = self.scalar(operand)?.to_number()?;
                Ok(FormulaValue::Number(match op {
                    UnaryOperator::Negate => -n,
                    UnaryOperator::Percent => n / 100.0,
                }))
            }

            // === Functions ===
            FormulaExpr::Function { name, args } => self.evaluate_function(name, args),
        }
    }

    /// Evaluate an operand that must be a single value
    fn scalar(&mut self, expr: &FormulaExpr) -> FormulaResult<FormulaValue> {
        match self.evaluate(expr)? {
            FormulaValue::Array(mut values) if values.len() == 1 => Ok(values.remove(0)),
            FormulaValue::Array(_) => Err(FormulaError::Value(
                "a range cannot be used as a single value".into(),
            )),
            value => Ok(value),
        }
    }

    fn evaluate_function(&mut self, name: &str, args: &[FormulaExpr]) -> FormulaResult<FormulaValue> {
        // Only the taken branch is evaluated
        match name {
            "IF" => {
                check_arg_count(name, args.len(), 2, Some(3))?;
                let condition = self.scalar(&args[0])?.to_bool()?;
                return if condition {
                    self.evaluate(&args[1])
                } else {
                    args.get(2)
                        .map_or(Ok(FormulaValue::Boolean(false)), |e| self.evaluate(e))
                };
            }
            "IFERROR" => {
                check_arg_count(name, args.len(), 2, Some(2))?;
                return match self.evaluate(&args[0]) {
                    Ok(value) => Ok(value),
                    Err(_) => self.evaluate(&args[1]),
                };
            }
            _ => {}
        }

        let registry = get_function_registry();
        let func = registry
            .get(name)
            .ok_or_else(|| FormulaError::UnknownFunction(name.to_string()))?;
        check_arg_count(name, args.len(), func.min_args, func.max_args)?;

        let mut evaluated_args = Vec::with_capacity(args.len());
        for arg in args {
            evaluated_args.push(self.evaluate(arg)?);
        }

        (func.implementation)(&evaluated_args)
    }
}

fn check_arg_count(name: &str, actual: usize, min: usize, max: Option<usize>) -> FormulaResult<()> {
    if actual < min {
        return Err(FormulaError::ArgumentCount {
            function: name.to_string(),
            expected: format!("at least {}", min),
            actual,
        });
    }
    if let Some(max) = max {
        if actual > max {
            return Err(FormulaError::ArgumentCount {
                function: name.to_string(),
                expected: format!("at most {}", max),
                actual,
            });
        }
    }
    Ok(())
}

fn evaluate_binary_op(
    op: BinaryOperator,
    left: &FormulaValue,
    right: &FormulaValue,
) -> FormulaResult<FormulaValue> {
    let arithmetic = |f: fn(f64, f64) -> f64| -> FormulaResult<FormulaValue> {
        let result = f(left.to_number()?, right.to_number()?);
        if result.is_finite() {
            Ok(FormulaValue::Number(result))
        } else {
            Err(FormulaError::Value("numeric overflow".into()))
        }
    };

    match op {
        BinaryOperator::Add => arithmetic(|l, r| l + r),
        BinaryOperator::Subtract => arithmetic(|l, r| l - r),
        BinaryOperator::Multiply => arithmetic(|l, r| l * r),
        BinaryOperator::Divide => {
            if right.to_number()? == 0.0 {
                left.to_number()?;
                return Err(FormulaError::DivisionByZero);
            }
            arithmetic(|l, r| l / r)
        }
        BinaryOperator::Power => arithmetic(f64::powf),

        BinaryOperator::Equal => Ok(FormulaValue::Boolean(compare_values(left, right).is_eq())),
        BinaryOperator::NotEqual => Ok(FormulaValue::Boolean(compare_values(left, right).is_ne())),
        BinaryOperator::LessThan => Ok(FormulaValue::Boolean(compare_values(left, right).is_lt())),
        BinaryOperator::LessEqual => Ok(FormulaValue::Boolean(compare_values(left, right).is_le())),
        BinaryOperator::GreaterThan => {
            Ok(FormulaValue::Boolean(compare_values(left, right).is_gt()))
        }
        BinaryOperator::GreaterEqual => {
            Ok(FormulaValue::Boolean(compare_values(left, right).is_ge()))
        }

        BinaryOperator::Concat => Ok(FormulaValue::String(left.as_string() + &right.as_string())),
    }
}

/// Compare two values for ordering
///
/// Empty compares as 0 against numbers and as "" against text. Text that
/// parses as a number compares numerically against a number, since stored
/// values often arrive as raw text. Remaining mixed types order as
/// number < text < boolean.
fn compare_values(left: &FormulaValue, right: &FormulaValue) -> Ordering {
    use FormulaValue::*;

    match (left, right) {
        (Empty, Empty) => Ordering::Equal,
        (Empty, String(_)) => compare_values(&String(std::string::String::new()), right),
        (String(_), Empty) => compare_values(left, &String(std::string::String::new())),
        (Empty, _) => compare_values(&Number(0.0), right),
        (_, Empty) => compare_values(left, &Number(0.0)),

        (Number(l), Number(r)) => l.partial_cmp(r).unwrap_or(Ordering::Equal),
        (String(l), String(r)) => l.to_lowercase().cmp(&r.to_lowercase()),
        (Boolean(l), Boolean(r)) => l.cmp(r),

        (Number(l), String(s)) => match s.trim().parse::<f64>() {
            Ok(r) => l.partial_cmp(&r).unwrap_or(Ordering::Equal),
            Err(_) => Ordering::Less,
        },
        (String(_), Number(_)) => compare_values(right, left).reverse(),

        (Number(_), Boolean(_)) | (String(_), Boolean(_)) => Ordering::Less,
        (Boolean(_), Number(_)) | (Boolean(_), String(_)) => Ordering::Greater,

        (Array(_), _) | (_, Array(_)) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CIRCULAR_REFERENCE, DIVISION_BY_ZERO};
    use pretty_assertions::assert_eq;

    fn eval(formula: &str) -> FormulaResult<FormulaValue> {
        evaluate_formula(formula)
    }

    fn env(entries: &[(&str, CellState)]) -> Environment {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn formula(f: &str) -> CellState {
        CellState::Formula(f.to_string())
    }

    fn value(v: impl Into<CellValue>) -> CellState {
        CellState::Value(v.into())
    }

    #[test]
    fn test_evaluate_arithmetic() {
        assert_eq!(eval("=1+2").unwrap(), FormulaValue::Number(3.0));
        assert_eq!(eval("=10-4/2").unwrap(), FormulaValue::Number(8.0));
        assert_eq!(eval("=2^10").unwrap(), FormulaValue::Number(1024.0));
        assert_eq!(eval("=-5%").unwrap(), FormulaValue::Number(-0.05));
        assert_eq!(eval("=\"3\"*2").unwrap(), FormulaValue::Number(6.0));
    }

    #[test]
    fn test_evaluate_division_by_zero() {
        assert_eq!(eval("=1/0"), Err(FormulaError::DivisionByZero));
        assert_eq!(
            eval("=IFERROR(1/0, \"n/a\")").unwrap(),
            FormulaValue::String("n/a".into())
        );
    }

    #[test]
    fn test_evaluate_comparison() {
        assert_eq!(eval("=1<2").unwrap(), FormulaValue::Boolean(true));
        assert_eq!(eval("=\"abc\"=\"ABC\"").unwrap(), FormulaValue::Boolean(true));
        assert_eq!(eval("=\"10\">9").unwrap(), FormulaValue::Boolean(true));
        assert_eq!(eval("=TRUE>100").unwrap(), FormulaValue::Boolean(true));
    }

    #[test]
    fn test_evaluate_if_is_lazy() {
        assert_eq!(eval("=IF(1>0, \"\", 1/0)").unwrap(), FormulaValue::String("".into()));
        assert_eq!(eval("=IF(FALSE, 1)").unwrap(), FormulaValue::Boolean(false));
        assert!(eval("=IF(\"maybe\", 1, 2)").is_err());
    }

    #[test]
    fn test_evaluate_functions() {
        assert_eq!(eval("=SUM(1, 2, 3)").unwrap(), FormulaValue::Number(6.0));
        assert_eq!(eval("=ROUND(2.5, 0)").unwrap(), FormulaValue::Number(3.0));
        assert_eq!(eval("=ROUND(-2.5)").unwrap(), FormulaValue::Number(-3.0));
        assert_eq!(
            eval("=CONCATENATE(\"a\", 1, TRUE)").unwrap(),
            FormulaValue::String("a1TRUE".into())
        );
        assert!(matches!(eval("=NOPE(1)"), Err(FormulaError::UnknownFunction(_))));
        assert!(matches!(eval("=ABS()"), Err(FormulaError::ArgumentCount { .. })));
    }

    #[test]
    fn test_flat_evaluator_chain() {
        let environment = env(&[
            ("A1", value(2.0)),
            ("B1", formula("=A1*10")),
            ("C1", formula("=B1+Form2!A1")),
            ("Form2!A1", value(5.0)),
        ]);
        let results = FlatEvaluator.evaluate("Form1", &environment).unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results["B1"], Evaluation::Value(CellValue::Number(20.0)));
        assert_eq!(results["C1"], Evaluation::Value(CellValue::Number(25.0)));
    }

    #[test]
    fn test_flat_evaluator_qualified_own_scope() {
        let environment = env(&[("A1", value(3.0)), ("B1", formula("=form1!A1+1"))]);
        let results = FlatEvaluator.evaluate("Form1", &environment).unwrap();
        assert_eq!(results["B1"], Evaluation::Value(CellValue::Number(4.0)));
    }

    #[test]
    fn test_flat_evaluator_errors() {
        let environment = env(&[
            ("A1", value(0.0)),
            ("B1", formula("=10/A1")),
            ("C1", formula("=B1+1")),
            ("D1", formula("=Other!A1*2")),
            ("Other!A1", CellState::Error("Broken".into())),
            ("E1", formula("=SUM(A1:A3)")),
        ]);
        let results = FlatEvaluator.evaluate("Form1", &environment).unwrap();

        assert_eq!(results["B1"], Evaluation::Error(DIVISION_BY_ZERO.into()));
        assert_eq!(results["C1"], Evaluation::Error(DIVISION_BY_ZERO.into()));
        assert_eq!(results["D1"], Evaluation::Error("Broken".into()));
        assert_eq!(results["E1"], Evaluation::Value(CellValue::Number(0.0)));
    }

    #[test]
    fn test_flat_evaluator_circular() {
        let environment = env(&[
            ("A1", formula("=B1")),
            ("B1", formula("=A1")),
            ("C1", formula("=7")),
        ]);
        let results = FlatEvaluator.evaluate("Form1", &environment).unwrap();

        assert_eq!(results["A1"], Evaluation::Error(CIRCULAR_REFERENCE.into()));
        assert_eq!(results["B1"], Evaluation::Error(CIRCULAR_REFERENCE.into()));
        assert_eq!(results["C1"], Evaluation::Value(CellValue::Number(7.0)));
    }

    /// Test that a long same-scope chain evaluates without deep call nesting
    #[test]
    fn test_flat_evaluator_long_chain() {
        let mut environment = env(&[("A1", value(1.0))]);
        for row in 2..=6000 {
            environment.insert(format!("A{}", row), formula(&format!("=A{}+1", row - 1)));
        }
        let results = FlatEvaluator.evaluate("Form1", &environment).unwrap();

        assert_eq!(results.len(), 5999);
        assert_eq!(results["A6000"], Evaluation::Value(CellValue::Number(6000.0)));
        assert_eq!(results["A2"], Evaluation::Value(CellValue::Number(2.0)));
    }

    /// Test that every member of a long cycle is reported circular
    #[test]
    fn test_flat_evaluator_long_cycle() {
        let mut environment = env(&[("A1", formula("=A5000+1"))]);
        for row in 2..=5000 {
            environment.insert(format!("A{}", row), formula(&format!("=A{}+1", row - 1)));
        }
        environment.insert("B1".into(), formula("=A1*0+3"));
        let results = FlatEvaluator.evaluate("Form1", &environment).unwrap();

        let circular = Evaluation::Error(CIRCULAR_REFERENCE.into());
        assert!(results
            .iter()
            .filter(|(key, _)| key.starts_with('A'))
            .all(|(_, evaluation)| *evaluation == circular));
        assert_eq!(results["B1"], circular);
    }

    #[test]
    fn test_flat_evaluator_unparsable_formula() {
        let environment = env(&[("A1", formula("=1+"))]);
        let results = FlatEvaluator.evaluate("Form1", &environment).unwrap();
        assert!(results["A1"].is_error());
    }
}
