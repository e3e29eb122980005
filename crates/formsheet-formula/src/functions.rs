//! Built-in functions
//!
//! `IF` and `IFERROR` only evaluate the branch they take, so the evaluator
//! handles them itself; everything else receives already-evaluated arguments.

use crate::error::{FormulaError, FormulaResult};
use crate::evaluator::FormulaValue;
use ahash::AHashMap;

/// Function implementation signature
pub type FunctionImpl = fn(&[FormulaValue]) -> FormulaResult<FormulaValue>;

/// Function definition
pub struct FunctionDef {
    /// Function name (uppercase)
    pub name: &'static str,
    /// Minimum arguments
    pub min_args: usize,
    /// Maximum arguments (None = unlimited)
    pub max_args: Option<usize>,
    /// Implementation
    pub implementation: FunctionImpl,
}

/// Function registry
pub struct FunctionRegistry {
    functions: AHashMap<&'static str, FunctionDef>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionRegistry {
    /// Create a new registry with all built-in functions
    pub fn new() -> Self {
        let mut registry = Self {
            functions: AHashMap::new(),
        };

        let builtins: [(&'static str, usize, Option<usize>, FunctionImpl); 12] = [
            ("SUM", 1, None, fn_sum),
            ("AVERAGE", 1, None, fn_average),
            ("MIN", 1, None, fn_min),
            ("MAX", 1, None, fn_max),
            ("COUNT", 1, None, fn_count),
            ("ABS", 1, Some(1), fn_abs),
            ("ROUND", 1, Some(2), fn_round),
            ("AND", 1, None, fn_and),
            ("OR", 1, None, fn_or),
            ("NOT", 1, Some(1), fn_not),
            ("LEN", 1, Some(1), fn_len),
            ("CONCATENATE", 1, None, fn_concatenate),
        ];
        for (name, min_args, max_args, implementation) in builtins {
            registry.register(FunctionDef {
                name,
                min_args,
                max_args,
                implementation,
            });
        }

        registry
    }

    /// Look up a function by name
    pub fn get(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.get(name.to_uppercase().as_str())
    }

    /// Register a function
    pub fn register(&mut self, def: FunctionDef) {
        self.functions.insert(def.name, def);
    }
}

/// Numbers among the arguments
///
/// Direct arguments must convert to a number (empty ones are skipped); inside
/// ranges only numeric cells count, as in spreadsheet aggregates.
fn numbers(args: &[FormulaValue]) -> FormulaResult<Vec<f64>> {
    let mut out = Vec::new();
    for arg in args {
        match arg {
            FormulaValue::Array(values) => {
                out.extend(values.iter().filter_map(|v| match v {
                    FormulaValue::Number(n) => Some(*n),
                    _ => None,
                }));
            }
            FormulaValue::Empty => {}
            other => out.push(other.to_number()?),
        }
    }
    Ok(out)
}

fn scalars(args: &[FormulaValue]) -> impl Iterator<Item = &FormulaValue> {
    args.iter().flat_map(|arg| match arg {
        FormulaValue::Array(values) => values.as_slice(),
        other => std::slice::from_ref(other),
    })
}

fn fn_sum(args: &[FormulaValue]) -> FormulaResult<FormulaValue> {
    Ok(FormulaValue::Number(numbers(args)?.iter().sum()))
}

fn fn_average(args: &[FormulaValue]) -> FormulaResult<FormulaValue> {
    let values = numbers(args)?;
    if values.is_empty() {
        return Err(FormulaError::DivisionByZero);
    }
    Ok(FormulaValue::Number(
        values.iter().sum::<f64>() / values.len() as f64,
    ))
}

fn fn_min(args: &[FormulaValue]) -> FormulaResult<FormulaValue> {
    let min = numbers(args)?.into_iter().reduce(f64::min).unwrap_or(0.0);
    Ok(FormulaValue::Number(min))
}

fn fn_max(args: &[FormulaValue]) -> FormulaResult<FormulaValue> {
    let max = numbers(args)?.into_iter().reduce(f64::max).unwrap_or(0.0);
    Ok(FormulaValue::Number(max))
}

fn fn_count(args: &[FormulaValue]) -> FormulaResult<FormulaValue> {
    let count = scalars(args)
        .filter(|v| matches!(v, FormulaValue::Number(_)))
        .count();
    Ok(FormulaValue::Number(count as f64))
}

fn fn_abs(args: &[FormulaValue]) -> FormulaResult<FormulaValue> {
    Ok(FormulaValue::Number(args[0].to_number()?.abs()))
}

fn fn_round(args: &[FormulaValue]) -> FormulaResult<FormulaValue> {
    let number = args[0].to_number()?;
    let digits = match args.get(1) {
        Some(v) => v.to_number()? as i32,
        None => 0,
    };

    // Round half away from zero
    let multiplier = 10_f64.powi(digits);
    let result = if number >= 0.0 {
        (number * multiplier + 0.5).floor() / multiplier
    } else {
        (number * multiplier - 0.5).ceil() / multiplier
    };
    Ok(FormulaValue::Number(result))
}

fn conditions(args: &[FormulaValue]) -> FormulaResult<Vec<bool>> {
    scalars(args)
        .filter(|v| !matches!(v, FormulaValue::Empty))
        .map(FormulaValue::to_bool)
        .collect()
}

fn fn_and(args: &[FormulaValue]) -> FormulaResult<FormulaValue> {
    Ok(FormulaValue::Boolean(conditions(args)?.into_iter().all(|b| b)))
}

fn fn_or(args: &[FormulaValue]) -> FormulaResult<FormulaValue> {
    Ok(FormulaValue::Boolean(conditions(args)?.into_iter().any(|b| b)))
}

fn fn_not(args: &[FormulaValue]) -> FormulaResult<FormulaValue> {
    Ok(FormulaValue::Boolean(!args[0].to_bool()?))
}

fn fn_len(args: &[FormulaValue]) -> FormulaResult<FormulaValue> {
    if matches!(args[0], FormulaValue::Array(_)) {
        return Err(FormulaError::Value("LEN expects a single value".into()));
    }
    Ok(FormulaValue::Number(args[0].as_string().chars().count() as f64))
}

fn fn_concatenate(args: &[FormulaValue]) -> FormulaResult<FormulaValue> {
    Ok(FormulaValue::String(
        scalars(args).map(FormulaValue::as_string).collect(),
    ))
}
