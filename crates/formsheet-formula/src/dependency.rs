//! Dependency extraction and the per-scope dependency graph
//!
//! A [`DependencyGraph`] records, for one scope (a sheet, or the synthetic
//! limitations scope), which coordinates each formula reads and, inverted,
//! which formulas read each coordinate. Every coordinate it stores is
//! normalized against the graph's own scope (see
//! [`formsheet_core::coordinate::normalize`]).

use crate::error::FormulaResult;
use crate::parser::{tokenize, ReferenceToken, TokenKind};
use formsheet_core::coordinate::{quote_scope, scope_eq};
use formsheet_core::{CellAddress, Coordinate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Coordinates a formula reads, in order of appearance
///
/// Range references are expanded row by row; duplicates are kept, so the
/// result is a multiset. Coordinates are returned as written (prefix and all);
/// normalizing them is up to the caller.
///
/// A formula that cannot be tokenized reads nothing.
///
/// ```rust
/// use formsheet_formula::extract_dependencies;
///
/// let deps = extract_dependencies("=A1+Form2!B1:B2+A1");
/// assert_eq!(deps, vec!["A1", "Form2!B1", "Form2!B2", "A1"]);
/// ```
pub fn extract_dependencies(formula: &str) -> Vec<String> {
    let tokens = match tokenize(formula) {
        Ok(tokens) => tokens,
        Err(e) => {
            tracing::debug!(formula, error = %e, "formula not tokenizable, no dependencies");
            return Vec::new();
        }
    };

    let mut deps = Vec::new();
    for token in tokens {
        if let TokenKind::Reference(reference) = token.kind {
            for address in reference.cells() {
                let coordinate = Coordinate {
                    scope: reference.sheet.clone(),
                    address,
                };
                deps.push(coordinate.to_string());
            }
        }
    }
    deps
}

/// Rewrite every reference of a formula written for `from_scope` so that it
/// reads the same cells when interpreted in `to_scope`
///
/// Unqualified references gain a `from_scope` prefix; references to
/// `to_scope` lose theirs.
///
/// ```rust
/// use formsheet_formula::requalify_formula;
///
/// let f = requalify_formula("A1>Form2!A1", "Form1", "Form2").unwrap();
/// assert_eq!(f, "Form1!A1>A1");
/// ```
pub fn requalify_formula(formula: &str, from_scope: &str, to_scope: &str) -> FormulaResult<String> {
    rewrite_references(formula, |reference| {
        let scope = reference.sheet.as_deref().unwrap_or(from_scope);
        if scope_eq(scope, to_scope) {
            None
        } else {
            Some(scope.to_string())
        }
    })
}

/// Replace the scope prefix `old` with `new` in every reference naming it
///
/// Unqualified references are left alone.
pub fn rename_formula_scope(formula: &str, old: &str, new: &str) -> FormulaResult<String> {
    rewrite_references(formula, |reference| match reference.sheet.as_deref() {
        Some(scope) if scope_eq(scope, old) => Some(new.to_string()),
        other => other.map(str::to_string),
    })
}

fn rewrite_references<F>(formula: &str, scope_for: F) -> FormulaResult<String>
where
    F: Fn(&ReferenceToken) -> Option<String>,
{
    let tokens = tokenize(formula)?;

    let mut out = String::with_capacity(formula.len());
    let mut copied = 0;
    for token in tokens {
        let TokenKind::Reference(reference) = &token.kind else {
            continue;
        };
        out.push_str(&formula[copied..token.span.start]);
        out.push_str(&render_reference(
            scope_for(reference).as_deref(),
            reference.start,
            reference.end,
        ));
        copied = token.span.end;
    }
    out.push_str(&formula[copied..]);
    Ok(out)
}

fn render_reference(scope: Option<&str>, start: CellAddress, end: Option<CellAddress>) -> String {
    let mut text = String::new();
    if let Some(scope) = scope {
        let _ = write!(text, "{}!", quote_scope(scope));
    }
    let _ = write!(text, "{}", start);
    if let Some(end) = end {
        let _ = write!(text, ":{}", end);
    }
    text
}

/// Dependency graph of one scope
///
/// `dependency` maps a formula coordinate to the coordinates it reads, with
/// multiplicities; `inversion` maps a coordinate to the (sorted, distinct)
/// formula coordinates reading it. The two are kept transposes of each other,
/// and no coordinate maps to an empty collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraph {
    dependency: BTreeMap<String, BTreeMap<String, usize>>,
    inversion: BTreeMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Create a new empty dependency graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `coord` reads `deps` (already normalized)
    ///
    /// Replaces whatever was recorded for `coord` before. Self-references are
    /// dropped.
    pub fn insert<I, S>(&mut self, coord: &str, deps: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.remove(coord);

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for dep in deps {
            let dep = dep.into();
            if dep != coord {
                *counts.entry(dep).or_default() += 1;
            }
        }
        if counts.is_empty() {
            return;
        }

        for dep in counts.keys() {
            let readers = self.inversion.entry(dep.clone()).or_default();
            if let Err(at) = readers.binary_search_by(|r| r.as_str().cmp(coord)) {
                readers.insert(at, coord.to_string());
            }
        }
        self.dependency.insert(coord.to_string(), counts);
    }

    /// Forget `coord` as a formula; returns whether it was recorded
    pub fn remove(&mut self, coord: &str) -> bool {
        let Some(counts) = self.dependency.remove(coord) else {
            return false;
        };

        for dep in counts.keys() {
            if let Some(readers) = self.inversion.get_mut(dep) {
                readers.retain(|r| r != coord);
                if readers.is_empty() {
                    self.inversion.remove(dep);
                }
            }
        }
        true
    }

    /// Distinct coordinates `coord` reads
    pub fn dependencies(&self, coord: &str) -> impl Iterator<Item = &str> + '_ {
        self.dependency
            .get(coord)
            .into_iter()
            .flat_map(|counts| counts.keys().map(String::as_str))
    }

    /// Coordinates `coord` reads, with how many times each is read
    pub fn dependency_counts(&self, coord: &str) -> Option<&BTreeMap<String, usize>> {
        self.dependency.get(coord)
    }

    /// Formula coordinates that read `coord`
    pub fn dependents(&self, coord: &str) -> &[String] {
        self.inversion.get(coord).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether `coord` is recorded as a formula with dependencies
    pub fn contains(&self, coord: &str) -> bool {
        self.dependency.contains_key(coord)
    }

    /// Formula coordinates, sorted
    pub fn formulas(&self) -> impl Iterator<Item = &str> + '_ {
        self.dependency.keys().map(String::as_str)
    }

    /// Coordinates read by at least one formula, sorted
    pub fn read_coordinates(&self) -> impl Iterator<Item = &str> + '_ {
        self.inversion.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.dependency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependency.is_empty()
    }

    /// Rewrite every stored coordinate through `rename`
    ///
    /// Coordinates that collapse onto the same name are merged, and entries
    /// that become self-references are dropped.
    pub fn rename_coordinates<F>(&mut self, rename: F)
    where
        F: Fn(&str) -> String,
    {
        let old = std::mem::take(&mut self.dependency);
        self.inversion.clear();

        let mut merged: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (coord, counts) in old {
            let deps = merged.entry(rename(&coord)).or_default();
            for (dep, n) in counts {
                let dep = rename(&dep);
                deps.extend(std::iter::repeat(dep).take(n));
            }
        }
        for (coord, deps) in merged {
            self.insert(&coord, deps);
        }
    }

    /// Check that `inversion` is exactly the transpose of `dependency`
    pub fn verify(&self) -> Result<(), String> {
        for (coord, counts) in &self.dependency {
            if counts.is_empty() {
                return Err(format!("'{}' has an empty dependency entry", coord));
            }
            for (dep, n) in counts {
                if *n == 0 {
                    return Err(format!("'{}' reads '{}' zero times", coord, dep));
                }
                if dep == coord {
                    return Err(format!("'{}' reads itself", coord));
                }
                if self.inversion.get(dep).map_or(true, |r| !r.contains(coord)) {
                    return Err(format!("inversion of '{}' lacks '{}'", dep, coord));
                }
            }
        }

        for (dep, readers) in &self.inversion {
            if readers.is_empty() {
                return Err(format!("'{}' has an empty inversion entry", dep));
            }
            if readers.windows(2).any(|w| w[0] >= w[1]) {
                return Err(format!("inversion of '{}' is not sorted and distinct", dep));
            }
            for reader in readers {
                let reads = self
                    .dependency
                    .get(reader)
                    .map_or(false, |counts| counts.contains_key(dep));
                if !reads {
                    return Err(format!(
                        "inversion says '{}' reads '{}', dependency disagrees",
                        reader, dep
                    ));
                }
            }
        }

        Ok(())
    }
}
