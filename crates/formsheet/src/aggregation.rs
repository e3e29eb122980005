//! Aggregation across the division hierarchy
//!
//! An aggregation edge links a contributing cell to an aggregating cell of
//! the same period. When a contributor changes in a document, the aggregating
//! cells it feeds are recomputed for the document of the parent division,
//! from the contributors' values in all of that division's child documents,
//! and written through the engine as value edits. That run may change
//! contributors of further edges, so aggregation climbs the hierarchy one
//! level per run.

use crate::cache::CacheStore;
use crate::calculation::{Engine, RecalcReport};
use crate::error::{Error, Result};
use crate::storage::{AggregationEdge, Storage};
use ahash::AHashSet;
use formsheet_core::coordinate::scope_eq;
use formsheet_core::{
    AggregationMethod, Cell, CellPos, CellState, CellValue, Coordinate, Document, PeriodId,
};
use formsheet_formula::FormulaEvaluator;
use serde::Deserialize;
use std::collections::BTreeSet;

/// Why a set of values could not be reduced
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReductionError {
    #[error("Division by zero")]
    DivisionByZero,
    #[error("No values to aggregate")]
    NoValues,
}

/// Reduce contributor values with an aggregation method
///
/// Values are read as numbers (text trimmed then parsed); anything that does
/// not parse is dropped.
///
/// ```rust
/// use formsheet::aggregation::compute;
/// use formsheet_core::{AggregationMethod, CellValue};
///
/// let values = [CellValue::Number(3.0), CellValue::text("bad"), CellValue::text(" 5 ")];
/// assert_eq!(compute(AggregationMethod::Sum, &values), Ok(8.0));
/// ```
pub fn compute(method: AggregationMethod, values: &[CellValue]) -> std::result::Result<f64, ReductionError> {
    let numbers: Vec<f64> = values.iter().filter_map(CellValue::parse_number).collect();
    match method {
        AggregationMethod::Sum => Ok(numbers.iter().sum()),
        AggregationMethod::Avg => {
            if numbers.is_empty() {
                return Err(ReductionError::DivisionByZero);
            }
            Ok(numbers.iter().sum::<f64>() / numbers.len() as f64)
        }
        AggregationMethod::Min => numbers
            .into_iter()
            .reduce(f64::min)
            .ok_or(ReductionError::NoValues),
        AggregationMethod::Max => numbers
            .into_iter()
            .reduce(f64::max)
            .ok_or(ReductionError::NoValues),
    }
}

/// Check one edge; `method` is the aggregating cell's method
fn validate_edge(
    to: &Cell,
    method: Option<AggregationMethod>,
    from: &Cell,
    existing: &BTreeSet<AggregationEdge>,
) -> std::result::Result<(), String> {
    if method.is_none() {
        return Err(format!("{} has no aggregation method", to.pos()));
    }
    if to.pos() == from.pos() {
        return Err(format!("{} cannot aggregate itself", to.pos()));
    }
    if to.kind != from.kind {
        return Err(format!(
            "{} holds {:?} values but {} holds {:?}",
            to.pos(),
            to.kind,
            from.pos(),
            from.kind
        ));
    }
    let edge = AggregationEdge {
        to: to.pos(),
        from: from.pos(),
    };
    if existing.contains(&edge) {
        return Err(format!("{} already aggregates {}", to.pos(), from.pos()));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct AggregationRecord {
    to_cell: String,
    aggregation: String,
    from_cells: Vec<String>,
}

impl<S: Storage, C: CacheStore, E: FormulaEvaluator> Engine<S, C, E> {
    /// Add an aggregation edge after validating it
    pub fn add_edge(&mut self, to: CellPos, from: CellPos) -> Result<()> {
        let to_cell = self.storage.cell(to)?.ok_or(Error::UnknownCell(to))?;
        let from_cell = self.storage.cell(from)?.ok_or(Error::UnknownCell(from))?;

        let period = self.storage.sheet(to.sheet)?.period;
        if self.storage.sheet(from.sheet)?.period != period {
            return Err(Error::rejected(format!("{} and {} belong to different periods", to, from)));
        }

        let existing: BTreeSet<AggregationEdge> =
            self.storage.aggregation_edges(period)?.into_iter().collect();
        validate_edge(&to_cell, to_cell.aggregation, &from_cell, &existing).map_err(Error::rejected)?;

        self.storage.insert_aggregation_edge(AggregationEdge { to, from })?;
        tracing::debug!(%to, %from, "added aggregation edge");
        Ok(())
    }

    /// Remove an aggregation edge; returns whether it existed
    pub fn remove_edge(&mut self, to: CellPos, from: CellPos) -> Result<bool> {
        self.storage.delete_aggregation_edge(AggregationEdge { to, from })
    }

    /// Replace every aggregation edge of a period from a JSON list of
    /// `{"to_cell": "Sheet!A1", "aggregation": "sum", "from_cells": ["Sheet!B1", ...]}`
    ///
    /// Every record is resolved and validated before anything is stored.
    /// Returns the number of edges stored.
    pub fn update_aggregations_from_file(&mut self, period: PeriodId, json: &str) -> Result<usize> {
        let records: Vec<serde_json::Value> =
            serde_json::from_str(json).map_err(|e| Error::Import {
                position: None,
                message: e.to_string(),
            })?;

        let mut methods: Vec<(CellPos, AggregationMethod)> = Vec::new();
        let mut edges: BTreeSet<AggregationEdge> = BTreeSet::new();
        for (position, raw) in records.into_iter().enumerate() {
            let record: AggregationRecord =
                serde_json::from_value(raw).map_err(|e| Error::import(position, e.to_string()))?;
            let method: AggregationMethod = record
                .aggregation
                .parse()
                .map_err(|e: formsheet_core::Error| Error::import(position, e.to_string()))?;

            let to = self.resolve_cell(period, &record.to_cell, position)?;
            if methods.iter().any(|(pos, _)| *pos == to.pos()) {
                return Err(Error::import(
                    position,
                    format!("{} is declared twice", record.to_cell),
                ));
            }
            for text in &record.from_cells {
                let from = self.resolve_cell(period, text, position)?;
                validate_edge(&to, Some(method), &from, &edges)
                    .map_err(|reason| Error::import(position, reason))?;
                edges.insert(AggregationEdge {
                    to: to.pos(),
                    from: from.pos(),
                });
            }
            methods.push((to.pos(), method));
        }

        for (pos, method) in &methods {
            self.storage.set_aggregation(*pos, Some(*method))?;
        }
        self.storage.clear_aggregation_edges(period)?;
        for edge in &edges {
            self.storage.insert_aggregation_edge(*edge)?;
        }

        tracing::info!(
            period = %period,
            aggregators = methods.len(),
            edges = edges.len(),
            "imported aggregation edges"
        );
        Ok(edges.len())
    }

    fn resolve_cell(&self, period: PeriodId, text: &str, position: usize) -> Result<Cell> {
        let coordinate =
            Coordinate::parse(text, None).map_err(|e| Error::import(position, e.to_string()))?;
        let Some(scope) = coordinate.scope.as_deref() else {
            return Err(Error::import(position, format!("'{}' names no sheet", text)));
        };
        let sheet = self
            .storage
            .sheets(period)?
            .into_iter()
            .find(|s| scope_eq(&s.name, scope))
            .ok_or_else(|| Error::import(position, format!("unknown sheet '{}'", scope)))?;
        self.storage
            .cell(CellPos::new(sheet.id, coordinate.address))?
            .ok_or_else(|| Error::import(position, format!("unknown cell '{}'", text)))
    }

    /// Fail before any write when aggregation from this document could climb
    /// a cyclic or over-deep division hierarchy
    pub(crate) fn check_division_chain(&self, document: &Document) -> Result<()> {
        if !self.options.propagate_aggregations
            || self.storage.aggregation_edges(document.period)?.is_empty()
        {
            return Ok(());
        }

        let mut seen = AHashSet::new();
        let mut current = Some(document.division);
        let mut depth = 0;
        while let Some(division) = current {
            if !seen.insert(division) || depth > self.options.max_aggregation_depth {
                tracing::warn!(document = %document.id, %division, depth, "division hierarchy too deep or cyclic");
                return Err(Error::AggregationDepthExceeded {
                    depth,
                    document: document.id,
                });
            }
            current = self.storage.division(division)?.and_then(|d| d.parent);
            depth += 1;
        }
        Ok(())
    }

    /// Recompute the aggregating cells fed by `changed` in the parent document
    pub(crate) fn propagate_aggregations(
        &mut self,
        document: &Document,
        changed: &[CellPos],
        depth: usize,
    ) -> Result<Vec<RecalcReport>> {
        if changed.is_empty() {
            return Ok(Vec::new());
        }
        let edges = self.storage.aggregation_edges(document.period)?;
        let changed: AHashSet<CellPos> = changed.iter().copied().collect();
        let targets: BTreeSet<CellPos> = edges
            .iter()
            .filter(|edge| changed.contains(&edge.from))
            .map(|edge| edge.to)
            .collect();
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let Some(parent) = self
            .storage
            .division(document.division)?
            .and_then(|d| d.parent)
        else {
            return Ok(Vec::new());
        };
        let documents = self.storage.documents(document.period)?;
        let Some(parent_document) = documents.iter().find(|d| d.division == parent).cloned() else {
            tracing::debug!(division = %parent, period = %document.period, "parent division has no document");
            return Ok(Vec::new());
        };
        let children: AHashSet<_> = self
            .storage
            .child_divisions(parent)?
            .into_iter()
            .map(|d| d.id)
            .collect();
        let contributors: Vec<&Document> = documents
            .iter()
            .filter(|d| children.contains(&d.division))
            .collect();

        let mut seeds = Vec::new();
        for to in targets {
            let Some(method) = self.storage.cell(to)?.and_then(|cell| cell.aggregation) else {
                tracing::warn!(%to, "aggregation edge into a cell without a method");
                continue;
            };
            let mut values = Vec::new();
            for edge in edges.iter().filter(|edge| edge.to == to) {
                for contributor in &contributors {
                    if let CellState::Value(value) = self.stored_state(contributor.id, edge.from)? {
                        values.push(value);
                    }
                }
            }
            let state = match compute(method, &values) {
                Ok(n) => CellState::Value(CellValue::Number(n)),
                Err(e) => CellState::Error(e.to_string()),
            };
            seeds.push((to, state));
        }
        if seeds.is_empty() {
            return Ok(Vec::new());
        }

        tracing::debug!(
            from = %document.id,
            to = %parent_document.id,
            cells = seeds.len(),
            depth = depth + 1,
            "propagating aggregation"
        );
        let report = self.run(&parent_document, seeds, Vec::new(), depth + 1)?;
        Ok(vec![report])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use crate::storage::MemoryStorage;
    use formsheet_core::{CellAddress, CellKind, DivisionId, DocumentId, SheetId};
    use pretty_assertions::assert_eq;

    fn pos(sheet: u64, a1: &str) -> CellPos {
        CellPos::new(SheetId(sheet), CellAddress::parse(a1).unwrap())
    }

    fn cell(sheet: u64, a1: &str) -> Cell {
        Cell::new(SheetId(sheet), CellAddress::parse(a1).unwrap())
    }

    fn aggregator(sheet: u64, a1: &str, method: AggregationMethod) -> Cell {
        let mut c = cell(sheet, a1);
        c.aggregation = Some(method);
        c
    }

    fn engine() -> Engine<MemoryStorage, MemoryCacheStore> {
        let mut storage = MemoryStorage::new();
        storage
            .add_sheet(PeriodId(1), SheetId(1), "Form1")
            .add_sheet(PeriodId(2), SheetId(2), "Later")
            .add_cell(aggregator(1, "B1", AggregationMethod::Sum))
            .add_cell(cell(1, "A1"))
            .add_cell(cell(1, "A2"))
            .add_cell(cell(2, "A1"));
        let mut text = cell(1, "A3");
        text.kind = CellKind::Text;
        storage.add_cell(text);
        Engine::new(storage, MemoryCacheStore::new())
    }

    #[test]
    fn test_compute() {
        let values = [
            CellValue::Number(3.0),
            CellValue::text("bad"),
            CellValue::Number(5.0),
        ];
        assert_eq!(compute(AggregationMethod::Sum, &values), Ok(8.0));
        assert_eq!(compute(AggregationMethod::Avg, &values), Ok(4.0));
        assert_eq!(compute(AggregationMethod::Min, &values), Ok(3.0));
        assert_eq!(compute(AggregationMethod::Max, &values), Ok(5.0));
    }

    #[test]
    fn test_compute_without_values() {
        let values = [CellValue::Empty, CellValue::Boolean(true)];
        assert_eq!(compute(AggregationMethod::Sum, &values), Ok(0.0));
        assert_eq!(
            compute(AggregationMethod::Avg, &values),
            Err(ReductionError::DivisionByZero)
        );
        assert_eq!(compute(AggregationMethod::Max, &[]), Err(ReductionError::NoValues));
        assert_eq!(ReductionError::DivisionByZero.to_string(), "Division by zero");
    }

    #[test]
    fn test_add_edge_validation() {
        let mut engine = engine();
        engine.add_edge(pos(1, "B1"), pos(1, "A1")).unwrap();

        let rejected = |r: Result<()>| matches!(r, Err(Error::AggregationRejected { .. }));
        assert!(rejected(engine.add_edge(pos(1, "B1"), pos(1, "A1"))));
        assert!(rejected(engine.add_edge(pos(1, "B1"), pos(1, "B1"))));
        assert!(rejected(engine.add_edge(pos(1, "A2"), pos(1, "A1"))));
        assert!(rejected(engine.add_edge(pos(1, "B1"), pos(1, "A3"))));
        assert!(rejected(engine.add_edge(pos(1, "B1"), pos(2, "A1"))));
        assert!(matches!(
            engine.add_edge(pos(1, "B1"), pos(1, "Z9")),
            Err(Error::UnknownCell(_))
        ));

        assert!(engine.remove_edge(pos(1, "B1"), pos(1, "A1")).unwrap());
        assert!(!engine.remove_edge(pos(1, "B1"), pos(1, "A1")).unwrap());
    }

    #[test]
    fn test_update_from_file() {
        let mut engine = engine();
        engine.add_edge(pos(1, "B1"), pos(1, "A1")).unwrap();

        let json = r#"[{"to_cell": "form1!A2", "aggregation": "max", "from_cells": ["Form1!A1", "Form1!$B$1"]}]"#;
        assert_eq!(engine.update_aggregations_from_file(PeriodId(1), json).unwrap(), 2);

        let edges = engine.storage().aggregation_edges(PeriodId(1)).unwrap();
        assert_eq!(
            edges,
            vec![
                AggregationEdge { to: pos(1, "A2"), from: pos(1, "A1") },
                AggregationEdge { to: pos(1, "A2"), from: pos(1, "B1") },
            ]
        );
        let a2 = engine.storage().cell(pos(1, "A2")).unwrap().unwrap();
        assert_eq!(a2.aggregation, Some(AggregationMethod::Max));
    }

    #[test]
    fn test_update_from_file_is_all_or_nothing() {
        let mut engine = engine();
        engine.add_edge(pos(1, "B1"), pos(1, "A1")).unwrap();
        let before = engine.storage().aggregation_edges(PeriodId(1)).unwrap();

        let cases = [
            (r#"[{"to_cell": "Form1!B1", "aggregation": "sum", "from_cells": ["Form1!A2"]},
                 {"to_cell": "Form1!A2", "aggregation": "sum", "from_cells": ["Form1!A3"]}]"#, Some(1)),
            (r#"[{"to_cell": "Form1!B1", "aggregation": "median", "from_cells": []}]"#, Some(0)),
            (r#"[{"to_cell": "Nowhere!B1", "aggregation": "sum", "from_cells": []}]"#, Some(0)),
            (r#"[{"to_cell": "B1", "aggregation": "sum", "from_cells": []}]"#, Some(0)),
            (r#"[{"to_cell": "Form1!B1", "aggregation": "sum", "from_cells": ["Form1!C9"]}]"#, Some(0)),
            (r#"[{"to_cell": "Form1!B1"}]"#, Some(0)),
            (r#"{"to_cell": "Form1!B1"}"#, None),
        ];
        for (json, expected) in cases {
            match engine.update_aggregations_from_file(PeriodId(1), json) {
                Err(Error::Import { position, .. }) => assert_eq!(position, expected, "{}", json),
                other => panic!("expected import error for {}, got {:?}", json, other),
            }
        }
        assert_eq!(engine.storage().aggregation_edges(PeriodId(1)).unwrap(), before);
    }

    #[test]
    fn test_cyclic_hierarchy_is_reported_before_writing() {
        let mut engine = engine();
        engine.add_edge(pos(1, "B1"), pos(1, "A1")).unwrap();
        engine
            .storage_mut()
            .add_division(DivisionId(1), Some(DivisionId(2)))
            .add_division(DivisionId(2), Some(DivisionId(1)))
            .add_document(DocumentId(1), PeriodId(1), DivisionId(1))
            .add_document(DocumentId(2), PeriodId(1), DivisionId(2));

        let edit = crate::CellEdit::value(SheetId(1), CellAddress::parse("A1").unwrap(), 1.0);
        let err = engine.apply(DocumentId(1), &[edit]).unwrap_err();
        assert!(matches!(err, Error::AggregationDepthExceeded { .. }));
        assert_eq!(engine.storage().value(DocumentId(1), pos(1, "A1")).unwrap(), None);
    }
}
