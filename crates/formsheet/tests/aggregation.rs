//! Tests for aggregation up the division hierarchy

use formsheet::prelude::*;
use pretty_assertions::assert_eq;

fn at(a1: &str) -> CellAddress {
    CellAddress::parse(a1).unwrap()
}

fn pos(a1: &str) -> CellPos {
    CellPos::new(SheetId(1), at(a1))
}

fn cell(a1: &str) -> Cell {
    Cell::new(SheetId(1), at(a1))
}

fn aggregator(a1: &str, method: AggregationMethod) -> Cell {
    let mut cell = cell(a1);
    cell.aggregation = Some(method);
    cell
}

/// Root division 1 with children 2, 3 and 4; one document each
fn storage() -> MemoryStorage {
    let mut storage = MemoryStorage::new();
    storage
        .add_sheet(PeriodId(1), SheetId(1), "Form1")
        .add_cell(cell("A1"))
        .add_cell(aggregator("B1", AggregationMethod::Sum))
        .add_division(DivisionId(1), None);
    for id in 1..=4 {
        if id > 1 {
            storage.add_division(DivisionId(id), Some(DivisionId(1)));
        }
        storage.add_document(DocumentId(id), PeriodId(1), DivisionId(id));
    }
    storage
}

/// Test the worked example: an unparsable contribution is dropped from the sum
#[test]
fn test_sum_skips_unparsable_values() {
    let mut storage = storage();
    storage
        .set_value(DocumentId(2), pos("A1"), 3.0)
        .set_value(DocumentId(3), pos("A1"), "bad");
    let mut engine = Engine::new(storage, MemoryCacheStore::new());
    engine.add_edge(pos("B1"), pos("A1")).unwrap();

    let report = engine
        .apply(DocumentId(4), &[CellEdit::value(SheetId(1), at("A1"), 5.0)])
        .unwrap();

    assert_eq!(report.cascaded.len(), 1);
    assert_eq!(report.cascaded[0].document, DocumentId(1));
    assert_eq!(
        engine.storage().value(DocumentId(1), pos("B1")).unwrap(),
        Some(CellState::Value(8.0.into()))
    );
}

/// Test that a failed reduction is stored on the aggregating cell
#[test]
fn test_average_of_nothing_is_an_error_state() {
    let mut storage = storage();
    storage.add_cell(aggregator("C1", AggregationMethod::Avg));
    let mut engine = Engine::new(storage, MemoryCacheStore::new());
    engine.add_edge(pos("C1"), pos("A1")).unwrap();

    engine
        .apply(DocumentId(2), &[CellEdit::value(SheetId(1), at("A1"), "n/a")])
        .unwrap();

    assert_eq!(
        engine.storage().value(DocumentId(1), pos("C1")).unwrap(),
        Some(CellState::Error(formsheet::DIVISION_BY_ZERO.to_string()))
    );
}

/// Test aggregation of aggregation across two levels, with formulas reading
/// the aggregated value in between
#[test]
fn test_aggregation_chain() {
    let mut storage = storage();
    let mut doubled = cell("D1");
    doubled.formula = Some("=B1*2".to_string());
    storage
        .add_cell(doubled)
        .add_cell(aggregator("E1", AggregationMethod::Max))
        .add_division(DivisionId(5), Some(DivisionId(2)))
        .add_document(DocumentId(5), PeriodId(1), DivisionId(5))
        .set_value(DocumentId(3), pos("D1"), 100.0);
    let mut engine = Engine::new(storage, MemoryCacheStore::new());
    engine.add_edge(pos("B1"), pos("A1")).unwrap();
    engine.add_edge(pos("E1"), pos("D1")).unwrap();

    let report = engine
        .apply(DocumentId(5), &[CellEdit::value(SheetId(1), at("A1"), 60.0)])
        .unwrap();

    // Division 5 feeds division 2: B1 aggregates, D1 doubles it
    let level1 = &report.cascaded[0];
    assert_eq!(level1.document, DocumentId(2));
    assert_eq!(level1.state(pos("D1")), Some(&CellState::Value(120.0.into())));

    // Division 2 feeds division 1: the larger of 120 and document 3's 100
    let level2 = &level1.cascaded[0];
    assert_eq!(level2.document, DocumentId(1));
    assert_eq!(
        engine.storage().value(DocumentId(1), pos("E1")).unwrap(),
        Some(CellState::Value(120.0.into()))
    );
    assert!(level2.cascaded.is_empty());
}

/// Test that propagation can be switched off
#[test]
fn test_propagation_disabled() {
    let options = EngineOptions {
        propagate_aggregations: false,
        ..EngineOptions::default()
    };
    let mut engine = Engine::new(storage(), MemoryCacheStore::new()).with_options(options);
    engine.add_edge(pos("B1"), pos("A1")).unwrap();

    let report = engine
        .apply(DocumentId(2), &[CellEdit::value(SheetId(1), at("A1"), 1.0)])
        .unwrap();
    assert!(report.cascaded.is_empty());
    assert_eq!(engine.storage().value(DocumentId(1), pos("B1")).unwrap(), None);
}

/// Test that a hierarchy deeper than the limit is an error
#[test]
fn test_depth_limit() {
    let mut storage = storage();
    storage
        .add_division(DivisionId(10), Some(DivisionId(2)))
        .add_division(DivisionId(11), Some(DivisionId(10)))
        .add_document(DocumentId(11), PeriodId(1), DivisionId(11));
    let options = EngineOptions {
        max_aggregation_depth: 1,
        ..EngineOptions::default()
    };
    let mut engine = Engine::new(storage, MemoryCacheStore::new()).with_options(options);
    engine.add_edge(pos("B1"), pos("A1")).unwrap();

    let err = engine
        .apply(DocumentId(11), &[CellEdit::value(SheetId(1), at("A1"), 1.0)])
        .unwrap_err();
    assert!(matches!(err, Error::AggregationDepthExceeded { .. }));
}

/// Test replacing edges from an import file, then propagating through them
#[test]
fn test_import_then_propagate() {
    let mut storage = storage();
    storage.add_cell(cell("A2"));
    let mut engine = Engine::new(storage, MemoryCacheStore::new());
    engine.add_edge(pos("B1"), pos("A1")).unwrap();

    let json = r#"[{"to_cell": "Form1!A2", "aggregation": "min", "from_cells": ["Form1!A1"]}]"#;
    engine.update_aggregations_from_file(PeriodId(1), json).unwrap();

    engine
        .apply(DocumentId(3), &[CellEdit::value(SheetId(1), at("A1"), 7.0)])
        .unwrap();
    assert_eq!(
        engine.storage().value(DocumentId(1), pos("A2")).unwrap(),
        Some(CellState::Value(7.0.into()))
    );
    assert_eq!(engine.storage().value(DocumentId(1), pos("B1")).unwrap(), None);
}

/// Evaluator that fails every scope it is asked for
struct Unavailable;

impl FormulaEvaluator for Unavailable {
    fn evaluate(
        &self,
        scope: &str,
        _environment: &formsheet::Environment,
    ) -> std::result::Result<std::collections::BTreeMap<String, formsheet::Evaluation>, formsheet::FormulaError>
    {
        Err(formsheet::FormulaError::Value(format!("{} is unavailable", scope)))
    }
}

/// Test that a failure in a cascaded run keeps the values the edited
/// document already wrote
#[test]
fn test_failed_cascade_keeps_written_values() {
    let mut storage = storage();
    let mut doubled = cell("D1");
    doubled.formula = Some("=B1*2".to_string());
    storage.add_cell(doubled);
    let mut engine = Engine::with_evaluator(storage, MemoryCacheStore::new(), Unavailable);
    engine.add_edge(pos("B1"), pos("A1")).unwrap();

    let err = engine
        .apply(DocumentId(2), &[CellEdit::value(SheetId(1), at("A1"), 1.0)])
        .unwrap_err();
    assert!(matches!(err, Error::Formula(_)));

    assert_eq!(
        engine.storage().value(DocumentId(2), pos("A1")).unwrap(),
        Some(CellState::Value(1.0.into()))
    );
    assert_eq!(engine.storage().value(DocumentId(1), pos("B1")).unwrap(), None);
    assert_eq!(engine.storage().value(DocumentId(1), pos("D1")).unwrap(), None);
}
