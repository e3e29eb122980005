//! Tests for limitation checks

use formsheet::prelude::*;
use pretty_assertions::assert_eq;

fn at(a1: &str) -> CellAddress {
    CellAddress::parse(a1).unwrap()
}

fn pos(sheet: u64, a1: &str) -> CellPos {
    CellPos::new(SheetId(sheet), at(a1))
}

fn engine(a: f64, b: f64) -> Engine<MemoryStorage, MemoryCacheStore> {
    let mut storage = MemoryStorage::new();
    storage
        .add_sheet(PeriodId(1), SheetId(1), "Форма1")
        .add_sheet(PeriodId(1), SheetId(2), "Форма2")
        .add_division(DivisionId(1), None)
        .add_document(DocumentId(1), PeriodId(1), DivisionId(1))
        .set_value(DocumentId(1), pos(1, "A1"), a)
        .set_value(DocumentId(1), pos(2, "A1"), b)
        .add_limitation(Limitation {
            index: 0,
            formula: "Форма1!A1 > Форма2!A1".to_string(),
            error_message: "A must exceed B".to_string(),
            sheet: SheetId(1),
        });
    Engine::new(storage, MemoryCacheStore::new())
}

/// Test the worked example in both directions
#[test]
fn test_cross_sheet_check() {
    let failures = engine(5.0, 9.0).check_limitations(DocumentId(1)).unwrap();
    let messages: Vec<&str> = failures.iter().map(|f| f.message.as_str()).collect();
    assert_eq!(messages, vec!["A must exceed B"]);

    assert!(engine(9.0, 5.0).check_limitations(DocumentId(1)).unwrap().is_empty());
}

/// Test that a value edit reports the limitations it can affect and that the
/// check sees the new value
#[test]
fn test_edit_reports_affected_limitations() {
    let mut engine = engine(9.0, 5.0);

    let report = engine
        .apply(DocumentId(1), &[CellEdit::value(SheetId(2), at("A1"), 10.0)])
        .unwrap();
    assert_eq!(report.affected_limitations, vec![0]);

    let report = engine
        .apply(DocumentId(1), &[CellEdit::value(SheetId(2), at("B7"), 1.0)])
        .unwrap();
    assert!(report.affected_limitations.is_empty());

    assert_eq!(engine.check_limitations(DocumentId(1)).unwrap().len(), 1);
}

/// Test that limitations read formula results computed by the engine
#[test]
fn test_check_reads_recalculated_values() {
    let mut engine = engine(9.0, 5.0);
    engine
        .apply(
            DocumentId(1),
            &[CellEdit::formula(SheetId(2), at("A1"), "=Форма1!B1*3")],
        )
        .unwrap();
    assert!(engine.check_limitations(DocumentId(1)).unwrap().is_empty());

    engine
        .apply(DocumentId(1), &[CellEdit::value(SheetId(1), at("B1"), 4.0)])
        .unwrap();
    assert_eq!(engine.check_limitations(DocumentId(1)).unwrap().len(), 1);
}

/// Test that renaming a sheet keeps its limitations working
#[test]
fn test_rename_keeps_limitations() {
    let mut engine = engine(5.0, 9.0);
    engine.limitation_cache(PeriodId(1)).unwrap();

    engine.rename_sheet(SheetId(1), "ФормаX").unwrap();

    let limitations = engine.storage().limitations(PeriodId(1)).unwrap();
    assert_eq!(limitations[0].formula, "ФормаX!A1 > Форма2!A1");
    let cache = engine.limitation_cache(PeriodId(1)).unwrap();
    assert_eq!(cache.graph().dependents("ФормаX!A1").len(), 1);
    assert!(cache.graph().dependents("Форма1!A1").is_empty());

    assert_eq!(engine.check_limitations(DocumentId(1)).unwrap().len(), 1);
}

/// Test importing limitations, with unqualified references resolved against the form
#[test]
fn test_import_limitations() {
    let mut engine = engine(5.0, 9.0);
    let json = r#"[
        {"form": "Форма2", "check": "A1 >= 9", "message": "B too small"},
        {"form": "форма1", "check": "=AND(A1 > 0, A1 < Форма2!A1)", "message": "A out of range"},
        {"form": "Форма1", "check": "A1 = 6", "message": "A must be \"6\""}
    ]"#;
    assert_eq!(engine.update_limitations_from_file(PeriodId(1), json).unwrap(), 3);

    let failures = engine.check_limitations(DocumentId(1)).unwrap();
    assert_eq!(
        failures,
        vec![LimitationFailure {
            index: 2,
            message: "A must be \"6\"".to_string()
        }]
    );
}
