//! Limitation validator
//!
//! A limitation is a boolean check over a period's cells. Each one is turned
//! into a synthetic formula `=IF(<check>, "", "<message>")` living in the
//! private scope [`LIMITATION_SCOPE`], so a whole period's checks evaluate in
//! one pass through the [`FormulaEvaluator`].

use crate::cache::{CacheStore, DependencyCache, LIMITATION_FORMULAS};
use crate::calculation::{fold, Engine};
use crate::error::{Error, Result};
use crate::storage::Storage;
use ahash::AHashMap;
use formsheet_core::coordinate::scope_eq;
use formsheet_core::{CellAddress, CellPos, CellState, Coordinate, DocumentId, Limitation, PeriodId};
use formsheet_formula::{parse_formula, requalify_formula, Environment, Evaluation, FormulaEvaluator};
use serde::Deserialize;

/// Scope the synthetic limitation formulas are evaluated in
pub const LIMITATION_SCOPE: &str = "__limitations__";

/// A limitation that did not hold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitationFailure {
    pub index: u32,
    pub message: String,
}

/// Coordinate of a limitation's synthetic formula: column A, row `index + 1`
pub fn synthetic_coordinate(index: u32) -> String {
    CellAddress::new(index, 0).to_string()
}

fn index_of(coordinate: &str) -> Option<u32> {
    Coordinate::parse(coordinate, None)
        .ok()
        .map(|c| c.address.row)
}

/// The synthetic formula of a limitation whose check is written for `sheet_name`
pub fn synthetic_formula(limitation: &Limitation, sheet_name: &str) -> String {
    let check = strip_equals(&limitation.formula);
    let check = match requalify_formula(check, sheet_name, LIMITATION_SCOPE) {
        Ok(requalified) => requalified,
        Err(e) => {
            tracing::warn!(index = limitation.index, error = %e, "limitation check kept as written");
            check.to_string()
        }
    };
    format!(
        "=IF({}, \"\", \"{}\")",
        check,
        limitation.error_message.replace('"', "\"\"")
    )
}

fn strip_equals(formula: &str) -> &str {
    let formula = formula.trim();
    formula.strip_prefix('=').unwrap_or(formula)
}

#[derive(Debug, Deserialize)]
struct LimitationRecord {
    form: String,
    check: String,
    message: String,
}

impl<S: Storage, C: CacheStore, E: FormulaEvaluator> Engine<S, C, E> {
    /// Evaluate every limitation of the document's period against its values
    ///
    /// Returns the failures ordered by index; an empty list allows the
    /// document's status transition. Nothing is written.
    pub fn check_limitations(&self, document: DocumentId) -> Result<Vec<LimitationFailure>> {
        let document = self.storage.document(document)?;
        let limitations = self.storage.limitations(document.period)?;
        if limitations.is_empty() {
            return Ok(Vec::new());
        }

        let sheets = self.storage.sheets(document.period)?;
        let cache = self.limitation_cache(document.period)?;

        let mut environment = Environment::new();
        let mut checked = Vec::new();
        for limitation in &limitations {
            let Some(sheet) = sheets.iter().find(|s| s.id == limitation.sheet) else {
                tracing::warn!(index = limitation.index, "limitation of an unknown sheet skipped");
                continue;
            };
            let coord = synthetic_coordinate(limitation.index);
            environment.insert(
                coord.clone(),
                CellState::Formula(synthetic_formula(limitation, &sheet.name)),
            );
            checked.push((limitation, coord));
        }

        let mut reads = Vec::new();
        for (_, coord) in &checked {
            if let Some(key) = cache.normalize(coord) {
                reads.extend(cache.graph().dependencies(&key).map(str::to_string));
            }
        }
        for text in reads {
            if environment.contains_key(&text) {
                continue;
            }
            let Ok(coordinate) = Coordinate::parse(&text, None) else {
                continue;
            };
            let sheet = coordinate
                .scope
                .as_deref()
                .and_then(|scope| sheets.iter().find(|s| scope_eq(&s.name, scope)));
            let state = match sheet {
                Some(sheet) => {
                    self.stored_state(document.id, CellPos::new(sheet.id, coordinate.address))?
                }
                None => {
                    tracing::warn!(coordinate = %text, "limitation reads an unknown sheet");
                    continue;
                }
            };
            environment.insert(text, state);
        }

        let results = self.evaluator.evaluate(LIMITATION_SCOPE, &environment)?;

        let mut failures = Vec::new();
        for (limitation, coord) in checked {
            let message = match results.get(&coord) {
                Some(Evaluation::Value(value)) => {
                    let text = value.to_string();
                    if text.is_empty() {
                        continue;
                    }
                    text
                }
                Some(Evaluation::Error(e)) => e.clone(),
                None => limitation.error_message.clone(),
            };
            failures.push(LimitationFailure {
                index: limitation.index,
                message,
            });
        }
        failures.sort_by_key(|f| f.index);

        tracing::debug!(
            document = %document.id,
            checked = limitations.len(),
            failed = failures.len(),
            "checked limitations"
        );
        Ok(failures)
    }

    /// Indexes of the limitations of a period reading any of `cells`
    pub fn affected_limitations(&self, period: PeriodId, cells: &[CellPos]) -> Result<Vec<u32>> {
        if cells.is_empty() || self.storage.limitations(period)?.is_empty() {
            return Ok(Vec::new());
        }
        let cache = self.limitation_cache(period)?;
        let sheets = self.storage.sheets(period)?;

        let mut readers: AHashMap<String, &[String]> = AHashMap::new();
        for read in cache.graph().read_coordinates() {
            readers.insert(fold(read), cache.graph().dependents(read));
        }

        let mut indexes = Vec::new();
        for pos in cells {
            let Some(sheet) = sheets.iter().find(|s| s.id == pos.sheet) else {
                continue;
            };
            let key = fold(&Coordinate::qualified(sheet.name.clone(), pos.address).to_string());
            if let Some(dependents) = readers.get(&key) {
                indexes.extend(dependents.iter().filter_map(|d| index_of(d)));
            }
        }
        indexes.sort_unstable();
        indexes.dedup();
        Ok(indexes)
    }

    /// Replace a period's limitations from a JSON list of
    /// `{"form": <sheet name>, "check": <formula>, "message": <text>}`
    ///
    /// Every record is validated before anything is stored. Records are
    /// indexed by their position in the file.
    pub fn update_limitations_from_file(&mut self, period: PeriodId, json: &str) -> Result<usize> {
        let records: Vec<serde_json::Value> =
            serde_json::from_str(json).map_err(|e| Error::Import {
                position: None,
                message: e.to_string(),
            })?;

        let mut limitations = Vec::with_capacity(records.len());
        for (position, raw) in records.into_iter().enumerate() {
            let record: LimitationRecord =
                serde_json::from_value(raw).map_err(|e| Error::import(position, e.to_string()))?;
            let sheet = self
                .storage
                .sheet_by_name(period, &record.form)?
                .ok_or_else(|| Error::import(position, format!("unknown sheet '{}'", record.form)))?;

            let check = strip_equals(&record.check);
            parse_formula(&format!("={}", check))
                .map_err(|e| Error::import(position, format!("invalid check: {}", e)))?;

            let index = u32::try_from(position)
                .map_err(|_| Error::import(position, "too many limitations"))?;
            limitations.push(Limitation {
                index,
                formula: check.to_string(),
                error_message: record.message,
                sheet: sheet.id,
            });
        }

        let count = limitations.len();
        self.storage.replace_limitations(period, limitations)?;
        DependencyCache::<PeriodId>::invalidate(&self.cache, &LIMITATION_FORMULAS, period);
        DependencyCache::rebuild(&self.cache, &self.storage, &LIMITATION_FORMULAS, period)?;

        tracing::info!(period = %period, count, "imported limitations");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use crate::storage::MemoryStorage;
    use formsheet_core::{DivisionId, SheetId};
    use pretty_assertions::assert_eq;

    fn pos(sheet: u64, a1: &str) -> CellPos {
        CellPos::new(SheetId(sheet), CellAddress::parse(a1).unwrap())
    }

    fn limitation(index: u32, formula: &str, message: &str) -> Limitation {
        Limitation {
            index,
            formula: formula.to_string(),
            error_message: message.to_string(),
            sheet: SheetId(1),
        }
    }

    fn engine(limitations: Vec<Limitation>) -> Engine<MemoryStorage, MemoryCacheStore> {
        let mut storage = MemoryStorage::new();
        storage
            .add_sheet(PeriodId(1), SheetId(1), "Form1")
            .add_sheet(PeriodId(1), SheetId(2), "Form 2")
            .add_division(DivisionId(1), None)
            .add_document(DocumentId(1), PeriodId(1), DivisionId(1))
            .set_value(DocumentId(1), pos(1, "A1"), 5.0)
            .set_value(DocumentId(1), pos(2, "A1"), 3.0);
        for l in limitations {
            storage.add_limitation(l);
        }
        Engine::new(storage, MemoryCacheStore::new())
    }

    #[test]
    fn test_synthetic_formula() {
        let l = limitation(0, "=A1>'Form 2'!A1", "Say \"no\"");
        assert_eq!(
            synthetic_formula(&l, "Form1"),
            "=IF(Form1!A1>'Form 2'!A1, \"\", \"Say \"\"no\"\"\")"
        );
        assert_eq!(synthetic_coordinate(0), "A1");
        assert_eq!(synthetic_coordinate(4), "A5");
    }

    #[test]
    fn test_passing_and_failing_checks() {
        let engine = engine(vec![
            limitation(1, "A1 < 'Form 2'!A1", "A must be below B"),
            limitation(0, "A1 > 'Form 2'!A1", "A must exceed B"),
            limitation(2, "SUM(A1, 'Form 2'!A1) = 10", "Total must be 10"),
        ]);

        let failures = engine.check_limitations(DocumentId(1)).unwrap();
        assert_eq!(
            failures,
            vec![
                LimitationFailure {
                    index: 1,
                    message: "A must be below B".into()
                },
                LimitationFailure {
                    index: 2,
                    message: "Total must be 10".into()
                },
            ]
        );
    }

    #[test]
    fn test_evaluation_error_fails_with_error_text() {
        let engine = engine(vec![limitation(0, "A1 / 0 > 1", "unused")]);
        let failures = engine.check_limitations(DocumentId(1)).unwrap();
        assert_eq!(failures[0].message, "Division by zero");
    }

    #[test]
    fn test_affected_limitations() {
        let engine = engine(vec![
            limitation(0, "A1 > 0", "a"),
            limitation(1, "'form 2'!A1 > 0", "b"),
        ]);
        assert_eq!(
            engine.affected_limitations(PeriodId(1), &[pos(2, "A1")]).unwrap(),
            vec![1]
        );
        assert_eq!(
            engine
                .affected_limitations(PeriodId(1), &[pos(1, "A1"), pos(2, "A1"), pos(1, "B1")])
                .unwrap(),
            vec![0, 1]
        );
    }

    #[test]
    fn test_update_from_file() {
        let mut engine = engine(vec![limitation(0, "A1 > 100", "old")]);
        let json = r#"[
            {"form": "form1", "check": "=A1 > 1", "message": "first"},
            {"form": "Form 2", "check": "A1 > 4", "message": "second"}
        ]"#;
        assert_eq!(engine.update_limitations_from_file(PeriodId(1), json).unwrap(), 2);

        let failures = engine.check_limitations(DocumentId(1)).unwrap();
        assert_eq!(
            failures,
            vec![LimitationFailure {
                index: 1,
                message: "second".into()
            }]
        );
    }

    #[test]
    fn test_update_from_file_is_all_or_nothing() {
        let mut engine = engine(vec![limitation(0, "A1 > 100", "old")]);

        let unknown_sheet = r#"[
            {"form": "Form1", "check": "A1 > 1", "message": "ok"},
            {"form": "Nowhere", "check": "A1 > 1", "message": "bad"}
        ]"#;
        let err = engine
            .update_limitations_from_file(PeriodId(1), unknown_sheet)
            .unwrap_err();
        assert!(matches!(err, Error::Import { position: Some(1), .. }));

        let bad_formula = r#"[{"form": "Form1", "check": "A1 >", "message": "bad"}]"#;
        assert!(engine.update_limitations_from_file(PeriodId(1), bad_formula).is_err());

        let not_a_list = r#"{"form": "Form1"}"#;
        let err = engine.update_limitations_from_file(PeriodId(1), not_a_list).unwrap_err();
        assert!(matches!(err, Error::Import { position: None, .. }));

        let kept = engine.storage().limitations(PeriodId(1)).unwrap();
        assert_eq!(kept, vec![limitation(0, "A1 > 100", "old")]);
    }
}
