//! Storage boundary
//!
//! The engine reads templates (sheets, cells, formulas, limitations,
//! aggregation edges) and per-document values through [`Storage`], and
//! writes values back in one batch per run. [`MemoryStorage`] keeps
//! everything in memory and loads from JSON fixtures.

use crate::error::{Error, Result};
use formsheet_core::coordinate::scope_eq;
use formsheet_core::{
    AggregationMethod, Cell, CellAddress, CellPos, CellState, CellValue, Division, DivisionId,
    Document, DocumentId, Limitation, PeriodId, Sheet, SheetId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// An explicit contributor → aggregator link
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregationEdge {
    pub to: CellPos,
    pub from: CellPos,
}

/// Durable storage of templates and document values
pub trait Storage {
    /// Sheets of a period, in display order
    fn sheets(&self, period: PeriodId) -> Result<Vec<Sheet>>;

    fn sheet(&self, id: SheetId) -> Result<Sheet>;

    /// Sheet of a period by name, matched case-insensitively
    fn sheet_by_name(&self, period: PeriodId, name: &str) -> Result<Option<Sheet>> {
        Ok(self
            .sheets(period)?
            .into_iter()
            .find(|s| scope_eq(&s.name, name)))
    }

    fn rename_sheet(&mut self, id: SheetId, name: &str) -> Result<()>;

    /// Remove a sheet with its cells, values, edges and limitations
    fn delete_sheet(&mut self, id: SheetId) -> Result<()>;

    fn cell(&self, pos: CellPos) -> Result<Option<Cell>>;

    /// Cells of a sheet, in storage order
    fn cells(&self, sheet: SheetId) -> Result<Vec<Cell>>;

    /// Formula cells of a sheet, in storage order
    fn formulas(&self, sheet: SheetId) -> Result<Vec<(CellAddress, String)>> {
        Ok(self
            .cells(sheet)?
            .into_iter()
            .filter_map(|c| c.formula.map(|f| (c.address, f)))
            .collect())
    }

    /// Set or clear a cell's formula, creating the cell if needed
    fn set_formula(&mut self, pos: CellPos, formula: Option<String>) -> Result<()>;

    /// Set or clear a cell's aggregation method
    fn set_aggregation(&mut self, pos: CellPos, method: Option<AggregationMethod>) -> Result<()>;

    /// Stored value (or error) of a cell in a document
    fn value(&self, document: DocumentId, pos: CellPos) -> Result<Option<CellState>>;

    /// Write a batch of values for one document; all or nothing
    fn write_values(&mut self, document: DocumentId, values: &[(CellPos, CellState)]) -> Result<()>;

    fn document(&self, id: DocumentId) -> Result<Document>;

    fn documents(&self, period: PeriodId) -> Result<Vec<Document>>;

    fn division(&self, id: DivisionId) -> Result<Option<Division>>;

    /// Divisions whose parent is `parent`
    fn child_divisions(&self, parent: DivisionId) -> Result<Vec<Division>>;

    /// Limitations of a period, ordered by index
    fn limitations(&self, period: PeriodId) -> Result<Vec<Limitation>>;

    fn replace_limitations(&mut self, period: PeriodId, limitations: Vec<Limitation>) -> Result<()>;

    /// Aggregation edges whose cells belong to a period's sheets
    fn aggregation_edges(&self, period: PeriodId) -> Result<Vec<AggregationEdge>>;

    fn insert_aggregation_edge(&mut self, edge: AggregationEdge) -> Result<()>;

    /// Returns whether the edge existed
    fn delete_aggregation_edge(&mut self, edge: AggregationEdge) -> Result<bool>;

    fn clear_aggregation_edges(&mut self, period: PeriodId) -> Result<()>;
}

/// A stored value as it appears in a fixture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredValue {
    document: DocumentId,
    sheet: SheetId,
    address: CellAddress,
    #[serde(default, skip_serializing_if = "CellValue::is_empty")]
    value: CellValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Serialized form of [`MemoryStorage`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Fixture {
    #[serde(default)]
    sheets: Vec<Sheet>,
    #[serde(default)]
    cells: Vec<Cell>,
    #[serde(default)]
    divisions: Vec<Division>,
    #[serde(default)]
    documents: Vec<Document>,
    #[serde(default)]
    values: Vec<StoredValue>,
    #[serde(default)]
    limitations: Vec<Limitation>,
    #[serde(default)]
    aggregation_edges: Vec<AggregationEdge>,
}

/// In-memory [`Storage`]
///
/// Serializes as a flat JSON fixture:
///
/// ```rust
/// use formsheet::storage::{MemoryStorage, Storage};
/// use formsheet::PeriodId;
///
/// let storage = MemoryStorage::from_json(r#"{
///     "sheets": [{"id": 1, "period": 1, "name": "Form1"}],
///     "cells": [{"sheet": 1, "address": "C1", "formula": "=A1+B1"}]
/// }"#).unwrap();
/// assert_eq!(storage.sheets(PeriodId(1)).unwrap().len(), 1);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Fixture", into = "Fixture")]
pub struct MemoryStorage {
    sheets: BTreeMap<SheetId, Sheet>,
    cells: BTreeMap<SheetId, Vec<Cell>>,
    divisions: BTreeMap<DivisionId, Division>,
    documents: BTreeMap<DocumentId, Document>,
    values: BTreeMap<DocumentId, BTreeMap<CellPos, CellState>>,
    limitations: Vec<Limitation>,
    edges: Vec<AggregationEdge>,
}

impl From<Fixture> for MemoryStorage {
    fn from(fixture: Fixture) -> Self {
        let mut storage = MemoryStorage::new();
        for sheet in fixture.sheets {
            storage.sheets.insert(sheet.id, sheet);
        }
        for cell in fixture.cells {
            storage.cells.entry(cell.sheet).or_default().push(cell);
        }
        for division in fixture.divisions {
            storage.divisions.insert(division.id, division);
        }
        for document in fixture.documents {
            storage.documents.insert(document.id, document);
        }
        for v in fixture.values {
            let state = match v.error {
                Some(e) => CellState::Error(e),
                None => CellState::Value(v.value),
            };
            storage
                .values
                .entry(v.document)
                .or_default()
                .insert(CellPos::new(v.sheet, v.address), state);
        }
        storage.limitations = fixture.limitations;
        storage.limitations.sort_by_key(|l| l.index);
        storage.edges = fixture.aggregation_edges;
        storage
    }
}

impl From<MemoryStorage> for Fixture {
    fn from(storage: MemoryStorage) -> Self {
        let mut values = Vec::new();
        for (document, cells) in storage.values {
            for (pos, state) in cells {
                let (value, error) = match state {
                    CellState::Value(v) => (v, None),
                    CellState::Error(e) => (CellValue::Empty, Some(e)),
                    CellState::Formula(_) => continue,
                };
                values.push(StoredValue {
                    document,
                    sheet: pos.sheet,
                    address: pos.address,
                    value,
                    error,
                });
            }
        }

        Fixture {
            sheets: storage.sheets.into_values().collect(),
            cells: storage.cells.into_values().flatten().collect(),
            divisions: storage.divisions.into_values().collect(),
            documents: storage.documents.into_values().collect(),
            values,
            limitations: storage.limitations,
            aggregation_edges: storage.edges,
        }
    }
}

impl MemoryStorage {
    /// Create an empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON fixture
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON fixture from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Serialize to a JSON fixture
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write a JSON fixture to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    // === Builders ===

    pub fn add_sheet(&mut self, period: PeriodId, id: SheetId, name: &str) -> &mut Self {
        let position = self.sheets.values().filter(|s| s.period == period).count() as u32;
        self.sheets.insert(
            id,
            Sheet {
                id,
                period,
                name: name.to_string(),
                position,
            },
        );
        self
    }

    /// Add or replace a cell record
    pub fn add_cell(&mut self, cell: Cell) -> &mut Self {
        let cells = self.cells.entry(cell.sheet).or_default();
        match cells.iter_mut().find(|c| c.address == cell.address) {
            Some(existing) => *existing = cell,
            None => cells.push(cell),
        }
        self
    }

    pub fn add_division(&mut self, id: DivisionId, parent: Option<DivisionId>) -> &mut Self {
        self.divisions.insert(id, Division { id, parent });
        self
    }

    pub fn add_document(&mut self, id: DocumentId, period: PeriodId, division: DivisionId) -> &mut Self {
        self.documents.insert(
            id,
            Document {
                id,
                period,
                division,
            },
        );
        self
    }

    pub fn set_value<V: Into<CellValue>>(&mut self, document: DocumentId, pos: CellPos, value: V) -> &mut Self {
        self.values
            .entry(document)
            .or_default()
            .insert(pos, CellState::Value(value.into()));
        self
    }

    pub fn add_limitation(&mut self, limitation: Limitation) -> &mut Self {
        self.limitations.push(limitation);
        self.limitations.sort_by_key(|l| l.index);
        self
    }

    pub fn add_edge(&mut self, to: CellPos, from: CellPos) -> &mut Self {
        self.edges.push(AggregationEdge { to, from });
        self
    }

    fn period_of(&self, sheet: SheetId) -> Option<PeriodId> {
        self.sheets.get(&sheet).map(|s| s.period)
    }

    fn cell_mut(&mut self, pos: CellPos) -> Result<&mut Cell> {
        if !self.sheets.contains_key(&pos.sheet) {
            return Err(Error::UnknownSheet(pos.sheet.to_string()));
        }
        let cells = self.cells.entry(pos.sheet).or_default();
        let at = match cells.iter().position(|c| c.address == pos.address) {
            Some(at) => at,
            None => {
                cells.push(Cell::new(pos.sheet, pos.address));
                cells.len() - 1
            }
        };
        Ok(&mut cells[at])
    }
}

impl Storage for MemoryStorage {
    fn sheets(&self, period: PeriodId) -> Result<Vec<Sheet>> {
        let mut sheets: Vec<Sheet> = self
            .sheets
            .values()
            .filter(|s| s.period == period)
            .cloned()
            .collect();
        sheets.sort_by_key(|s| (s.position, s.id));
        Ok(sheets)
    }

    fn sheet(&self, id: SheetId) -> Result<Sheet> {
        self.sheets
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::UnknownSheet(id.to_string()))
    }

    fn rename_sheet(&mut self, id: SheetId, name: &str) -> Result<()> {
        let sheet = self
            .sheets
            .get_mut(&id)
            .ok_or_else(|| Error::UnknownSheet(id.to_string()))?;
        sheet.name = name.to_string();
        Ok(())
    }

    fn delete_sheet(&mut self, id: SheetId) -> Result<()> {
        if self.sheets.remove(&id).is_none() {
            return Err(Error::UnknownSheet(id.to_string()));
        }
        self.cells.remove(&id);
        for cells in self.values.values_mut() {
            cells.retain(|pos, _| pos.sheet != id);
        }
        self.edges.retain(|e| e.to.sheet != id && e.from.sheet != id);
        self.limitations.retain(|l| l.sheet != id);
        Ok(())
    }

    fn cell(&self, pos: CellPos) -> Result<Option<Cell>> {
        Ok(self
            .cells
            .get(&pos.sheet)
            .and_then(|cells| cells.iter().find(|c| c.address == pos.address))
            .cloned())
    }

    fn cells(&self, sheet: SheetId) -> Result<Vec<Cell>> {
        Ok(self.cells.get(&sheet).cloned().unwrap_or_default())
    }

    fn set_formula(&mut self, pos: CellPos, formula: Option<String>) -> Result<()> {
        self.cell_mut(pos)?.formula = formula;
        Ok(())
    }

    fn set_aggregation(&mut self, pos: CellPos, method: Option<AggregationMethod>) -> Result<()> {
        self.cell_mut(pos)?.aggregation = method;
        Ok(())
    }

    fn value(&self, document: DocumentId, pos: CellPos) -> Result<Option<CellState>> {
        Ok(self
            .values
            .get(&document)
            .and_then(|cells| cells.get(&pos))
            .cloned())
    }

    fn write_values(&mut self, document: DocumentId, values: &[(CellPos, CellState)]) -> Result<()> {
        if !self.documents.contains_key(&document) {
            return Err(Error::UnknownDocument(document));
        }
        if let Some((pos, _)) = values.iter().find(|(pos, _)| !self.sheets.contains_key(&pos.sheet)) {
            return Err(Error::UnknownSheet(pos.sheet.to_string()));
        }

        let cells = self.values.entry(document).or_default();
        for (pos, state) in values {
            cells.insert(*pos, state.clone());
        }
        Ok(())
    }

    fn document(&self, id: DocumentId) -> Result<Document> {
        self.documents
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownDocument(id))
    }

    fn documents(&self, period: PeriodId) -> Result<Vec<Document>> {
        Ok(self
            .documents
            .values()
            .filter(|d| d.period == period)
            .cloned()
            .collect())
    }

    fn division(&self, id: DivisionId) -> Result<Option<Division>> {
        Ok(self.divisions.get(&id).cloned())
    }

    fn child_divisions(&self, parent: DivisionId) -> Result<Vec<Division>> {
        Ok(self
            .divisions
            .values()
            .filter(|d| d.parent == Some(parent))
            .cloned()
            .collect())
    }

    fn limitations(&self, period: PeriodId) -> Result<Vec<Limitation>> {
        Ok(self
            .limitations
            .iter()
            .filter(|l| self.period_of(l.sheet) == Some(period))
            .cloned()
            .collect())
    }

    fn replace_limitations(&mut self, period: PeriodId, limitations: Vec<Limitation>) -> Result<()> {
        let sheets = &self.sheets;
        self.limitations
            .retain(|l| sheets.get(&l.sheet).map(|s| s.period) != Some(period));
        self.limitations.extend(limitations);
        self.limitations.sort_by_key(|l| l.index);
        Ok(())
    }

    fn aggregation_edges(&self, period: PeriodId) -> Result<Vec<AggregationEdge>> {
        Ok(self
            .edges
            .iter()
            .filter(|e| self.period_of(e.to.sheet) == Some(period))
            .copied()
            .collect())
    }

    fn insert_aggregation_edge(&mut self, edge: AggregationEdge) -> Result<()> {
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
        Ok(())
    }

    fn delete_aggregation_edge(&mut self, edge: AggregationEdge) -> Result<bool> {
        let before = self.edges.len();
        self.edges.retain(|e| *e != edge);
        Ok(self.edges.len() != before)
    }

    fn clear_aggregation_edges(&mut self, period: PeriodId) -> Result<()> {
        let sheets = &self.sheets;
        self.edges
            .retain(|e| sheets.get(&e.to.sheet).map(|s| s.period) != Some(period));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pos(sheet: u64, a1: &str) -> CellPos {
        CellPos::new(SheetId(sheet), CellAddress::parse(a1).unwrap())
    }

    const FIXTURE: &str = r#"{
        "sheets": [
            {"id": 2, "period": 1, "name": "Second", "position": 1},
            {"id": 1, "period": 1, "name": "First", "position": 0}
        ],
        "cells": [
            {"sheet": 1, "address": "B1", "formula": "=A1*2"},
            {"sheet": 1, "address": "A1", "kind": "money", "default": 4}
        ],
        "divisions": [{"id": 1}, {"id": 2, "parent": 1}],
        "documents": [{"id": 10, "period": 1, "division": 2}],
        "values": [
            {"document": 10, "sheet": 1, "address": "A1", "value": 7},
            {"document": 10, "sheet": 1, "address": "B1", "error": "Division by zero"}
        ]
    }"#;

    #[test]
    fn test_fixture_round_trip() {
        let storage = MemoryStorage::from_json(FIXTURE).unwrap();

        let names: Vec<_> = storage
            .sheets(PeriodId(1))
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["First", "Second"]);
        assert_eq!(
            storage.formulas(SheetId(1)).unwrap(),
            vec![(CellAddress::parse("B1").unwrap(), "=A1*2".to_string())]
        );
        assert_eq!(
            storage.value(DocumentId(10), pos(1, "B1")).unwrap(),
            Some(CellState::Error("Division by zero".into()))
        );

        let reloaded = MemoryStorage::from_json(&storage.to_json().unwrap()).unwrap();
        assert_eq!(
            reloaded.value(DocumentId(10), pos(1, "A1")).unwrap(),
            Some(CellState::Value(CellValue::Number(7.0)))
        );
        assert_eq!(reloaded.cells(SheetId(1)).unwrap(), storage.cells(SheetId(1)).unwrap());
    }

    #[test]
    fn test_sheet_by_name_ignores_case() {
        let storage = MemoryStorage::from_json(FIXTURE).unwrap();
        let sheet = storage.sheet_by_name(PeriodId(1), "second").unwrap().unwrap();
        assert_eq!(sheet.id, SheetId(2));
        assert!(storage.sheet_by_name(PeriodId(2), "Second").unwrap().is_none());
    }

    #[test]
    fn test_write_values_is_all_or_nothing() {
        let mut storage = MemoryStorage::from_json(FIXTURE).unwrap();
        let batch = vec![
            (pos(1, "A1"), CellState::Value(1.0.into())),
            (pos(99, "A1"), CellState::Value(2.0.into())),
        ];
        assert!(storage.write_values(DocumentId(10), &batch).is_err());
        assert_eq!(
            storage.value(DocumentId(10), pos(1, "A1")).unwrap(),
            Some(CellState::Value(7.0.into()))
        );
    }

    #[test]
    fn test_set_formula_creates_cell() {
        let mut storage = MemoryStorage::from_json(FIXTURE).unwrap();
        storage.set_formula(pos(2, "D4"), Some("=1".into())).unwrap();
        assert_eq!(storage.formulas(SheetId(2)).unwrap().len(), 1);
        assert!(storage.set_formula(pos(5, "A1"), None).is_err());
    }

    #[test]
    fn test_delete_sheet_cascades() {
        let mut storage = MemoryStorage::from_json(FIXTURE).unwrap();
        storage.add_edge(pos(2, "A1"), pos(1, "A1"));
        storage.delete_sheet(SheetId(1)).unwrap();

        assert!(storage.cells(SheetId(1)).unwrap().is_empty());
        assert!(storage.aggregation_edges(PeriodId(1)).unwrap().is_empty());
        assert_eq!(storage.value(DocumentId(10), pos(1, "A1")).unwrap(), None);
    }
}
