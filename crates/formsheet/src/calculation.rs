//! Incremental recalculation engine
//!
//! A run takes the edits made to one document, finds every formula cell that
//! (transitively) reads an edited cell across all sheets of the period, and
//! recomputes exactly those, sheet by sheet, through the
//! [`FormulaEvaluator`]. Results are collected first and written in one batch.
//!
//! # Example
//!
//! ```rust
//! use formsheet::prelude::*;
//!
//! let mut storage = MemoryStorage::new();
//! storage
//!     .add_sheet(PeriodId(1), SheetId(1), "Form1")
//!     .add_division(DivisionId(1), None)
//!     .add_document(DocumentId(1), PeriodId(1), DivisionId(1));
//!
//! let mut engine = Engine::new(storage, MemoryCacheStore::new());
//! let a1 = CellAddress::parse("A1").unwrap();
//! let b1 = CellAddress::parse("B1").unwrap();
//! engine
//!     .apply(DocumentId(1), &[CellEdit::formula(SheetId(1), b1, "=A1*2")])
//!     .unwrap();
//! let report = engine
//!     .apply(DocumentId(1), &[CellEdit::value(SheetId(1), a1, 21.0)])
//!     .unwrap();
//!
//! assert_eq!(
//!     report.recalculated,
//!     vec![(CellPos::new(SheetId(1), b1), CellState::Value(42.0.into()))]
//! );
//! ```

use crate::cache::{CacheStore, DependencyCache, LIMITATION_FORMULAS, SHEET_FORMULAS};
use crate::error::{Error, Result};
use crate::options::EngineOptions;
use crate::storage::Storage;
use ahash::{AHashMap, AHashSet};
use formsheet_core::coordinate::scope_eq;
use formsheet_core::{
    CellAddress, CellPos, CellState, CellValue, Coordinate, Document, DocumentId, PeriodId, Sheet,
    SheetId,
};
use formsheet_formula::{rename_formula_scope, Environment, FlatEvaluator, FormulaEvaluator};
use std::collections::{BTreeSet, VecDeque};

/// What an edit does to a cell
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Store a value for the document
    Value(CellValue),
    /// Set (or with `None`, clear) the cell's formula
    Formula(Option<String>),
}

/// One edit of a run
#[derive(Debug, Clone, PartialEq)]
pub struct CellEdit {
    pub sheet: SheetId,
    pub address: CellAddress,
    pub change: Change,
}

impl CellEdit {
    pub fn value<V: Into<CellValue>>(sheet: SheetId, address: CellAddress, value: V) -> Self {
        Self {
            sheet,
            address,
            change: Change::Value(value.into()),
        }
    }

    pub fn formula<S: Into<String>>(sheet: SheetId, address: CellAddress, formula: S) -> Self {
        Self {
            sheet,
            address,
            change: Change::Formula(Some(formula.into())),
        }
    }

    pub fn clear_formula(sheet: SheetId, address: CellAddress) -> Self {
        Self {
            sheet,
            address,
            change: Change::Formula(None),
        }
    }

    pub fn pos(&self) -> CellPos {
        CellPos::new(self.sheet, self.address)
    }
}

/// Outcome of a recalculation run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecalcReport {
    pub document: DocumentId,
    /// Recomputed cells with their new state, in evaluation order
    pub recalculated: Vec<(CellPos, CellState)>,
    /// Sheets in the order they were evaluated
    pub evaluation_sequence: Vec<SheetId>,
    /// Number of recomputed cells that ended in an error state
    pub errors: usize,
    /// Indexes of the limitations reading a changed cell
    pub affected_limitations: Vec<u32>,
    /// Runs triggered in parent documents by aggregation
    pub cascaded: Vec<RecalcReport>,
}

impl RecalcReport {
    /// New state of a recomputed cell
    pub fn state(&self, pos: CellPos) -> Option<&CellState> {
        self.recalculated
            .iter()
            .find(|(p, _)| *p == pos)
            .map(|(_, state)| state)
    }
}

/// The recalculation engine
///
/// Owns its collaborators: the storage, the cache store holding dependency
/// graphs, and the formula evaluator.
pub struct Engine<S, C, E = FlatEvaluator> {
    pub(crate) storage: S,
    pub(crate) cache: C,
    pub(crate) evaluator: E,
    pub(crate) options: EngineOptions,
}

impl<S: Storage, C: CacheStore> Engine<S, C, FlatEvaluator> {
    /// Create an engine using the built-in evaluator
    pub fn new(storage: S, cache: C) -> Self {
        Self::with_evaluator(storage, cache, FlatEvaluator)
    }
}

impl<S: Storage, C: CacheStore, E: FormulaEvaluator> Engine<S, C, E> {
    pub fn with_evaluator(storage: S, cache: C, evaluator: E) -> Self {
        Self {
            storage,
            cache,
            evaluator,
            options: EngineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn cache_store(&self) -> &C {
        &self.cache
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    /// Dependency cache of a sheet, built from storage on a miss
    pub fn sheet_cache(&self, sheet: SheetId) -> Result<DependencyCache<SheetId>> {
        DependencyCache::get(
            &self.cache,
            &self.storage,
            &SHEET_FORMULAS,
            sheet,
            self.options.verify_cache_on_load,
        )
    }

    /// Dependency cache of a period's limitations, built from storage on a miss
    pub fn limitation_cache(&self, period: PeriodId) -> Result<DependencyCache<PeriodId>> {
        DependencyCache::get(
            &self.cache,
            &self.storage,
            &LIMITATION_FORMULAS,
            period,
            self.options.verify_cache_on_load,
        )
    }

    /// Apply edits to a document and recalculate everything they affect
    ///
    /// Every edit is checked before anything is written. Formula edits are
    /// stored first; if the run then fails before its values are written,
    /// they are rolled back. Runs cascaded by aggregation after that write
    /// are not rolled back.
    pub fn apply(&mut self, document: DocumentId, edits: &[CellEdit]) -> Result<RecalcReport> {
        let document = self.storage.document(document)?;
        self.check_division_chain(&document)?;

        for edit in edits {
            let sheet = self.storage.sheet(edit.sheet)?;
            if sheet.period != document.period {
                return Err(Error::UnknownSheet(format!(
                    "{} is not part of period {}",
                    sheet.name, document.period
                )));
            }
        }

        let mut replaced = Vec::new();
        let staged = self.stage_formulas(edits, &mut replaced).and_then(|()| {
            let mut seeds = Vec::new();
            let mut roots = Vec::new();
            for edit in edits {
                match &edit.change {
                    Change::Value(value) => seeds.push((edit.pos(), CellState::Value(value.clone()))),
                    Change::Formula(_) => roots.push(edit.pos()),
                }
            }
            let pending = self.prepare_run(&document, seeds, roots, 0)?;
            self.write_run(&document, &pending)?;
            Ok(pending)
        });
        match staged {
            Ok(pending) => self.finish_run(&document, pending, 0),
            Err(e) => {
                self.restore_formulas(replaced);
                Err(e)
            }
        }
    }

    /// Recompute every formula cell of the document's period
    pub fn recalculate_document(&mut self, document: DocumentId) -> Result<RecalcReport> {
        let document = self.storage.document(document)?;
        self.check_division_chain(&document)?;

        let mut roots = Vec::new();
        for sheet in self.storage.sheets(document.period)? {
            for (address, _) in self.storage.formulas(sheet.id)? {
                roots.push(CellPos::new(sheet.id, address));
            }
        }
        self.run(&document, Vec::new(), roots, 0)
    }

    /// Rename a sheet everywhere it is referenced
    pub fn rename_sheet(&mut self, sheet: SheetId, new_name: &str) -> Result<()> {
        let sheet = self.storage.sheet(sheet)?;
        if let Some(other) = self.storage.sheet_by_name(sheet.period, new_name)? {
            if other.id != sheet.id {
                return Err(Error::DuplicateSheetName(new_name.to_string()));
            }
        }
        let old_name = sheet.name.clone();
        self.storage.rename_sheet(sheet.id, new_name)?;

        let sheets = self.storage.sheets(sheet.period)?;
        for s in &sheets {
            for (address, formula) in self.storage.formulas(s.id)? {
                let renamed = rename_or_keep(&formula, &old_name, new_name);
                if renamed != formula {
                    self.storage
                        .set_formula(CellPos::new(s.id, address), Some(renamed))?;
                }
            }
        }

        let mut limitations = self.storage.limitations(sheet.period)?;
        let mut limitations_changed = false;
        for limitation in &mut limitations {
            let renamed = rename_or_keep(&limitation.formula, &old_name, new_name);
            if renamed != limitation.formula {
                limitation.formula = renamed;
                limitations_changed = true;
            }
        }
        if limitations_changed {
            self.storage.replace_limitations(sheet.period, limitations)?;
        }

        let verify = self.options.verify_cache_on_load;
        for s in &sheets {
            match DependencyCache::load(&self.cache, &SHEET_FORMULAS, s.id, verify) {
                Some(mut cache) => {
                    cache.rename_scope(&old_name, new_name);
                    cache.save(&self.cache)?;
                }
                None => DependencyCache::<SheetId>::invalidate(&self.cache, &SHEET_FORMULAS, s.id),
            }
        }
        match DependencyCache::load(&self.cache, &LIMITATION_FORMULAS, sheet.period, verify) {
            Some(mut cache) => {
                cache.rename_scope(&old_name, new_name);
                cache.save(&self.cache)?;
            }
            None => DependencyCache::<PeriodId>::invalidate(
                &self.cache,
                &LIMITATION_FORMULAS,
                sheet.period,
            ),
        }

        tracing::info!(sheet = %sheet.id, from = %old_name, to = new_name, "renamed sheet");
        Ok(())
    }

    /// Delete a sheet with its cells and evict its cache entry
    pub fn delete_sheet(&mut self, sheet: SheetId) -> Result<()> {
        let sheet = self.storage.sheet(sheet)?;
        self.storage.delete_sheet(sheet.id)?;
        DependencyCache::<SheetId>::delete(&self.cache, &SHEET_FORMULAS, sheet.id);
        DependencyCache::<PeriodId>::invalidate(&self.cache, &LIMITATION_FORMULAS, sheet.period);
        tracing::info!(sheet = %sheet.id, name = %sheet.name, "deleted sheet");
        Ok(())
    }

    /// Set or clear a cell's formula, keeping its sheet cache in step
    fn set_formula(&mut self, pos: CellPos, formula: Option<String>) -> Result<()> {
        let mut cache = self.sheet_cache(pos.sheet)?;
        self.storage.set_formula(pos, formula.clone())?;

        let coord = pos.address.to_string();
        match &formula {
            Some(formula) => cache.change_formula(&coord, formula),
            None => {
                cache.delete_formula(&coord);
            }
        }
        cache.save(&self.cache)?;
        Ok(())
    }

    /// Store the formula edits, remembering what each one replaced
    fn stage_formulas(
        &mut self,
        edits: &[CellEdit],
        replaced: &mut Vec<(CellPos, Option<String>)>,
    ) -> Result<()> {
        for edit in edits {
            if let Change::Formula(formula) = &edit.change {
                let before = self.storage.cell(edit.pos())?.and_then(|cell| cell.formula);
                replaced.push((edit.pos(), before));
                self.set_formula(edit.pos(), formula.clone())?;
            }
        }
        Ok(())
    }

    /// Put back formulas replaced by a failed `apply`, newest first
    fn restore_formulas(&mut self, replaced: Vec<(CellPos, Option<String>)>) {
        for (pos, formula) in replaced.into_iter().rev() {
            if let Err(e) = self.set_formula(pos, formula) {
                tracing::warn!(%pos, error = %e, "formula could not be restored");
            }
        }
    }

    /// State of a cell for a document before this run touches it
    pub(crate) fn stored_state(&self, document: DocumentId, pos: CellPos) -> Result<CellState> {
        if let Some(state) = self.storage.value(document, pos)? {
            return Ok(state);
        }
        let default = self
            .storage
            .cell(pos)?
            .map(|cell| cell.default)
            .unwrap_or_default();
        Ok(CellState::Value(default))
    }

    /// One recalculation run
    ///
    /// `seeds` are values written by this run; `roots` are cells whose
    /// formula changed and must be recomputed even if nothing they read did.
    pub(crate) fn run(
        &mut self,
        document: &Document,
        seeds: Vec<(CellPos, CellState)>,
        roots: Vec<CellPos>,
        depth: usize,
    ) -> Result<RecalcReport> {
        let pending = self.prepare_run(document, seeds, roots, depth)?;
        self.write_run(document, &pending)?;
        self.finish_run(document, pending, depth)
    }

    /// Evaluate a run without writing anything
    fn prepare_run(
        &self,
        document: &Document,
        seeds: Vec<(CellPos, CellState)>,
        roots: Vec<CellPos>,
        depth: usize,
    ) -> Result<PendingRun> {
        if depth > self.options.max_aggregation_depth {
            return Err(Error::AggregationDepthExceeded {
                depth,
                document: document.id,
            });
        }

        let graphs = PeriodGraphs::load(self, document.period)?;

        // Phase 1: closure over the inversions of every sheet graph
        let mut visited: AHashSet<CellPos> = AHashSet::new();
        let mut members: Vec<CellPos> = Vec::new();
        let mut queue: VecDeque<CellPos> = seeds.iter().map(|(pos, _)| *pos).collect();
        for root in &roots {
            if visited.insert(*root) {
                members.push(*root);
                queue.push_back(*root);
            }
        }
        while let Some(pos) = queue.pop_front() {
            for reader in graphs.readers_of(pos) {
                if visited.insert(reader) {
                    members.push(reader);
                    queue.push_back(reader);
                }
            }
        }

        // Phase 2: snapshot of formulas and of everything the members read
        let mut formulas: AHashMap<CellPos, String> = AHashMap::new();
        for pos in &members {
            if let Some(formula) = self.storage.cell(*pos)?.and_then(|cell| cell.formula) {
                formulas.insert(*pos, formula);
            }
        }
        members.retain(|pos| formulas.contains_key(pos));

        let mut related: BTreeSet<CellPos> = BTreeSet::new();
        let mut worklist = members.clone();
        while let Some(pos) = worklist.pop() {
            for (_, dependency) in graphs.dependencies_of(pos) {
                if related.insert(dependency) {
                    worklist.push(dependency);
                }
            }
        }

        let seeded: AHashMap<CellPos, CellState> = seeds.iter().cloned().collect();
        let mut states: AHashMap<CellPos, CellState> = AHashMap::new();
        for pos in related.iter().chain(members.iter()) {
            if states.contains_key(pos) {
                continue;
            }
            let state = match seeded.get(pos) {
                Some(state) => state.clone(),
                None => self.stored_state(document.id, *pos)?,
            };
            states.insert(*pos, state);
        }

        let sequence = graphs.evaluation_sequence(&members);
        tracing::debug!(
            document = %document.id,
            recalculate = members.len(),
            related = related.len(),
            sequence = ?sequence,
            "recalculation closure"
        );

        // Phase 3: evaluate scope by scope, later scopes seeing earlier results
        let member_set: AHashSet<CellPos> = members.iter().copied().collect();
        let mut recalculated = Vec::with_capacity(members.len());
        for sheet_id in &sequence {
            let Some(sheet) = graphs.sheet(*sheet_id) else {
                continue;
            };
            let scope_members: Vec<CellPos> = members
                .iter()
                .copied()
                .filter(|pos| pos.sheet == *sheet_id)
                .collect();

            let mut environment = Environment::new();
            for pos in &scope_members {
                if let Some(formula) = formulas.get(pos) {
                    environment.insert(pos.address.to_string(), CellState::Formula(formula.clone()));
                }
            }
            for pos in &scope_members {
                for (text, dependency) in graphs.dependencies_of(*pos) {
                    if environment.contains_key(&text) {
                        continue;
                    }
                    let state = match formulas.get(&dependency) {
                        Some(formula) if dependency.sheet == *sheet_id && member_set.contains(&dependency) => {
                            CellState::Formula(formula.clone())
                        }
                        _ => states
                            .get(&dependency)
                            .cloned()
                            .unwrap_or(CellState::Value(CellValue::Empty)),
                    };
                    environment.insert(text, state);
                }
            }

            let mut results = self.evaluator.evaluate(&sheet.name, &environment)?;

            // Phase 4: capture every member's result
            for pos in scope_members {
                let key = pos.address.to_string();
                let state = match results.remove(&key) {
                    Some(evaluation) => CellState::from(evaluation),
                    None => CellState::Error(format!("No result for {}", key)),
                };
                states.insert(pos, state.clone());
                recalculated.push((pos, state));
            }
        }

        Ok(PendingRun {
            seeds,
            recalculated,
            sequence,
        })
    }

    /// Write seeds and recalculated values as one batch
    fn write_run(&mut self, document: &Document, pending: &PendingRun) -> Result<()> {
        let batch: Vec<(CellPos, CellState)> = pending
            .seeds
            .iter()
            .chain(pending.recalculated.iter())
            .cloned()
            .collect();
        if batch.is_empty() {
            return Ok(());
        }
        self.storage.write_values(document.id, &batch)
    }

    /// Downstream limitations and aggregation of a written run
    fn finish_run(
        &mut self,
        document: &Document,
        pending: PendingRun,
        depth: usize,
    ) -> Result<RecalcReport> {
        let PendingRun {
            seeds,
            recalculated,
            sequence,
        } = pending;

        let errors = recalculated
            .iter()
            .filter(|(_, state)| state.error().is_some())
            .count();
        if errors > 0 {
            tracing::debug!(document = %document.id, errors, "recalculation produced error states");
        }

        // Phase 5: downstream limitations and aggregation
        let changed: Vec<CellPos> = seeds
            .iter()
            .chain(recalculated.iter())
            .map(|(pos, _)| *pos)
            .collect();
        let affected_limitations = self.affected_limitations(document.period, &changed)?;
        let cascaded = if self.options.propagate_aggregations {
            self.propagate_aggregations(document, &changed, depth)?
        } else {
            Vec::new()
        };

        Ok(RecalcReport {
            document: document.id,
            recalculated,
            evaluation_sequence: sequence,
            errors,
            affected_limitations,
            cascaded,
        })
    }
}

/// A run that has been evaluated but not yet written
struct PendingRun {
    seeds: Vec<(CellPos, CellState)>,
    recalculated: Vec<(CellPos, CellState)>,
    sequence: Vec<SheetId>,
}

fn rename_or_keep(formula: &str, old: &str, new: &str) -> String {
    match rename_formula_scope(formula, old, new) {
        Ok(renamed) => renamed,
        Err(e) => {
            tracing::warn!(formula, error = %e, "formula left unchanged by rename");
            formula.to_string()
        }
    }
}

/// Case-folded lookup key for coordinate text
pub(crate) fn fold(text: &str) -> String {
    text.to_lowercase()
}

/// The sheet graphs of one period, loaded for the duration of a run
struct PeriodGraphs {
    sheets: Vec<Sheet>,
    caches: AHashMap<SheetId, DependencyCache<SheetId>>,
    /// Per sheet: folded read coordinate to the formula cells reading it
    readers: AHashMap<SheetId, AHashMap<String, Vec<String>>>,
}

impl PeriodGraphs {
    fn load<S, C, E>(engine: &Engine<S, C, E>, period: PeriodId) -> Result<Self>
    where
        S: Storage,
        C: CacheStore,
        E: FormulaEvaluator,
    {
        let sheets = engine.storage.sheets(period)?;
        let mut caches = AHashMap::new();
        let mut readers = AHashMap::new();
        for sheet in &sheets {
            let cache = engine.sheet_cache(sheet.id)?;
            let mut index: AHashMap<String, Vec<String>> = AHashMap::new();
            for read in cache.graph().read_coordinates() {
                index
                    .entry(fold(read))
                    .or_default()
                    .extend(cache.graph().dependents(read).iter().cloned());
            }
            readers.insert(sheet.id, index);
            caches.insert(sheet.id, cache);
        }
        Ok(Self {
            sheets,
            caches,
            readers,
        })
    }

    fn sheet(&self, id: SheetId) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.id == id)
    }

    fn sheet_named(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| scope_eq(&s.name, name))
    }

    /// Resolve coordinate text recorded in `owner`'s graph to a cell position
    fn resolve(&self, owner: &Sheet, text: &str) -> Option<CellPos> {
        let coordinate = match Coordinate::parse(text, Some(&owner.name)) {
            Ok(coordinate) => coordinate,
            Err(e) => {
                tracing::warn!(coordinate = text, error = %e, "unparsable coordinate in graph");
                return None;
            }
        };
        let scope = coordinate.scope.as_deref().unwrap_or(&owner.name);
        match self.sheet_named(scope) {
            Some(sheet) => Some(CellPos::new(sheet.id, coordinate.address)),
            None => {
                tracing::warn!(
                    sheet = %owner.name,
                    coordinate = text,
                    "reference to an unknown sheet ignored"
                );
                None
            }
        }
    }

    /// Formula cells, on any sheet, reading `pos`
    fn readers_of(&self, pos: CellPos) -> Vec<CellPos> {
        let Some(owner) = self.sheet(pos.sheet) else {
            return Vec::new();
        };
        let coordinate = Coordinate::qualified(owner.name.clone(), pos.address);

        let mut out = Vec::new();
        for sheet in &self.sheets {
            let key = fold(&coordinate.relative_to(&sheet.name).to_string());
            let Some(readers) = self.readers.get(&sheet.id).and_then(|index| index.get(&key)) else {
                continue;
            };
            for reader in readers {
                match CellAddress::parse(reader) {
                    Ok(address) => out.push(CellPos::new(sheet.id, address)),
                    Err(e) => tracing::warn!(coordinate = %reader, error = %e, "bad formula key in graph"),
                }
            }
        }
        out
    }

    /// Coordinates `pos` reads, as recorded and resolved
    fn dependencies_of(&self, pos: CellPos) -> Vec<(String, CellPos)> {
        let (Some(owner), Some(cache)) = (self.sheet(pos.sheet), self.caches.get(&pos.sheet)) else {
            return Vec::new();
        };
        cache
            .graph()
            .dependencies(&pos.address.to_string())
            .filter_map(|text| self.resolve(owner, text).map(|p| (text.to_string(), p)))
            .collect()
    }

    /// Sheets holding members, first-seen order refined so that a sheet runs
    /// after the sheets whose recomputed cells it reads; cycles keep
    /// first-seen order
    fn evaluation_sequence(&self, members: &[CellPos]) -> Vec<SheetId> {
        let mut first_seen: Vec<SheetId> = Vec::new();
        for pos in members {
            if !first_seen.contains(&pos.sheet) {
                first_seen.push(pos.sheet);
            }
        }

        let member_set: AHashSet<CellPos> = members.iter().copied().collect();
        let mut edges: BTreeSet<(SheetId, SheetId)> = BTreeSet::new();
        for pos in members {
            for (_, dependency) in self.dependencies_of(*pos) {
                if dependency.sheet != pos.sheet && member_set.contains(&dependency) {
                    edges.insert((pos.sheet, dependency.sheet));
                }
            }
        }
        if edges.is_empty() {
            return first_seen;
        }

        let mut pending: AHashMap<SheetId, usize> = first_seen.iter().map(|s| (*s, 0)).collect();
        for (reader, _) in &edges {
            if let Some(count) = pending.get_mut(reader) {
                *count += 1;
            }
        }

        let mut remaining = first_seen.clone();
        let mut ordered = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let Some(next) = remaining.iter().position(|s| pending.get(s) == Some(&0)) else {
                tracing::debug!(sequence = ?first_seen, "sheets read each other, keeping first-seen order");
                return first_seen;
            };
            let sheet = remaining.remove(next);
            for (reader, provider) in &edges {
                if *provider == sheet {
                    if let Some(count) = pending.get_mut(reader) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
            ordered.push(sheet);
        }
        ordered
    }
}
