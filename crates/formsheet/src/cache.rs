//! Dependency cache
//!
//! One [`DependencyCache`] holds the [`DependencyGraph`] of one scope: a sheet
//! (keyed by [`SheetId`]) or the limitations of a period (keyed by
//! [`PeriodId`]). What differs between the two is configuration, captured by
//! a [`CacheFlavor`]: the key template, how dependencies are normalized, and
//! where the formulas come from on rebuild ([`FormulaSource`]).
//!
//! Caches are plain values: load one from a [`CacheStore`], patch it, save it
//! back. Concurrent writers of the same scope are not coordinated; two
//! first accesses may both rebuild and the last save wins.

use crate::error::{Error, Result};
use crate::limitation::{synthetic_coordinate, synthetic_formula, LIMITATION_SCOPE};
use crate::storage::Storage;
use ahash::AHashMap;
use formsheet_core::coordinate::scope_eq;
use formsheet_core::{Coordinate, PeriodId, SheetId};
use formsheet_formula::{extract_dependencies, DependencyGraph};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::RwLock;

/// Byte-oriented key/value cache
pub trait CacheStore {
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Returns whether the value was stored
    fn set(&self, key: &str, value: Vec<u8>) -> bool;

    /// Returns whether a value was removed
    fn delete(&self, key: &str) -> bool;
}

impl<T: CacheStore + ?Sized> CacheStore for &T {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: Vec<u8>) -> bool {
        (**self).set(key, value)
    }

    fn delete(&self, key: &str) -> bool {
        (**self).delete(key)
    }
}

/// In-process [`CacheStore`]
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<AHashMap<String, Vec<u8>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: Vec<u8>) -> bool {
        match self.entries.write() {
            Ok(mut entries) => {
                entries.insert(key.to_string(), value);
                true
            }
            Err(_) => false,
        }
    }

    fn delete(&self, key: &str) -> bool {
        match self.entries.write() {
            Ok(mut entries) => entries.remove(key).is_some(),
            Err(_) => false,
        }
    }
}

/// How a cache stores the coordinates a formula reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    /// References to the cache's own scope lose their prefix
    RelativeToScope,
    /// Every reference carries a scope prefix; unqualified ones get the cache's scope
    Qualified,
}

impl Normalization {
    fn apply(&self, coordinate: &Coordinate, scope: &str) -> String {
        match self {
            Normalization::RelativeToScope => coordinate.relative_to(scope).to_string(),
            Normalization::Qualified => coordinate.qualify(scope).to_string(),
        }
    }
}

/// Configuration of one kind of dependency cache
#[derive(Debug)]
pub struct CacheFlavor {
    /// Cache key with `{id}` standing for the scope id
    pub key_template: &'static str,
    pub normalization: Normalization,
    /// Name used in logs
    pub label: &'static str,
}

impl CacheFlavor {
    /// Cache key for a scope id
    pub fn key<K: fmt::Display>(&self, id: K) -> String {
        self.key_template.replace("{id}", &id.to_string())
    }
}

/// Formulas of the sheets of a period, keyed by sheet id
pub const SHEET_FORMULAS: CacheFlavor = CacheFlavor {
    key_template: "cache.sheet.formula.{id}",
    normalization: Normalization::RelativeToScope,
    label: "sheet",
};

/// Limitation formulas of a period, keyed by period id
pub const LIMITATION_FORMULAS: CacheFlavor = CacheFlavor {
    key_template: "cache.limitation.formula.{id}",
    normalization: Normalization::Qualified,
    label: "limitation",
};

/// Formulas of one scope, as needed to (re)build its graph
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeFormulas {
    pub scope_name: String,
    /// Coordinate (relative to the scope) and formula text, in storage order
    pub formulas: Vec<(String, String)>,
}

/// Source of the formulas of a scope
pub trait FormulaSource<K> {
    fn scope_formulas(&self, id: K) -> Result<ScopeFormulas>;
}

impl<S: Storage + ?Sized> FormulaSource<SheetId> for S {
    fn scope_formulas(&self, id: SheetId) -> Result<ScopeFormulas> {
        let sheet = self.sheet(id)?;
        let formulas = self
            .formulas(id)?
            .into_iter()
            .map(|(address, formula)| (address.to_string(), formula))
            .collect();
        Ok(ScopeFormulas {
            scope_name: sheet.name,
            formulas,
        })
    }
}

impl<S: Storage + ?Sized> FormulaSource<PeriodId> for S {
    fn scope_formulas(&self, id: PeriodId) -> Result<ScopeFormulas> {
        let sheets = self.sheets(id)?;
        let mut formulas = Vec::new();
        for limitation in self.limitations(id)? {
            let Some(sheet) = sheets.iter().find(|s| s.id == limitation.sheet) else {
                tracing::warn!(
                    index = limitation.index,
                    sheet = %limitation.sheet,
                    "limitation belongs to a sheet outside its period, skipped"
                );
                continue;
            };
            formulas.push((
                synthetic_coordinate(limitation.index),
                synthetic_formula(&limitation, &sheet.name),
            ));
        }
        Ok(ScopeFormulas {
            scope_name: LIMITATION_SCOPE.to_string(),
            formulas,
        })
    }
}

/// Serialized cache payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub scope_name: String,
    pub graph: DependencyGraph,
}

/// The dependency graph of one scope, with the operations that keep it in
/// step with formula edits
#[derive(Debug, Clone)]
pub struct DependencyCache<K> {
    flavor: &'static CacheFlavor,
    scope_id: K,
    scope_name: String,
    graph: DependencyGraph,
}

impl<K: Copy + fmt::Display> DependencyCache<K> {
    /// Create an empty cache for a scope
    pub fn new<S: Into<String>>(flavor: &'static CacheFlavor, scope_id: K, scope_name: S) -> Self {
        Self {
            flavor,
            scope_id,
            scope_name: scope_name.into(),
            graph: DependencyGraph::new(),
        }
    }

    pub fn scope_id(&self) -> K {
        self.scope_id
    }

    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn key(&self) -> String {
        self.flavor.key(self.scope_id)
    }

    /// Normalize coordinate text the way this cache stores it
    pub fn normalize(&self, text: &str) -> Option<String> {
        match Coordinate::parse(text, None) {
            Ok(coordinate) => Some(self.flavor.normalization.apply(&coordinate, &self.scope_name)),
            Err(e) => {
                tracing::warn!(coordinate = text, error = %e, "unparsable coordinate ignored");
                None
            }
        }
    }

    /// Record the dependencies of the formula at `coord`
    pub fn add_formula(&mut self, coord: &str, formula: &str) {
        let Some(key) = self.normalize(coord) else {
            return;
        };
        let deps: Vec<String> = extract_dependencies(formula)
            .iter()
            .filter_map(|dep| self.normalize(dep))
            .collect();
        self.graph.insert(&key, deps);
    }

    /// Forget the formula at `coord`; returns whether one was recorded
    pub fn delete_formula(&mut self, coord: &str) -> bool {
        match self.normalize(coord) {
            Some(key) => self.graph.remove(&key),
            None => false,
        }
    }

    pub fn change_formula(&mut self, coord: &str, formula: &str) {
        self.delete_formula(coord);
        self.add_formula(coord, formula);
    }

    /// Rewrite references to scope `old` as references to `new`
    ///
    /// When this cache's own scope is the one renamed, its name changes too
    /// and references already naming `new` become relative.
    pub fn rename_scope(&mut self, old: &str, new: &str) {
        if scope_eq(&self.scope_name, old) {
            self.scope_name = new.to_string();
        }

        let scope = self.scope_name.clone();
        let normalization = self.flavor.normalization;
        self.graph.rename_coordinates(|text| {
            let Ok(mut coordinate) = Coordinate::parse(text, None) else {
                return text.to_string();
            };
            if coordinate.scope.as_deref().map_or(false, |s| scope_eq(s, old)) {
                coordinate.scope = Some(new.to_string());
            }
            normalization.apply(&coordinate, &scope)
        });
    }

    /// Check the graph's transpose invariant
    pub fn verify(&self) -> Result<()> {
        self.graph
            .verify()
            .map_err(|reason| Error::GraphInconsistency {
                scope: self.scope_name.clone(),
                reason,
            })
    }

    /// Replay every formula of the scope, in storage order
    pub fn build_from_storage<S>(source: &S, flavor: &'static CacheFlavor, scope_id: K) -> Result<Self>
    where
        S: FormulaSource<K> + ?Sized,
    {
        let scope = source.scope_formulas(scope_id)?;
        let mut cache = Self::new(flavor, scope_id, scope.scope_name);
        for (coord, formula) in &scope.formulas {
            cache.add_formula(coord, formula);
        }
        tracing::debug!(
            flavor = flavor.label,
            scope = %scope_id,
            formulas = cache.graph.len(),
            "built dependency cache from storage"
        );
        Ok(cache)
    }

    /// Persist under this cache's key; returns whether the store accepted it
    pub fn save<C: CacheStore + ?Sized>(&self, store: &C) -> Result<bool> {
        let entry = CacheEntry {
            scope_name: self.scope_name.clone(),
            graph: self.graph.clone(),
        };
        let bytes = serde_json::to_vec(&entry)?;
        let stored = store.set(&self.key(), bytes);
        if !stored {
            tracing::warn!(key = %self.key(), "cache store refused entry");
        }
        Ok(stored)
    }

    /// Load a stored cache, `None` on a miss, an undecodable entry, or (when
    /// `verify` is set) an entry violating the transpose invariant
    pub fn load<C: CacheStore + ?Sized>(
        store: &C,
        flavor: &'static CacheFlavor,
        scope_id: K,
        verify: bool,
    ) -> Option<Self> {
        let key = flavor.key(scope_id);
        let bytes = store.get(&key)?;

        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(%key, error = %e, "undecodable cache entry discarded");
                return None;
            }
        };

        let cache = Self {
            flavor,
            scope_id,
            scope_name: entry.scope_name,
            graph: entry.graph,
        };
        if verify {
            if let Err(e) = cache.verify() {
                tracing::warn!(%key, error = %e, "inconsistent cache entry discarded");
                return None;
            }
        }
        tracing::debug!(%key, "dependency cache hit");
        Some(cache)
    }

    /// Load the stored cache, or build it from storage and save it
    pub fn get<C, S>(
        store: &C,
        source: &S,
        flavor: &'static CacheFlavor,
        scope_id: K,
        verify: bool,
    ) -> Result<Self>
    where
        C: CacheStore + ?Sized,
        S: FormulaSource<K> + ?Sized,
    {
        if let Some(cache) = Self::load(store, flavor, scope_id, verify) {
            return Ok(cache);
        }
        tracing::debug!(key = %flavor.key(scope_id), "dependency cache miss");
        Self::rebuild(store, source, flavor, scope_id)
    }

    /// Build from storage and overwrite the stored entry
    pub fn rebuild<C, S>(store: &C, source: &S, flavor: &'static CacheFlavor, scope_id: K) -> Result<Self>
    where
        C: CacheStore + ?Sized,
        S: FormulaSource<K> + ?Sized,
    {
        let cache = Self::build_from_storage(source, flavor, scope_id)?;
        cache.save(store)?;
        Ok(cache)
    }

    /// Remove the stored entry; returns whether one existed
    pub fn delete<C: CacheStore + ?Sized>(store: &C, flavor: &'static CacheFlavor, scope_id: K) -> bool {
        store.delete(&flavor.key(scope_id))
    }

    /// Drop the stored entry so the next `get` rebuilds it
    pub fn invalidate<C: CacheStore + ?Sized>(store: &C, flavor: &'static CacheFlavor, scope_id: K) {
        if Self::delete(store, flavor, scope_id) {
            tracing::debug!(key = %flavor.key(scope_id), "dependency cache invalidated");
        }
    }
}
