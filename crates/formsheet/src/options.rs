//! Engine configuration

/// Options for the recalculation engine
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// How many times aggregation may re-enter the engine for one edit
    /// (one level per division up the hierarchy). Default: 32
    pub max_aggregation_depth: usize,
    /// Check the transpose invariant of cached graphs when they are loaded,
    /// rebuilding from storage on violation. Default: true
    pub verify_cache_on_load: bool,
    /// Recompute aggregating cells of parent documents after a run. Default: true
    pub propagate_aggregations: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_aggregation_depth: 32,
            verify_cache_on_load: true,
            propagate_aggregations: true,
        }
    }
}
