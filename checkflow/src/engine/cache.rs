//! Cache of final run contexts keyed by ledger position.

use crate::context::PipelineContext;
use crate::core::RunId;
use dashmap::DashMap;

#[derive(Debug, Clone)]
struct CachedState {
    mark: (u64, u32),
    context: PipelineContext,
}

/// Last known context per run.
///
/// Every entry remembers the `(step_index, attempt)` of the ledger's latest
/// row when it was stored. A lookup with a different mark is a miss, so
/// the cache can never serve a context older than the ledger.
#[derive(Debug, Default)]
pub struct StateCache {
    entries: DashMap<RunId, CachedState>,
}

impl StateCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `context` as current for `mark`.
    pub fn insert(&self, run_id: RunId, mark: (u64, u32), context: PipelineContext) {
        self.entries.insert(run_id, CachedState { mark, context });
    }

    /// Returns the cached context if it was stored for `mark`.
    ///
    /// A stale entry is dropped.
    pub fn get_current(&self, run_id: &RunId, mark: (u64, u32)) -> Option<PipelineContext> {
        match self.entries.get(run_id) {
            None => return None,
            Some(entry) if entry.mark == mark => return Some(entry.context.clone()),
            Some(_) => {}
        }
        tracing::debug!(run_id = %run_id, "Dropping stale cached state");
        self.invalidate(run_id);
        None
    }

    /// Drops the entry for `run_id`.
    pub fn invalidate(&self, run_id: &RunId) {
        self.entries.remove(run_id);
    }

    /// Number of cached runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
