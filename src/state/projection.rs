use std::sync::Arc;

use dashmap::DashMap;

use crate::types::ItemState;

/// In-memory current-state projection, keyed by ASIN. Write-through cache
/// over the persisted current_state table: the batch runner reads the diff
/// baseline here first and falls back to the store on a miss, and every
/// persisted update lands here too. Items are processed one at a time
/// inside a run, so there is a single writer per key; the map makes
/// concurrent API reads safe alongside run writes.
pub struct ProjectionCache {
    states: DashMap<String, ItemState>,
}

impl ProjectionCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { states: DashMap::new() })
    }

    pub fn get(&self, asin: &str) -> Option<ItemState> {
        self.states.get(asin).map(|s| s.clone())
    }

    pub fn put(&self, state: ItemState) {
        self.states.insert(state.asin.clone(), state);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Total badge count across cached items — a cheap liveness number for
    /// the health endpoint.
    pub fn badge_count(&self) -> usize {
        self.states.iter().map(|e| e.value().badges.len()).sum()
    }
}

impl Default for ProjectionCache {
    fn default() -> Self {
        Self { states: DashMap::new() }
    }
}
