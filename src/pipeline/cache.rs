//! Per-run memo of class -> source resolution.

use std::collections::HashMap;

use super::collaborators::{ProjectNavigator, SourceUnit};
use crate::trace::outer_class_name;

/// Resolved source units, keyed by outer class name.
///
/// Owned by one orchestration run and dropped with it; nothing survives across runs.
#[derive(Debug, Default)]
pub struct UnitCache {
    units: HashMap<String, Option<SourceUnit>>,
    hits: usize,
}

impl UnitCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve through the cache; misses are cached too.
    pub fn resolve(&mut self, navigator: &dyn ProjectNavigator, class: &str) -> Option<SourceUnit> {
        let key = outer_class_name(class);
        if let Some(unit) = self.units.get(key) {
            self.hits += 1;
            return unit.clone();
        }
        let unit = navigator.resolve_source(class);
        self.units.insert(key.to_string(), unit.clone());
        unit
    }

    /// Resolve and confirm the backing file still exists on disk.
    pub fn resolve_existing(
        &mut self,
        navigator: &dyn ProjectNavigator,
        class: &str,
    ) -> Option<SourceUnit> {
        self.resolve(navigator, class)
            .filter(|unit| unit.source_file.is_file())
    }

    /// Number of lookups answered from memory.
    pub fn hits(&self) -> usize {
        self.hits
    }
}
