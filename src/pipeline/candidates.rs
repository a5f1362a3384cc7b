//! Mutation candidate selection from a passing test's execution.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::{debug, warn};

use super::cache::UnitCache;
use super::collaborators::{ClassScanner, ProjectNavigator};
use super::orchestrator::CancellationFlag;
use crate::trace::{ClassLocation, outer_class_name};

/// Candidate selection errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CandidateError {
    /// The first executed class has no source artifact; the test case cannot be mutated.
    #[error("cannot resolve source of candidate class {0}")]
    Unresolved(String),
    /// Cancellation was requested between scanning passes.
    #[error("candidate scanning cancelled")]
    Cancelled,
}

/// Candidate locations for one test case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationCandidateSet {
    /// Lines executed by the passing test, in first-seen order.
    pub dynamic: Vec<ClassLocation>,
    /// Structurally related lines found by scanning, disjoint from `dynamic`.
    pub control_dominated: Vec<ClassLocation>,
}

impl MutationCandidateSet {
    /// True when neither list holds a candidate.
    pub fn is_empty(&self) -> bool {
        self.dynamic.is_empty() && self.control_dominated.is_empty()
    }
}

fn in_test_class(location: &ClassLocation, test_class: &str) -> bool {
    outer_class_name(&location.class) == outer_class_name(test_class)
}

fn file_line(location: &ClassLocation) -> (String, u32) {
    (outer_class_name(&location.class).to_string(), location.line)
}

/// Executed locations outside the test class, method signature dropped.
pub fn dynamic_candidates(visited: &[ClassLocation], test_class: &str) -> Vec<ClassLocation> {
    visited
        .iter()
        .filter(|loc| !in_test_class(loc, test_class))
        .map(ClassLocation::without_method)
        .collect()
}

/// Derives dynamic and control-dominated candidates.
pub struct CandidateSelector<'a> {
    navigator: &'a dyn ProjectNavigator,
    scanner: &'a dyn ClassScanner,
}

impl<'a> CandidateSelector<'a> {
    /// Selector over the given collaborators.
    pub fn new(navigator: &'a dyn ProjectNavigator, scanner: &'a dyn ClassScanner) -> Self {
        Self { navigator, scanner }
    }

    /// Select candidates for a test whose correct run visited `visited`.
    pub fn select(
        &self,
        cache: &mut UnitCache,
        visited: &[ClassLocation],
        test_class: &str,
        cancel: &CancellationFlag,
    ) -> Result<MutationCandidateSet, CandidateError> {
        let dynamic = dynamic_candidates(visited, test_class);
        let Some(first) = dynamic.first() else {
            return Ok(MutationCandidateSet::default());
        };
        if cache.resolve(self.navigator, &first.class).is_none() {
            return Err(CandidateError::Unresolved(first.class.clone()));
        }

        let before = dynamic.len();
        let dynamic: Vec<ClassLocation> = dynamic
            .into_iter()
            .filter(|loc| cache.resolve_existing(self.navigator, &loc.class).is_some())
            .collect();
        if dynamic.len() < before {
            debug!(
                dropped = before - dynamic.len(),
                "dropped dynamic candidates without local source"
            );
        }

        // one source file per outer class: inner-class steps share its line numbers
        let mut lines_by_class: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
        for loc in &dynamic {
            lines_by_class
                .entry(outer_class_name(&loc.class).to_string())
                .or_default()
                .insert(loc.line);
        }

        let taken: BTreeSet<(String, u32)> = dynamic.iter().map(file_line).collect();
        let mut control_dominated = Vec::new();
        let mut seen = BTreeSet::new();
        for (class, lines) in &lines_by_class {
            if cancel.is_cancelled() {
                return Err(CandidateError::Cancelled);
            }
            let Some(unit) = cache.resolve_existing(self.navigator, class) else {
                continue;
            };
            let related = match self.scanner.related_lines(&unit, class, lines) {
                Ok(related) => related,
                Err(err) => {
                    warn!(class = %class, error = %err, "static scan failed; skipping class");
                    continue;
                }
            };
            for loc in related {
                let loc = loc.without_method();
                if in_test_class(&loc, test_class) || taken.contains(&file_line(&loc)) {
                    continue;
                }
                if cache.resolve_existing(self.navigator, &loc.class).is_none() {
                    continue;
                }
                if seen.insert(file_line(&loc)) {
                    control_dominated.push(loc);
                }
            }
        }

        Ok(MutationCandidateSet {
            dynamic,
            control_dominated,
        })
    }
}
