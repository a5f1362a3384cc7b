//! Longest-common-subsequence alignment of a mutant trace against the correct trace.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::config::AlignmentPolicy;
use crate::trace::{Trace, TraceStep};

/// Pure equivalence over trace steps.
///
/// `fingerprint` must agree with `equivalent`: equivalent steps share a fingerprint.
pub trait StepEquivalence {
    /// Cheap pre-filter hash.
    fn fingerprint(&self, step: &TraceStep) -> u64;

    /// Full comparison, only consulted when fingerprints agree.
    fn equivalent(&self, a: &TraceStep, b: &TraceStep) -> bool;
}

/// Steps are equivalent when they execute the same location.
#[derive(Debug, Clone, Copy, Default)]
pub struct SameLocation;

impl StepEquivalence for SameLocation {
    fn fingerprint(&self, step: &TraceStep) -> u64 {
        // method signatures are wildcards, so they stay out of the hash
        let mut hasher = DefaultHasher::new();
        step.location.class.hash(&mut hasher);
        step.location.line.hash(&mut hasher);
        hasher.finish()
    }

    fn equivalent(&self, a: &TraceStep, b: &TraceStep) -> bool {
        a.location.matches(&b.location)
    }
}

/// Same location and identical recorded state.
#[derive(Debug, Clone, Copy, Default)]
pub struct SameLocationAndState;

impl StepEquivalence for SameLocationAndState {
    fn fingerprint(&self, step: &TraceStep) -> u64 {
        let mut hasher = DefaultHasher::new();
        step.location.class.hash(&mut hasher);
        step.location.line.hash(&mut hasher);
        step.state.hash(&mut hasher);
        hasher.finish()
    }

    fn equivalent(&self, a: &TraceStep, b: &TraceStep) -> bool {
        a.location.matches(&b.location) && a.state == b.state
    }
}

/// One aligned correspondence. At least one side is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPair {
    /// Index into the mutant trace.
    pub mutant: Option<usize>,
    /// Index into the correct trace.
    pub correct: Option<usize>,
}

impl StepPair {
    /// Both sides present.
    pub fn is_matched(&self) -> bool {
        self.mutant.is_some() && self.correct.is_some()
    }
}

/// Alignment result in merged order; both index sequences are increasing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairList {
    pairs: Vec<StepPair>,
}

impl PairList {
    /// All correspondences.
    pub fn pairs(&self) -> &[StepPair] {
        &self.pairs
    }

    /// Number of correspondences.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// True for an alignment of two empty traces.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Number of matched pairs (the LCS length).
    pub fn matched(&self) -> usize {
        self.pairs.iter().filter(|p| p.is_matched()).count()
    }

    /// Mutant steps without a counterpart.
    pub fn unmatched_mutant(&self) -> Vec<usize> {
        self.pairs
            .iter()
            .filter(|p| p.correct.is_none())
            .filter_map(|p| p.mutant)
            .collect()
    }

    /// Correct steps without a counterpart.
    pub fn unmatched_correct(&self) -> Vec<usize> {
        self.pairs
            .iter()
            .filter(|p| p.mutant.is_none())
            .filter_map(|p| p.correct)
            .collect()
    }
}

const DIAG: u8 = 0;
const UP: u8 = 1;
const LEFT: u8 = 2;

/// Two-bit direction table.
struct Directions {
    bits: Vec<u8>,
    width: usize,
}

impl Directions {
    fn new(rows: usize, width: usize) -> Self {
        Self {
            bits: vec![0; (rows * width).div_ceil(4)],
            width,
        }
    }

    fn set(&mut self, row: usize, col: usize, dir: u8) {
        let cell = row * self.width + col;
        self.bits[cell / 4] |= dir << ((cell % 4) * 2);
    }

    fn get(&self, row: usize, col: usize) -> u8 {
        let cell = row * self.width + col;
        (self.bits[cell / 4] >> ((cell % 4) * 2)) & 0b11
    }
}

/// Aligns traces under a step equivalence.
pub struct TraceAligner {
    equivalence: Box<dyn StepEquivalence + Send + Sync>,
}

impl std::fmt::Debug for TraceAligner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceAligner").finish_non_exhaustive()
    }
}

impl TraceAligner {
    /// Aligner for a configured policy.
    pub fn new(policy: AlignmentPolicy) -> Self {
        match policy {
            AlignmentPolicy::Location => Self::with_equivalence(SameLocation),
            AlignmentPolicy::LocationAndState => Self::with_equivalence(SameLocationAndState),
        }
    }

    /// Aligner for a custom equivalence.
    pub fn with_equivalence(equivalence: impl StepEquivalence + Send + Sync + 'static) -> Self {
        Self {
            equivalence: Box::new(equivalence),
        }
    }

    /// Align `mutant` against `correct`. A missing correct trace aligns against nothing.
    ///
    /// Ties prefer skipping the mutant step, which makes the result a pure function of the inputs.
    pub fn align(&self, mutant: &Trace, correct: Option<&Trace>) -> PairList {
        let a = mutant.steps();
        let b = correct.map(Trace::steps).unwrap_or_default();
        let fa: Vec<u64> = a.iter().map(|s| self.equivalence.fingerprint(s)).collect();
        let fb: Vec<u64> = b.iter().map(|s| self.equivalence.fingerprint(s)).collect();
        let eq = |i: usize, j: usize| fa[i] == fb[j] && self.equivalence.equivalent(&a[i], &b[j]);

        let mut prefix = 0;
        while prefix < a.len() && prefix < b.len() && eq(prefix, prefix) {
            prefix += 1;
        }
        let mut suffix = 0;
        while suffix < a.len() - prefix
            && suffix < b.len() - prefix
            && eq(a.len() - 1 - suffix, b.len() - 1 - suffix)
        {
            suffix += 1;
        }

        let n = a.len() - prefix - suffix;
        let m = b.len() - prefix - suffix;
        let mut pairs = Vec::with_capacity(a.len().max(b.len()));
        pairs.extend((0..prefix).map(|k| StepPair {
            mutant: Some(k),
            correct: Some(k),
        }));

        let mut dirs = Directions::new(n, m);
        let mut prev = vec![0u32; m + 1];
        let mut cur = vec![0u32; m + 1];
        for i in 1..=n {
            cur[0] = 0;
            for j in 1..=m {
                if eq(prefix + i - 1, prefix + j - 1) {
                    cur[j] = prev[j - 1] + 1;
                    dirs.set(i - 1, j - 1, DIAG);
                } else if prev[j] >= cur[j - 1] {
                    cur[j] = prev[j];
                    dirs.set(i - 1, j - 1, UP);
                } else {
                    cur[j] = cur[j - 1];
                    dirs.set(i - 1, j - 1, LEFT);
                }
            }
            std::mem::swap(&mut prev, &mut cur);
        }

        let mut middle = Vec::with_capacity(n + m);
        let (mut i, mut j) = (n, m);
        while i > 0 || j > 0 {
            let dir = if i == 0 {
                LEFT
            } else if j == 0 {
                UP
            } else {
                dirs.get(i - 1, j - 1)
            };
            match dir {
                DIAG => {
                    middle.push(StepPair {
                        mutant: Some(prefix + i - 1),
                        correct: Some(prefix + j - 1),
                    });
                    i -= 1;
                    j -= 1;
                }
                UP => {
                    middle.push(StepPair {
                        mutant: Some(prefix + i - 1),
                        correct: None,
                    });
                    i -= 1;
                }
                _ => {
                    middle.push(StepPair {
                        mutant: None,
                        correct: Some(prefix + j - 1),
                    });
                    j -= 1;
                }
            }
        }
        middle.reverse();
        pairs.extend(middle);

        pairs.extend((0..suffix).map(|k| StepPair {
            mutant: Some(a.len() - suffix + k),
            correct: Some(b.len() - suffix + k),
        }));
        PairList { pairs }
    }
}

impl Default for TraceAligner {
    fn default() -> Self {
        Self::new(AlignmentPolicy::default())
    }
}
