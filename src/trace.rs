//! Captured executions: class locations, trace steps and bounded traces.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default cap on the number of steps a trace may hold.
pub const DEFAULT_STEP_LIMIT: usize = 10_000;

/// Trace construction errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceError {
    /// The execution produced more steps than the configured cap.
    #[error("trace is over long: {steps} steps exceeds limit of {limit}")]
    OverLong {
        /// Steps reported by the execution.
        steps: usize,
        /// Configured cap.
        limit: usize,
    },
}

/// A source line inside a class, optionally qualified by method signature.
///
/// A missing method signature acts as a wildcard in [`ClassLocation::matches`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClassLocation {
    /// Canonical class name, e.g. `com.acme.Parser$Token`.
    pub class: String,
    /// Method signature, when known.
    #[serde(default)]
    pub method: Option<String>,
    /// 1-based source line.
    pub line: u32,
}

impl ClassLocation {
    /// Create a location.
    pub fn new(class: impl Into<String>, method: Option<String>, line: u32) -> Self {
        Self {
            class: class.into(),
            method,
            line,
        }
    }

    /// Location without a method signature.
    pub fn line_of(class: impl Into<String>, line: u32) -> Self {
        Self::new(class, None, line)
    }

    /// Same class and line; method signatures must agree only when both are present.
    pub fn matches(&self, other: &ClassLocation) -> bool {
        self.class == other.class
            && self.line == other.line
            && match (&self.method, &other.method) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }

    /// Class name with any inner-class suffix removed.
    pub fn outer_class(&self) -> &str {
        outer_class_name(&self.class)
    }

    /// Drop the method signature, keeping class and line.
    pub fn without_method(&self) -> Self {
        Self::line_of(self.class.clone(), self.line)
    }
}

impl fmt::Display for ClassLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.method {
            Some(method) => write!(f, "{}#{}:{}", self.class, method, self.line),
            None => write!(f, "{}:{}", self.class, self.line),
        }
    }
}

/// Strip an inner-class suffix (`Outer$Inner` -> `Outer`).
pub fn outer_class_name(class: &str) -> &str {
    match class.find('$') {
        Some(idx) => &class[..idx],
        None => class,
    }
}

/// One executed step: where it ran and the observable state after it ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceStep {
    /// Executed location.
    pub location: ClassLocation,
    /// Variable name to rendered value. Opaque to the pipeline beyond equality.
    #[serde(default)]
    pub state: BTreeMap<String, String>,
}

impl TraceStep {
    /// Step without recorded state.
    pub fn at(location: ClassLocation) -> Self {
        Self {
            location,
            state: BTreeMap::new(),
        }
    }

    /// Add one variable binding.
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.state.insert(name.into(), value.into());
        self
    }

    /// Variables whose values differ between two steps, including ones present on one side only.
    pub fn differing_vars(&self, other: &TraceStep) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for (name, value) in &self.state {
            if other.state.get(name) != Some(value) {
                names.push(name.clone());
            }
        }
        for name in other.state.keys() {
            if !self.state.contains_key(name) {
                names.push(name.clone());
            }
        }
        names.sort();
        names
    }
}

/// An immutable captured execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    steps: Vec<TraceStep>,
    step_count: usize,
    #[serde(default)]
    construct_time: Duration,
}

impl Trace {
    /// Materialize a trace, refusing anything longer than `step_limit`.
    pub fn bounded(steps: Vec<TraceStep>, step_limit: usize) -> Result<Self, TraceError> {
        if steps.len() > step_limit {
            return Err(TraceError::OverLong {
                steps: steps.len(),
                limit: step_limit,
            });
        }
        let step_count = steps.len();
        Ok(Self {
            steps,
            step_count,
            construct_time: Duration::ZERO,
        })
    }

    /// Stamp the time it took to produce this trace.
    pub fn with_construct_time(mut self, construct_time: Duration) -> Self {
        self.construct_time = construct_time;
        self
    }

    /// Ordered steps.
    pub fn steps(&self) -> &[TraceStep] {
        &self.steps
    }

    /// Step at `index`.
    pub fn step(&self, index: usize) -> Option<&TraceStep> {
        self.steps.get(index)
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.step_count
    }

    /// True when the trace holds no steps.
    pub fn is_empty(&self) -> bool {
        self.step_count == 0
    }

    /// Time spent producing the trace.
    pub fn construct_time(&self) -> Duration {
        self.construct_time
    }

    /// Distinct executed locations (method dropped) in first-seen order.
    pub fn visited_locations(&self) -> Vec<ClassLocation> {
        let mut seen = std::collections::BTreeSet::new();
        let mut out = Vec::new();
        for step in &self.steps {
            let loc = step.location.without_method();
            if seen.insert(loc.clone()) {
                out.push(loc);
            }
        }
        out
    }

    /// How many times `location` executed before step `index`.
    pub fn hits_before(&self, index: usize, location: &ClassLocation) -> usize {
        self.steps
            .iter()
            .take(index)
            .filter(|s| s.location.matches(location))
            .count()
    }

    /// Encode with bincode for archiving.
    #[cfg(feature = "serialization")]
    pub fn to_bincode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Decode a bincode archive.
    #[cfg(feature = "serialization")]
    pub fn from_bincode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
