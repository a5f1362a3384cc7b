//! Mutant generation for candidate locations.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::cache::UnitCache;
use super::collaborators::{ProjectNavigator, SourceUnit};
use super::operators::{LineMutation, control_dominated_mutations, trace_guided_mutations};
use crate::trace::{ClassLocation, outer_class_name};

/// Mutation generation errors.
#[derive(Debug, Error)]
pub enum MutationError {
    /// IO failure reading a source or writing a mutant.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which candidate list, and therefore which operator family, produced a mutant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStrategy {
    /// Expression edits on lines the test executed.
    TraceGuided,
    /// Branch and statement edits on structurally related lines.
    ControlDominated,
}

impl MutationStrategy {
    /// Short tag used in paths and identifiers.
    pub fn tag(self) -> &'static str {
        match self {
            Self::TraceGuided => "tg",
            Self::ControlDominated => "cd",
        }
    }

    fn operators(self, line: &str) -> Vec<LineMutation> {
        match self {
            Self::TraceGuided => trace_guided_mutations(line),
            Self::ControlDominated => control_dominated_mutations(line),
        }
    }
}

impl fmt::Display for MutationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A generated mutant source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutantFile {
    /// Where the mutated source was written.
    pub path: PathBuf,
    /// Outer class whose file was mutated.
    pub class: String,
    /// Mutated line.
    pub line: u32,
    /// Producing strategy.
    pub strategy: MutationStrategy,
    /// Position among this line's mutants for the strategy.
    pub ordinal: usize,
    /// Operator family.
    pub operator: String,
}

impl MutantFile {
    /// Stable identifier, safe for file names.
    pub fn id(&self) -> String {
        format!(
            "{}_L{}_{}{}",
            self.class.replace(['.', '$'], "_"),
            self.line,
            self.strategy.tag(),
            self.ordinal
        )
    }
}

/// Mutants generated for one class file, grouped by line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationResult {
    /// Original source file.
    pub source_file: PathBuf,
    /// Source root of the file.
    pub source_folder: PathBuf,
    /// Line -> mutants in generation order.
    pub mutated_files: BTreeMap<u32, Vec<MutantFile>>,
}

impl MutationResult {
    /// Number of mutants.
    pub fn total(&self) -> usize {
        self.mutated_files.values().map(Vec::len).sum()
    }
}

/// Class name -> its mutation result.
pub type MutationResults = BTreeMap<String, MutationResult>;

/// Union `other` into `into` per class, then per line.
pub fn merge_results(into: &mut MutationResults, other: MutationResults) {
    for (class, result) in other {
        match into.get_mut(&class) {
            Some(existing) => {
                for (line, files) in result.mutated_files {
                    let slot = existing.mutated_files.entry(line).or_default();
                    for file in files {
                        if !slot.iter().any(|f| f.path == file.path) {
                            slot.push(file);
                        }
                    }
                }
            }
            None => {
                into.insert(class, result);
            }
        }
    }
}

struct LineSlot {
    class: String,
    line: u32,
    edits: Vec<(LineMutation, String)>,
}

/// Writes bounded sets of mutants under a scratch directory.
pub struct Mutator<'a> {
    navigator: &'a dyn ProjectNavigator,
    scratch_dir: PathBuf,
    budget: usize,
}

impl<'a> Mutator<'a> {
    /// Mutator writing at most `budget` mutants per strategy call.
    pub fn new(
        navigator: &'a dyn ProjectNavigator,
        scratch_dir: impl Into<PathBuf>,
        budget: usize,
    ) -> Self {
        Self {
            navigator,
            scratch_dir: scratch_dir.into(),
            budget,
        }
    }

    /// Generate mutants for `candidates` with `strategy`.
    ///
    /// Lines are served round-robin so the budget spreads across candidates in order.
    /// Identical mutated lines within a class are generated once.
    pub fn mutate(
        &self,
        cache: &mut UnitCache,
        candidates: &[ClassLocation],
        strategy: MutationStrategy,
    ) -> Result<MutationResults, MutationError> {
        let mut units: BTreeMap<String, (SourceUnit, Vec<String>)> = BTreeMap::new();
        let mut slots: Vec<LineSlot> = Vec::new();
        let mut seen_lines = BTreeSet::new();
        let mut seen_edits: BTreeSet<(String, u32, String)> = BTreeSet::new();

        for candidate in candidates {
            let class = outer_class_name(&candidate.class).to_string();
            if !seen_lines.insert((class.clone(), candidate.line)) {
                continue;
            }
            // Re-check: the file may have vanished since selection.
            let Some(unit) = cache.resolve_existing(self.navigator, &class) else {
                continue;
            };
            if !units.contains_key(&class) {
                let source = std::fs::read_to_string(&unit.source_file)?;
                let lines = source.split_inclusive('\n').map(str::to_string).collect();
                units.insert(class.clone(), (unit, lines));
            }
            let Some((_, lines)) = units.get(&class) else {
                continue;
            };
            let Some(text) = lines.get(candidate.line.saturating_sub(1) as usize) else {
                continue;
            };
            let edits: Vec<(LineMutation, String)> = strategy
                .operators(text)
                .into_iter()
                .filter_map(|m| {
                    let mutated = m.apply(text);
                    seen_edits
                        .insert((class.clone(), candidate.line, mutated.clone()))
                        .then_some((m, mutated))
                })
                .collect();
            if !edits.is_empty() {
                slots.push(LineSlot {
                    class,
                    line: candidate.line,
                    edits,
                });
            }
        }

        let mut chosen: Vec<(usize, usize)> = Vec::new();
        let mut round = 0;
        while chosen.len() < self.budget {
            let mut progressed = false;
            for (slot_idx, slot) in slots.iter().enumerate() {
                if chosen.len() >= self.budget {
                    break;
                }
                if round < slot.edits.len() {
                    chosen.push((slot_idx, round));
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
            round += 1;
        }
        chosen.sort();

        let mut results = MutationResults::new();
        for (slot_idx, edit_idx) in chosen {
            let slot = &slots[slot_idx];
            let Some((unit, lines)) = units.get(&slot.class) else {
                continue;
            };
            let (mutation, mutated_line) = &slot.edits[edit_idx];
            let file = MutantFile {
                path: PathBuf::new(),
                class: slot.class.clone(),
                line: slot.line,
                strategy,
                ordinal: edit_idx,
                operator: mutation.operator.to_string(),
            };
            let path = self.write_mutant(unit, lines, &file, mutated_line)?;
            let file = MutantFile { path, ..file };

            results
                .entry(slot.class.clone())
                .or_insert_with(|| MutationResult {
                    source_file: unit.source_file.clone(),
                    source_folder: unit.source_folder.clone(),
                    mutated_files: BTreeMap::new(),
                })
                .mutated_files
                .entry(slot.line)
                .or_default()
                .push(file);
        }

        debug!(
            strategy = %strategy,
            mutants = results.values().map(MutationResult::total).sum::<usize>(),
            "generated mutants"
        );
        Ok(results)
    }

    fn write_mutant(
        &self,
        unit: &SourceUnit,
        lines: &[String],
        file: &MutantFile,
        mutated_line: &str,
    ) -> Result<PathBuf, MutationError> {
        let dir = self
            .scratch_dir
            .join(&file.class)
            .join(file.line.to_string())
            .join(format!("{}{}", file.strategy.tag(), file.ordinal));
        std::fs::create_dir_all(&dir)?;
        let file_name = unit
            .source_file
            .file_name()
            .map(Path::new)
            .unwrap_or_else(|| Path::new("Mutant.java"));
        let path = dir.join(file_name);

        let idx = file.line.saturating_sub(1) as usize;
        let mut body = String::with_capacity(lines.iter().map(String::len).sum::<usize>() + 8);
        for (i, line) in lines.iter().enumerate() {
            body.push_str(if i == idx { mutated_line } else { line });
        }
        std::fs::write(&path, body)?;
        Ok(path)
    }
}
