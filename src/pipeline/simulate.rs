//! Divergence simulation over an aligned mutant/correct trace pair.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::align::PairList;
use super::collaborators::LineDiff;
use super::events::TrialKey;
use crate::trace::{ClassLocation, Trace, outer_class_name};

/// Shortest mutant trace that can explain anything.
pub const MIN_INFORMATIVE_STEPS: usize = 2;

/// How the executions disagree at the divergence point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DivergenceKind {
    /// The mutant executed a step the correct run never reached here.
    ControlFlow,
    /// The correct run executed a step the mutant skipped.
    MissingStep,
    /// Both executed the step but observed different values.
    DataValue {
        /// Variables whose values differ.
        vars: Vec<String>,
    },
}

/// A divergence explained by a mutated line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Divergence {
    /// What disagreed.
    pub kind: DivergenceKind,
    /// Position in the pair list.
    pub pair_index: usize,
    /// Mutant step at the divergence, if any.
    pub mutant_step: Option<usize>,
    /// Correct step at the divergence, if any.
    pub correct_step: Option<usize>,
    /// Latest mutant step on a mutated line before the divergence.
    pub root_step: usize,
    /// Location of that step.
    pub root: ClassLocation,
}

/// The located fault for one killing mutant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmpiricalTrial {
    /// Identity of the mutant and test case.
    pub key: TrialKey,
    /// Mutant source file.
    pub mutant_file: PathBuf,
    /// Lines the mutation changed, in mutated-file numbering.
    pub mutated_lines: Vec<u32>,
    /// Root-cause location.
    pub root_cause: ClassLocation,
    /// Root-cause line in original-file numbering.
    #[serde(default)]
    pub original_root_line: Option<u32>,
    /// Root-cause step in the mutant trace.
    pub root_cause_step: usize,
    /// Divergence found after the root cause.
    pub divergence: DivergenceKind,
    /// Mutant step at the divergence.
    #[serde(default)]
    pub mutant_step: Option<usize>,
    /// Correct step at the divergence.
    #[serde(default)]
    pub correct_step: Option<usize>,
    /// Mutant trace length.
    pub mutant_trace_len: usize,
    /// Correct trace length (0 when no correct trace was available).
    pub correct_trace_len: usize,
    /// Time spent producing the mutant trace, in milliseconds.
    pub trace_construct_ms: u64,
    /// The root-cause line had already executed earlier in the mutant run.
    pub loop_effective: bool,
}

/// Inputs for one simulation.
#[derive(Debug, Clone, Copy)]
pub struct SimulationInput<'a> {
    /// Killing mutant trace.
    pub mutant: &'a Trace,
    /// Correct trace, when captured.
    pub correct: Option<&'a Trace>,
    /// Alignment of the two.
    pub pairs: &'a PairList,
    /// Original vs mutated source.
    pub diff: &'a LineDiff,
    /// Outer class whose source was mutated.
    pub mutated_class: &'a str,
}

/// Finds the earliest explainable divergence.
#[derive(Debug, Clone, Copy, Default)]
pub struct DivergenceSimulator;

impl DivergenceSimulator {
    /// Every divergence preceded by a mutated-line step, in walk order.
    pub fn divergences(&self, input: SimulationInput<'_>) -> Vec<Divergence> {
        let mutant = input.mutant;
        if mutant.len() < MIN_INFORMATIVE_STEPS {
            return Vec::new();
        }
        let on_mutated_line = |index: usize| {
            mutant.step(index).is_some_and(|step| {
                outer_class_name(&step.location.class) == input.mutated_class
                    && input.diff.is_changed(step.location.line)
            })
        };

        let mut out = Vec::new();
        let mut root: Option<usize> = None;
        for (pair_index, pair) in input.pairs.pairs().iter().enumerate() {
            if let Some(m) = pair.mutant.filter(|&m| on_mutated_line(m)) {
                root = Some(m);
            }
            let Some(root_step) = root else {
                continue;
            };
            let kind = match (pair.mutant, pair.correct) {
                (Some(_), None) => DivergenceKind::ControlFlow,
                (None, Some(_)) => DivergenceKind::MissingStep,
                (Some(m), Some(c)) => {
                    let (Some(ms), Some(cs)) =
                        (mutant.step(m), input.correct.and_then(|t| t.step(c)))
                    else {
                        continue;
                    };
                    let vars = ms.differing_vars(cs);
                    if vars.is_empty() {
                        continue;
                    }
                    DivergenceKind::DataValue { vars }
                }
                (None, None) => continue,
            };
            let Some(root_location) = mutant.step(root_step).map(|s| s.location.clone()) else {
                continue;
            };
            out.push(Divergence {
                kind,
                pair_index,
                mutant_step: pair.mutant,
                correct_step: pair.correct,
                root_step,
                root: root_location,
            });
        }
        out
    }

    /// Earliest divergence turned into a trial; later candidates are dropped.
    pub fn simulate(
        &self,
        input: SimulationInput<'_>,
        key: TrialKey,
        mutant_file: PathBuf,
    ) -> Option<EmpiricalTrial> {
        let first = self.divergences(input).into_iter().next()?;
        let loop_effective = input.mutant.hits_before(first.root_step, &first.root) > 0;
        Some(EmpiricalTrial {
            key,
            mutant_file,
            mutated_lines: input.diff.changed_mutated.iter().copied().collect(),
            original_root_line: input.diff.original_line(first.root.line),
            root_cause: first.root,
            root_cause_step: first.root_step,
            divergence: first.kind,
            mutant_step: first.mutant_step,
            correct_step: first.correct_step,
            mutant_trace_len: input.mutant.len(),
            correct_trace_len: input.correct.map_or(0, Trace::len),
            trace_construct_ms: u64::try_from(input.mutant.construct_time().as_millis())
                .unwrap_or(u64::MAX),
            loop_effective,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::pipeline::align::TraceAligner;
    use crate::pipeline::collaborators::TestCaseId;
    use crate::pipeline::mutator::MutationStrategy;
    use crate::trace::TraceStep;

    fn trace(steps: Vec<TraceStep>) -> Trace {
        Trace::bounded(steps, 100).expect("fixture trace should build")
    }

    fn at(line: u32) -> TraceStep {
        TraceStep::at(ClassLocation::line_of("a.Calc", line))
    }

    fn diff(changed: &[u32]) -> LineDiff {
        LineDiff {
            changed_original: changed.iter().copied().collect(),
            changed_mutated: changed.iter().copied().collect::<BTreeSet<_>>(),
            mutated_to_original: (1..=20).map(|line| (line, line)).collect(),
        }
    }

    fn key() -> TrialKey {
        TrialKey {
            test_case: TestCaseId::new("a.CalcTest", "adds"),
            class: "a.Calc".to_string(),
            line: 3,
            strategy: MutationStrategy::TraceGuided,
            ordinal: 0,
        }
    }

    fn run(mutant: &Trace, correct: Option<&Trace>, changed: &[u32]) -> Option<EmpiricalTrial> {
        let pairs = TraceAligner::default().align(mutant, correct);
        let d = diff(changed);
        DivergenceSimulator.simulate(
            SimulationInput {
                mutant,
                correct,
                pairs: &pairs,
                diff: &d,
                mutated_class: "a.Calc",
            },
            key(),
            PathBuf::from("Calc.java"),
        )
    }

    #[test]
    fn flipped_branch_diverges_after_the_mutated_line() {
        let mutant = trace(vec![at(2), at(3), at(6), at(7)]);
        let correct = trace(vec![at(2), at(3), at(4), at(7)]);
        let trial = run(&mutant, Some(&correct), &[3]).expect("a trial should be found");
        assert_eq!(trial.root_cause, ClassLocation::line_of("a.Calc", 3));
        assert_eq!(trial.root_cause_step, 1);
        assert_eq!(trial.original_root_line, Some(3));
        assert_eq!(trial.divergence, DivergenceKind::MissingStep);
        assert_eq!(trial.correct_step, Some(2));
        assert!(!trial.loop_effective);
        assert_eq!(trial.mutated_lines, vec![3]);
    }

    #[test]
    fn data_divergence_on_a_matched_step() {
        let mutant = trace(vec![at(2), at(3).with_var("x", "2"), at(4).with_var("x", "2")]);
        let correct = trace(vec![at(2), at(3).with_var("x", "1"), at(4).with_var("x", "1")]);
        let trial = run(&mutant, Some(&correct), &[3]).expect("a trial should be found");
        assert_eq!(
            trial.divergence,
            DivergenceKind::DataValue {
                vars: vec!["x".to_string()]
            }
        );
        assert_eq!(trial.mutant_step, Some(1));
    }

    #[test]
    fn divergence_before_any_mutated_line_is_not_explained() {
        let mutant = trace(vec![at(9), at(2), at(3)]);
        let correct = trace(vec![at(2), at(3)]);
        assert!(run(&mutant, Some(&correct), &[3]).is_none());
    }

    #[test]
    fn one_step_traces_are_not_informative() {
        let mutant = trace(vec![at(3)]);
        assert!(run(&mutant, None, &[3]).is_none());
    }

    #[test]
    fn loop_effective_when_the_root_line_ran_before() {
        let mutant = trace(vec![at(3), at(4), at(3), at(5)]);
        let correct = trace(vec![at(3), at(4), at(3), at(4)]);
        let trial = run(&mutant, Some(&correct), &[3]).expect("a trial should be found");
        assert_eq!(trial.root_cause_step, 2);
        assert!(trial.loop_effective);
    }

    #[test]
    fn only_the_earliest_divergence_is_kept() {
        let mutant = trace(vec![at(3), at(8), at(9)]);
        let correct = trace(vec![at(3), at(4), at(5)]);
        let pairs = TraceAligner::default().align(&mutant, Some(&correct));
        let d = diff(&[3]);
        let input = SimulationInput {
            mutant: &mutant,
            correct: Some(&correct),
            pairs: &pairs,
            diff: &d,
            mutated_class: "a.Calc",
        };
        let all = DivergenceSimulator.divergences(input);
        assert_eq!(all.len(), 4);
        let trial = DivergenceSimulator
            .simulate(input, key(), PathBuf::from("Calc.java"))
            .expect("a trial should be found");
        assert_eq!(
            (trial.mutant_step, trial.correct_step),
            (all[0].mutant_step, all[0].correct_step)
        );
    }

    #[test]
    fn missing_correct_trace_is_best_effort() {
        let mutant = trace(vec![at(3), at(4)]);
        let trial = run(&mutant, None, &[3]).expect("a trial should be found");
        assert_eq!(trial.divergence, DivergenceKind::ControlFlow);
        assert_eq!(trial.mutant_step, Some(0));
        assert_eq!(trial.correct_trace_len, 0);
    }
}
