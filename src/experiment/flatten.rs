//! Flattening an [`Experiment`] into the linear program the device executes.
//!
//! Expansion is depth-first pre-order. A node with repeat `R` has its whole
//! expansion emitted `R` times consecutively, so `[{a, b}] x2` runs
//! `a, b, a, b`.
//!
//! # Numbering
//!
//! Every repetition of every top-level node is one *repetition unit*.
//!
//! - `step_number` is the index of the leaf's repetition unit.
//! - `substep_number` is the leaf's position inside that unit.
//! - `ordinal` is the leaf's position in the whole program.
//!
//! `[a] x2` yields `(0,0), (1,0)`; `[{a, b}] x2` yields
//! `(0,0), (0,1), (1,0), (1,1)`.

use super::tree::{Experiment, NodeContent};
use crate::elements::Element;
use crate::error::{InstrumentError, InstrumentResult};
use serde::{Deserialize, Serialize};

/// Longest program the host will flatten.
pub const MAX_PLAN_STEPS: u64 = 1_000_000;

/// Step context surfaced to observers when an element starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExperimentNode {
    /// Element display name
    pub step_name: String,
    /// Repetition unit index
    pub step_number: u32,
    /// Position within the repetition unit
    pub substep_number: u32,
}

/// One executable step of a flattened program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    /// Position in the program
    pub ordinal: u32,
    /// Observer-facing numbering
    pub node: ExperimentNode,
    /// Element to execute
    pub element: Element,
}

/// A flattened, immutable program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    experiment_name: String,
    steps: Vec<PlannedStep>,
}

impl ExecutionPlan {
    /// Name of the experiment this plan was flattened from.
    pub fn experiment_name(&self) -> &str {
        &self.experiment_name
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Always false for plans produced by [`flatten`].
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step at `ordinal`.
    pub fn get(&self, ordinal: u32) -> Option<&PlannedStep> {
        self.steps.get(ordinal as usize)
    }

    /// Steps in execution order.
    pub fn iter(&self) -> std::slice::Iter<'_, PlannedStep> {
        self.steps.iter()
    }

    /// A cursor positioned before the first step.
    pub fn cursor(&self) -> StepCursor {
        StepCursor::default()
    }
}

impl<'a> IntoIterator for &'a ExecutionPlan {
    type Item = &'a PlannedStep;
    type IntoIter = std::slice::Iter<'a, PlannedStep>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}

/// Outcome of [`StepCursor::advance`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Advance<'a> {
    /// The cursor moved to this step
    Next(&'a PlannedStep),
    /// The program has no further steps
    Exhausted,
}

/// Position within an [`ExecutionPlan`].
///
/// The cursor holds no reference to the plan so it can live next to the
/// plan in the same session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepCursor {
    position: Option<u32>,
    exhausted: bool,
}

impl StepCursor {
    /// Move to the next step.
    pub fn advance<'a>(&mut self, plan: &'a ExecutionPlan) -> Advance<'a> {
        if self.exhausted {
            return Advance::Exhausted;
        }
        let next = self.position.map_or(0, |p| p.saturating_add(1));
        match plan.get(next) {
            Some(step) => {
                self.position = Some(next);
                Advance::Next(step)
            }
            None => {
                self.exhausted = true;
                Advance::Exhausted
            }
        }
    }

    /// Jump to the step the device reported. Returns it if it exists.
    pub fn seek<'a>(&mut self, plan: &'a ExecutionPlan, ordinal: u32) -> Option<&'a PlannedStep> {
        let step = plan.get(ordinal)?;
        self.position = Some(ordinal);
        self.exhausted = false;
        Some(step)
    }

    /// Ordinal of the current step, if any step has started.
    pub fn position(&self) -> Option<u32> {
        self.position
    }

    /// True once `advance` ran past the final step.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// True when the current step is the final step of `plan`.
    pub fn at_last(&self, plan: &ExecutionPlan) -> bool {
        self.position
            .is_some_and(|p| p as usize + 1 == plan.len())
    }
}

/// Flatten `experiment` into an [`ExecutionPlan`].
///
/// # Errors
///
/// - [`InstrumentError::ExperimentIsEmpty`] when the tree expands to no
///   steps.
/// - [`InstrumentError::InvalidParameters`] when the expansion exceeds
///   [`MAX_PLAN_STEPS`].
pub fn flatten(experiment: &Experiment) -> InstrumentResult<ExecutionPlan> {
    let total = experiment.leaf_count();
    if total == 0 {
        return Err(InstrumentError::ExperimentIsEmpty);
    }
    if total > MAX_PLAN_STEPS {
        return Err(InstrumentError::InvalidParameters(format!(
            "experiment expands to {total} steps (maximum {MAX_PLAN_STEPS})"
        )));
    }

    let mut steps = Vec::with_capacity(total as usize);
    let mut unit: u32 = 0;
    let mut pass = Vec::new();

    for node in experiment.nodes() {
        pass.clear();
        collect_once(&node.content, &mut pass);
        for _ in 0..node.repeat {
            for (substep, element) in pass.iter().enumerate() {
                let ordinal = steps.len() as u32;
                steps.push(PlannedStep {
                    ordinal,
                    node: ExperimentNode {
                        step_name: element.name().to_string(),
                        step_number: unit,
                        substep_number: substep as u32,
                    },
                    element: (*element).clone(),
                });
            }
            unit += 1;
        }
    }

    Ok(ExecutionPlan {
        experiment_name: experiment.name().to_string(),
        steps,
    })
}

/// Leaves of one pass through `content`, honoring nested repeats.
fn collect_once<'a>(content: &'a NodeContent, out: &mut Vec<&'a Element>) {
    match content {
        NodeContent::Element(element) => out.push(element),
        NodeContent::Experiment(sub) => {
            for node in sub.nodes() {
                let start = out.len();
                collect_once(&node.content, out);
                let end = out.len();
                for _ in 1..node.repeat {
                    out.extend_from_within(start..end);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elements::{ConstantCurrent, OpenCircuit};

    fn ocp(duration: f64) -> Element {
        Element::from(OpenCircuit::new(duration, 1.0))
    }

    fn cc() -> Element {
        Element::from(ConstantCurrent::new(0.001, 1.0, 5.0))
    }

    fn numbering(plan: &ExecutionPlan) -> Vec<(u32, u32)> {
        plan.iter()
            .map(|s| (s.node.step_number, s.node.substep_number))
            .collect()
    }

    #[test]
    fn empty_tree_is_rejected() {
        assert_eq!(
            flatten(&Experiment::new()),
            Err(InstrumentError::ExperimentIsEmpty)
        );
        let mut exp = Experiment::new();
        exp.append_sub_experiment(&Experiment::new(), 3);
        assert_eq!(flatten(&exp), Err(InstrumentError::ExperimentIsEmpty));
    }

    #[test]
    fn repeated_element_is_one_unit_per_repeat() {
        let mut exp = Experiment::new();
        exp.append_element(&ocp(1.0), 2);
        let plan = flatten(&exp).unwrap();
        assert_eq!(numbering(&plan), vec![(0, 0), (1, 0)]);
        assert!(plan.iter().all(|s| s.element == ocp(1.0)));
    }

    #[test]
    fn repeats_are_outer() {
        let mut sub = Experiment::new();
        sub.append_element(&ocp(1.0), 1);
        sub.append_element(&cc(), 1);
        let mut exp = Experiment::new();
        exp.append_sub_experiment(&sub, 2);

        let plan = flatten(&exp).unwrap();
        let kinds: Vec<_> = plan.iter().map(|s| s.element.clone()).collect();
        assert_eq!(kinds, vec![ocp(1.0), cc(), ocp(1.0), cc()]);
        assert_eq!(numbering(&plan), vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
        let ordinals: Vec<_> = plan.iter().map(|s| s.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2, 3]);
    }

    #[test]
    fn nested_repeats_expand_in_place() {
        let mut inner = Experiment::new();
        inner.append_element(&cc(), 2);
        let mut sub = Experiment::new();
        sub.append_element(&ocp(1.0), 1);
        sub.append_sub_experiment(&inner, 2);

        let mut exp = Experiment::new();
        exp.append_element(&ocp(5.0), 1);
        exp.append_sub_experiment(&sub, 1);

        let plan = flatten(&exp).unwrap();
        assert_eq!(plan.len(), 6);
        assert_eq!(
            numbering(&plan),
            vec![(0, 0), (1, 0), (1, 1), (1, 2), (1, 3), (1, 4)]
        );
        assert_eq!(plan.get(0).unwrap().node.step_name, "Open Circuit Potential");
        assert_eq!(plan.get(2).unwrap().node.step_name, "Constant Current, Advanced");
    }

    #[test]
    fn mutation_after_append_is_inert() {
        let mut element = ocp(1.0);
        let mut exp = Experiment::new();
        exp.append_element(&element, 1);
        if let Element::OpenCircuit(record) = &mut element {
            record.duration = 42.0;
        }
        let plan = flatten(&exp).unwrap();
        assert_eq!(plan.get(0).unwrap().element, ocp(1.0));
    }

    #[test]
    fn oversized_expansion_is_rejected() {
        let mut inner = Experiment::new();
        inner.append_element(&ocp(1.0), 65_535);
        let mut exp = Experiment::new();
        exp.append_sub_experiment(&inner, 65_535);
        assert!(matches!(
            flatten(&exp),
            Err(InstrumentError::InvalidParameters(_))
        ));
    }

    #[test]
    fn cursor_walks_and_exhausts() {
        let mut exp = Experiment::new();
        exp.append_element(&ocp(1.0), 2);
        let plan = flatten(&exp).unwrap();
        let mut cursor = plan.cursor();

        assert!(matches!(cursor.advance(&plan), Advance::Next(s) if s.ordinal == 0));
        assert!(!cursor.at_last(&plan));
        assert!(matches!(cursor.advance(&plan), Advance::Next(s) if s.ordinal == 1));
        assert!(cursor.at_last(&plan));
        assert_eq!(cursor.advance(&plan), Advance::Exhausted);
        assert!(cursor.is_exhausted());
        assert_eq!(cursor.advance(&plan), Advance::Exhausted);

        assert!(cursor.seek(&plan, 0).is_some());
        assert_eq!(cursor.position(), Some(0));
        assert!(cursor.seek(&plan, 9).is_none());
    }
}
