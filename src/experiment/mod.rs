//! Experiment composition and sequencing.
//!
//! - [`Experiment`]: nested, repeatable tree of elements and sub-experiments
//! - [`flatten`]: deterministic expansion into an [`ExecutionPlan`]
//! - [`StepCursor`]: position within a plan while it executes

mod flatten;
mod tree;

pub use flatten::{
    flatten, Advance, ExecutionPlan, ExperimentNode, PlannedStep, StepCursor, MAX_PLAN_STEPS,
};
pub use tree::{
    effective_repeat, Experiment, Node, NodeContent, DEFAULT_CATEGORY, DEFAULT_DESCRIPTION,
    DEFAULT_NAME, MAX_REPEAT,
};
