//! Planning and execution.
//!
//! This module builds the dependency graph over active resources, reconciles
//! it against the prior snapshot into a plan, and executes plans with
//! rollback on failure.

mod diff;
mod executor;
mod graph;
mod plan;
mod rollback;

pub use diff::{ActionKind, DiffEngine, FieldChange, ResourceDiff, TYPE_FIELD};
pub use executor::{ExecutionReport, FailureMode, PlanExecutor, StepResult};
pub use graph::DependencyGraph;
pub use plan::{
    ExecutionStep, Plan, PlanContext, PlanKind, PlanSummary, PlannedAction, Planner, StepOperation,
};
pub use rollback::{JournalEntry, Rollback, RollbackReport};
