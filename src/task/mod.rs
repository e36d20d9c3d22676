//! Task module - decomposed units of work, plans, and the ChangeSets they produce.
//!
//! - All state changes go through explicit transition methods
//! - Plans are validated on construction, so a `TaskPlan` is always dispatchable
//! - ChangeSets are values; aggregation builds a new one

mod changeset;
mod patch;
mod plan;
pub mod task;

pub use changeset::{ChangeSet, FileChange, FileMode, PathConflict};
pub use patch::{apply_patch, PatchError};
pub use plan::{PlannedTask, TaskPlan, TaskPlanError};
pub use task::{Task, TaskError, TaskFailure, TaskId, TaskOutput, TaskState};
