//! Decomposition plans: the validated output of the planning step.
//!
//! A plan is a list of [`PlannedTask`]s whose prerequisites are given as
//! indices into the same list. Validation happens in [`TaskPlan::new`], so a
//! `TaskPlan` value is always dispatchable.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::{Task, TaskId};
use crate::agents::Role;
use crate::run::RunId;

/// A planned task before it is bound to a Run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub role: Role,
    pub description: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Indices of tasks that must succeed first
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

impl PlannedTask {
    pub fn new(role: Role, description: impl Into<String>) -> Self {
        Self {
            role,
            description: description.into(),
            artifacts: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Add a dependency on another planned task (by index).
    pub fn with_dependency(mut self, index: usize) -> Self {
        self.depends_on.push(index);
        self
    }
}

/// A validated decomposition.
///
/// # Invariants
/// - `tasks` is non-empty
/// - every role is dispatchable and every description non-empty
/// - all dependency indices are valid, none is a self reference
/// - the prerequisite graph is acyclic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    summary: String,
    tasks: Vec<PlannedTask>,
}

impl TaskPlan {
    /// Validate and build a plan.
    pub fn new(summary: impl Into<String>, tasks: Vec<PlannedTask>) -> Result<Self, TaskPlanError> {
        if tasks.is_empty() {
            return Err(TaskPlanError::Empty);
        }

        for (i, task) in tasks.iter().enumerate() {
            if !task.role.is_dispatchable() {
                return Err(TaskPlanError::UndispatchableRole {
                    index: i,
                    role: task.role,
                });
            }
            if task.description.trim().is_empty() {
                return Err(TaskPlanError::EmptyDescription { index: i });
            }
            for &dep in &task.depends_on {
                if dep == i {
                    return Err(TaskPlanError::SelfDependency { index: i });
                }
                if dep >= tasks.len() {
                    return Err(TaskPlanError::InvalidDependency {
                        index: i,
                        dependency: dep,
                    });
                }
            }
        }

        let plan = Self {
            summary: summary.into(),
            tasks,
        };
        plan.execution_order()?;
        Ok(plan)
    }

    /// A one-task plan for a requirement already addressed to `role`.
    pub fn single(role: Role, description: impl Into<String>) -> Result<Self, TaskPlanError> {
        Self::new(
            format!("Routed directly to the {} role", role),
            vec![PlannedTask::new(role, description)],
        )
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn tasks(&self) -> &[PlannedTask] {
        &self.tasks
    }

    /// Indices in an order that respects dependencies (Kahn's algorithm).
    ///
    /// Ties are broken by plan order so the result is deterministic.
    pub fn execution_order(&self) -> Result<Vec<usize>, TaskPlanError> {
        let n = self.tasks.len();
        let mut in_degree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, task) in self.tasks.iter().enumerate() {
            for &dep in &task.depends_on {
                dependents[dep].push(i);
                in_degree[i] += 1;
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(node) = queue.pop_front() {
            order.push(node);
            for &next in &dependents[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != n {
            Err(TaskPlanError::CircularDependency)
        } else {
            Ok(order)
        }
    }

    /// Bind the plan to a Run, turning dependency indices into task ids.
    pub fn into_tasks(self, run_id: RunId) -> Vec<Task> {
        let ids: Vec<TaskId> = (0..self.tasks.len()).map(|_| TaskId::new()).collect();

        self.tasks
            .into_iter()
            .enumerate()
            .filter_map(|(index, planned)| {
                let mut deps: Vec<TaskId> = planned.depends_on.iter().map(|&d| ids[d]).collect();
                deps.sort();
                deps.dedup();
                // descriptions were validated in `new`
                Task::new(run_id, index, planned.role, planned.description)
                    .ok()
                    .map(|task| {
                        task.with_id(ids[index])
                            .with_artifacts(planned.artifacts)
                            .with_dependencies(deps)
                    })
            })
            .collect()
    }
}

/// Errors in plan validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskPlanError {
    #[error("Task list cannot be empty")]
    Empty,

    #[error("Task {index} has an empty description")]
    EmptyDescription { index: usize },

    #[error("Task {index} is assigned to role '{role}', which cannot take tasks")]
    UndispatchableRole { index: usize, role: Role },

    #[error("Task {index} has invalid dependency index {dependency}")]
    InvalidDependency { index: usize, dependency: usize },

    #[error("Task {index} depends on itself")]
    SelfDependency { index: usize },

    #[error("Circular dependency detected in task plan")]
    CircularDependency,
}

impl TaskPlanError {
    /// Structural defects point at the planner prompt, not at a flaky reply.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            TaskPlanError::SelfDependency { .. } | TaskPlanError::CircularDependency
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_plan_rejected() {
        assert_eq!(TaskPlan::new("", vec![]).unwrap_err(), TaskPlanError::Empty);
    }

    #[test]
    fn test_self_reference_rejected() {
        let tasks = vec![
            PlannedTask::new(Role::Backend, "endpoint"),
            PlannedTask::new(Role::Frontend, "ui").with_dependency(1),
        ];
        let err = TaskPlan::new("", tasks).unwrap_err();
        assert_eq!(err, TaskPlanError::SelfDependency { index: 1 });
        assert!(err.is_structural());
    }

    #[test]
    fn test_cycle_rejected() {
        let tasks = vec![
            PlannedTask::new(Role::Backend, "a").with_dependency(2),
            PlannedTask::new(Role::Frontend, "b").with_dependency(0),
            PlannedTask::new(Role::Database, "c").with_dependency(1),
        ];
        let err = TaskPlan::new("", tasks).unwrap_err();
        assert_eq!(err, TaskPlanError::CircularDependency);
        assert!(err.is_structural());
    }

    #[test]
    fn test_out_of_range_dependency_is_retryable() {
        let tasks = vec![PlannedTask::new(Role::Backend, "a").with_dependency(4)];
        let err = TaskPlan::new("", tasks).unwrap_err();
        assert!(matches!(err, TaskPlanError::InvalidDependency { .. }));
        assert!(!err.is_structural());
    }

    #[test]
    fn test_reviewer_cannot_take_tasks() {
        let tasks = vec![PlannedTask::new(Role::Reviewer, "look at it")];
        assert!(matches!(
            TaskPlan::new("", tasks).unwrap_err(),
            TaskPlanError::UndispatchableRole { index: 0, .. }
        ));
    }

    #[test]
    fn test_single_role_plan() {
        let plan = TaskPlan::single(Role::Database, "add a tags table").unwrap();
        assert_eq!(plan.tasks(), &[PlannedTask::new(Role::Database, "add a tags table")]);
        assert!(plan.summary().contains("database"));

        assert!(matches!(
            TaskPlan::single(Role::Reviewer, "look at it").unwrap_err(),
            TaskPlanError::UndispatchableRole { .. }
        ));
        assert_eq!(
            TaskPlan::single(Role::Backend, "  ").unwrap_err(),
            TaskPlanError::EmptyDescription { index: 0 }
        );
    }

    #[test]
    fn test_execution_order_respects_dependencies() {
        let tasks = vec![
            PlannedTask::new(Role::Frontend, "ui").with_dependency(1),
            PlannedTask::new(Role::Backend, "endpoint").with_dependency(2),
            PlannedTask::new(Role::Database, "table"),
        ];
        let plan = TaskPlan::new("", tasks).unwrap();
        assert_eq!(plan.execution_order().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_into_tasks_maps_indices_to_ids() {
        let run_id = RunId::new();
        let tasks = vec![
            PlannedTask::new(Role::Backend, "endpoint"),
            PlannedTask::new(Role::Frontend, "ui")
                .with_dependency(0)
                .with_dependency(0),
        ];
        let bound = TaskPlan::new("upload", tasks).unwrap().into_tasks(run_id);

        assert_eq!(bound.len(), 2);
        assert!(bound.iter().all(|t| t.run_id() == run_id));
        assert_eq!(bound[1].depends_on(), &[bound[0].id()]);
        assert!(bound[0].depends_on().is_empty());
    }
}
