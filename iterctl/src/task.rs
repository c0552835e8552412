//! Task list data model.
//!
//! The persisted document is `{ "tasks": [...] }`. Unknown fields on the
//! document and on individual tasks are carried through untouched so that a
//! load/save cycle never drops data written by importers.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::task_id::{TaskId, TaskIdError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskListError {
    #[error(transparent)]
    InvalidId(#[from] TaskIdError),
    #[error("duplicate task id '{0}'")]
    DuplicateId(String),
    #[error("unknown task id '{0}'")]
    UnknownId(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub passes: bool,
    #[serde(default)]
    pub notes: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Fields for a task that does not have an id yet.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskDraft {
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub priority: i64,
    pub notes: String,
}

impl TaskDraft {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    fn into_task(self, id: &TaskId) -> Task {
        Task {
            id: id.to_string(),
            title: self.title,
            description: self.description,
            acceptance_criteria: self.acceptance_criteria,
            priority: self.priority,
            passes: false,
            notes: self.notes,
            extra: Map::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct TaskList {
    pub tasks: Vec<Task>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskList {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks,
            extra: Map::new(),
        }
    }

    /// Check that every id parses and no id repeats.
    pub fn validate(&self) -> Result<(), TaskListError> {
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(TaskId::parse(&task.id)?) {
                return Err(TaskListError::DuplicateId(task.id.clone()));
            }
        }
        Ok(())
    }

    fn parsed_ids(&self) -> Result<Vec<TaskId>, TaskListError> {
        self.tasks
            .iter()
            .map(|task| TaskId::parse(&task.id).map_err(TaskListError::from))
            .collect()
    }

    /// Tasks in logical order. Storage order is irrelevant.
    pub fn sorted(&self) -> Result<Vec<&Task>, TaskListError> {
        let ids = self.parsed_ids()?;
        let mut indexed: Vec<(TaskId, &Task)> = ids.into_iter().zip(self.tasks.iter()).collect();
        indexed.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(indexed.into_iter().map(|(_, task)| task).collect())
    }

    /// First task in logical order that has not passed.
    pub fn next_open(&self) -> Result<Option<&Task>, TaskListError> {
        Ok(self.sorted()?.into_iter().find(|task| !task.passes))
    }

    /// True when the list is non-empty and every task passes.
    pub fn all_pass(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|task| task.passes)
    }

    pub fn find(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    fn position(&self, id: &str) -> Result<usize, TaskListError> {
        self.tasks
            .iter()
            .position(|task| task.id == id)
            .ok_or_else(|| TaskListError::UnknownId(id.to_string()))
    }

    /// Id that `insert_after(anchor)` would assign, without mutating.
    pub fn next_id_after(&self, anchor: &str) -> Result<TaskId, TaskListError> {
        self.position(anchor)?;
        let anchor_id = TaskId::parse(anchor)?;
        let ids = self.parsed_ids()?;
        Ok(anchor_id.generate_next_available(ids.iter())?)
    }

    /// Splice a new task in after `anchor`, past every existing minor under
    /// the anchor's major. The new task is stored right after the last task
    /// sharing that major so the file stays readable.
    pub fn insert_after(&mut self, anchor: &str, draft: TaskDraft) -> Result<TaskId, TaskListError> {
        let new_id = self.next_id_after(anchor)?;
        let anchor_id = TaskId::parse(anchor)?;
        let mut insert_at = self.position(anchor)? + 1;
        for (index, task) in self.tasks.iter().enumerate() {
            if let Ok(id) = TaskId::parse(&task.id)
                && id.same_major(&anchor_id)
                && index >= insert_at
            {
                insert_at = index + 1;
            }
        }
        self.tasks.insert(insert_at, draft.into_task(&new_id));
        Ok(new_id)
    }

    /// Splice a new task in at the decimal midpoint between two siblings.
    pub fn insert_between(
        &mut self,
        lower: &str,
        upper: &str,
        draft: TaskDraft,
    ) -> Result<TaskId, TaskListError> {
        let lower_index = self.position(lower)?;
        self.position(upper)?;
        let new_id = TaskId::generate_between(&TaskId::parse(lower)?, &TaskId::parse(upper)?)?;
        if self.find(&new_id.to_string()).is_some() {
            return Err(TaskListError::DuplicateId(new_id.to_string()));
        }
        self.tasks.insert(lower_index + 1, draft.into_task(&new_id));
        Ok(new_id)
    }

    /// Record verified completion. Returns `false` if the task already passed.
    pub fn mark_passes(&mut self, id: &str) -> Result<bool, TaskListError> {
        let index = self.position(id)?;
        let task = &mut self.tasks[index];
        if task.passes {
            return Ok(false);
        }
        task.passes = true;
        Ok(true)
    }
}
