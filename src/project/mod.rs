//! Derived read-model over a task snapshot: per-project statistics,
//! workstream rollups, and the blocked/ready partitioning the CLI
//! renders. Never persisted; rebuilt from the store on demand.

use crate::models::{Priority, Task, TaskStatus, WorkstreamKey};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Default)]
pub struct WorkstreamRollup {
    pub key: WorkstreamKey,
    pub total: usize,
    pub complete: usize,
    pub in_progress: usize,
    pub pending: usize,
    /// Pending tasks whose dependencies are all complete.
    pub ready: usize,
    pub failed: usize,
}

impl WorkstreamRollup {
    pub fn is_done(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }

    pub fn is_blocked(&self) -> bool {
        self.pending > 0 && self.ready == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProjectSummary {
    /// Folder name; empty for the root project.
    pub name: String,
    pub total: usize,
    pub by_status: HashMap<TaskStatus, usize>,
    pub by_role: HashMap<String, usize>,
    pub by_priority: HashMap<Priority, usize>,
    pub workstreams: Vec<WorkstreamRollup>,
}

impl ProjectSummary {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "root"
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProjectView {
    pub projects: Vec<ProjectSummary>,
    /// Ids of tasks living directly under the tasks root.
    pub root_tasks: Vec<String>,
}

impl ProjectView {
    /// Build the view from a full store snapshot.
    pub fn build(tasks: &[Task]) -> Self {
        let complete_ids: HashMap<&str, bool> = tasks
            .iter()
            .map(|t| (t.id.as_str(), t.status == TaskStatus::Complete))
            .collect();
        let is_ready = |task: &Task| {
            task.status.is_schedulable()
                && task
                    .depends_on
                    .iter()
                    .all(|dep| complete_ids.get(dep.as_str()).copied().unwrap_or(false))
        };

        let mut projects: BTreeMap<String, ProjectSummary> = BTreeMap::new();
        let mut rollups: BTreeMap<WorkstreamKey, WorkstreamRollup> = BTreeMap::new();
        let mut root_tasks = Vec::new();

        for task in tasks {
            let summary = projects
                .entry(task.project.clone())
                .or_insert_with(|| ProjectSummary {
                    name: task.project.clone(),
                    ..Default::default()
                });
            summary.total += 1;
            *summary.by_status.entry(task.status).or_default() += 1;
            *summary.by_role.entry(task.role.clone()).or_default() += 1;
            *summary.by_priority.entry(task.priority).or_default() += 1;

            let key = task.workstream_key();
            let rollup = rollups.entry(key.clone()).or_insert_with(|| WorkstreamRollup {
                key,
                ..Default::default()
            });
            rollup.total += 1;
            match task.status {
                TaskStatus::Complete => rollup.complete += 1,
                TaskStatus::Assigned | TaskStatus::InProgress => rollup.in_progress += 1,
                TaskStatus::Pending | TaskStatus::Blocked => {
                    rollup.pending += 1;
                    if is_ready(task) {
                        rollup.ready += 1;
                    }
                }
                TaskStatus::Failed => rollup.failed += 1,
                TaskStatus::Review => {}
            }

            if task.project.is_empty() {
                root_tasks.push(task.id.clone());
            }
        }

        for rollup in rollups.into_values() {
            if let Some(summary) = projects.get_mut(&rollup.key.project) {
                summary.workstreams.push(rollup);
            }
        }
        root_tasks.sort();

        Self {
            projects: projects.into_values().collect(),
            root_tasks,
        }
    }

    pub fn project(&self, name: &str) -> Option<&ProjectSummary> {
        self.projects.iter().find(|p| p.name == name)
    }
}
