use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A unit of work parsed from a markdown task file.
///
/// Tasks are the fundamental currency of the system. Each one lives in a
/// file under the tasks root; the struct keeps the file's provenance so
/// every mutation can be written back to the same place.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub title: String,
    /// Project folder name; empty string means the root project.
    pub project: String,
    pub role: String,
    pub workstream: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub depends_on: Vec<String>,
    pub assigned_to: Option<String>,
    pub completion: Option<Completion>,
    /// Markdown body below the front matter.
    pub content: String,
    /// File the task was parsed from; mutations rewrite this path.
    pub path: PathBuf,
    /// Original front matter, in source key order. Mutations update known
    /// keys in place so unknown keys and ordering survive a rewrite.
    pub front_matter: serde_yaml::Mapping,
}

impl Task {
    /// The derived workstream key grouping this task with its siblings.
    pub fn workstream_key(&self) -> WorkstreamKey {
        WorkstreamKey {
            project: self.project.clone(),
            role: self.role.clone(),
            workstream: self.workstream.clone(),
        }
    }
}

/// How a task is declared done: either a literal signal appearing in the
/// agent's output, or a verify command exiting zero. Either is sufficient.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub verify: Option<String>,
    pub signal: Option<String>,
}

/// Status of a task in its lifecycle.
///
/// `pending -> assigned -> in_progress -> (complete | failed | review)`,
/// with `pending <-> blocked` as dependency state changes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Blocked,
    Assigned,
    InProgress,
    Review,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Review => "review",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
        }
    }

    /// Statuses for which the assignment invariant requires an empty
    /// `assigned_to`.
    pub fn clears_assignment(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Blocked | TaskStatus::Complete | TaskStatus::Failed
        )
    }

    /// Statuses the scheduler may still dispatch. `blocked` flows back to
    /// runnable the moment its dependencies complete; the two statuses
    /// are one pool as far as readiness is concerned.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Blocked)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "blocked" => Ok(TaskStatus::Blocked),
            "assigned" => Ok(TaskStatus::Assigned),
            "in_progress" => Ok(TaskStatus::InProgress),
            "review" => Ok(TaskStatus::Review),
            "complete" => Ok(TaskStatus::Complete),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(format!("unknown task status: {s}")),
        }
    }
}

/// Task priority. The derive order makes `Critical` compare lowest, so
/// sorting ascending serves the most urgent work first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            _ => Err(format!("unknown priority: {s}")),
        }
    }
}

/// Identity of a workstream: the grouping under which tasks are drained
/// sequentially by a single agent. Derived, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkstreamKey {
    pub project: String,
    pub role: String,
    pub workstream: String,
}

impl WorkstreamKey {
    pub fn new(
        project: impl Into<String>,
        role: impl Into<String>,
        workstream: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            role: role.into(),
            workstream: workstream.into(),
        }
    }
}

impl fmt::Display for WorkstreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let project = if self.project.is_empty() {
            "root"
        } else {
            &self.project
        };
        write!(f, "{project}/{}/{}", self.role, self.workstream)
    }
}

/// Durable record of an intended agent.
///
/// The registry file is the source of intent; the container engine is the
/// source of observed state. `reconcile` converges the two.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    pub branch: String,
    pub worktree_path: PathBuf,
    pub container_id: String,
    pub container_name: String,
    pub role: String,
    pub workstream: String,
    pub status: AgentStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_task: Option<LastTask>,
}

/// Observed/intended lifecycle state of an agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Stopped,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Error => "error",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping for the most recent `run` on an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastTask {
    pub prompt: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}
