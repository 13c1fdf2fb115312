//! Persistent home for all tasks, keyed by ID.
//!
//! The filesystem is the database: tasks are markdown files under the
//! tasks root, and every mutation rewrites the owning file atomically
//! (write to a temp sibling, fsync, rename). The in-memory index is
//! rebuilt by `scan` and kept consistent with each write; direct edits by
//! the user between commands are picked up because every CLI entry point
//! re-scans.

use crate::models::{Priority, Task, TaskStatus, WorkstreamKey};
use crate::{Result, TanukiError};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub mod front_matter;

/// Counts by status, role, and priority over the current index.
#[derive(Debug, Clone, Default)]
pub struct TaskStats {
    pub total: usize,
    pub by_status: HashMap<TaskStatus, usize>,
    pub by_role: HashMap<String, usize>,
    pub by_priority: HashMap<Priority, usize>,
}

#[derive(Default)]
struct Index {
    tasks: HashMap<String, Task>,
    by_project: HashMap<String, BTreeSet<String>>,
    by_role: HashMap<String, BTreeSet<String>>,
    by_workstream: HashMap<WorkstreamKey, BTreeSet<String>>,
}

impl Index {
    fn insert(&mut self, task: Task) {
        self.by_project
            .entry(task.project.clone())
            .or_default()
            .insert(task.id.clone());
        self.by_role
            .entry(task.role.clone())
            .or_default()
            .insert(task.id.clone());
        self.by_workstream
            .entry(task.workstream_key())
            .or_default()
            .insert(task.id.clone());
        self.tasks.insert(task.id.clone(), task);
    }

    fn collect(&self, ids: Option<&BTreeSet<String>>) -> Vec<Task> {
        match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.tasks.get(id))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    fn is_blocked(&self, task: &Task) -> bool {
        task.depends_on.iter().any(|dep| {
            self.tasks
                .get(dep)
                .map_or(true, |d| d.status != TaskStatus::Complete)
        })
    }

    fn is_ready(&self, task: &Task) -> bool {
        task.status.is_schedulable() && !self.is_blocked(task)
    }
}

/// The task store singleton. Mutating operations serialize through the
/// writer lock; readers proceed concurrently under the shared lock.
pub struct TaskStore {
    root: PathBuf,
    inner: RwLock<Index>,
}

impl TaskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            inner: RwLock::new(Index::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the tasks root and rebuild the index, returning a stable
    /// snapshot sorted by id.
    ///
    /// A missing root yields an empty store. A file that fails to parse
    /// is logged and skipped. A duplicate id fails the whole scan, citing
    /// both paths.
    pub async fn scan(&self) -> Result<Vec<Task>> {
        let mut index = Index::default();

        if !self.root.exists() {
            warn!("Tasks root {} does not exist", self.root.display());
            *self.inner.write().await = index;
            return Ok(Vec::new());
        }

        for (path, project) in self.task_files().await? {
            let raw = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Skipping unreadable task file {}: {e}", path.display());
                    continue;
                }
            };
            let task = match front_matter::parse_task(&path, &project, &raw) {
                Ok(task) => task,
                Err(e) => {
                    warn!("Skipping malformed task file {}: {e}", path.display());
                    continue;
                }
            };
            if let Some(existing) = index.tasks.get(&task.id) {
                return Err(TanukiError::invalid(
                    "tasks",
                    format!(
                        "duplicate task id {:?} in {} and {}",
                        task.id,
                        existing.path.display(),
                        task.path.display()
                    ),
                ));
            }
            index.insert(task);
        }

        debug!("Scanned {} tasks from {}", index.tasks.len(), self.root.display());
        let mut snapshot: Vec<Task> = index.tasks.values().cloned().collect();
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        *self.inner.write().await = index;
        Ok(snapshot)
    }

    /// Enumerate `(path, project)` pairs: flat `*.md` files belong to the
    /// root project (empty name), one level of subdirectories are project
    /// folders. `README.md` is the project description, not a task.
    async fn task_files(&self) -> Result<Vec<(PathBuf, String)>> {
        let mut out = Vec::new();
        let mut top = tokio::fs::read_dir(&self.root).await?;
        let mut entries = Vec::new();
        while let Some(entry) = top.next_entry().await? {
            entries.push(entry.path());
        }
        entries.sort();

        for path in entries {
            if path.is_file() {
                if is_task_file(&path) {
                    out.push((path, String::new()));
                }
            } else if path.is_dir() {
                let project = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let mut sub = tokio::fs::read_dir(&path).await?;
                let mut files = Vec::new();
                while let Some(entry) = sub.next_entry().await? {
                    let p = entry.path();
                    if p.is_file() && is_task_file(&p) {
                        files.push(p);
                    }
                }
                files.sort();
                for file in files {
                    out.push((file, project.clone()));
                }
            }
        }
        Ok(out)
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        self.inner.read().await.tasks.get(id).cloned()
    }

    pub async fn get_by_project(&self, project: &str) -> Vec<Task> {
        let index = self.inner.read().await;
        index.collect(index.by_project.get(project))
    }

    pub async fn get_by_role(&self, role: &str) -> Vec<Task> {
        let index = self.inner.read().await;
        index.collect(index.by_role.get(role))
    }

    pub async fn get_by_role_and_workstream(&self, role: &str, workstream: &str) -> Vec<Task> {
        let index = self.inner.read().await;
        index
            .collect(index.by_role.get(role))
            .into_iter()
            .filter(|t| t.workstream == workstream)
            .collect()
    }

    pub async fn get_by_project_and_workstream(&self, key: &WorkstreamKey) -> Vec<Task> {
        let index = self.inner.read().await;
        index.collect(index.by_workstream.get(key))
    }

    /// Full snapshot, sorted by id.
    pub async fn snapshot(&self) -> Vec<Task> {
        let index = self.inner.read().await;
        let mut tasks: Vec<Task> = index.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// True iff any dependency is missing or not complete.
    pub async fn is_blocked(&self, id: &str) -> Result<bool> {
        let index = self.inner.read().await;
        let task = index
            .tasks
            .get(id)
            .ok_or_else(|| TanukiError::not_found("task", id))?;
        Ok(index.is_blocked(task))
    }

    /// Next ready task in a workstream: priority ascending, then id.
    pub async fn next_ready_in_workstream(&self, key: &WorkstreamKey) -> Option<Task> {
        let index = self.inner.read().await;
        index
            .by_workstream
            .get(key)?
            .iter()
            .filter_map(|id| index.tasks.get(id))
            .filter(|t| index.is_ready(t))
            .min_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)))
            .cloned()
    }

    pub async fn update_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let mut index = self.inner.write().await;
        let task = index
            .tasks
            .get_mut(id)
            .ok_or_else(|| TanukiError::not_found("task", id))?;
        task.status = status;
        if status.clears_assignment() {
            task.assigned_to = None;
        }
        let rendered = front_matter::render_task(task)?;
        let path = task.path.clone();
        atomic_write(&path, &rendered).await?;
        debug!("Task {id} -> {status}");
        Ok(())
    }

    /// Record the owning agent and move the task to `assigned`.
    pub async fn assign(&self, id: &str, agent: &str) -> Result<()> {
        let mut index = self.inner.write().await;
        let task = index
            .tasks
            .get_mut(id)
            .ok_or_else(|| TanukiError::not_found("task", id))?;
        task.assigned_to = Some(agent.to_string());
        task.status = TaskStatus::Assigned;
        let rendered = front_matter::render_task(task)?;
        let path = task.path.clone();
        atomic_write(&path, &rendered).await?;
        debug!("Task {id} assigned to {agent}");
        Ok(())
    }

    /// Clear the assignment and return the task to `pending`.
    pub async fn unassign(&self, id: &str) -> Result<()> {
        let mut index = self.inner.write().await;
        let task = index
            .tasks
            .get_mut(id)
            .ok_or_else(|| TanukiError::not_found("task", id))?;
        task.assigned_to = None;
        if matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
            task.status = TaskStatus::Pending;
        }
        let rendered = front_matter::render_task(task)?;
        let path = task.path.clone();
        atomic_write(&path, &rendered).await?;
        Ok(())
    }

    /// Return every `assigned`/`in_progress` task to `pending`. Used at
    /// restart and by `project resume` after an interrupted run.
    pub async fn reset_interrupted(&self) -> Result<usize> {
        let interrupted: Vec<String> = {
            let index = self.inner.read().await;
            index
                .tasks
                .values()
                .filter(|t| matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress))
                .map(|t| t.id.clone())
                .collect()
        };
        for id in &interrupted {
            self.unassign(id).await?;
        }
        Ok(interrupted.len())
    }

    pub async fn stats(&self) -> TaskStats {
        let index = self.inner.read().await;
        let mut stats = TaskStats {
            total: index.tasks.len(),
            ..Default::default()
        };
        for task in index.tasks.values() {
            *stats.by_status.entry(task.status).or_default() += 1;
            *stats.by_role.entry(task.role.clone()).or_default() += 1;
            *stats.by_priority.entry(task.priority).or_default() += 1;
        }
        stats
    }
}

fn is_task_file(path: &Path) -> bool {
    if path.extension().and_then(|e| e.to_str()) != Some("md") {
        return false;
    }
    path.file_name().and_then(|n| n.to_str()) != Some("README.md")
}

/// Write-to-temp, fsync, rename. The rename is the commit point callers
/// rely on for the happens-before with scheduler callbacks.
pub(crate) async fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TanukiError::invalid("path", format!("{}", path.display())))?;
    let tmp = path.with_file_name(format!("{file_name}.tmp"));

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(content.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store_with(files: &[(&str, &str)]) -> (TempDir, TaskStore) {
        let dir = TempDir::new().unwrap();
        for (rel, content) in files {
            let path = dir.path().join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, content).unwrap();
        }
        let store = TaskStore::new(dir.path());
        store.scan().await.unwrap();
        (dir, store)
    }

    fn task_file(id: &str, extra: &str) -> String {
        format!("---\nid: {id}\ntitle: {id}\nrole: backend\n{extra}---\nbody of {id}\n")
    }

    #[tokio::test]
    async fn missing_root_scans_empty() {
        let store = TaskStore::new("/nonexistent/tanuki-tasks");
        assert!(store.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scan_indexes_projects_and_skips_readme() {
        let (_dir, store) = store_with(&[
            ("root-001.md", &task_file("root-001", "")),
            ("webapp/001-login.md", &task_file("web-001", "")),
            ("webapp/README.md", "# webapp project\n"),
        ])
        .await;

        let all = store.snapshot().await;
        assert_eq!(all.len(), 2);
        assert_eq!(store.get_by_project("").await.len(), 1);
        assert_eq!(store.get_by_project("webapp").await.len(), 1);
        assert_eq!(store.get("web-001").await.unwrap().project, "webapp");
    }

    #[tokio::test]
    async fn malformed_file_is_skipped_not_fatal() {
        let (_dir, store) = store_with(&[
            ("good.md", &task_file("good-001", "")),
            ("bad.md", "no front matter at all\n"),
        ])
        .await;
        assert_eq!(store.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_ids_fail_the_scan_citing_both_paths() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.md"), task_file("dup-001", "")).unwrap();
        std::fs::write(dir.path().join("b.md"), task_file("dup-001", "")).unwrap();
        let store = TaskStore::new(dir.path());
        let err = store.scan().await.unwrap_err().to_string();
        assert!(err.contains("dup-001"));
        assert!(err.contains("a.md"));
        assert!(err.contains("b.md"));
    }

    #[tokio::test]
    async fn blockedness_tracks_dependencies() {
        let (_dir, store) = store_with(&[
            ("p1.md", &task_file("p-001", "")),
            ("p2.md", &task_file("p-002", "depends_on: [p-001]\n")),
            ("p3.md", &task_file("p-003", "depends_on: [missing-id]\n")),
        ])
        .await;

        assert!(!store.is_blocked("p-001").await.unwrap());
        assert!(store.is_blocked("p-002").await.unwrap());
        assert!(store.is_blocked("p-003").await.unwrap());

        store
            .update_status("p-001", TaskStatus::Complete)
            .await
            .unwrap();
        assert!(!store.is_blocked("p-002").await.unwrap());
    }

    #[tokio::test]
    async fn mutations_rewrite_the_file_atomically() {
        let (dir, store) = store_with(&[("t.md", &task_file("t-001", "custom: keepme\n"))]).await;

        store.assign("t-001", "agent-a").await.unwrap();
        store
            .update_status("t-001", TaskStatus::InProgress)
            .await
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("t.md")).unwrap();
        assert!(raw.contains("status: in_progress"));
        assert!(raw.contains("assigned_to: agent-a"));
        assert!(raw.contains("custom: keepme"));
        assert!(!dir.path().join("t.md.tmp").exists());

        // completion clears the assignment per the invariant
        store
            .update_status("t-001", TaskStatus::Complete)
            .await
            .unwrap();
        let task = store.get("t-001").await.unwrap();
        assert_eq!(task.status, TaskStatus::Complete);
        assert_eq!(task.assigned_to, None);
    }

    #[tokio::test]
    async fn rescan_sees_external_edits() {
        let (dir, store) = store_with(&[("t.md", &task_file("t-001", "status: failed\n"))]).await;
        assert_eq!(store.get("t-001").await.unwrap().status, TaskStatus::Failed);

        // the user edits the file between commands
        std::fs::write(dir.path().join("t.md"), task_file("t-001", "status: pending\n")).unwrap();
        store.scan().await.unwrap();
        assert_eq!(store.get("t-001").await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn next_ready_orders_by_priority_then_id() {
        let (_dir, store) = store_with(&[
            ("a.md", &task_file("z-001", "priority: high\nworkstream: main\n")),
            ("b.md", &task_file("a-002", "priority: critical\nworkstream: main\n")),
            ("c.md", &task_file("a-001", "priority: critical\nworkstream: main\n")),
            ("d.md", &task_file("m-001", "priority: low\nworkstream: main\n")),
        ])
        .await;

        let key = WorkstreamKey::new("", "backend", "main");
        let order = ["a-001", "a-002", "z-001", "m-001"];
        for expected in order {
            let next = store.next_ready_in_workstream(&key).await.unwrap();
            assert_eq!(next.id, expected);
            store
                .update_status(&next.id, TaskStatus::Complete)
                .await
                .unwrap();
        }
        assert!(store.next_ready_in_workstream(&key).await.is_none());
    }

    #[tokio::test]
    async fn reset_interrupted_returns_tasks_to_pending() {
        let (_dir, store) = store_with(&[
            ("a.md", &task_file("r-001", "status: in_progress\nassigned_to: agent-a\n")),
            ("b.md", &task_file("r-002", "status: assigned\nassigned_to: agent-a\n")),
            ("c.md", &task_file("r-003", "status: complete\n")),
        ])
        .await;

        assert_eq!(store.reset_interrupted().await.unwrap(), 2);
        assert_eq!(store.get("r-001").await.unwrap().status, TaskStatus::Pending);
        assert_eq!(store.get("r-002").await.unwrap().status, TaskStatus::Pending);
        assert_eq!(store.get("r-003").await.unwrap().status, TaskStatus::Complete);
        assert_eq!(store.get("r-001").await.unwrap().assigned_to, None);
    }

    #[tokio::test]
    async fn stats_count_by_status_role_priority() {
        let (_dir, store) = store_with(&[
            ("a.md", &task_file("s-001", "priority: high\n")),
            ("b.md", &task_file("s-002", "status: complete\n")),
        ])
        .await;
        let stats = store.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_status[&TaskStatus::Pending], 1);
        assert_eq!(stats.by_status[&TaskStatus::Complete], 1);
        assert_eq!(stats.by_role["backend"], 2);
        assert_eq!(stats.by_priority[&Priority::High], 1);
    }
}
