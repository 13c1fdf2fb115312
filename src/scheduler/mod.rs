//! Readiness-aware workstream scheduling.
//!
//! The scheduler decides which workstream should run next for each role,
//! subject to dependency readiness and per-role concurrency caps. It is a
//! plain in-memory structure over task data: it knows nothing about
//! agents, containers, or the store, and its `&mut` methods are
//! serialized by the single mutex its owner wraps it in. Readiness
//! updates are O(#dependents of the changed task), not O(N).

use crate::models::{Priority, Task, TaskStatus, WorkstreamKey};
use crate::{Result, TanukiError};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct TaskNode {
    priority: Priority,
    status: TaskStatus,
    depends_on: Vec<String>,
    key: WorkstreamKey,
}

/// Snapshot of one workstream's scheduling state.
#[derive(Debug, Clone)]
pub struct WorkstreamInfo {
    pub key: WorkstreamKey,
    /// Tasks that are `pending` with every dependency `complete`.
    pub ready_count: usize,
    /// Best (lowest) priority among the ready tasks.
    pub best_ready_priority: Option<Priority>,
    /// Tasks that are `pending` at all, ready or not.
    pub pending_count: usize,
    /// Other workstreams owning non-complete dependencies of this one's
    /// pending tasks.
    pub blocked_by: BTreeSet<WorkstreamKey>,
}

impl WorkstreamInfo {
    fn is_ready(&self) -> bool {
        self.ready_count > 0
    }

    fn is_blocked(&self) -> bool {
        self.pending_count > 0 && self.ready_count == 0
    }
}

/// One role whose workstreams can only unblock each other.
#[derive(Debug, Clone)]
pub struct RoleDeadlock {
    pub role: String,
    pub workstreams: Vec<WorkstreamKey>,
    pub suggestion: String,
}

#[derive(Debug, Clone, Default)]
pub struct DeadlockReport {
    pub roles: Vec<RoleDeadlock>,
}

pub struct WorkstreamScheduler {
    tasks: HashMap<String, TaskNode>,
    workstreams: BTreeMap<WorkstreamKey, WorkstreamInfo>,
    role_concurrency: HashMap<String, usize>,
    default_concurrency: usize,
    active: HashMap<String, BTreeSet<WorkstreamKey>>,
    ready: HashMap<String, Vec<WorkstreamKey>>,
    /// Task id -> workstreams whose readiness depends on it.
    dependents: HashMap<String, BTreeSet<WorkstreamKey>>,
}

impl WorkstreamScheduler {
    pub fn new(role_concurrency: HashMap<String, usize>, default_concurrency: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            workstreams: BTreeMap::new(),
            role_concurrency,
            default_concurrency: default_concurrency.max(1),
            active: HashMap::new(),
            ready: HashMap::new(),
            dependents: HashMap::new(),
        }
    }

    pub fn role_quota(&self, role: &str) -> usize {
        self.role_concurrency
            .get(role)
            .copied()
            .unwrap_or(self.default_concurrency)
    }

    /// Build the readiness graph from a task snapshot. Replaces all prior
    /// state, including the active set.
    pub fn initialize(&mut self, tasks: &[Task]) {
        self.tasks.clear();
        self.workstreams.clear();
        self.active.clear();
        self.ready.clear();
        self.dependents.clear();

        for task in tasks {
            self.tasks.insert(
                task.id.clone(),
                TaskNode {
                    priority: task.priority,
                    status: task.status,
                    depends_on: task.depends_on.clone(),
                    key: task.workstream_key(),
                },
            );
        }

        let keys: BTreeSet<WorkstreamKey> =
            self.tasks.values().map(|node| node.key.clone()).collect();
        for key in keys {
            let info = self.compute_info(&key);
            self.workstreams.insert(key, info);
        }
        self.rebuild_dependents();

        for (key, info) in self.workstreams.clone() {
            if info.is_ready() {
                self.enqueue_ready(&key);
            }
        }

        info!(
            "[Scheduler] Initialized {} workstreams ({} ready)",
            self.workstreams.len(),
            self.ready.values().map(Vec::len).sum::<usize>()
        );
    }

    fn rebuild_dependents(&mut self) {
        self.dependents.clear();
        for node in self.tasks.values() {
            if !node.status.is_schedulable() {
                continue;
            }
            for dep in &node.depends_on {
                let complete = self
                    .tasks
                    .get(dep)
                    .is_some_and(|d| d.status == TaskStatus::Complete);
                if !complete {
                    self.dependents
                        .entry(dep.clone())
                        .or_default()
                        .insert(node.key.clone());
                }
            }
        }
    }

    fn task_is_ready(&self, node: &TaskNode) -> bool {
        node.status.is_schedulable()
            && node.depends_on.iter().all(|dep| {
                self.tasks
                    .get(dep)
                    .is_some_and(|d| d.status == TaskStatus::Complete)
            })
    }

    fn compute_info(&self, key: &WorkstreamKey) -> WorkstreamInfo {
        let mut info = WorkstreamInfo {
            key: key.clone(),
            ready_count: 0,
            best_ready_priority: None,
            pending_count: 0,
            blocked_by: BTreeSet::new(),
        };
        for node in self.tasks.values().filter(|n| &n.key == key) {
            if !node.status.is_schedulable() {
                continue;
            }
            info.pending_count += 1;
            if self.task_is_ready(node) {
                info.ready_count += 1;
                info.best_ready_priority = Some(match info.best_ready_priority {
                    Some(best) => best.min(node.priority),
                    None => node.priority,
                });
            } else {
                for dep in &node.depends_on {
                    match self.tasks.get(dep) {
                        Some(d) if d.status != TaskStatus::Complete && &d.key != key => {
                            info.blocked_by.insert(d.key.clone());
                        }
                        _ => {}
                    }
                }
            }
        }
        info
    }

    /// Ordering for a role's ready queue: best ready priority first, then
    /// more ready tasks, then key.
    fn queue_position(&self, queue: &[WorkstreamKey], key: &WorkstreamKey) -> usize {
        let rank = |k: &WorkstreamKey| {
            let info = &self.workstreams[k];
            (
                info.best_ready_priority.unwrap_or(Priority::Low),
                usize::MAX - info.ready_count,
                k.clone(),
            )
        };
        let target = rank(key);
        queue.partition_point(|existing| rank(existing) <= target)
    }

    fn enqueue_ready(&mut self, key: &WorkstreamKey) {
        let queue = self.ready.entry(key.role.clone()).or_default().clone();
        if queue.contains(key) {
            return;
        }
        let pos = self.queue_position(&queue, key);
        if let Some(queue) = self.ready.get_mut(&key.role) {
            queue.insert(pos, key.clone());
        }
    }

    fn dequeue_ready(&mut self, key: &WorkstreamKey) {
        if let Some(queue) = self.ready.get_mut(&key.role) {
            queue.retain(|k| k != key);
        }
    }

    fn resort_role_queue(&mut self, role: &str) {
        let Some(queue) = self.ready.get(role) else {
            return;
        };
        let mut keys = queue.clone();
        let rank = |k: &WorkstreamKey, this: &Self| {
            let info = &this.workstreams[k];
            (
                info.best_ready_priority.unwrap_or(Priority::Low),
                usize::MAX - info.ready_count,
                k.clone(),
            )
        };
        keys.sort_by(|a, b| rank(a, self).cmp(&rank(b, self)));
        self.ready.insert(role.to_string(), keys);
    }

    /// Highest-priority ready workstream for a role whose activation would
    /// not exceed the role's quota. A pure read.
    pub fn get_next_workstream(&self, role: &str) -> Option<&WorkstreamInfo> {
        let active = self.active.get(role).map_or(0, BTreeSet::len);
        if active >= self.role_quota(role) {
            return None;
        }
        let queue = self.ready.get(role)?;
        queue
            .iter()
            .find(|key| !self.is_active(key))
            .and_then(|key| self.workstreams.get(key))
    }

    fn is_active(&self, key: &WorkstreamKey) -> bool {
        self.active
            .get(&key.role)
            .is_some_and(|set| set.contains(key))
    }

    /// Atomic check-and-insert into the active set; pops the ready queue.
    pub fn activate_workstream(&mut self, key: &WorkstreamKey) -> Result<()> {
        if self.is_active(key) {
            return Err(TanukiError::already_exists(
                "active workstream",
                key.to_string(),
            ));
        }
        let quota = self.role_quota(&key.role);
        let active = self.active.entry(key.role.clone()).or_default();
        if active.len() >= quota {
            return Err(TanukiError::invalid(
                "activation",
                format!("role {} is at its concurrency limit ({quota})", key.role),
            ));
        }
        active.insert(key.clone());
        self.dequeue_ready(key);
        debug!("[Scheduler] Activated {key}");
        Ok(())
    }

    /// Diagnostic: workstreams for a role with pending tasks but nothing
    /// ready.
    pub fn get_blocked_workstreams(&self, role: &str) -> Vec<WorkstreamInfo> {
        self.workstreams
            .values()
            .filter(|info| info.key.role == role && info.is_blocked())
            .cloned()
            .collect()
    }

    /// A task reached `complete`: recompute readiness for the workstreams
    /// that were waiting on it (and its own), promoting any that became
    /// ready.
    pub fn on_task_complete(&mut self, task_id: &str) {
        let Some(node) = self.tasks.get_mut(task_id) else {
            return;
        };
        node.status = TaskStatus::Complete;
        let own_key = node.key.clone();

        let mut affected: BTreeSet<WorkstreamKey> =
            self.dependents.remove(task_id).unwrap_or_default();
        affected.insert(own_key);
        self.refresh(affected);
    }

    /// A task failed: it is no longer pending, and everything depending on
    /// it stays blocked.
    pub fn on_task_failed(&mut self, task_id: &str) {
        let Some(node) = self.tasks.get_mut(task_id) else {
            return;
        };
        node.status = TaskStatus::Failed;
        let mut affected = BTreeSet::new();
        affected.insert(node.key.clone());
        self.refresh(affected);
    }

    fn refresh(&mut self, keys: BTreeSet<WorkstreamKey>) {
        let mut touched_roles = BTreeSet::new();
        for key in keys {
            let info = self.compute_info(&key);
            let ready = info.is_ready();
            self.workstreams.insert(key.clone(), info);
            touched_roles.insert(key.role.clone());
            if ready {
                if !self.is_active(&key) {
                    self.enqueue_ready(&key);
                }
            } else {
                self.dequeue_ready(&key);
            }
        }
        for role in touched_roles {
            self.resort_role_queue(&role);
        }
    }

    /// A runner drained its workstream: release the role's slot. The
    /// workstream is re-queued if it still (or again) has ready tasks.
    pub fn on_workstream_complete(&mut self, key: &WorkstreamKey) {
        if let Some(set) = self.active.get_mut(&key.role) {
            set.remove(key);
        }
        let mut keys = BTreeSet::new();
        keys.insert(key.clone());
        self.refresh(keys);
        debug!("[Scheduler] Released {key}");
    }

    /// Flag roles whose workstreams can only unblock each other while the
    /// role may run one workstream at a time. Warn-only: the scheduler
    /// never refuses to run.
    pub fn detect_potential_deadlock(&self) -> Option<DeadlockReport> {
        let roles: BTreeSet<String> = self
            .workstreams
            .keys()
            .map(|key| key.role.clone())
            .collect();

        let mut report = DeadlockReport::default();
        for role in roles {
            if self.role_quota(&role) != 1 {
                continue;
            }
            let members: Vec<&WorkstreamInfo> = self
                .workstreams
                .values()
                .filter(|info| info.key.role == role && info.pending_count > 0)
                .collect();
            if members.is_empty() {
                continue;
            }
            let all_intra_blocked = members.iter().all(|info| {
                info.is_blocked()
                    && !info.blocked_by.is_empty()
                    && info.blocked_by.iter().all(|blocker| blocker.role == role)
            });
            if all_intra_blocked {
                let workstreams: Vec<WorkstreamKey> =
                    members.iter().map(|info| info.key.clone()).collect();
                let names = workstreams
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                report.roles.push(RoleDeadlock {
                    suggestion: format!(
                        "role {role:?} cannot make progress: every workstream ({names}) waits \
                         on another workstream of the same role and the role runs one at a \
                         time. Raise its concurrency in tanuki.yaml or break a dependency."
                    ),
                    role,
                    workstreams,
                });
            }
        }

        if report.roles.is_empty() {
            None
        } else {
            Some(report)
        }
    }

    pub fn workstreams(&self) -> impl Iterator<Item = &WorkstreamInfo> {
        self.workstreams.values()
    }

    /// Roles present in the current graph, deduplicated and ordered.
    pub fn roles(&self) -> Vec<String> {
        let roles: BTreeSet<String> = self
            .workstreams
            .keys()
            .map(|key| key.role.clone())
            .collect();
        roles.into_iter().collect()
    }

    pub fn active_count(&self, role: &str) -> usize {
        self.active.get(role).map_or(0, BTreeSet::len)
    }
}
