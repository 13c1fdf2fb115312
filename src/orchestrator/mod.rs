//! Workstream orchestration: one runner per active workstream, driven by
//! the scheduler and reporting back over a single event channel.
//!
//! Runners never touch scheduler state. They persist task transitions
//! through the store first and only then emit the event, so by the time
//! the scheduler observes a completion the file rename has already
//! returned.

use crate::agent::{AgentManager, SpawnOptions};
use crate::executor::{ExecutionReport, RunOptions};
use crate::models::{AgentStatus, Task, TaskStatus, WorkstreamKey};
use crate::scheduler::WorkstreamScheduler;
use crate::tasks::TaskStore;
use crate::validation::derive_agent_name;
use crate::{Result, TanukiError};
use std::process::Stdio;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub mod ralph;

/// Events runners emit toward the scheduler loop.
#[derive(Debug)]
pub enum RunnerEvent {
    TaskComplete { task_id: String },
    TaskFailed { task_id: String, reason: String },
    WorkstreamComplete { key: WorkstreamKey },
    RunnerAborted { key: WorkstreamKey, reason: String },
}

pub struct Orchestrator {
    store: Arc<TaskStore>,
    scheduler: Arc<Mutex<WorkstreamScheduler>>,
    agents: Arc<AgentManager>,
    base_run_opts: RunOptions,
    verify_retries: u32,
}

impl Orchestrator {
    pub fn new(
        store: Arc<TaskStore>,
        scheduler: Arc<Mutex<WorkstreamScheduler>>,
        agents: Arc<AgentManager>,
        base_run_opts: RunOptions,
        verify_retries: u32,
    ) -> Self {
        Self {
            store,
            scheduler,
            agents,
            base_run_opts,
            verify_retries,
        }
    }

    /// Drive every workstream of the selected project (or all projects)
    /// to completion or cancellation. Returns once no runner is live and
    /// nothing further can be activated.
    pub async fn run_project(
        &self,
        project: Option<&str>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let snapshot = self.store.scan().await?;
        let tasks: Vec<Task> = match project {
            Some(project) => snapshot
                .into_iter()
                .filter(|t| t.project == project)
                .collect(),
            None => snapshot,
        };

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut runners = JoinSet::new();
        let mut live = {
            let mut sched = self.scheduler.lock().await;
            sched.initialize(&tasks);
            if let Some(report) = sched.detect_potential_deadlock() {
                for role in &report.roles {
                    warn!("[Scheduler] Potential deadlock: {}", role.suggestion);
                }
            }
            self.launch_ready(&mut sched, &mut runners, &events_tx, &shutdown)
        };

        if live == 0 {
            info!("No ready workstreams to start");
            return Ok(());
        }

        let mut shutdown_watch = shutdown.clone();
        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    let mut sched = self.scheduler.lock().await;
                    match event {
                        RunnerEvent::TaskComplete { task_id } => {
                            sched.on_task_complete(&task_id);
                            live += self.launch_ready(&mut sched, &mut runners, &events_tx, &shutdown);
                        }
                        RunnerEvent::TaskFailed { task_id, reason } => {
                            warn!("Task {task_id} failed: {reason}");
                            sched.on_task_failed(&task_id);
                        }
                        RunnerEvent::WorkstreamComplete { key } => {
                            info!("Workstream {key} complete");
                            sched.on_workstream_complete(&key);
                            live -= 1;
                            live += self.launch_ready(&mut sched, &mut runners, &events_tx, &shutdown);
                            if live == 0 {
                                break;
                            }
                        }
                        RunnerEvent::RunnerAborted { key, reason } => {
                            error!("Runner for {key} aborted: {reason}");
                            sched.on_workstream_complete(&key);
                            live -= 1;
                            if live == 0 {
                                break;
                            }
                        }
                    }
                }
                changed = shutdown_watch.changed() => {
                    if changed.is_err() || *shutdown_watch.borrow() {
                        info!("Cancellation requested; waiting for runners to wind down");
                        break;
                    }
                }
            }
        }

        while runners.join_next().await.is_some() {}
        Ok(())
    }

    /// Activate and spawn a runner for every workstream the quotas allow.
    fn launch_ready(
        &self,
        sched: &mut WorkstreamScheduler,
        runners: &mut JoinSet<()>,
        events: &mpsc::UnboundedSender<RunnerEvent>,
        shutdown: &watch::Receiver<bool>,
    ) -> usize {
        let mut launched = 0;
        for role in sched.roles() {
            while let Some(info) = sched.get_next_workstream(&role) {
                let key = info.key.clone();
                if sched.activate_workstream(&key).is_err() {
                    break;
                }
                let runner = Runner {
                    key: key.clone(),
                    store: self.store.clone(),
                    agents: self.agents.clone(),
                    events: events.clone(),
                    shutdown: shutdown.clone(),
                    base_opts: self.base_run_opts.clone(),
                    verify_retries: self.verify_retries,
                };
                info!("Launching runner for {key}");
                runners.spawn(runner.run());
                launched += 1;
            }
        }
        launched
    }
}

enum TaskOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Per-workstream worker: drains the ready tasks of one workstream
/// sequentially through one agent.
struct Runner {
    key: WorkstreamKey,
    store: Arc<TaskStore>,
    agents: Arc<AgentManager>,
    events: mpsc::UnboundedSender<RunnerEvent>,
    shutdown: watch::Receiver<bool>,
    base_opts: RunOptions,
    verify_retries: u32,
}

impl Runner {
    async fn run(mut self) {
        let agent_name = derive_agent_name(&self.key.project, &self.key.workstream);
        if let Err(e) = self.ensure_agent(&agent_name).await {
            let _ = self.events.send(RunnerEvent::RunnerAborted {
                key: self.key.clone(),
                reason: format!("could not prepare agent {agent_name}: {e}"),
            });
            return;
        }

        loop {
            if self.cancelled() {
                return;
            }
            let Some(task) = self.store.next_ready_in_workstream(&self.key).await else {
                let _ = self.events.send(RunnerEvent::WorkstreamComplete {
                    key: self.key.clone(),
                });
                return;
            };

            match self.process_task(&agent_name, &task).await {
                Ok(TaskOutcome::Completed) => {
                    let _ = self.events.send(RunnerEvent::TaskComplete {
                        task_id: task.id.clone(),
                    });
                }
                Ok(TaskOutcome::Failed(reason)) => {
                    let _ = self.events.send(RunnerEvent::TaskFailed {
                        task_id: task.id.clone(),
                        reason,
                    });
                }
                Ok(TaskOutcome::Cancelled) => return,
                Err(e) => {
                    // Unrecoverable: the engine or executor is gone.
                    let _ = self.events.send(RunnerEvent::RunnerAborted {
                        key: self.key.clone(),
                        reason: e.to_string(),
                    });
                    return;
                }
            }
        }
    }

    fn cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Make sure the workstream's agent exists and can accept work.
    async fn ensure_agent(&self, name: &str) -> Result<()> {
        match self.agents.get(name).await {
            Some(agent) if agent.status == AgentStatus::Stopped => {
                self.agents.start(name).await?;
            }
            Some(_) => {}
            None => {
                self.agents
                    .spawn(
                        name,
                        SpawnOptions {
                            branch: None,
                            role: self.key.role.clone(),
                            workstream: self.key.workstream.clone(),
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Run one task through the agent and decide completion.
    ///
    /// `Err` is reserved for unrecoverable infrastructure failures; a
    /// task-level failure is an `Ok(Failed)` so the runner can move on.
    async fn process_task(&mut self, agent_name: &str, task: &Task) -> Result<TaskOutcome> {
        self.store.assign(&task.id, agent_name).await?;
        self.store
            .update_status(&task.id, TaskStatus::InProgress)
            .await?;
        debug!("[Runner:{}] Starting task {}", self.key, task.id);

        let prompt = build_prompt(task);
        let run = self.agents.run(agent_name, &prompt, &self.base_opts);
        tokio::pin!(run);

        let result = tokio::select! {
            result = &mut run => result,
            _ = self.shutdown.changed() => {
                // Dropping the run future kills the in-container exec;
                // the task goes back to pending for `project resume`.
                info!("[Runner:{}] Cancelled; resetting {}", self.key, task.id);
                self.store.unassign(&task.id).await?;
                return Ok(TaskOutcome::Cancelled);
            }
        };

        let report = match result {
            Ok(report) => report,
            Err(e) if matches!(e, TanukiError::Unavailable { .. }) => {
                self.store.update_status(&task.id, TaskStatus::Failed).await?;
                return Err(e);
            }
            Err(e) => {
                self.store.update_status(&task.id, TaskStatus::Failed).await?;
                return Ok(TaskOutcome::Failed(e.to_string()));
            }
        };

        let completed = self.is_complete(task, &report).await;
        if completed {
            // Persist before the event: the scheduler must observe the
            // completion only after the rename has returned.
            self.store
                .update_status(&task.id, TaskStatus::Complete)
                .await?;
            info!("[Runner:{}] Task {} complete", self.key, task.id);
            Ok(TaskOutcome::Completed)
        } else {
            self.store.update_status(&task.id, TaskStatus::Failed).await?;
            let reason = report
                .error
                .unwrap_or_else(|| "no completion signal and verify did not pass".to_string());
            Ok(TaskOutcome::Failed(reason))
        }
    }

    /// Either mechanism is sufficient: the signal literal in the output,
    /// or the verify command exiting zero. Tasks declaring neither fall
    /// back to the executor's own exit status.
    async fn is_complete(&self, task: &Task, report: &ExecutionReport) -> bool {
        let completion = task.completion.clone().unwrap_or_default();

        if let Some(signal) = &completion.signal {
            if report.output.contains(signal) {
                return true;
            }
        }
        if let Some(verify) = &completion.verify {
            return self.run_verify(verify).await;
        }
        if completion.signal.is_some() {
            return false;
        }
        // No completion contract at all; trust the executor.
        report.ok
    }

    async fn run_verify(&self, command: &str) -> bool {
        let workdir = match self
            .agents
            .get(&derive_agent_name(&self.key.project, &self.key.workstream))
            .await
        {
            Some(agent) => agent.worktree_path,
            None => return false,
        };

        for attempt in 1..=self.verify_retries.max(1) {
            let status = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&workdir)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            match status {
                Ok(status) if status.success() => return true,
                Ok(status) => debug!(
                    "[Runner:{}] Verify attempt {attempt} exited {:?}",
                    self.key,
                    status.code()
                ),
                Err(e) => {
                    warn!("[Runner:{}] Verify could not run: {e}", self.key);
                    return false;
                }
            }
        }
        false
    }
}

/// Prompt handed to the executor: title, body, and the completion
/// contract the agent must satisfy.
fn build_prompt(task: &Task) -> String {
    let mut prompt = String::new();
    if task.title.is_empty() {
        prompt.push_str(&format!("# Task {}\n\n", task.id));
    } else {
        prompt.push_str(&format!("# {} ({})\n\n", task.title, task.id));
    }
    prompt.push_str(task.content.trim());
    prompt.push('\n');

    if let Some(completion) = &task.completion {
        if let Some(signal) = &completion.signal {
            prompt.push_str(&format!(
                "\nWhen the task is fully complete, print exactly: {signal}\n"
            ));
        }
        if let Some(verify) = &completion.verify {
            prompt.push_str(&format!(
                "\nYour work is verified with `{verify}`; make sure it passes.\n"
            ));
        }
    }
    prompt
}
