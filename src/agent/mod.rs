//! Agent-level API gluing the registry, worktree, and container
//! lifecycles together.
//!
//! An agent is a branch + worktree + long-lived container + registry
//! record, all derived from one validated name and owned exclusively by
//! that record. `spawn` builds the pieces in order and rolls back
//! everything it managed to create when a later step fails, so no
//! partial agents survive.

use crate::container::{container_name, ContainerEngine};
use crate::executor::{ExecutionReport, Executor, RunOptions};
use crate::models::{Agent, AgentStatus, LastTask};
use crate::registry::AgentRegistry;
use crate::validation::validate_agent_name;
use crate::worktree::WorktreeProvisioner;
use crate::{Result, TanukiError};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Branch override; defaults to the canonical `<prefix>/<name>`.
    pub branch: Option<String>,
    pub role: String,
    pub workstream: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    /// Remove even if the agent is recorded as working.
    pub force: bool,
    /// Keep the branch for later inspection or merging.
    pub keep_branch: bool,
}

/// Observed + recorded status of one agent.
#[derive(Debug, Clone)]
pub struct AgentReport {
    pub agent: Agent,
    pub container_exists: bool,
    pub container_running: bool,
}

pub struct AgentManager {
    registry: Arc<AgentRegistry>,
    worktrees: Arc<WorktreeProvisioner>,
    engine: Arc<dyn ContainerEngine>,
    executor: Arc<dyn Executor>,
}

impl AgentManager {
    pub fn new(
        registry: Arc<AgentRegistry>,
        worktrees: Arc<WorktreeProvisioner>,
        engine: Arc<dyn ContainerEngine>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            registry,
            worktrees,
            engine,
            executor,
        }
    }

    /// Create a new agent: worktree + branch, then container, then the
    /// registry record. Rolls back completed steps on any failure.
    pub async fn spawn(&self, name: &str, opts: SpawnOptions) -> Result<Agent> {
        validate_agent_name(name)?;
        if self.registry.get(name).await.is_some() {
            return Err(TanukiError::already_exists("agent", name));
        }

        let branch = opts
            .branch
            .unwrap_or_else(|| self.worktrees.branch_name(name));

        // Step A: version-control isolation.
        let worktree_path = self
            .worktrees
            .create_worktree_on_branch(name, &branch)
            .await?;

        // Step B: runtime isolation.
        if let Err(e) = self.engine.ensure_network().await {
            self.rollback_worktree(name).await;
            return Err(e);
        }
        let container_id = match self
            .engine
            .create_agent_container(name, &worktree_path)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.rollback_worktree(name).await;
                return Err(e);
            }
        };
        if let Err(e) = self.engine.start(&container_id).await {
            self.rollback_container(&container_id).await;
            self.rollback_worktree(name).await;
            return Err(e);
        }

        let agent = Agent {
            name: name.to_string(),
            branch,
            worktree_path,
            container_id: container_id.clone(),
            container_name: container_name(name),
            role: opts.role,
            workstream: opts.workstream,
            status: AgentStatus::Idle,
            created_at: Utc::now(),
            last_task: None,
        };
        if let Err(e) = self.registry.add(agent.clone()).await {
            self.rollback_container(&container_id).await;
            self.rollback_worktree(name).await;
            return Err(e);
        }

        info!("Spawned agent {name} in {}", agent.container_name);
        Ok(agent)
    }

    async fn rollback_container(&self, container_id: &str) {
        if let Err(e) = self.engine.remove(container_id).await {
            error!("Rollback: failed to remove container {container_id}: {e}");
        }
    }

    async fn rollback_worktree(&self, name: &str) {
        if let Err(e) = self.worktrees.remove_worktree(name, true).await {
            error!("Rollback: failed to remove worktree for {name}: {e}");
        }
    }

    /// Start a stopped agent's container.
    pub async fn start(&self, name: &str) -> Result<Agent> {
        let agent = self.require(name).await?;
        let (exists, running) = self.engine.container_status(&agent.container_id).await?;
        if !exists {
            return Err(TanukiError::not_found("container", &agent.container_name));
        }
        if !running {
            self.engine.start(&agent.container_id).await?;
        }
        if agent.status == AgentStatus::Stopped {
            self.registry
                .update_status(name, AgentStatus::Idle)
                .await?;
        }
        self.require(name).await
    }

    /// Stop the agent's container, preserving worktree and branch.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let agent = self.require(name).await?;
        self.engine.stop(&agent.container_id).await?;
        self.registry
            .update_status(name, AgentStatus::Stopped)
            .await?;
        info!("Stopped agent {name}");
        Ok(())
    }

    /// Tear the agent down: container, then worktree, then the record.
    pub async fn remove(&self, name: &str, opts: RemoveOptions) -> Result<()> {
        let agent = self.require(name).await?;
        if agent.status == AgentStatus::Working && !opts.force {
            return Err(TanukiError::invalid(
                "remove",
                format!("agent {name} is working; pass --force to remove anyway"),
            ));
        }
        self.engine.remove(&agent.container_id).await?;
        self.worktrees
            .remove_worktree(name, !opts.keep_branch)
            .await?;
        self.registry.remove(name).await?;
        info!("Removed agent {name}");
        Ok(())
    }

    /// Run a prompt on the agent. Marks it `working` for the duration and
    /// flips it to `idle` or `error` depending on how the run ends.
    pub async fn run(
        &self,
        name: &str,
        prompt: &str,
        opts: &RunOptions,
    ) -> Result<ExecutionReport> {
        let agent = self.require(name).await?;
        let (_, running) = self.engine.container_status(&agent.container_id).await?;
        if !running {
            return Err(TanukiError::invalid(
                "run",
                format!("agent {name} is not running; run `tanuki agent start {name}` first"),
            ));
        }

        self.registry
            .update_status(name, AgentStatus::Working)
            .await?;
        let started_at = Utc::now();
        self.registry
            .update_last_task(
                name,
                LastTask {
                    prompt: prompt.to_string(),
                    started_at,
                    completed_at: None,
                    session_id: None,
                },
            )
            .await?;

        let result = self.executor.execute(&agent, prompt, opts).await;

        match result {
            Ok(report) => {
                self.registry
                    .update_last_task(
                        name,
                        LastTask {
                            prompt: prompt.to_string(),
                            started_at,
                            completed_at: Some(Utc::now()),
                            session_id: Some(report.session_id.clone()),
                        },
                    )
                    .await?;
                let status = if report.ok {
                    AgentStatus::Idle
                } else {
                    AgentStatus::Error
                };
                self.registry.update_status(name, status).await?;
                Ok(report)
            }
            Err(e) => {
                warn!("Run on agent {name} failed: {e}");
                self.registry
                    .update_last_task(
                        name,
                        LastTask {
                            prompt: prompt.to_string(),
                            started_at,
                            completed_at: Some(Utc::now()),
                            session_id: None,
                        },
                    )
                    .await?;
                self.registry
                    .update_status(name, AgentStatus::Error)
                    .await?;
                Err(e)
            }
        }
    }

    pub async fn list(&self) -> Vec<Agent> {
        self.registry.list().await
    }

    pub async fn get(&self, name: &str) -> Option<Agent> {
        self.registry.get(name).await
    }

    /// Recorded state plus what the engine actually observes.
    pub async fn status(&self, name: &str) -> Result<AgentReport> {
        let agent = self.require(name).await?;
        let (container_exists, container_running) =
            self.engine.container_status(&agent.container_id).await?;
        Ok(AgentReport {
            agent,
            container_exists,
            container_running,
        })
    }

    pub async fn reconcile(&self) -> Result<()> {
        self.registry.reconcile(self.engine.as_ref()).await
    }

    async fn require(&self, name: &str) -> Result<Agent> {
        self.registry
            .get(name)
            .await
            .ok_or_else(|| TanukiError::not_found("agent", name))
    }
}
