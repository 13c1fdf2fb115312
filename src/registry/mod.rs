//! Durable record of intended agents.
//!
//! A single JSON file holds every agent record. The file is the source of
//! intent; the container engine is the source of observed state, and
//! `reconcile` converges the two. Writes are atomic and all callers in
//! the process serialize through one lock; cross-process use is not
//! supported.

use crate::container::ContainerEngine;
use crate::models::{Agent, AgentStatus, LastTask};
use crate::tasks::atomic_write;
use crate::{Result, TanukiError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    agents: Vec<Agent>,
}

pub struct AgentRegistry {
    path: PathBuf,
    inner: Mutex<HashMap<String, Agent>>,
}

impl AgentRegistry {
    /// Open the registry at `path`, loading existing records if the file
    /// is present.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut agents = HashMap::new();
        if path.exists() {
            let raw = tokio::fs::read_to_string(&path).await?;
            let file: RegistryFile = serde_json::from_str(&raw)?;
            for agent in file.agents {
                agents.insert(agent.name.clone(), agent);
            }
        }
        Ok(Self {
            path,
            inner: Mutex::new(agents),
        })
    }

    async fn save(&self, agents: &HashMap<String, Agent>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut list: Vec<Agent> = agents.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        let rendered = serde_json::to_string_pretty(&RegistryFile { agents: list })?;
        atomic_write(&self.path, &rendered).await
    }

    pub async fn add(&self, agent: Agent) -> Result<()> {
        let mut agents = self.inner.lock().await;
        if agents.contains_key(&agent.name) {
            return Err(TanukiError::already_exists("agent", &agent.name));
        }
        let name = agent.name.clone();
        agents.insert(name.clone(), agent);
        self.save(&agents).await?;
        info!("Registered agent {name}");
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Agent> {
        self.inner.lock().await.get(name).cloned()
    }

    pub async fn remove(&self, name: &str) -> Result<Agent> {
        let mut agents = self.inner.lock().await;
        let removed = agents
            .remove(name)
            .ok_or_else(|| TanukiError::not_found("agent", name))?;
        self.save(&agents).await?;
        info!("Removed agent {name}");
        Ok(removed)
    }

    /// All records, sorted by name.
    pub async fn list(&self) -> Vec<Agent> {
        let agents = self.inner.lock().await;
        let mut list: Vec<Agent> = agents.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub async fn update_status(&self, name: &str, status: AgentStatus) -> Result<()> {
        let mut agents = self.inner.lock().await;
        let agent = agents
            .get_mut(name)
            .ok_or_else(|| TanukiError::not_found("agent", name))?;
        agent.status = status;
        self.save(&agents).await
    }

    pub async fn update_last_task(&self, name: &str, last_task: LastTask) -> Result<()> {
        let mut agents = self.inner.lock().await;
        let agent = agents
            .get_mut(name)
            .ok_or_else(|| TanukiError::not_found("agent", name))?;
        agent.last_task = Some(last_task);
        self.save(&agents).await
    }

    /// Converge recorded intent with observed container state.
    ///
    /// For every record: a container that no longer exists orphans the
    /// record (deleted); one that exists but is not running demotes the
    /// agent to `stopped` (an error is logged if the record claimed it
    /// was working); a running container under a `stopped` record
    /// upgrades it back to `idle`. Idempotent by construction.
    pub async fn reconcile(&self, engine: &dyn ContainerEngine) -> Result<()> {
        let mut agents = self.inner.lock().await;
        let names: Vec<String> = {
            let mut names: Vec<String> = agents.keys().cloned().collect();
            names.sort();
            names
        };

        let mut dirty = false;
        for name in names {
            let container_id = match agents.get(&name) {
                Some(agent) => agent.container_id.clone(),
                None => continue,
            };
            let (exists, running) = engine.container_status(&container_id).await?;

            if !exists {
                warn!("Agent {name} is an orphan (container gone); dropping record");
                agents.remove(&name);
                dirty = true;
                continue;
            }
            let Some(agent) = agents.get_mut(&name) else {
                continue;
            };
            if !running {
                if agent.status == AgentStatus::Working {
                    error!(
                        "Agent {name} was recorded working but its container is not running"
                    );
                }
                if agent.status != AgentStatus::Stopped {
                    agent.status = AgentStatus::Stopped;
                    dirty = true;
                }
            } else if agent.status == AgentStatus::Stopped {
                agent.status = AgentStatus::Idle;
                dirty = true;
            }
        }

        if dirty {
            self.save(&agents).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::container_name;
    use crate::tests::fakes::FakeEngine;
    use chrono::Utc;
    use tempfile::TempDir;

    fn agent(name: &str, container_id: &str, status: AgentStatus) -> Agent {
        Agent {
            name: name.to_string(),
            branch: format!("tanuki/{name}"),
            worktree_path: PathBuf::from(format!("/repo/.tanuki/worktrees/{name}")),
            container_id: container_id.to_string(),
            container_name: container_name(name),
            role: "backend".to_string(),
            workstream: "main".to_string(),
            status,
            created_at: Utc::now(),
            last_task: None,
        }
    }

    async fn registry(dir: &TempDir) -> AgentRegistry {
        AgentRegistry::open(dir.path().join("state/agents.json"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn add_get_list_remove_round_trip() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir).await;

        registry.add(agent("b-agent", "c1", AgentStatus::Idle)).await.unwrap();
        registry.add(agent("a-agent", "c2", AgentStatus::Idle)).await.unwrap();

        assert!(registry.get("a-agent").await.is_some());
        let names: Vec<String> = registry.list().await.into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["a-agent", "b-agent"]);

        // duplicate names collide
        assert!(registry
            .add(agent("a-agent", "c3", AgentStatus::Idle))
            .await
            .is_err());

        registry.remove("a-agent").await.unwrap();
        assert!(registry.get("a-agent").await.is_none());
        assert!(registry.remove("a-agent").await.is_err());
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let registry = registry(&dir).await;
            registry.add(agent("keeper", "c1", AgentStatus::Idle)).await.unwrap();
            registry
                .update_status("keeper", AgentStatus::Stopped)
                .await
                .unwrap();
        }
        let reopened = registry(&dir).await;
        let loaded = reopened.get("keeper").await.unwrap();
        assert_eq!(loaded.status, AgentStatus::Stopped);
        assert_eq!(loaded.container_name, "tanuki-keeper");
    }

    #[tokio::test]
    async fn update_last_task_is_persisted() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir).await;
        registry.add(agent("worker", "c1", AgentStatus::Idle)).await.unwrap();

        registry
            .update_last_task(
                "worker",
                LastTask {
                    prompt: "do the thing".to_string(),
                    started_at: Utc::now(),
                    completed_at: None,
                    session_id: Some("sess-1".to_string()),
                },
            )
            .await
            .unwrap();

        let loaded = registry.get("worker").await.unwrap();
        assert_eq!(loaded.last_task.unwrap().prompt, "do the thing");
    }

    #[tokio::test]
    async fn reconcile_drops_orphans() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir).await;
        let engine = FakeEngine::new();
        engine.add_container("c1", "tanuki-alive", true).await;

        registry.add(agent("alive", "c1", AgentStatus::Idle)).await.unwrap();
        registry.add(agent("ghost", "c-gone", AgentStatus::Idle)).await.unwrap();

        registry.reconcile(&engine).await.unwrap();
        assert!(registry.get("alive").await.is_some());
        assert!(registry.get("ghost").await.is_none());
        let names: Vec<String> = registry.list().await.into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["alive"]);
    }

    #[tokio::test]
    async fn reconcile_converges_statuses() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir).await;
        let engine = FakeEngine::new();
        engine.add_container("c1", "tanuki-halted", false).await;
        engine.add_container("c2", "tanuki-revived", true).await;
        engine.add_container("c3", "tanuki-crashed", false).await;

        registry.add(agent("halted", "c1", AgentStatus::Idle)).await.unwrap();
        registry.add(agent("revived", "c2", AgentStatus::Stopped)).await.unwrap();
        registry.add(agent("crashed", "c3", AgentStatus::Working)).await.unwrap();

        registry.reconcile(&engine).await.unwrap();
        assert_eq!(registry.get("halted").await.unwrap().status, AgentStatus::Stopped);
        assert_eq!(registry.get("revived").await.unwrap().status, AgentStatus::Idle);
        assert_eq!(registry.get("crashed").await.unwrap().status, AgentStatus::Stopped);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir).await;
        let engine = FakeEngine::new();
        engine.add_container("c1", "tanuki-a", true).await;
        engine.add_container("c2", "tanuki-b", false).await;

        registry.add(agent("a", "c1", AgentStatus::Stopped)).await.unwrap();
        registry.add(agent("b", "c2", AgentStatus::Working)).await.unwrap();
        registry.add(agent("c", "c-gone", AgentStatus::Idle)).await.unwrap();

        registry.reconcile(&engine).await.unwrap();
        let first: Vec<Agent> = registry.list().await;
        registry.reconcile(&engine).await.unwrap();
        let second: Vec<Agent> = registry.list().await;

        let summarize = |agents: &[Agent]| -> Vec<(String, AgentStatus)> {
            agents.iter().map(|a| (a.name.clone(), a.status)).collect()
        };
        assert_eq!(summarize(&first), summarize(&second));
    }
}
