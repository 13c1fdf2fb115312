//! The executor boundary: given an agent, a prompt, and run options,
//! produce the agent's output stream and report whether the run ended
//! cleanly.
//!
//! The default implementation drives the LLM CLI inside the agent's
//! container through the container engine. Everything above this module
//! depends only on the [`Executor`] trait so tests can script outcomes.

use crate::config::ExecutorConfig;
use crate::container::{ContainerEngine, LogSink};
use crate::models::Agent;
use crate::{Result, TanukiError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

pub mod command;

pub use command::{ExecutorCommand, SessionMode};

/// Options for a single `run` on an agent.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Echo output lines to the operator's terminal as they arrive.
    pub follow: bool,
    pub max_turns: Option<u32>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    /// Wall-clock budget; the executor future is cancelled on expiry.
    pub timeout: Option<Duration>,
    /// Line sink observed by the caller while the run is in flight.
    pub output: Option<LogSink>,
}

/// What the executor reports back after a run.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub ok: bool,
    /// Combined stdout+stderr of the run.
    pub output: String,
    pub session_id: String,
    pub error: Option<String>,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        agent: &Agent,
        prompt: &str,
        opts: &RunOptions,
    ) -> Result<ExecutionReport>;
}

/// Executor driving the Claude CLI inside the agent's worker container.
pub struct ClaudeExecutor {
    engine: Arc<dyn ContainerEngine>,
    config: ExecutorConfig,
}

impl ClaudeExecutor {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: ExecutorConfig) -> Self {
        Self { engine, config }
    }

    fn build_argv(&self, prompt: &str, opts: &RunOptions) -> Vec<String> {
        let allowed = if opts.allowed_tools.is_empty() {
            &self.config.allowed_tools
        } else {
            &opts.allowed_tools
        };
        let disallowed = if opts.disallowed_tools.is_empty() {
            &self.config.disallowed_tools
        } else {
            &opts.disallowed_tools
        };
        ExecutorCommand::new(self.config.binary.clone())
            .with_max_turns(opts.max_turns.unwrap_or(self.config.max_turns))
            .with_allowed_tools(allowed)
            .with_disallowed_tools(disallowed)
            .build(prompt)
    }

    fn effective_timeout(&self, opts: &RunOptions) -> Option<Duration> {
        opts.timeout
            .or(self.config.timeout_seconds.map(Duration::from_secs))
    }
}

#[async_trait]
impl Executor for ClaudeExecutor {
    async fn execute(
        &self,
        agent: &Agent,
        prompt: &str,
        opts: &RunOptions,
    ) -> Result<ExecutionReport> {
        let session_id = Uuid::new_v4().to_string();
        let argv = self.build_argv(prompt, opts);
        debug!(
            "[Executor] Running {} turns-capped prompt in {}",
            agent.name, agent.container_name
        );

        // One sink feeds both the follow echo and the caller's observer.
        let sink = if opts.follow || opts.output.is_some() {
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            let follow = opts.follow;
            let forward = opts.output.clone();
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    if follow {
                        println!("{line}");
                    }
                    if let Some(forward) = &forward {
                        let _ = forward.send(line);
                    }
                }
            });
            Some(tx)
        } else {
            None
        };

        let exec = self
            .engine
            .exec_streamed(&agent.container_id, &argv, &[], sink);
        let outcome = match self.effective_timeout(opts) {
            Some(limit) => match tokio::time::timeout(limit, exec).await {
                Ok(outcome) => outcome?,
                Err(_) => {
                    return Err(TanukiError::Timeout {
                        seconds: limit.as_secs(),
                        message: format!("executor run on agent {}", agent.name),
                    })
                }
            },
            None => exec.await?,
        };

        let ok = outcome.success();
        let error = if ok {
            None
        } else {
            Some(format!(
                "executor exited with status {}",
                outcome.exit_code
            ))
        };
        Ok(ExecutionReport {
            ok,
            output: outcome.output,
            session_id,
            error,
        })
    }
}
