//! Thin command-line surface over the library. Parsing is clap-derive;
//! every handler wires the singletons together, does one thing, and
//! prints a one-line diagnostic (including the unblocking command) on
//! recoverable failures.

use crate::agent::{AgentManager, RemoveOptions, SpawnOptions};
use crate::config::TanukiConfig;
use crate::container::{ContainerEngine, DockerCli};
use crate::executor::{ClaudeExecutor, Executor, RunOptions};
use crate::models::TaskStatus;
use crate::orchestrator::ralph::{run_ralph, RalphOptions};
use crate::orchestrator::Orchestrator;
use crate::project::ProjectView;
use crate::registry::AgentRegistry;
use crate::scheduler::WorkstreamScheduler;
use crate::tasks::TaskStore;
use crate::worktree::WorktreeProvisioner;
use crate::{Result, TanukiError};
use clap::{Args, Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "tanuki",
    version,
    about = "Task-driven orchestration of autonomous coding agents"
)]
pub struct Cli {
    /// Repository the agents work on.
    #[arg(long, global = true, default_value = ".")]
    pub repo: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Manage individual agents.
    Agent {
        #[command(subcommand)]
        command: AgentCommand,
    },
    /// Drive whole projects of tasks.
    Project {
        #[command(subcommand)]
        command: ProjectCommand,
    },
    /// Inspect the task tree.
    Tasks {
        #[command(subcommand)]
        command: TasksCommand,
    },
    /// One-shot prompt on an agent, optionally in Ralph mode.
    Run(RunArgs),
}

#[derive(Subcommand)]
pub enum AgentCommand {
    /// Create an agent: branch + worktree + worker container.
    Spawn {
        name: String,
        #[arg(long, default_value = "")]
        role: String,
        #[arg(long, default_value = "main")]
        workstream: String,
        /// Branch override; defaults to <prefix>/<name>.
        #[arg(long)]
        branch: Option<String>,
    },
    /// Start a stopped agent's container.
    Start { name: String },
    /// Stop an agent's container, keeping worktree and branch.
    Stop { name: String },
    /// Tear an agent down.
    Remove {
        name: String,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        keep_branch: bool,
    },
    /// List all recorded agents.
    List,
    /// Recorded and observed state of one agent.
    Status { name: String },
    /// Follow an agent's container logs.
    Logs {
        name: String,
        #[arg(long)]
        follow: bool,
    },
    /// Converge the registry with observed container state.
    Reconcile,
}

#[derive(Subcommand)]
pub enum ProjectCommand {
    /// Per-project summaries and workstream rollups.
    Status { name: Option<String> },
    /// List projects.
    List,
    /// Schedule and run every ready workstream until done or cancelled.
    Start {
        name: Option<String>,
        /// Override a role's concurrency, e.g. --role-limit backend=2.
        #[arg(long = "role-limit")]
        role_limits: Vec<String>,
    },
    /// Reset interrupted tasks to pending, then start.
    Resume {
        name: Option<String>,
        #[arg(long = "role-limit")]
        role_limits: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum TasksCommand {
    /// List tasks, optionally filtered.
    List {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },
    /// Full detail of one task.
    Show { id: String },
}

#[derive(Args)]
pub struct RunArgs {
    pub name: String,
    /// The prompt, as trailing words.
    #[arg(required = true, trailing_var_arg = true)]
    pub prompt: Vec<String>,
    /// Loop until the completion signal appears or iterations run out.
    #[arg(long)]
    pub ralph: bool,
    #[arg(long)]
    pub iterations: Option<u32>,
    #[arg(long, default_value = "TASK COMPLETE")]
    pub signal: String,
    #[arg(long)]
    pub follow: bool,
    #[arg(long)]
    pub max_turns: Option<u32>,
}

struct App {
    config: TanukiConfig,
    store: Arc<TaskStore>,
    engine: Arc<DockerCli>,
    agents: Arc<AgentManager>,
}

impl App {
    async fn build(repo: &PathBuf) -> Result<Self> {
        let config = TanukiConfig::load(repo)?;
        let store = Arc::new(TaskStore::new(config.tasks_root()));
        let registry = Arc::new(AgentRegistry::open(config.registry_path()).await?);
        let worktrees = Arc::new(WorktreeProvisioner::new(
            config.repo_root.clone(),
            config.branch_prefix.clone(),
        ));
        let engine = Arc::new(DockerCli::new(
            config.network.clone(),
            config.worker.clone(),
        ));
        let executor: Arc<dyn Executor> = Arc::new(ClaudeExecutor::new(
            engine.clone() as Arc<dyn ContainerEngine>,
            config.executor.clone(),
        ));
        let agents = Arc::new(AgentManager::new(
            registry,
            worktrees,
            engine.clone() as Arc<dyn ContainerEngine>,
            executor,
        ));
        Ok(Self {
            config,
            store,
            engine,
            agents,
        })
    }

    fn base_run_opts(&self) -> RunOptions {
        RunOptions {
            follow: false,
            max_turns: None,
            allowed_tools: self.config.executor.allowed_tools.clone(),
            disallowed_tools: self.config.executor.disallowed_tools.clone(),
            timeout: self
                .config
                .executor
                .timeout_seconds
                .map(std::time::Duration::from_secs),
            output: None,
        }
    }

    fn scheduler(&self, overrides: &[String]) -> Result<WorkstreamScheduler> {
        let mut limits: HashMap<String, usize> = self.config.roles.clone();
        for raw in overrides {
            let (role, value) = raw.split_once('=').ok_or_else(|| {
                TanukiError::invalid("role limit", format!("expected role=N, got {raw:?}"))
            })?;
            let value: usize = value.parse().map_err(|_| {
                TanukiError::invalid("role limit", format!("{value:?} is not a number"))
            })?;
            if value == 0 {
                return Err(TanukiError::invalid("role limit", "limit must be at least 1"));
            }
            limits.insert(role.to_string(), value);
        }
        Ok(WorkstreamScheduler::new(
            limits,
            self.config.default_role_concurrency,
        ))
    }
}

/// Watch channel flipped to `true` on the first Ctrl-C.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(true);
        }
        // keep the sender alive so later borrows still read `true`
        std::future::pending::<()>().await;
    });
    rx
}

pub async fn execute(cli: Cli) -> Result<()> {
    let app = App::build(&cli.repo).await?;
    match cli.command {
        Command::Agent { command } => agent_command(&app, command).await,
        Command::Project { command } => project_command(&app, command).await,
        Command::Tasks { command } => tasks_command(&app, command).await,
        Command::Run(args) => run_command(&app, args).await,
    }
}

async fn agent_command(app: &App, command: AgentCommand) -> Result<()> {
    match command {
        AgentCommand::Spawn {
            name,
            role,
            workstream,
            branch,
        } => {
            app.engine.verify_available().await?;
            let agent = app
                .agents
                .spawn(
                    &name,
                    SpawnOptions {
                        branch,
                        role,
                        workstream,
                    },
                )
                .await?;
            println!(
                "Spawned {} (branch {}, container {})",
                agent.name, agent.branch, agent.container_name
            );
        }
        AgentCommand::Start { name } => {
            let agent = app.agents.start(&name).await?;
            println!("Agent {} is {}", agent.name, agent.status);
        }
        AgentCommand::Stop { name } => {
            app.agents.stop(&name).await?;
            println!("Agent {name} stopped");
        }
        AgentCommand::Remove {
            name,
            force,
            keep_branch,
        } => {
            app.agents
                .remove(&name, RemoveOptions { force, keep_branch })
                .await?;
            println!("Agent {name} removed");
        }
        AgentCommand::List => {
            let agents = app.agents.list().await;
            if agents.is_empty() {
                println!("No agents. Spawn one with `tanuki agent spawn <name>`.");
            }
            for agent in agents {
                println!(
                    "{:<24} {:<8} role={} workstream={} branch={}",
                    agent.name, agent.status, agent.role, agent.workstream, agent.branch
                );
            }
        }
        AgentCommand::Status { name } => {
            let report = app.agents.status(&name).await?;
            println!("name:      {}", report.agent.name);
            println!("status:    {}", report.agent.status);
            println!("branch:    {}", report.agent.branch);
            println!("worktree:  {}", report.agent.worktree_path.display());
            println!("container: {}", report.agent.container_name);
            println!(
                "observed:  exists={} running={}",
                report.container_exists, report.container_running
            );
            if let Some(last) = report.agent.last_task {
                println!("last task: started {}", last.started_at.to_rfc3339());
                if let Some(done) = last.completed_at {
                    println!("           finished {}", done.to_rfc3339());
                }
            }
        }
        AgentCommand::Logs { name, follow } => {
            let agent = app
                .agents
                .get(&name)
                .await
                .ok_or_else(|| TanukiError::not_found("agent", &name))?;
            let mut stream = app.engine.stream_logs(&agent.container_id, follow).await?;
            while let Some(line) = stream.next_line().await {
                println!("{line}");
            }
        }
        AgentCommand::Reconcile => {
            app.agents.reconcile().await?;
            println!("Registry reconciled against the container engine");
        }
    }
    Ok(())
}

async fn project_command(app: &App, command: ProjectCommand) -> Result<()> {
    match command {
        ProjectCommand::List => {
            let snapshot = app.store.scan().await?;
            let view = ProjectView::build(&snapshot);
            for project in &view.projects {
                println!("{:<20} {} tasks", project.display_name(), project.total);
            }
        }
        ProjectCommand::Status { name } => {
            let snapshot = app.store.scan().await?;
            let view = ProjectView::build(&snapshot);
            let selected: Vec<_> = match &name {
                Some(name) => view.projects.iter().filter(|p| &p.name == name).collect(),
                None => view.projects.iter().collect(),
            };
            if selected.is_empty() {
                println!("No such project. See `tanuki project list`.");
                return Ok(());
            }
            for project in selected {
                println!("project {}", project.display_name());
                for (status, count) in &project.by_status {
                    println!("  {status}: {count}");
                }
                for rollup in &project.workstreams {
                    let state = if rollup.is_done() {
                        "done"
                    } else if rollup.is_blocked() {
                        "blocked"
                    } else {
                        "ready"
                    };
                    println!(
                        "  {} [{}] {}/{} complete, {} ready",
                        rollup.key, state, rollup.complete, rollup.total, rollup.ready
                    );
                }
            }
        }
        ProjectCommand::Start { name, role_limits } => {
            start_project(app, name.as_deref(), &role_limits).await?;
        }
        ProjectCommand::Resume { name, role_limits } => {
            app.store.scan().await?;
            let reset = app.store.reset_interrupted().await?;
            if reset > 0 {
                println!("Reset {reset} interrupted task(s) to pending");
            }
            start_project(app, name.as_deref(), &role_limits).await?;
        }
    }
    Ok(())
}

async fn start_project(app: &App, name: Option<&str>, role_limits: &[String]) -> Result<()> {
    app.engine.verify_available().await?;
    app.agents.reconcile().await?;

    let scheduler = Arc::new(Mutex::new(app.scheduler(role_limits)?));
    let orchestrator = Orchestrator::new(
        app.store.clone(),
        scheduler,
        app.agents.clone(),
        app.base_run_opts(),
        app.config.executor.verify_retries,
    );
    orchestrator.run_project(name, shutdown_signal()).await?;

    let stats = app.store.stats().await;
    let complete = stats.by_status.get(&TaskStatus::Complete).copied().unwrap_or(0);
    let failed = stats.by_status.get(&TaskStatus::Failed).copied().unwrap_or(0);
    println!("Done: {complete}/{} complete, {failed} failed", stats.total);
    if failed > 0 {
        println!("Inspect failures with `tanuki tasks list --status failed`, fix, then `tanuki project resume`.");
    }
    Ok(())
}

async fn tasks_command(app: &App, command: TasksCommand) -> Result<()> {
    let snapshot = app.store.scan().await?;
    match command {
        TasksCommand::List {
            project,
            role,
            status,
        } => {
            let status = match status {
                Some(raw) => Some(raw.parse::<TaskStatus>().map_err(|e| {
                    TanukiError::invalid("status filter", e)
                })?),
                None => None,
            };
            for task in snapshot.iter().filter(|t| {
                project.as_ref().map_or(true, |p| &t.project == p)
                    && role.as_ref().map_or(true, |r| &t.role == r)
                    && status.map_or(true, |s| t.status == s)
            }) {
                println!(
                    "{:<16} {:<12} {:<8} {} {}",
                    task.id, task.status, task.priority, task.workstream_key(), task.title
                );
            }
        }
        TasksCommand::Show { id } => {
            let task = app
                .store
                .get(&id)
                .await
                .ok_or_else(|| TanukiError::not_found("task", &id))?;
            println!("id:        {}", task.id);
            println!("title:     {}", task.title);
            println!("status:    {}", task.status);
            println!("priority:  {}", task.priority);
            println!("workstream:{}", task.workstream_key());
            if !task.depends_on.is_empty() {
                println!("depends:   {}", task.depends_on.join(", "));
                println!("blocked:   {}", app.store.is_blocked(&id).await?);
            }
            if let Some(agent) = &task.assigned_to {
                println!("assigned:  {agent}");
            }
            println!("file:      {}", task.path.display());
            println!("\n{}", task.content.trim());
        }
    }
    Ok(())
}

async fn run_command(app: &App, args: RunArgs) -> Result<()> {
    let prompt = args.prompt.join(" ");
    let mut opts = app.base_run_opts();
    opts.follow = args.follow;
    opts.max_turns = args.max_turns;

    if args.ralph {
        let ralph = RalphOptions {
            max_iterations: args
                .iterations
                .unwrap_or(crate::constants::DEFAULT_RALPH_ITERATIONS),
            signal: args.signal,
            run: opts,
        };
        let outcome = run_ralph(&app.agents, &args.name, &prompt, ralph, shutdown_signal()).await?;
        if outcome.completed {
            println!("Completed after {} iteration(s)", outcome.iterations);
        } else {
            println!(
                "No completion signal after {} iteration(s); re-run or raise --iterations",
                outcome.iterations
            );
        }
    } else {
        let report = app.agents.run(&args.name, &prompt, &opts).await?;
        if !opts.follow {
            print!("{}", report.output);
        }
        if !report.ok {
            warn!("Run finished with errors: {:?}", report.error);
        }
    }
    Ok(())
}
