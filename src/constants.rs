//! System-wide constants: canonical naming, well-known paths, and limits.

/// Prefix for every worker container; the full name is `tanuki-<agent>`.
pub const CONTAINER_NAME_PREFIX: &str = "tanuki-";

/// Default prefix for agent branches; the full branch is `<prefix>/<agent>`.
pub const DEFAULT_BRANCH_PREFIX: &str = "tanuki";

/// Shared virtual network joined by every worker container.
pub const DEFAULT_NETWORK: &str = "tanuki-net";

/// Worktrees live under `<repo>/.tanuki/worktrees/<agent>`.
pub const WORKTREES_DIR: &str = ".tanuki/worktrees";

/// Durable state lives under `<repo>/.tanuki/state`.
pub const STATE_DIR: &str = ".tanuki/state";

/// File name of the agent registry inside the state dir.
pub const AGENTS_STATE_FILE: &str = "agents.json";

/// Default tasks root, relative to the repository root.
pub const DEFAULT_TASKS_DIR: &str = "tasks";

/// Default image for worker containers.
pub const DEFAULT_WORKER_IMAGE: &str = "tanuki-worker:latest";

/// Workdir mounted inside every worker container.
pub const CONTAINER_WORKDIR: &str = "/workspace";

/// Executor binary looked up inside the worker container.
pub const DEFAULT_EXECUTOR_BINARY: &str = "claude";

/// Workstreams per role unless the config overrides the role.
pub const DEFAULT_ROLE_CONCURRENCY: usize = 1;

/// Default turn budget handed to the executor per task.
pub const DEFAULT_MAX_TURNS: u32 = 30;

/// How many times a `verify` command is retried before a task fails.
pub const DEFAULT_VERIFY_RETRIES: u32 = 2;

/// Iteration cap for the Ralph loop when the CLI does not override it.
pub const DEFAULT_RALPH_ITERATIONS: u32 = 10;

/// How much trailing output is carried into the next Ralph iteration.
pub const RALPH_FAILURE_CONTEXT_CHARS: usize = 2000;

/// Agent names: lowercase alphanumeric plus hyphen, 2-63 chars, starts
/// with a letter, ends with an alphanumeric. Shared by validation and
/// every place that derives a name.
pub const AGENT_NAME_PATTERN: &str = "^[a-z][a-z0-9-]{0,61}[a-z0-9]$";

/// Maximum length of a derived agent name.
pub const AGENT_NAME_MAX_LEN: usize = 63;
