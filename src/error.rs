use std::path::PathBuf;
use thiserror::Error;

/// Convenience type alias for Results with TanukiError
pub type Result<T> = std::result::Result<T, TanukiError>;

/// Main error type for Tanuki
///
/// Every recoverable failure in the system maps onto one of these
/// variants. Callers match on the variant to decide whether to retry,
/// roll back, or surface a diagnostic to the operator.
#[derive(Error, Debug)]
pub enum TanukiError {
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("branch already exists: {0}")]
    BranchExists(String),

    #[error("worktree already exists at {}", .0.display())]
    WorktreeExists(PathBuf),

    #[error("not a git repository: {}", .0.display())]
    NotGitRepo(PathBuf),

    #[error("invalid {what}: {message}")]
    Invalid { what: &'static str, message: String },

    #[error("{tool} is not usable: {message}")]
    Unavailable { tool: &'static str, message: String },

    #[error("`{program} {args}` exited with status {code}: {stderr}")]
    Subprocess {
        program: String,
        args: String,
        code: i32,
        stderr: String,
    },

    #[error("executor error: {message}")]
    Executor { message: String },

    #[error("timed out after {seconds}s: {message}")]
    Timeout { seconds: u64, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl TanukiError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        TanukiError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(kind: &'static str, name: impl Into<String>) -> Self {
        TanukiError::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    pub fn invalid(what: &'static str, message: impl Into<String>) -> Self {
        TanukiError::Invalid {
            what,
            message: message.into(),
        }
    }

    pub fn unavailable(tool: &'static str, message: impl Into<String>) -> Self {
        TanukiError::Unavailable {
            tool,
            message: message.into(),
        }
    }

    /// True when retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TanukiError::Subprocess { .. } | TanukiError::Timeout { .. } | TanukiError::Io(_)
        )
    }
}
