//! Version-control isolation: one worktree and one branch per agent, both
//! derived purely from the agent's name.
//!
//! Git is always invoked with explicit argument arrays; names pass the
//! canonical validator before reaching an argv.

use crate::constants::WORKTREES_DIR;
use crate::validation::{validate_agent_name, validate_branch_name};
use crate::{Result, TanukiError};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub struct WorktreeProvisioner {
    repo_root: PathBuf,
    branch_prefix: String,
    /// The parent repo is shared by all worktrees; mutations serialize
    /// here so concurrent provisioning never races on git's index lock.
    mutate_lock: tokio::sync::Mutex<()>,
}

impl WorktreeProvisioner {
    pub fn new(repo_root: impl Into<PathBuf>, branch_prefix: impl Into<String>) -> Self {
        Self {
            repo_root: repo_root.into(),
            branch_prefix: branch_prefix.into(),
            mutate_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Canonical branch for an agent: `<prefix>/<name>`.
    pub fn branch_name(&self, agent: &str) -> String {
        format!("{}/{agent}", self.branch_prefix)
    }

    /// Canonical worktree path for an agent.
    pub fn worktree_path(&self, agent: &str) -> PathBuf {
        self.repo_root.join(WORKTREES_DIR).join(agent)
    }

    /// Fail with `NotGitRepo` unless the root is inside a git repository.
    pub async fn verify_repo(&self) -> Result<()> {
        let probe = self.git_raw(&self.repo_root, &["rev-parse", "--git-dir"]).await?;
        if probe.status.success() {
            Ok(())
        } else {
            Err(TanukiError::NotGitRepo(self.repo_root.clone()))
        }
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let probe = self
            .git_raw(
                &self.repo_root,
                &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")],
            )
            .await?;
        Ok(probe.status.success())
    }

    /// Create the agent's worktree on a fresh branch off the main branch.
    /// Returns the absolute worktree path.
    pub async fn create_worktree(&self, agent: &str) -> Result<PathBuf> {
        let branch = self.branch_name(agent);
        self.create_worktree_on_branch(agent, &branch).await
    }

    /// Like [`create_worktree`](Self::create_worktree) but on an
    /// explicitly named branch instead of the canonical one.
    pub async fn create_worktree_on_branch(&self, agent: &str, branch: &str) -> Result<PathBuf> {
        validate_agent_name(agent)?;
        validate_branch_name(branch)?;
        self.verify_repo().await?;
        let _guard = self.mutate_lock.lock().await;

        if self.branch_exists(branch).await? {
            return Err(TanukiError::BranchExists(branch.to_string()));
        }
        let path = self.worktree_path(agent);
        if path.exists() {
            return Err(TanukiError::WorktreeExists(path));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let base = self.main_branch().await?;
        let path_arg = path.to_string_lossy().to_string();
        self.git(
            &self.repo_root,
            &["worktree", "add", "-b", branch, &path_arg, &base],
        )
        .await?;
        info!("[Worktree] Created {} on branch {branch}", path.display());

        Ok(tokio::fs::canonicalize(&path).await.unwrap_or(path))
    }

    /// Remove the agent's worktree, optionally deleting its branch.
    pub async fn remove_worktree(&self, agent: &str, delete_branch: bool) -> Result<()> {
        validate_agent_name(agent)?;
        let _guard = self.mutate_lock.lock().await;
        let path = self.worktree_path(agent);

        if path.exists() {
            let path_arg = path.to_string_lossy().to_string();
            self.git(
                &self.repo_root,
                &["worktree", "remove", "--force", &path_arg],
            )
            .await?;
        } else {
            // Stale bookkeeping from a worktree deleted out-of-band.
            let _ = self.git(&self.repo_root, &["worktree", "prune"]).await;
        }

        if delete_branch {
            let branch = self.branch_name(agent);
            match self.git(&self.repo_root, &["branch", "-D", &branch]).await {
                Ok(_) => debug!("[Worktree] Deleted branch {branch}"),
                Err(TanukiError::Subprocess { stderr, .. }) if stderr.contains("not found") => {
                    warn!("[Worktree] Branch {branch} already gone");
                }
                Err(e) => return Err(e),
            }
        }
        info!("[Worktree] Removed worktree for {agent}");
        Ok(())
    }

    /// `git status --porcelain` inside the agent's worktree.
    pub async fn status(&self, agent: &str) -> Result<String> {
        validate_agent_name(agent)?;
        let path = self.worktree_path(agent);
        if !path.exists() {
            return Err(TanukiError::not_found("worktree", agent));
        }
        self.git(&path, &["status", "--porcelain"]).await
    }

    /// Diff of the agent's worktree against a base revision.
    pub async fn diff(&self, agent: &str, base: &str) -> Result<String> {
        validate_agent_name(agent)?;
        let path = self.worktree_path(agent);
        if !path.exists() {
            return Err(TanukiError::not_found("worktree", agent));
        }
        self.git(&path, &["diff", base]).await
    }

    pub async fn current_branch(&self) -> Result<String> {
        self.git(&self.repo_root, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
    }

    /// The repository's primary branch: `main`, then `master`, then
    /// `trunk`, then whatever `origin/HEAD` points at, then the current
    /// branch as a last resort.
    pub async fn main_branch(&self) -> Result<String> {
        for candidate in ["main", "master", "trunk"] {
            if self.branch_exists(candidate).await? {
                return Ok(candidate.to_string());
            }
        }
        let probe = self
            .git_raw(
                &self.repo_root,
                &["symbolic-ref", "refs/remotes/origin/HEAD"],
            )
            .await?;
        if probe.status.success() {
            let full = String::from_utf8_lossy(&probe.stdout).trim().to_string();
            if let Some(branch) = full.strip_prefix("refs/remotes/origin/") {
                return Ok(branch.to_string());
            }
        }
        self.current_branch().await
    }

    async fn git_raw(&self, dir: &Path, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| TanukiError::unavailable("git", e.to_string()))
    }

    /// Run git, returning trimmed stdout or a subprocess error carrying
    /// the captured stderr.
    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = self.git_raw(dir, args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(TanukiError::Subprocess {
                program: "git".to_string(),
                args: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn sh(dir: &Path, program: &str, args: &[&str]) {
        let status = std::process::Command::new(program)
            .args(args)
            .current_dir(dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(status.success(), "{program} {args:?} failed");
    }

    fn scratch_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        sh(dir.path(), "git", &["init", "-b", "main"]);
        sh(dir.path(), "git", &["config", "user.email", "test@example.com"]);
        sh(dir.path(), "git", &["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "scratch\n").unwrap();
        sh(dir.path(), "git", &["add", "."]);
        sh(dir.path(), "git", &["commit", "-m", "init"]);
        dir
    }

    #[tokio::test]
    async fn not_a_repo_is_explicit() {
        let dir = TempDir::new().unwrap();
        let provisioner = WorktreeProvisioner::new(dir.path(), "tanuki");
        match provisioner.verify_repo().await {
            Err(TanukiError::NotGitRepo(_)) => {}
            other => panic!("expected NotGitRepo, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_and_remove_worktree() {
        if !git_available() {
            return;
        }
        let repo = scratch_repo();
        let provisioner = WorktreeProvisioner::new(repo.path(), "tanuki");

        let path = provisioner.create_worktree("agent-a").await.unwrap();
        assert!(path.exists());
        assert!(provisioner.branch_exists("tanuki/agent-a").await.unwrap());
        assert_eq!(provisioner.status("agent-a").await.unwrap(), "");

        // second create collides on the branch
        match provisioner.create_worktree("agent-a").await {
            Err(TanukiError::BranchExists(branch)) => assert_eq!(branch, "tanuki/agent-a"),
            other => panic!("expected BranchExists, got {other:?}"),
        }

        provisioner.remove_worktree("agent-a", true).await.unwrap();
        assert!(!provisioner.worktree_path("agent-a").exists());
        assert!(!provisioner.branch_exists("tanuki/agent-a").await.unwrap());
    }

    #[tokio::test]
    async fn diff_reflects_worktree_edits() {
        if !git_available() {
            return;
        }
        let repo = scratch_repo();
        let provisioner = WorktreeProvisioner::new(repo.path(), "tanuki");
        let path = provisioner.create_worktree("agent-b").await.unwrap();

        std::fs::write(path.join("README.md"), "changed\n").unwrap();
        let diff = provisioner.diff("agent-b", "main").await.unwrap();
        assert!(diff.contains("changed"));
        let status = provisioner.status("agent-b").await.unwrap();
        assert!(status.contains("README.md"));
    }

    #[tokio::test]
    async fn main_branch_detection_prefers_main() {
        if !git_available() {
            return;
        }
        let repo = scratch_repo();
        let provisioner = WorktreeProvisioner::new(repo.path(), "tanuki");
        assert_eq!(provisioner.main_branch().await.unwrap(), "main");
    }

    #[tokio::test]
    async fn invalid_names_never_reach_git() {
        let dir = TempDir::new().unwrap();
        let provisioner = WorktreeProvisioner::new(dir.path(), "tanuki");
        assert!(provisioner.create_worktree("Bad Name").await.is_err());
        assert!(provisioner.remove_worktree("x; rm", true).await.is_err());
    }
}
