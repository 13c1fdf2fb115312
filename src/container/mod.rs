//! Runtime isolation: long-lived worker containers driven through the
//! container engine CLI.
//!
//! Workers are sleep-based containers with the agent's worktree mounted as
//! their workdir, joined to one shared network. All engine calls go
//! through explicit argument arrays; agent names are validated before
//! they ever reach an argv.

use crate::config::WorkerConfig;
use crate::constants::{CONTAINER_NAME_PREFIX, CONTAINER_WORKDIR};
use crate::{Result, TanukiError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Canonical container name for an agent.
pub fn container_name(agent: &str) -> String {
    format!("{CONTAINER_NAME_PREFIX}{agent}")
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    /// Host path mounted at the container path.
    pub mount: Option<(PathBuf, String)>,
    pub workdir: Option<String>,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cpus: Option<f64>,
    pub memory: Option<String>,
}

/// TTY/interactive selection for `exec`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions {
    pub tty: bool,
    pub interactive: bool,
}

/// Result of a buffered/streamed exec.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub output: String,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone)]
pub struct ResourceUsage {
    pub cpu_percent: String,
    pub memory_usage: String,
}

/// Line sink used to tee exec output while it is being buffered.
pub type LogSink = mpsc::UnboundedSender<String>;

/// Capability set over the container engine. The agent manager and the
/// executor depend on this trait, never on the concrete CLI driver, so
/// tests can substitute a fake engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn ensure_network(&self) -> Result<()>;
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;
    /// Create the canonical long-lived worker for an agent; returns the
    /// container id.
    async fn create_agent_container(&self, agent: &str, worktree: &Path) -> Result<String>;
    async fn start(&self, id: &str) -> Result<()>;
    async fn stop(&self, id: &str) -> Result<()>;
    /// Force-remove; absent containers are not an error.
    async fn remove(&self, id: &str) -> Result<()>;
    /// Interactive exec inheriting the caller's stdio; returns the exit code.
    async fn exec(&self, id: &str, cmd: &[String], opts: ExecOptions) -> Result<i32>;
    /// Buffered exec combining stdout and stderr, optionally teeing each
    /// line into `sink` as it arrives.
    async fn exec_streamed(
        &self,
        id: &str,
        cmd: &[String],
        env: &[(String, String)],
        sink: Option<LogSink>,
    ) -> Result<ExecOutcome>;
    async fn exec_with_output(&self, id: &str, cmd: &[String]) -> Result<String> {
        let outcome = self.exec_streamed(id, cmd, &[], None).await?;
        if outcome.success() {
            Ok(outcome.output)
        } else {
            Err(TanukiError::Subprocess {
                program: "exec".to_string(),
                args: cmd.join(" "),
                code: outcome.exit_code,
                stderr: outcome.output,
            })
        }
    }
    /// `(exists, running)` as observed by the engine.
    async fn container_status(&self, id: &str) -> Result<(bool, bool)>;
    async fn stream_logs(&self, id: &str, follow: bool) -> Result<LogStream>;
    async fn inspect(&self, id: &str) -> Result<serde_json::Value>;
    async fn resource_usage(&self, id: &str) -> Result<ResourceUsage>;
}

/// Combined stdout+stderr log handle. Dropping or closing it terminates
/// the underlying process.
pub struct LogStream {
    child: Option<tokio::process::Child>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl LogStream {
    fn from_child(mut child: tokio::process::Child) -> Result<Self> {
        let stdout = child.stdout.take().ok_or_else(|| {
            TanukiError::unavailable("container engine", "log stream has no stdout")
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            TanukiError::unavailable("container engine", "log stream has no stderr")
        })?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_lines(stdout, tx.clone()));
        tokio::spawn(forward_lines(stderr, tx));
        Ok(Self {
            child: Some(child),
            rx,
        })
    }

    /// Pre-canned stream for tests and fakes.
    pub fn from_lines(lines: Vec<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        for line in lines {
            let _ = tx.send(line);
        }
        Self { child: None, rx }
    }

    /// Next combined output line; `None` once the process is done.
    pub async fn next_line(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Terminate the underlying process.
    pub async fn close(mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

async fn forward_lines(reader: impl AsyncRead + Unpin, tx: mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            break;
        }
    }
}

/// Container engine driver speaking the docker CLI.
pub struct DockerCli {
    binary: String,
    network: String,
    worker: WorkerConfig,
}

impl DockerCli {
    pub fn new(network: impl Into<String>, worker: WorkerConfig) -> Self {
        Self {
            binary: "docker".to_string(),
            network: network.into(),
            worker,
        }
    }

    /// Fail fast when the engine daemon is unreachable.
    pub async fn verify_available(&self) -> Result<()> {
        let output = Command::new(&self.binary)
            .args(["version", "--format", "{{.Server.Version}}"])
            .output()
            .await
            .map_err(|e| TanukiError::unavailable("container engine", e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(TanukiError::unavailable(
                "container engine",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn docker_raw(&self, args: &[String]) -> Result<std::process::Output> {
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| TanukiError::unavailable("container engine", e.to_string()))
    }

    /// Run a docker command; trimmed stdout on success, a subprocess
    /// error carrying stderr otherwise.
    async fn docker(&self, args: &[String]) -> Result<String> {
        let output = self.docker_raw(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(TanukiError::Subprocess {
                program: self.binary.clone(),
                args: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn create_args(&self, spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--network".to_string(),
            spec.network.clone(),
        ];
        if let Some((host, container)) = &spec.mount {
            args.push("-v".to_string());
            args.push(format!("{}:{container}", host.display()));
        }
        if let Some(workdir) = &spec.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }
        if let Some(cpus) = spec.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        if let Some(memory) = &spec.memory {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn ensure_network(&self) -> Result<()> {
        let probe = self
            .docker_raw(&[
                "network".to_string(),
                "inspect".to_string(),
                self.network.clone(),
            ])
            .await?;
        if probe.status.success() {
            return Ok(());
        }
        info!("Creating container network {}", self.network);
        self.docker(&[
            "network".to_string(),
            "create".to_string(),
            self.network.clone(),
        ])
        .await?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let id = self.docker(&self.create_args(spec)).await?;
        debug!("Created container {} ({})", spec.name, id);
        Ok(id)
    }

    async fn create_agent_container(&self, agent: &str, worktree: &Path) -> Result<String> {
        let spec = ContainerSpec {
            name: container_name(agent),
            image: self.worker.image.clone(),
            network: self.network.clone(),
            mount: Some((worktree.to_path_buf(), CONTAINER_WORKDIR.to_string())),
            workdir: Some(CONTAINER_WORKDIR.to_string()),
            command: vec!["sleep".to_string(), "infinity".to_string()],
            env: self
                .worker
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            cpus: self.worker.cpus,
            memory: self.worker.memory.clone(),
        };
        self.create_container(&spec).await
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker(&["start".to_string(), id.to_string()]).await?;
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.docker(&["stop".to_string(), id.to_string()]).await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        match self
            .docker(&["rm".to_string(), "-f".to_string(), id.to_string()])
            .await
        {
            Ok(_) => Ok(()),
            Err(TanukiError::Subprocess { stderr, .. }) if stderr.contains("No such container") => {
                warn!("Container {id} already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn exec(&self, id: &str, cmd: &[String], opts: ExecOptions) -> Result<i32> {
        let mut command = Command::new(&self.binary);
        command.arg("exec");
        if opts.interactive {
            command.arg("-i");
        }
        if opts.tty {
            command.arg("-t");
        }
        command.arg(id);
        command.args(cmd);
        let status = command
            .status()
            .await
            .map_err(|e| TanukiError::unavailable("container engine", e.to_string()))?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn exec_streamed(
        &self,
        id: &str,
        cmd: &[String],
        env: &[(String, String)],
        sink: Option<LogSink>,
    ) -> Result<ExecOutcome> {
        let mut command = Command::new(&self.binary);
        command.arg("exec");
        for (key, value) in env {
            command.arg("-e");
            command.arg(format!("{key}={value}"));
        }
        command.arg(id);
        command.args(cmd);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| TanukiError::unavailable("container engine", e.to_string()))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TanukiError::unavailable("container engine", "exec has no stdout pipe")
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            TanukiError::unavailable("container engine", "exec has no stderr pipe")
        })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let out_task = tokio::spawn(forward_lines(stdout, tx.clone()));
        let err_task = tokio::spawn(forward_lines(stderr, tx));

        let mut output = String::new();
        while let Some(line) = rx.recv().await {
            if let Some(sink) = &sink {
                let _ = sink.send(line.clone());
            }
            output.push_str(&line);
            output.push('\n');
        }
        let _ = out_task.await;
        let _ = err_task.await;

        let status = child.wait().await?;
        Ok(ExecOutcome {
            exit_code: status.code().unwrap_or(-1),
            output,
        })
    }

    async fn container_status(&self, id: &str) -> Result<(bool, bool)> {
        let output = self
            .docker_raw(&[
                "inspect".to_string(),
                "-f".to_string(),
                "{{.State.Running}}".to_string(),
                id.to_string(),
            ])
            .await?;
        if !output.status.success() {
            return Ok((false, false));
        }
        let running = String::from_utf8_lossy(&output.stdout).trim() == "true";
        Ok((true, running))
    }

    async fn stream_logs(&self, id: &str, follow: bool) -> Result<LogStream> {
        let mut command = Command::new(&self.binary);
        command.arg("logs");
        if follow {
            command.arg("-f");
        }
        command.arg(id);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command
            .spawn()
            .map_err(|e| TanukiError::unavailable("container engine", e.to_string()))?;
        LogStream::from_child(child)
    }

    async fn inspect(&self, id: &str) -> Result<serde_json::Value> {
        let raw = self
            .docker(&["inspect".to_string(), id.to_string()])
            .await?;
        let parsed: serde_json::Value = serde_json::from_str(&raw)?;
        parsed
            .as_array()
            .and_then(|arr| arr.first())
            .cloned()
            .ok_or_else(|| TanukiError::not_found("container", id))
    }

    async fn resource_usage(&self, id: &str) -> Result<ResourceUsage> {
        let raw = self
            .docker(&[
                "stats".to_string(),
                "--no-stream".to_string(),
                "--format".to_string(),
                "{{.CPUPerc}};{{.MemUsage}}".to_string(),
                id.to_string(),
            ])
            .await?;
        let (cpu, mem) = raw.split_once(';').ok_or_else(|| {
            TanukiError::invalid("stats output", format!("unexpected format: {raw}"))
        })?;
        Ok(ResourceUsage {
            cpu_percent: cpu.trim().to_string(),
            memory_usage: mem.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn canonical_container_names() {
        assert_eq!(container_name("auth-backend"), "tanuki-auth-backend");
    }

    #[test]
    fn create_args_cover_the_full_spec() {
        let mut env = HashMap::new();
        env.insert("FOO".to_string(), "bar".to_string());
        let docker = DockerCli::new(
            "tanuki-net",
            WorkerConfig {
                image: "worker:1".to_string(),
                cpus: Some(1.5),
                memory: Some("2g".to_string()),
                env,
            },
        );
        let spec = ContainerSpec {
            name: "tanuki-a".to_string(),
            image: "worker:1".to_string(),
            network: "tanuki-net".to_string(),
            mount: Some((PathBuf::from("/repo/.tanuki/worktrees/a"), "/workspace".to_string())),
            workdir: Some("/workspace".to_string()),
            command: vec!["sleep".to_string(), "infinity".to_string()],
            env: vec![("FOO".to_string(), "bar".to_string())],
            cpus: Some(1.5),
            memory: Some("2g".to_string()),
        };
        let args = docker.create_args(&spec);
        let joined = args.join(" ");
        assert!(joined.starts_with("create --name tanuki-a --network tanuki-net"));
        assert!(joined.contains("-v /repo/.tanuki/worktrees/a:/workspace"));
        assert!(joined.contains("-w /workspace"));
        assert!(joined.contains("--cpus 1.5"));
        assert!(joined.contains("--memory 2g"));
        assert!(joined.contains("-e FOO=bar"));
        assert!(joined.ends_with("worker:1 sleep infinity"));
    }

    #[tokio::test]
    async fn log_stream_from_lines_drains_and_ends() {
        let mut stream = LogStream::from_lines(vec!["one".to_string(), "two".to_string()]);
        assert_eq!(stream.next_line().await.as_deref(), Some("one"));
        assert_eq!(stream.next_line().await.as_deref(), Some("two"));
        assert_eq!(stream.next_line().await, None);
    }
}
