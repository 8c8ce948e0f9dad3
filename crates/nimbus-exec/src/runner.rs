//! Node command runner
//!
//! Everything the pipeline does to a cluster goes through a shell
//! command inside the bootstrap container. The runner retries transient
//! failures with a fixed delay; logical failures surface to the caller
//! after the retry budget is spent. Kubernetes-side timeouts live in
//! the commands themselves (`kubectl wait --timeout=...`), not here.

use crate::error::{ExecError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Retry budget for one command.
#[derive(Debug, Clone, Copy)]
pub struct ExecOpts {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for ExecOpts {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

impl ExecOpts {
    pub fn retries(attempts: u32, delay_secs: u64) -> Self {
        Self {
            attempts,
            delay: Duration::from_secs(delay_secs),
        }
    }

    /// Budget for "object eventually appears" polls.
    pub fn appear() -> Self {
        Self::retries(25, 5)
    }
}

/// Cooperative cancellation checked between retry attempts.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Command execution against the bootstrap node.
#[async_trait]
pub trait NodeRunner: Send + Sync {
    /// Run `sh -c command` inside the node, retrying per `opts`, with
    /// `env` exported into the command's environment. Returns combined
    /// stdout+stderr of the last attempt.
    async fn exec_env(&self, command: &str, opts: ExecOpts, env: &[String]) -> Result<String>;

    /// Run `argv` without a shell, streaming `stdin` into it.
    async fn pipe(&self, argv: &[&str], stdin: &str) -> Result<String>;

    /// Copy a file or directory out of the node onto the local host.
    async fn copy_from(&self, node_path: &str, local_dest: &Path) -> Result<()>;

    async fn exec(&self, command: &str, opts: ExecOpts) -> Result<String> {
        self.exec_env(command, opts, &[]).await
    }
}

/// The real runner: a named container driven through `docker exec`.
pub struct DockerNode {
    name: String,
    cancel: CancelFlag,
}

impl DockerNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn run_once(&self, command: &str, env: &[String]) -> Result<(bool, String)> {
        let mut cmd = Command::new("docker");
        cmd.arg("exec");
        for var in env {
            cmd.arg("-e").arg(var);
        }
        cmd.arg(&self.name).arg("sh").arg("-c").arg(command);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = cmd.output().await.map_err(|source| ExecError::Spawn {
            cmd: command.to_string(),
            source,
        })?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((output.status.success(), combined))
    }
}

#[async_trait]
impl NodeRunner for DockerNode {
    async fn exec_env(&self, command: &str, opts: ExecOpts, env: &[String]) -> Result<String> {
        let mut last_output = String::new();
        for attempt in 1..=opts.attempts {
            if self.cancel.is_cancelled() {
                return Err(ExecError::Cancelled);
            }
            match self.run_once(command, env).await {
                Ok((true, output)) => {
                    debug!(attempt, command, "node command succeeded");
                    return Ok(output);
                }
                Ok((false, output)) => {
                    warn!(attempt, command, "node command failed");
                    last_output = output;
                }
                Err(e) => {
                    warn!(attempt, command, error = %e, "node transport error");
                    last_output = e.to_string();
                }
            }
            if attempt < opts.attempts {
                tokio::time::sleep(opts.delay).await;
            }
        }
        Err(ExecError::ExecFailed {
            cmd: command.to_string(),
            attempts: opts.attempts,
            stderr: last_output,
        })
    }

    async fn pipe(&self, argv: &[&str], stdin: &str) -> Result<String> {
        let mut cmd = Command::new("docker");
        cmd.arg("exec").arg("-i").arg(&self.name).args(argv);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            cmd: argv.join(" "),
            source,
        })?;
        if let Some(mut handle) = child.stdin.take() {
            handle.write_all(stdin.as_bytes()).await?;
            drop(handle);
        }
        let output = child.wait_with_output().await?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(ExecError::ExecFailed {
                cmd: argv.join(" "),
                attempts: 1,
                stderr: combined,
            });
        }
        Ok(combined)
    }

    async fn copy_from(&self, node_path: &str, local_dest: &Path) -> Result<()> {
        let src = format!("{}:{}", self.name, node_path);
        let output = Command::new("docker")
            .arg("cp")
            .arg(&src)
            .arg(local_dest)
            .output()
            .await
            .map_err(|source| ExecError::Spawn {
                cmd: format!("docker cp {src}"),
                source,
            })?;
        if !output.status.success() {
            return Err(ExecError::ExecFailed {
                cmd: format!("docker cp {src}"),
                attempts: 1,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

/// Runs commands on the local host instead of inside a node. The
/// delete path drives `kubectl`/`clusterctl` against kubeconfig files
/// directly and goes through this.
#[derive(Debug, Default)]
pub struct LocalRunner;

#[async_trait]
impl NodeRunner for LocalRunner {
    async fn exec_env(&self, command: &str, opts: ExecOpts, env: &[String]) -> Result<String> {
        let mut last_output = String::new();
        for attempt in 1..=opts.attempts {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            for var in env {
                if let Some((key, value)) = var.split_once('=') {
                    cmd.env(key, value);
                }
            }
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            match cmd.output().await {
                Ok(output) => {
                    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                    combined.push_str(&String::from_utf8_lossy(&output.stderr));
                    if output.status.success() {
                        return Ok(combined);
                    }
                    warn!(attempt, command, "local command failed");
                    last_output = combined;
                }
                Err(e) => {
                    warn!(attempt, command, error = %e, "local spawn error");
                    last_output = e.to_string();
                }
            }
            if attempt < opts.attempts {
                tokio::time::sleep(opts.delay).await;
            }
        }
        Err(ExecError::ExecFailed {
            cmd: command.to_string(),
            attempts: opts.attempts,
            stderr: last_output,
        })
    }

    async fn pipe(&self, argv: &[&str], stdin: &str) -> Result<String> {
        let (program, rest) = argv.split_first().ok_or_else(|| ExecError::ExecFailed {
            cmd: String::new(),
            attempts: 1,
            stderr: "empty argv".to_string(),
        })?;
        let mut cmd = Command::new(program);
        cmd.args(rest)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            cmd: argv.join(" "),
            source,
        })?;
        if let Some(mut handle) = child.stdin.take() {
            handle.write_all(stdin.as_bytes()).await?;
            drop(handle);
        }
        let output = child.wait_with_output().await?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(ExecError::ExecFailed {
                cmd: argv.join(" "),
                attempts: 1,
                stderr: combined,
            });
        }
        Ok(combined)
    }

    async fn copy_from(&self, node_path: &str, local_dest: &Path) -> Result<()> {
        tokio::fs::copy(node_path, local_dest).await?;
        Ok(())
    }
}

/// A scripted runner for tests: records every command and answers from a
/// response table instead of touching a container.
#[derive(Default)]
pub struct ScriptedRunner {
    log: std::sync::Mutex<Vec<String>>,
    responses: Vec<(String, std::result::Result<String, String>)>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `output` for any command containing `needle`.
    pub fn respond(mut self, needle: impl Into<String>, output: impl Into<String>) -> Self {
        self.responses.push((needle.into(), Ok(output.into())));
        self
    }

    /// Fail any command containing `needle`.
    pub fn fail_on(mut self, needle: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.responses.push((needle.into(), Err(stderr.into())));
        self
    }

    /// Every command seen so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn saw(&self, needle: &str) -> bool {
        self.commands().iter().any(|c| c.contains(needle))
    }

    fn answer(&self, command: &str) -> Result<String> {
        self.log.lock().unwrap().push(command.to_string());
        for (needle, response) in &self.responses {
            if command.contains(needle.as_str()) {
                return match response {
                    Ok(output) => Ok(output.clone()),
                    Err(stderr) => Err(ExecError::ExecFailed {
                        cmd: command.to_string(),
                        attempts: 1,
                        stderr: stderr.clone(),
                    }),
                };
            }
        }
        Ok(String::new())
    }
}

#[async_trait]
impl NodeRunner for ScriptedRunner {
    async fn exec_env(&self, command: &str, _opts: ExecOpts, _env: &[String]) -> Result<String> {
        self.answer(command)
    }

    async fn pipe(&self, argv: &[&str], stdin: &str) -> Result<String> {
        let recorded = format!("{} <<< {}", argv.join(" "), stdin.lines().count());
        self.answer(&recorded)
    }

    async fn copy_from(&self, node_path: &str, local_dest: &Path) -> Result<()> {
        self.answer(&format!("copy {} {}", node_path, local_dest.display()))
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_runner_records_commands() {
        let runner = ScriptedRunner::new().respond("kubectl get", "demo");
        let out = runner
            .exec("kubectl get cluster demo", ExecOpts::default())
            .await
            .unwrap();
        assert_eq!(out, "demo");
        assert!(runner.saw("kubectl get cluster"));
    }

    #[tokio::test]
    async fn test_scripted_runner_failure() {
        let runner = ScriptedRunner::new().fail_on("helm install", "chart not found");
        let err = runner
            .exec("helm install foo /stratio/helm/foo", ExecOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::ExecFailed { .. }));
    }

    #[tokio::test]
    async fn test_cancel_flag_stops_exec() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let node = DockerNode::new("missing-node").with_cancel(cancel);
        let err = node.exec("true", ExecOpts::default()).await.unwrap_err();
        assert!(matches!(err, ExecError::Cancelled));
    }

    #[test]
    fn test_exec_opts_defaults() {
        let opts = ExecOpts::default();
        assert_eq!(opts.attempts, 3);
        assert_eq!(opts.delay, Duration::from_secs(5));
        assert_eq!(ExecOpts::appear().attempts, 25);
    }
}
