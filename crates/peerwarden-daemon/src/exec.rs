// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::collections::HashSet;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ExecSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("engine {0:?} is not configured")]
    UnknownEngine(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("exited with status {status}: {stderr}")]
    Failed { status: i32, stderr: String },

    #[error("engine {0:?} did not come back up after restart")]
    NotRunning(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Connection- or timeout-shaped failures of the exec backend, worth a retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Failed { stderr, .. } => is_transient_message(stderr),
            _ => false,
        }
    }
}

fn is_transient_message(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    const MARKERS: &[&str] = &[
        "i/o timeout",
        "context deadline exceeded",
        "cannot connect to the docker daemon",
        "eof",
    ];
    MARKERS.iter().any(|m| msg.contains(m))
        || (msg.contains("oci runtime") && msg.contains("failed"))
        || (msg.contains("http ") && msg.contains(" error"))
}

/// Runs commands and moves files inside a named engine's environment.
pub trait EngineExec: Send + Sync {
    fn exec(
        &self,
        engine: &str,
        command: &str,
    ) -> impl Future<Output = Result<ExecOutput, ExecError>> + Send;

    fn read_file(
        &self,
        engine: &str,
        path: &str,
    ) -> impl Future<Output = Result<String, ExecError>> + Send;

    /// Write `contents` to a sibling temp file, then move it over `path`.
    fn write_file_atomic(
        &self,
        engine: &str,
        path: &str,
        contents: &str,
    ) -> impl Future<Output = Result<(), ExecError>> + Send;

    fn restart(&self, engine: &str) -> impl Future<Output = Result<(), ExecError>> + Send;

    /// Run `command` and return its stdout, mapping a non-zero exit to [`ExecError::Failed`].
    fn exec_ok(
        &self,
        engine: &str,
        command: &str,
    ) -> impl Future<Output = Result<String, ExecError>> + Send {
        async move {
            let out = self.exec(engine, command).await?;
            if out.success() {
                Ok(out.stdout)
            } else {
                Err(ExecError::Failed {
                    status: out.status,
                    stderr: out.stderr.trim().to_string(),
                })
            }
        }
    }
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"/._-:=@%+,".contains(&b))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

// -- Docker-backed implementation --

const RESTART_POLLS: u32 = 15;
const RESTART_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct DockerExec {
    docker_bin: String,
    engines: HashSet<String>,
    timeout: Duration,
    retries: u32,
    retry_delay: Duration,
}

impl DockerExec {
    pub fn new(settings: &ExecSettings, engines: impl IntoIterator<Item = String>) -> Self {
        Self {
            docker_bin: settings.docker_bin.clone(),
            engines: engines.into_iter().collect(),
            timeout: Duration::from_secs(settings.timeout_secs),
            retries: settings.retries,
            retry_delay: Duration::from_secs(settings.retry_delay_secs),
        }
    }

    fn check_engine(&self, engine: &str) -> Result<(), ExecError> {
        if self.engines.contains(engine) {
            Ok(())
        } else {
            Err(ExecError::UnknownEngine(engine.to_string()))
        }
    }

    async fn run_once(&self, args: &[&str], input: Option<&[u8]>) -> Result<ExecOutput, ExecError> {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.args(args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let run = async {
            let mut child = cmd.spawn()?;
            if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
                stdin.write_all(data).await?;
                stdin.shutdown().await?;
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| ExecError::Timeout(self.timeout))??;

        Ok(ExecOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run(&self, args: &[&str], input: Option<&[u8]>) -> Result<ExecOutput, ExecError> {
        let mut attempt = 0;
        loop {
            let result = self.run_once(args, input).await;
            let transient = match &result {
                Ok(out) => !out.success() && is_transient_message(&out.stderr),
                Err(e) => e.is_transient(),
            };
            if !transient || attempt >= self.retries {
                return result;
            }
            attempt += 1;
            warn!(
                attempt,
                retries = self.retries,
                command = args.first().copied().unwrap_or_default(),
                "transient docker failure, retrying"
            );
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    async fn exec_with_input(
        &self,
        engine: &str,
        command: &str,
        input: Option<&[u8]>,
    ) -> Result<ExecOutput, ExecError> {
        self.check_engine(engine)?;
        debug!(engine, "docker exec");
        let args = ["exec", "-i", engine, "sh", "-lc", command];
        self.run(&args, input).await
    }

    async fn is_running(&self, engine: &str) -> bool {
        let args = ["inspect", "-f", "{{.State.Running}}", engine];
        matches!(self.run_once(&args, None).await, Ok(out) if out.stdout.trim() == "true")
    }

    async fn wait_running(&self, engine: &str) -> bool {
        for _ in 0..RESTART_POLLS {
            if self.is_running(engine).await {
                return true;
            }
            tokio::time::sleep(RESTART_POLL_INTERVAL).await;
        }
        false
    }
}

impl EngineExec for DockerExec {
    async fn exec(&self, engine: &str, command: &str) -> Result<ExecOutput, ExecError> {
        self.exec_with_input(engine, command, None).await
    }

    async fn read_file(&self, engine: &str, path: &str) -> Result<String, ExecError> {
        self.exec_ok(engine, &format!("cat {}", shell_quote(path))).await
    }

    async fn write_file_atomic(
        &self,
        engine: &str,
        path: &str,
        contents: &str,
    ) -> Result<(), ExecError> {
        let tmp = format!("{path}.tmp");
        let command = format!(
            "cat > {tmp} && mv -f {tmp} {path}",
            tmp = shell_quote(&tmp),
            path = shell_quote(path),
        );
        let out = self
            .exec_with_input(engine, &command, Some(contents.as_bytes()))
            .await?;
        if !out.success() {
            return Err(ExecError::Failed {
                status: out.status,
                stderr: out.stderr.trim().to_string(),
            });
        }
        debug!(engine, path, bytes = contents.len(), "wrote file");
        Ok(())
    }

    async fn restart(&self, engine: &str) -> Result<(), ExecError> {
        self.check_engine(engine)?;
        for round in 0..2 {
            info!(engine, round, "restarting engine");
            let out = self.run(&["restart", engine], None).await?;
            if !out.success() {
                warn!(engine, status = out.status, stderr = %out.stderr.trim(), "docker restart failed");
                continue;
            }
            if self.wait_running(engine).await {
                return Ok(());
            }
            warn!(engine, "engine not running after restart");
        }
        Err(ExecError::NotRunning(engine.to_string()))
    }
}
