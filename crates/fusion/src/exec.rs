use std::path::PathBuf;
use std::process::Stdio;
use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::{timeout, Duration};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invocation exceeded deadline of {0}s and was killed")]
    Timeout(u64),

    #[error("failed to wait for process: {0}")]
    Wait(std::io::Error),
}

/// What one external invocation produced. A non-zero exit code is a
/// normal, reportable outcome here, not an error.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes one external command and reports its outcome. The trait
/// seam lets the pipeline run against scripted doubles in tests.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, args: &[String]) -> Result<ToolOutput, ExecError>;
}

/// Runs the face-fusion executable as a subprocess, draining stdout
/// and stderr concurrently so neither pipe can fill and stall the tool.
pub struct FusionRunner {
    program: PathBuf,
    deadline_secs: Option<u64>,
}

impl FusionRunner {
    pub fn new(program: impl Into<PathBuf>, deadline_secs: Option<u64>) -> Self {
        Self {
            program: program.into(),
            deadline_secs,
        }
    }
}

#[async_trait]
impl ToolRunner for FusionRunner {
    async fn run(&self, args: &[String]) -> Result<ToolOutput, ExecError> {
        debug!("Executing: {} {}", self.program.display(), args.join(" "));

        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| ExecError::Launch {
            program: self.program.display().to_string(),
            source,
        })?;

        // Pipes are taken right after spawn; absence would be a tokio bug,
        // treat it as an empty stream rather than a fault.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_handle = tokio::spawn(async move {
            let mut lines = Vec::new();
            if let Some(stdout) = stdout {
                let mut line_stream = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = line_stream.next_line().await {
                    lines.push(line);
                }
            }
            lines.join("\n")
        });

        let stderr_handle = tokio::spawn(async move {
            let mut lines = Vec::new();
            if let Some(stderr) = stderr {
                let mut line_stream = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = line_stream.next_line().await {
                    lines.push(line);
                }
            }
            lines.join("\n")
        });

        let status = if let Some(deadline) = self.deadline_secs {
            match timeout(Duration::from_secs(deadline), child.wait()).await {
                Ok(result) => result.map_err(ExecError::Wait)?,
                Err(_) => {
                    child.kill().await.map_err(ExecError::Wait)?;
                    return Err(ExecError::Timeout(deadline));
                }
            }
        } else {
            child.wait().await.map_err(ExecError::Wait)?
        };

        let stdout = stdout_handle.await.unwrap_or_default();
        let stderr = stderr_handle.await.unwrap_or_default();

        // Signal-terminated processes report no code; fold to -1 like the
        // rest of the diagnostics
        let exit_code = status.code().unwrap_or(-1);
        debug!("Process exited with code {}", exit_code);

        Ok(ToolOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout_and_zero_exit() {
        let runner = FusionRunner::new("/bin/sh", None);
        let out = runner
            .run(&["-c".to_string(), "echo hello".to_string()])
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(out.success());
        assert_eq!(out.stdout, "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_ok_not_err() {
        let runner = FusionRunner::new("/bin/sh", None);
        let out = runner
            .run(&["-c".to_string(), "echo oops >&2; exit 3".to_string()])
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
        assert_eq!(out.stderr, "oops");
    }

    #[tokio::test]
    async fn test_missing_executable_is_launch_error() {
        let runner = FusionRunner::new("/nonexistent/fusion-tool", None);
        let err = runner.run(&[]).await.unwrap_err();
        assert!(matches!(err, ExecError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_deadline_kills_stuck_process() {
        let runner = FusionRunner::new("/bin/sh", Some(1));
        let err = runner
            .run(&["-c".to_string(), "sleep 30".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout(1)));
    }
}
