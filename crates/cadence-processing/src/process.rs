//! Subprocess helpers for ffmpeg/ffprobe
//!
//! A tool that cannot be started or exits non-zero is a retryable failure: it
//! maps to `PipelineError::Transcode` like any other external tool error.
//! Output that cannot be interpreted is the caller's business.

use cadence_core::PipelineError;
use std::ffi::OsStr;
use std::process::{ExitStatus, Output, Stdio};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

/// Longest stderr tail kept in error messages.
const STDERR_TAIL_CHARS: usize = 2000;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("Lost {tool} while it was running: {source}")]
    Wait {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<ToolError> for PipelineError {
    fn from(err: ToolError) -> Self {
        PipelineError::Transcode(err.to_string())
    }
}

/// Keep the end of a long stderr; ffmpeg prints the actual error last.
pub(crate) fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let count = text.chars().count();
    if count <= STDERR_TAIL_CHARS {
        text.to_string()
    } else {
        text.chars().skip(count - STDERR_TAIL_CHARS).collect()
    }
}

/// Run a tool to completion, capturing stdout and stderr. Non-zero exit is an error.
pub(crate) async fn run_tool<I, S>(program: &str, args: I) -> Result<Output, ToolError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ToolError::Spawn {
            tool: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(ToolError::Failed {
            tool: program.to_string(),
            status: output.status.to_string(),
            stderr: stderr_tail(&output.stderr),
        });
    }

    Ok(output)
}

/// A running tool whose stdout the caller reads incrementally.
///
/// stderr is drained on a separate task so a chatty tool never blocks on a
/// full pipe.
pub(crate) struct StreamingTool {
    tool: String,
    child: Child,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl StreamingTool {
    pub(crate) fn spawn<I, S>(program: &str, args: I) -> Result<Self, ToolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                tool: program.to_string(),
                source,
            })?;

        let stderr = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                buf
            })
        });

        Ok(Self {
            tool: program.to_string(),
            child,
            stderr,
        })
    }

    pub(crate) fn stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Wait for exit. Non-zero exit is an error carrying the stderr tail.
    pub(crate) async fn finish(mut self) -> Result<ExitStatus, ToolError> {
        let status = self.child.wait().await.map_err(|source| ToolError::Wait {
            tool: self.tool.clone(),
            source,
        })?;

        let stderr = match self.stderr.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };

        if !status.success() {
            return Err(ToolError::Failed {
                tool: self.tool,
                status: status.to_string(),
                stderr: stderr_tail(&stderr),
            });
        }
        Ok(status)
    }
}
