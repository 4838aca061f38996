//! Spawning and stopping engine process pipelines.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use super::error::EngineError;
use crate::config::{EngineConfig, OutputStream};

/// How long a stage gets to exit after SIGTERM before it is killed.
pub(super) const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// The stream hypotheses are read from.
pub enum EngineOutput {
    Stdout(ChildStdout),
    Stderr(ChildStderr),
}

/// A running pipeline: audio goes into `stdin`, hypotheses come out of `output`.
pub struct Pipeline {
    pub children: Vec<Child>,
    pub stdin: ChildStdin,
    pub output: EngineOutput,
}

/// Spawn every stage of `config`, wiring each stage's stdout into the next
/// stage's stdin.
pub fn spawn_pipeline(config: &EngineConfig, label: &str) -> Result<Pipeline, EngineError> {
    let last = config.stages.len().saturating_sub(1);
    let mut children = Vec::with_capacity(config.stages.len());
    let mut upstream: Option<ChildStdout> = None;
    let mut stdin = None;
    let mut output = None;

    for (i, stage) in config.stages.iter().enumerate() {
        let is_last = i == last;
        let mut command = Command::new(&stage.program);
        command.args(&stage.args).kill_on_drop(true);

        match upstream.take() {
            Some(previous) => {
                let piped: Stdio = previous.try_into()?;
                command.stdin(piped);
            }
            None => {
                command.stdin(Stdio::piped());
            }
        }

        let read_stderr = is_last && config.output == OutputStream::Stderr;
        if read_stderr {
            command.stdout(Stdio::null());
        } else {
            command.stdout(Stdio::piped());
        }
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| EngineError::Spawn {
            program: stage.program.clone(),
            source,
        })?;
        debug!(
            "[{}] Started stage {} '{}' (pid {:?})",
            label,
            i,
            stage.program,
            child.id()
        );

        if i == 0 {
            stdin = child.stdin.take();
        }

        let mut stderr = child.stderr.take();
        let stdout = child.stdout.take();
        if is_last {
            output = match config.output {
                OutputStream::Stdout => stdout.map(EngineOutput::Stdout),
                OutputStream::Stderr => stderr.take().map(EngineOutput::Stderr),
            };
            if let Some(stderr) = stderr {
                drain_to_log(label.to_string(), i, stderr);
            }
        } else {
            upstream = stdout;
            if let Some(stderr) = stderr {
                drain_to_log(label.to_string(), i, stderr);
            }
        }

        children.push(child);
    }

    let stdin = stdin.ok_or_else(|| missing_pipe("stdin"))?;
    let output = output.ok_or_else(|| missing_pipe("output"))?;
    Ok(Pipeline {
        children,
        stdin,
        output,
    })
}

fn missing_pipe(which: &str) -> EngineError {
    EngineError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("engine {} pipe unavailable", which),
    ))
}

/// Log a stage's diagnostic stream so the stage never blocks on a full pipe.
fn drain_to_log<R>(label: String, stage: usize, stream: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("[{}] stage {}: {}", label, stage, line);
        }
    });
}

/// Ask each stage to exit, killing any that outlive the grace period.
pub async fn shutdown(label: &str, children: Vec<Child>) {
    for mut child in children {
        request_exit(&child);
        match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!("[{}] Stage exited: {}", label, status),
            Ok(Err(e)) => warn!("[{}] Failed to wait for stage: {}", label, e),
            Err(_) => {
                warn!("[{}] Stage ignored SIGTERM, killing", label);
                if let Err(e) = child.kill().await {
                    warn!("[{}] Failed to kill stage: {}", label, e);
                }
            }
        }
    }
}

#[cfg(unix)]
fn request_exit(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: kill(2) has no memory-safety preconditions
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn request_exit(child: &Child) {
    // No polite termination signal; the grace wait falls through to kill
    let _ = child;
}
