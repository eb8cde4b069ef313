//! Agent CLI subprocess orchestration.
//!
//! One subprocess per unit of work. The prompt goes in via stdin (no OS
//! arg-length limits), stdout is framed as length-bounded JSON lines, and
//! stderr is drained concurrently so a chatty CLI can never deadlock the
//! stdout reader. Cancellation is cooperative: the token is checked at
//! every suspension point of the read loop, worst-case latency is one
//! line-read plus the graceful-shutdown timeout.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::protocol::{
    agent_message_text, chunk_text, extract_thread_id, turn_failed_message,
};
use crate::error::AgentError;
use crate::model::RetryMode;

/// Flush buffered events to the callback sink at this count...
const EVENT_FLUSH_COUNT: usize = 5;
/// ...or when this much time has passed since the last flush.
const EVENT_FLUSH_INTERVAL: Duration = Duration::from_millis(200);
/// Protocol lines longer than this are dropped, not fatal.
const MAX_LINE_BYTES: usize = 256 * 1024;
/// stderr ring buffer size.
const STDERR_RING_LINES: usize = 200;
/// How many stderr lines are attached to a failure.
const STDERR_TAIL_LINES: usize = 20;
/// Streamed value text is forwarded in chunks of this many chars.
const VALUE_CHUNK_CHARS: usize = 400;

/// Terminal outcome of one CLI run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Everything the caller needs to report the run.
#[derive(Debug, Clone)]
pub struct CliOutcome {
    pub status: RunStatus,
    /// Accumulated streamed text — preserved even on failure so partial
    /// output is not lost.
    pub value: String,
    pub resume_session_id: Option<String>,
    pub stderr_tail: Vec<String>,
    pub error: Option<String>,
}

/// Receives streaming progress during a run. Implementations post
/// callbacks to the dispatch service; failures there are logged by the
/// implementation and never abort the stream.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// A batch of raw protocol events (possibly empty, when only the
    /// resume token changed).
    async fn on_event_batch(&self, events: Vec<Value>, resume_session_id: Option<&str>);

    /// The accumulated assistant text after a new chunk arrived.
    async fn on_value_chunk(&self, accumulated: &str, resume_session_id: Option<&str>);
}

/// Build the codex-style CLI invocation.
///
/// The environment is an explicit, scoped map applied after `env_clear` —
/// credentials reach the child process only, never the parent's ambient
/// environment.
pub fn build_codex_command(
    codex_cmd: &str,
    cwd: &Path,
    model: Option<&str>,
    resume_session_id: Option<&str>,
    retry_mode: Option<RetryMode>,
    env: &HashMap<String, String>,
) -> Command {
    let mut cmd = Command::new(codex_cmd);
    cmd.arg("exec")
        .arg("--json")
        .arg("--dangerously-bypass-approvals-and-sandbox")
        .arg("--skip-git-repo-check")
        .arg("-C")
        .arg(cwd);
    if let Some(model) = model {
        cmd.arg("--model").arg(model);
    }
    if let Some(session) = resume_session_id {
        if retry_mode != Some(RetryMode::NewSession) {
            cmd.arg("resume").arg(session);
        }
    }
    // Prompt is read from stdin.
    cmd.arg("-");

    cmd.current_dir(cwd);
    cmd.env_clear();
    cmd.envs(env);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Ask the child to exit (SIGTERM on unix); the caller force-kills after
/// the graceful timeout.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            return;
        }
    }
    let _ = child.start_kill();
}

async fn flush_events(sink: &dyn ProgressSink, buffered: &mut Vec<Value>, resume: Option<&str>) {
    if buffered.is_empty() {
        return;
    }
    let batch = std::mem::take(buffered);
    sink.on_event_batch(batch, resume).await;
}

/// Run the agent CLI to completion (or cancellation), streaming progress
/// through the sink.
///
/// Cancellation before any output is a no-op completion, not a failure;
/// a non-zero exit attaches the last stderr lines for diagnosis.
pub async fn run_agent_cli(
    mut cmd: Command,
    prompt: &str,
    cancel: CancellationToken,
    graceful_timeout: Duration,
    sink: &dyn ProgressSink,
) -> Result<CliOutcome, AgentError> {
    let cmd_name = format!("{:?}", cmd.as_std().get_program());
    let mut child = cmd.spawn().map_err(|e| AgentError::Spawn {
        cmd: cmd_name,
        source: e,
    })?;

    // Compose the prompt, then close stdin so the CLI starts its turn.
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(prompt.as_bytes()).await?;
        stdin.shutdown().await?;
    }

    // Drain stderr concurrently: a subprocess blocked writing to a full
    // stderr pipe would otherwise stall stdout reading.
    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut ring: VecDeque<String> = VecDeque::new();
        if let Some(stderr) = stderr {
            let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
            while let Some(next) = lines.next().await {
                match next {
                    Ok(line) => {
                        let line = line.trim_end().to_string();
                        if !line.is_empty() {
                            ring.push_back(line);
                            if ring.len() > STDERR_RING_LINES {
                                ring.pop_front();
                            }
                        }
                    }
                    // Overlong or undecodable stderr: keep draining.
                    Err(_) => continue,
                }
            }
        }
        ring
    });

    let mut frames = child
        .stdout
        .take()
        .map(|out| FramedRead::new(out, LinesCodec::new_with_max_length(MAX_LINE_BYTES)));

    let mut buffered: Vec<Value> = Vec::new();
    let mut accumulated = String::new();
    let mut resume: Option<String> = None;
    let mut saw_output = false;
    let mut cancelled = false;
    let mut failure: Option<String> = None;

    let mut flush_timer = interval(EVENT_FLUSH_INTERVAL);
    flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    if let Some(frames) = frames.as_mut() {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    terminate(&mut child);
                    break;
                }
                _ = flush_timer.tick() => {
                    flush_events(sink, &mut buffered, resume.as_deref()).await;
                }
                frame = frames.next() => {
                    match frame {
                        None => break,
                        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                            // The codec discards up to the next newline;
                            // the stream continues.
                            warn!("Dropping overlong agent protocol line");
                        }
                        Some(Err(LinesCodecError::Io(e))) => {
                            warn!(error = %e, "Agent stdout read error");
                            break;
                        }
                        Some(Ok(line)) => {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            let Ok(event) = serde_json::from_str::<Value>(line) else {
                                debug!(
                                    preview = %line.chars().take(200).collect::<String>(),
                                    "Skipping non-JSON line from agent"
                                );
                                continue;
                            };
                            if !event.is_object() {
                                continue;
                            }
                            saw_output = true;

                            buffered.push(event.clone());
                            if buffered.len() >= EVENT_FLUSH_COUNT {
                                flush_events(sink, &mut buffered, resume.as_deref()).await;
                                flush_timer.reset();
                            }

                            if let Some(thread_id) = extract_thread_id(&event) {
                                if resume.as_deref() != Some(thread_id.as_str()) {
                                    resume = Some(thread_id);
                                    // Push the freshly learned token right away:
                                    // a crash mid-stream must still leave it on
                                    // the persisted subtask.
                                    sink.on_event_batch(Vec::new(), resume.as_deref()).await;
                                }
                            }

                            if let Some(text) = agent_message_text(&event) {
                                for chunk in chunk_text(text, VALUE_CHUNK_CHARS) {
                                    accumulated.push_str(&chunk);
                                    sink.on_value_chunk(&accumulated, resume.as_deref()).await;
                                }
                            }

                            if let Some(message) = turn_failed_message(&event) {
                                failure = Some(message);
                                terminate(&mut child);
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    flush_events(sink, &mut buffered, resume.as_deref()).await;

    let exit_status = match timeout(graceful_timeout, child.wait()).await {
        Ok(result) => result?,
        Err(_) => {
            child.kill().await?;
            child.wait().await?
        }
    };

    let stderr_tail: Vec<String> = stderr_task.await.unwrap_or_default().into();

    if cancelled {
        // Cancellation before any output is a no-op completion.
        let status = if saw_output {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        return Ok(CliOutcome {
            status,
            value: accumulated,
            resume_session_id: resume,
            stderr_tail,
            error: None,
        });
    }

    if let Some(message) = failure {
        return Ok(CliOutcome {
            status: RunStatus::Failed,
            value: accumulated,
            resume_session_id: resume,
            stderr_tail,
            error: Some(message),
        });
    }

    let code = exit_status.code().unwrap_or(-1);
    if code != 0 {
        let tail = stderr_tail
            .iter()
            .rev()
            .take(STDERR_TAIL_LINES)
            .rev()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");
        return Ok(CliOutcome {
            status: RunStatus::Failed,
            value: accumulated,
            resume_session_id: resume,
            stderr_tail,
            error: Some(format!(
                "agent CLI exited with code {code}. stderr_tail:\n{tail}"
            )),
        });
    }

    Ok(CliOutcome {
        status: RunStatus::Completed,
        value: accumulated,
        resume_session_id: resume,
        stderr_tail,
        error: None,
    })
}
