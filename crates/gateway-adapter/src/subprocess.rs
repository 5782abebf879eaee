//! `ModelAdapter`: spawns a provider subprocess in its own process group,
//! drains its stdout/stderr, and decodes its output as either a stream of
//! typed events or one accumulated batch result.
//!
//! The continuous-drain pattern mirrors a background mpsc-consumer loop,
//! retargeted from an inbound channel to a child process's stdout/stderr
//! pipes.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::process::CommandExt;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

use gateway_core::constants::{ADAPTER_KILL_GRACE_MS, ADAPTER_MAX_RUNTIME_MS};
use gateway_core::error::GatewayError;
use gateway_sse::StreamEvent;

const STDERR_TAIL_CAPACITY: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterMode {
    Stream,
    Batch,
}

/// How to launch and bound one provider subprocess invocation.
#[derive(Clone, Debug)]
pub struct AdapterConfig {
    pub command: String,
    pub args: Vec<String>,
    pub mode: AdapterMode,
    pub kill_grace: Duration,
    pub max_runtime: Duration,
}

impl AdapterConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>, mode: AdapterMode) -> Self {
        Self {
            command: command.into(),
            args,
            mode,
            kill_grace: Duration::from_millis(ADAPTER_KILL_GRACE_MS),
            max_runtime: Duration::from_millis(ADAPTER_MAX_RUNTIME_MS),
        }
    }
}

/// Owns a running subprocess's plumbing. Dropping it leaves the child
/// running; callers that need teardown must call `kill` explicitly.
pub struct ModelAdapter;

impl ModelAdapter {
    /// Spawns `config.command` in its own session/process group and writes
    /// `input` to its stdin, closing the write half once written so the
    /// child sees EOF.
    fn spawn(config: &AdapterConfig) -> Result<Child, GatewayError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        // SAFETY: `setsid` is async-signal-safe and is the only thing this
        // closure does; it runs in the forked child before exec.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
            });
        }

        cmd.spawn()
            .map_err(|e| GatewayError::AdapterSpawnFailed(e.to_string()))
    }

    #[cfg(unix)]
    fn process_group(child: &Child) -> Result<Pid, GatewayError> {
        let pid = child
            .id()
            .ok_or_else(|| GatewayError::AdapterSpawnFailed("child has no pid".to_string()))?;
        // `setsid` makes the child its own session and process-group leader,
        // so the group id equals the child's own pid.
        Ok(Pid::from_raw(pid as i32))
    }

    /// Streaming mode: spawns the child and returns a handle that yields
    /// decoded `StreamEvent`s as they arrive on stdout.
    pub async fn spawn_streaming(config: AdapterConfig, input: &str) -> Result<StreamHandle, GatewayError> {
        let mut child = Self::spawn(&config)?;
        write_stdin(&mut child, input).await?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::AdapterSpawnFailed("no stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GatewayError::AdapterSpawnFailed("no stderr pipe".to_string()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stdout_task = tokio::spawn(drain_stdout_stream(stdout, events_tx));

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_CAPACITY)));
        let stderr_task = tokio::spawn(drain_stderr(stderr, stderr_tail.clone()));

        #[cfg(unix)]
        let pgid = Self::process_group(&child)?;

        Ok(StreamHandle {
            child,
            #[cfg(unix)]
            pgid,
            events_rx,
            stderr_tail,
            stdout_task: Some(stdout_task),
            stderr_task: Some(stderr_task),
            kill_grace: config.kill_grace,
            max_runtime: config.max_runtime,
        })
    }

    /// Batch mode: spawns the child, writes `input`, waits for exit (bounded
    /// by `config.max_runtime`, escalating to a kill on timeout), then
    /// parses the complete stdout.
    pub async fn run_batch(config: AdapterConfig, input: &str) -> Result<BatchResult, GatewayError> {
        let mut child = Self::spawn(&config)?;
        write_stdin(&mut child, input).await?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::AdapterSpawnFailed("no stdout pipe".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| GatewayError::AdapterSpawnFailed("no stderr pipe".to_string()))?;

        #[cfg(unix)]
        let pgid = Self::process_group(&child)?;

        let read_all = async {
            use tokio::io::AsyncReadExt;
            let mut out = String::new();
            let mut err = String::new();
            tokio::try_join!(stdout.read_to_string(&mut out), stderr.read_to_string(&mut err))?;
            Ok::<(String, String), std::io::Error>((out, err))
        };

        let outcome = tokio::time::timeout(config.max_runtime, async {
            let (stdout_buf, stderr_buf) = read_all.await?;
            child.wait().await?;
            Ok::<(String, String), std::io::Error>((stdout_buf, stderr_buf))
        })
        .await;

        let (stdout_buf, stderr_buf) = match outcome {
            Ok(Ok(bufs)) => bufs,
            Ok(Err(e)) => return Err(GatewayError::Io(e.to_string())),
            Err(_) => {
                #[cfg(unix)]
                escalated_kill(&mut child, pgid, config.kill_grace).await?;
                #[cfg(not(unix))]
                let _ = child.start_kill();
                return Err(GatewayError::AdapterTimedOut {
                    max_runtime_ms: config.max_runtime.as_millis() as u64,
                });
            }
        };

        if !stderr_buf.is_empty() {
            tracing::debug!(stderr = %stderr_buf.trim_end(), "adapter stderr (batch mode)");
        }

        Ok(parse_batch(&stdout_buf))
    }
}

async fn write_stdin(child: &mut Child, input: &str) -> Result<(), GatewayError> {
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|e| GatewayError::Io(e.to_string()))?;
        stdin.shutdown().await.map_err(|e| GatewayError::Io(e.to_string()))?;
        // dropping `stdin` here closes the child's read end
    }
    Ok(())
}

async fn drain_stdout_stream<R>(stdout: R, events_tx: mpsc::UnboundedSender<StreamEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<StreamEvent>(line) {
                    Ok(event) => {
                        if events_tx.send(event).is_err() {
                            break; // receiver dropped, nothing left to do
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, line, "dropping malformed adapter stream line");
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "error reading adapter stdout");
                break;
            }
        }
    }
}

async fn drain_stderr<R>(stderr: R, tail: Arc<Mutex<VecDeque<String>>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(line = %line, "adapter stderr");
        let mut tail = tail.lock().expect("stderr tail mutex poisoned");
        if tail.len() == STDERR_TAIL_CAPACITY {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

#[cfg(unix)]
async fn escalated_kill(child: &mut Child, pgid: Pid, grace: Duration) -> Result<(), GatewayError> {
    let _ = killpg(pgid, Signal::SIGTERM);
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return verify_group_empty(pgid);
    }

    let _ = killpg(pgid, Signal::SIGKILL);
    let _ = tokio::time::timeout(grace, child.wait()).await;
    verify_group_empty(pgid)
}

#[cfg(unix)]
fn verify_group_empty(pgid: Pid) -> Result<(), GatewayError> {
    match killpg(pgid, None::<Signal>) {
        // ESRCH: no process in that group remains.
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(_) => Ok(()), // any other errno (e.g. EPERM racing reuse) is not our business here
        Ok(()) => {
            let _ = killpg(pgid, Signal::SIGKILL);
            match killpg(pgid, None::<Signal>) {
                Err(nix::errno::Errno::ESRCH) => Ok(()),
                _ => Err(GatewayError::AdapterProcessGroupSurvivedKill(pgid.as_raw())),
            }
        }
    }
}

/// A running streaming-mode adapter invocation.
pub struct StreamHandle {
    child: Child,
    #[cfg(unix)]
    pgid: Pid,
    events_rx: mpsc::UnboundedReceiver<StreamEvent>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stdout_task: Option<tokio::task::JoinHandle<()>>,
    stderr_task: Option<tokio::task::JoinHandle<()>>,
    kill_grace: Duration,
    max_runtime: Duration,
}

impl StreamHandle {
    /// Awaits the next decoded event. Returns `None` once stdout has closed
    /// and every buffered event has been delivered.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events_rx.recv().await
    }

    /// The most recent stderr lines, oldest first. Bounded, for diagnostics
    /// attached to a failed or aborted run.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.lock().expect("stderr tail mutex poisoned").iter().cloned().collect()
    }

    /// Waits for the child to exit naturally, bounded by `max_runtime`. On
    /// timeout, performs the escalated kill and returns `AdapterTimedOut`.
    pub async fn wait(&mut self) -> Result<std::process::ExitStatus, GatewayError> {
        match tokio::time::timeout(self.max_runtime, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.join_drain_tasks().await;
                Ok(status)
            }
            Ok(Err(e)) => Err(GatewayError::Io(e.to_string())),
            Err(_) => {
                self.kill().await?;
                Err(GatewayError::AdapterTimedOut {
                    max_runtime_ms: self.max_runtime.as_millis() as u64,
                })
            }
        }
    }

    /// Escalated kill: SIGTERM to the process group, grace period, SIGKILL to
    /// the process group, then verify the group is empty (force-killing
    /// again if it isn't).
    pub async fn kill(&mut self) -> Result<(), GatewayError> {
        #[cfg(unix)]
        {
            escalated_kill(&mut self.child, self.pgid, self.kill_grace).await?;
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
        }
        self.join_drain_tasks().await;
        Ok(())
    }

    async fn join_drain_tasks(&mut self) {
        if let Some(task) = self.stdout_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.stderr_task.take() {
            let _ = task.await;
        }
    }
}

/// The accumulated result of a batch-mode invocation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchResult {
    pub content: String,
    pub usage: Option<(u64, u64)>,
    pub events: Vec<StreamEvent>,
}

fn parse_batch(raw: &str) -> BatchResult {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return BatchResult::default();
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return batch_result_from_single_value(value);
    }

    let mut result = BatchResult::default();
    for line in trimmed.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<StreamEvent>(line) {
            Ok(event) => {
                accumulate(&mut result, &event);
                result.events.push(event);
            }
            Err(e) => {
                tracing::warn!(error = %e, line, "dropping malformed adapter batch line");
            }
        }
    }
    result
}

fn batch_result_from_single_value(value: serde_json::Value) -> BatchResult {
    if let Ok(event) = serde_json::from_value::<StreamEvent>(value.clone()) {
        let mut result = BatchResult::default();
        accumulate(&mut result, &event);
        result.events.push(event);
        return result;
    }

    let content = value
        .get("content")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_default();
    let usage = value.get("usage").and_then(|u| {
        let prompt = u.get("prompt_tokens")?.as_u64()?;
        let completion = u.get("completion_tokens")?.as_u64()?;
        Some((prompt, completion))
    });
    BatchResult {
        content,
        usage,
        events: Vec::new(),
    }
}

fn accumulate(result: &mut BatchResult, event: &StreamEvent) {
    match event {
        StreamEvent::Chunk { delta } => result.content.push_str(delta),
        StreamEvent::ToolCall { fragment } => result.content.push_str(fragment),
        StreamEvent::Usage {
            prompt_tokens,
            completion_tokens,
            ..
        } => result.usage = Some((*prompt_tokens, *completion_tokens)),
        StreamEvent::Done { .. } | StreamEvent::Error { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_batch_accumulates_jsonl_chunks_into_content() {
        let raw = "{\"type\":\"chunk\",\"delta\":\"hel\"}\n{\"type\":\"chunk\",\"delta\":\"lo\"}\n{\"type\":\"usage\",\"prompt_tokens\":3,\"completion_tokens\":2}\n";
        let result = parse_batch(raw);
        assert_eq!(result.content, "hello");
        assert_eq!(result.usage, Some((3, 2)));
    }

    #[test]
    fn parse_batch_accepts_single_whole_object_with_content_field() {
        let raw = r#"{"content":"full answer","usage":{"prompt_tokens":10,"completion_tokens":4}}"#;
        let result = parse_batch(raw);
        assert_eq!(result.content, "full answer");
        assert_eq!(result.usage, Some((10, 4)));
    }

    #[test]
    fn parse_batch_drops_malformed_lines_and_keeps_the_rest() {
        let raw = "not json at all\n{\"type\":\"chunk\",\"delta\":\"ok\"}\n";
        let result = parse_batch(raw);
        assert_eq!(result.content, "ok");
    }

    #[test]
    fn parse_batch_empty_output_yields_default() {
        let result = parse_batch("   \n");
        assert_eq!(result, BatchResult::default());
    }

    #[tokio::test]
    async fn spawn_streaming_decodes_lines_and_drops_malformed_ones() {
        let config = AdapterConfig::new(
            "sh",
            vec![
                "-c".to_string(),
                "printf '%s\\n' '{\"type\":\"chunk\",\"delta\":\"a\"}' 'garbage' '{\"type\":\"done\",\"finish_reason\":\"stop\"}'".to_string(),
            ],
            AdapterMode::Stream,
        );
        let mut handle = ModelAdapter::spawn_streaming(config, "").await.expect("spawn succeeds");
        let mut events = Vec::new();
        while let Some(event) = handle.next_event().await {
            events.push(event);
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Chunk { delta: "a".into() });
        assert_eq!(events[1], StreamEvent::Done { finish_reason: "stop".into() });
        handle.wait().await.expect("child exits cleanly");
    }

    #[tokio::test]
    async fn run_batch_waits_for_exit_and_parses_stdout() {
        let config = AdapterConfig::new(
            "sh",
            vec!["-c".to_string(), "printf '%s' '{\"content\":\"hi\"}'".to_string()],
            AdapterMode::Batch,
        );
        let result = ModelAdapter::run_batch(config, "").await.expect("batch run succeeds");
        assert_eq!(result.content, "hi");
    }

    #[tokio::test]
    async fn kill_terminates_a_long_running_child_and_verifies_group_empty() {
        let config = AdapterConfig::new("sleep", vec!["30".to_string()], AdapterMode::Stream);
        let mut handle = ModelAdapter::spawn_streaming(config, "").await.expect("spawn succeeds");
        handle.kill().await.expect("escalated kill succeeds");
    }
}
