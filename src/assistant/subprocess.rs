//! Subprocess-backed assistant handler.
//!
//! Spawns the configured CLI bound to a project directory, probes it for an
//! early exit, then runs background readers for stdout and stderr. Output is
//! surfaced as a finite stream of text chunks; reply completion is detected
//! by a prompt-ready marker when configured, otherwise by a quiet window
//! after at least one byte of output.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::stream::{ChunkBuffer, OutputStream};
use super::{
    AssistantHandler, HandlerHealth, HandlerState, LaunchOptions, OutputFormat, can_transition,
};
use crate::config::AssistantConfig;
use crate::error::HandlerError;

/// A chunk is emitted at the latest once this much output accumulates
/// without a newline.
const CHUNK_THRESHOLD: usize = 4_096;
const PROBE_POLL: Duration = Duration::from_millis(40);
const REPLY_POLL: Duration = Duration::from_millis(25);
const FORCE_KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitState {
    Running,
    Exited(Option<i32>),
}

#[derive(Default)]
struct ReplyProgress {
    seen_output: bool,
    last_output: Option<Instant>,
    marker_seen: bool,
}

struct Inner {
    config: AssistantConfig,
    state: Mutex<HandlerState>,
    chunks: Arc<ChunkBuffer>,
    stdin: AsyncMutex<Option<ChildStdin>>,
    pid: Mutex<Option<u32>>,
    exit: watch::Sender<ExitState>,
    kill_notify: Notify,
    reply: Mutex<ReplyProgress>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    started_at: Mutex<Option<Instant>>,
    external_session_id: Mutex<Option<String>>,
    stderr_ring: Mutex<VecDeque<u8>>,
    json_lines: Mutex<Vec<serde_json::Value>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn state(&self) -> HandlerState {
        *self.state.lock().unwrap()
    }

    /// Guarded transition; illegal moves are ignored so racing observers
    /// (monitor vs. terminate) cannot corrupt the machine.
    fn set_state(&self, to: HandlerState) -> bool {
        let mut state = self.state.lock().unwrap();
        if can_transition(*state, to) {
            *state = to;
            true
        } else {
            false
        }
    }

    fn exited(&self) -> Option<ExitState> {
        match *self.exit.borrow() {
            ExitState::Running => None,
            exited => Some(exited),
        }
    }

    fn exit_code(&self) -> Option<i32> {
        match *self.exit.borrow() {
            ExitState::Running => None,
            ExitState::Exited(code) => code,
        }
    }

    fn stderr_tail(&self) -> String {
        let ring = self.stderr_ring.lock().unwrap();
        let bytes: Vec<u8> = ring.iter().copied().collect();
        let text = String::from_utf8_lossy(&bytes);
        let tail = text.trim();
        if tail.len() > 512 {
            let mut cut = tail.len() - 512;
            while !tail.is_char_boundary(cut) {
                cut += 1;
            }
            tail[cut..].to_string()
        } else {
            tail.to_string()
        }
    }

    fn push_stderr(&self, bytes: &[u8]) {
        let mut ring = self.stderr_ring.lock().unwrap();
        ring.extend(bytes.iter().copied());
        while ring.len() > self.config.stderr_ring_bytes {
            ring.pop_front();
        }
    }

    fn mark_output(&self) {
        let mut reply = self.reply.lock().unwrap();
        reply.seen_output = true;
        reply.last_output = Some(Instant::now());
    }

    fn begin_reply(&self) {
        *self.reply.lock().unwrap() = ReplyProgress::default();
    }

    /// One parsed line from stdout: marker detection, stream-json handling,
    /// then re-emission as a text chunk.
    fn handle_line(&self, line: String) {
        if let Some(marker) = &self.config.prompt_marker
            && line.contains(marker.as_str())
        {
            self.reply.lock().unwrap().marker_seen = true;
        }

        if self.config.output_format == OutputFormat::StreamJson {
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                match serde_json::from_str::<serde_json::Value>(trimmed) {
                    Ok(value) => {
                        if let Some(id) = value.get("session_id").and_then(|v| v.as_str()) {
                            *self.external_session_id.lock().unwrap() = Some(id.to_string());
                        }
                        self.json_lines.lock().unwrap().push(value);
                    }
                    Err(e) => debug!("stream-json line did not parse: {}", e),
                }
            }
        }

        self.chunks.push(line);
    }
}

pub struct SubprocessHandler {
    inner: Arc<Inner>,
}

impl SubprocessHandler {
    pub fn new(config: AssistantConfig) -> Self {
        let chunks = ChunkBuffer::new(config.chunk_buffer);
        let (exit, _) = watch::channel(ExitState::Running);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(HandlerState::Idle),
                chunks,
                stdin: AsyncMutex::new(None),
                pid: Mutex::new(None),
                exit,
                kill_notify: Notify::new(),
                reply: Mutex::new(ReplyProgress::default()),
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                started_at: Mutex::new(None),
                external_session_id: Mutex::new(None),
                stderr_ring: Mutex::new(VecDeque::new()),
                json_lines: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    fn build_command(&self, project_dir: &Path, opts: &LaunchOptions) -> Command {
        let config = &self.inner.config;
        let mut cmd = Command::new(&config.cli_path);
        cmd.args(&config.default_args);
        if config.output_format != OutputFormat::Text {
            cmd.arg("--output-format").arg(config.output_format.as_flag());
        }
        if let Some(model) = &config.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(resume) = &opts.resume_id {
            cmd.arg("--resume").arg(resume);
        } else if opts.continue_last {
            cmd.arg("--continue");
        }
        cmd.current_dir(project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn fail_startup(&self, message: String) -> HandlerError {
        self.inner.set_state(HandlerState::Error);
        self.inner.set_state(HandlerState::Terminated);
        self.inner.chunks.close();
        HandlerError::Startup(message)
    }

    fn spawn_stdout_reader(&self, mut stdout: ChildStdout) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let mut pending = String::new();
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        if !pending.is_empty() {
                            inner.handle_line(std::mem::take(&mut pending));
                        }
                        break;
                    }
                    Ok(n) => {
                        inner.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                        pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                        while let Some(pos) = pending.find('\n') {
                            let line: String = pending.drain(..=pos).collect();
                            inner.handle_line(line);
                        }
                        if pending.len() >= CHUNK_THRESHOLD {
                            inner.handle_line(std::mem::take(&mut pending));
                        }
                        inner.mark_output();
                    }
                }
            }
        });
        self.inner.tasks.lock().unwrap().push(handle);
    }

    fn spawn_stderr_reader(&self, mut stderr: ChildStderr) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        inner.push_stderr(&buf[..n]);
                        debug!(
                            "assistant stderr: {}",
                            String::from_utf8_lossy(&buf[..n]).trim_end()
                        );
                    }
                }
            }
        });
        self.inner.tasks.lock().unwrap().push(handle);
    }

    fn spawn_monitor(&self, mut child: Child) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()),
                _ = inner.kill_notify.notified() => {
                    let _ = child.start_kill();
                    child.wait().await.ok().and_then(|s| s.code())
                }
            };
            let previous = inner.state();
            if previous.is_live() {
                warn!(
                    "assistant exited unexpectedly (code {:?}); recent stderr: {}",
                    code,
                    inner.stderr_tail()
                );
                inner.set_state(HandlerState::Error);
            } else {
                info!("assistant process exited (code {:?})", code);
            }
            inner.exit.send_replace(ExitState::Exited(code));
            inner.chunks.close();
        });
        self.inner.tasks.lock().unwrap().push(handle);
    }

    async fn wait_for_exit(&self) {
        let mut rx = self.inner.exit.subscribe();
        loop {
            if !matches!(*rx.borrow_and_update(), ExitState::Running) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Non-interactive single-shot: `-p <text>` runs one prompt and exits.
    pub async fn run_one_shot(
        config: &AssistantConfig,
        project_dir: &Path,
        text: &str,
        format: OutputFormat,
        timeout: Duration,
    ) -> Result<String, HandlerError> {
        if !project_dir.is_dir() {
            return Err(HandlerError::Startup(format!(
                "project directory does not exist: {}",
                project_dir.display()
            )));
        }
        if text.len() > config.max_input_len {
            return Err(HandlerError::InputTooLarge {
                len: text.len(),
                max: config.max_input_len,
            });
        }

        let mut cmd = Command::new(&config.cli_path);
        cmd.args(&config.default_args);
        if format != OutputFormat::Text {
            cmd.arg("--output-format").arg(format.as_flag());
        }
        if let Some(model) = &config.model {
            cmd.arg("--model").arg(model);
        }
        cmd.arg("-p")
            .arg(text)
            .current_dir(project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            HandlerError::Startup(format!("could not launch {}: {}", config.cli_path, e))
        })?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| HandlerError::Timeout(timeout))??;

        if !output.status.success() {
            return Err(HandlerError::UnexpectedExit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let collected = String::from_utf8_lossy(&output.stdout).to_string();
        if format == OutputFormat::Json
            && !collected.trim().is_empty()
            && serde_json::from_str::<serde_json::Value>(collected.trim()).is_err()
        {
            warn!("one-shot json output did not parse; returning raw text");
        }
        Ok(collected)
    }
}

#[async_trait]
impl AssistantHandler for SubprocessHandler {
    async fn start(
        &self,
        project_dir: &Path,
        session_id: &str,
        opts: LaunchOptions,
    ) -> Result<(), HandlerError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != HandlerState::Idle {
                return Err(HandlerError::Startup(format!(
                    "handler is {}, not idle",
                    state.as_str()
                )));
            }
            *state = HandlerState::Starting;
        }

        if !project_dir.is_dir() {
            return Err(self.fail_startup(format!(
                "project directory does not exist: {}",
                project_dir.display()
            )));
        }

        info!(
            "starting assistant for session {} in {}",
            session_id,
            project_dir.display()
        );

        let mut cmd = self.build_command(project_dir, &opts);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Err(self.fail_startup(format!(
                    "could not launch {}: {}",
                    self.inner.config.cli_path, e
                )));
            }
        };

        *self.inner.pid.lock().unwrap() = child.id();
        *self.inner.stdin.lock().await = child.stdin.take();
        if let Some(stdout) = child.stdout.take() {
            self.spawn_stdout_reader(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_stderr_reader(stderr);
        }

        // Startup probe: a process that dies this early was misconfigured,
        // not interrupted.
        let deadline = Instant::now() + Duration::from_millis(self.inner.config.startup_probe_ms);
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Err(self.fail_startup(format!(
                        "assistant exited during startup (code {:?}): {}",
                        status.code(),
                        self.inner.stderr_tail()
                    )));
                }
                Ok(None) => {}
                Err(e) => {
                    return Err(self.fail_startup(format!("could not probe assistant: {}", e)));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(PROBE_POLL.min(deadline - now)).await;
        }

        *self.inner.started_at.lock().unwrap() = Some(Instant::now());
        self.inner.set_state(HandlerState::Running);
        self.spawn_monitor(child);
        Ok(())
    }

    async fn send(&self, text: &str) -> Result<(), HandlerError> {
        let max = self.inner.config.max_input_len;
        if text.len() > max {
            return Err(HandlerError::InputTooLarge {
                len: text.len(),
                max,
            });
        }
        if self.inner.state() != HandlerState::Running {
            return Err(HandlerError::NotRunning);
        }

        self.inner.begin_reply();
        {
            let mut stdin = self.inner.stdin.lock().await;
            let stdin = stdin.as_mut().ok_or(HandlerError::NotRunning)?;
            stdin.write_all(text.as_bytes()).await?;
            if !text.ends_with('\n') {
                stdin.write_all(b"\n").await?;
            }
            stdin.flush().await?;
        }
        self.inner
            .bytes_in
            .fetch_add(text.len() as u64 + 1, Ordering::Relaxed);
        self.inner.set_state(HandlerState::Processing);
        Ok(())
    }

    fn stream(&self) -> OutputStream {
        OutputStream::new(self.inner.chunks.clone())
    }

    async fn wait_reply(&self, timeout: Duration) -> Result<(), HandlerError> {
        let deadline = Instant::now() + timeout;
        let quiet = Duration::from_millis(self.inner.config.quiet_window_ms);
        loop {
            if self.inner.exited().is_some() {
                break;
            }
            {
                let reply = self.inner.reply.lock().unwrap();
                if reply.marker_seen {
                    break;
                }
                if reply.seen_output
                    && reply
                        .last_output
                        .is_some_and(|at| at.elapsed() >= quiet)
                {
                    break;
                }
            }
            if Instant::now() >= deadline {
                return Err(HandlerError::Timeout(timeout));
            }
            tokio::time::sleep(REPLY_POLL).await;
        }
        self.inner.set_state(HandlerState::Running);
        Ok(())
    }

    async fn execute(&self, text: &str, timeout: Duration) -> Result<String, HandlerError> {
        self.send(text).await?;

        let mut stream = self.stream();
        let mut collected = String::new();
        let mut done = Box::pin(self.wait_reply(timeout));
        loop {
            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(c) => collected.push_str(&c),
                    None => break,
                },
                res = &mut done => {
                    res?;
                    while let Some(c) = stream.try_next() {
                        collected.push_str(&c);
                    }
                    break;
                }
            }
        }

        if self.inner.config.output_format == OutputFormat::Json
            && !collected.trim().is_empty()
            && serde_json::from_str::<serde_json::Value>(collected.trim()).is_err()
        {
            warn!("assistant json output did not parse; returning raw text");
        }
        Ok(collected)
    }

    async fn terminate(&self) -> Result<(), HandlerError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                HandlerState::Terminated => return Ok(()),
                HandlerState::Idle => {
                    *state = HandlerState::Terminated;
                    self.inner.chunks.close();
                    return Ok(());
                }
                HandlerState::Error => {
                    *state = HandlerState::Terminated;
                    self.inner.chunks.close();
                    return Ok(());
                }
                HandlerState::Terminating => {}
                _ => *state = HandlerState::Terminating,
            }
        }

        // Closing stdin is the first, gentlest signal for a line-driven CLI.
        self.inner.stdin.lock().await.take();

        #[cfg(unix)]
        {
            let pid = if self.inner.exited().is_none() {
                *self.inner.pid.lock().unwrap()
            } else {
                None
            };
            if let Some(pid) = pid {
                let _ = Command::new("kill")
                    .arg("-15")
                    .arg(pid.to_string())
                    .status()
                    .await;
            }
        }

        let grace = Duration::from_secs(self.inner.config.terminate_grace_secs);
        if self.inner.exited().is_none()
            && tokio::time::timeout(grace, self.wait_for_exit())
                .await
                .is_err()
        {
            warn!("assistant did not exit within the grace window; killing");
            self.inner.kill_notify.notify_waiters();
            let _ = tokio::time::timeout(FORCE_KILL_WAIT, self.wait_for_exit()).await;
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        {
            let mut state = self.inner.state.lock().unwrap();
            *state = HandlerState::Terminated;
        }
        self.inner.chunks.close();
        Ok(())
    }

    async fn health(&self) -> HandlerHealth {
        let uptime_secs = self
            .inner
            .started_at
            .lock()
            .unwrap()
            .map(|at| at.elapsed().as_secs())
            .unwrap_or(0);
        HandlerHealth {
            running: self.inner.state().is_live(),
            exit_code: self.inner.exit_code(),
            uptime_secs,
            bytes_in: self.inner.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.inner.bytes_out.load(Ordering::Relaxed),
            external_session_id: self.inner.external_session_id.lock().unwrap().clone(),
        }
    }

    fn state(&self) -> HandlerState {
        self.inner.state()
    }
}
