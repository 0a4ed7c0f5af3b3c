//! Shared test doubles: a scripted in-memory assistant handler and a
//! recording chat transport.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::assistant::stream::ChunkBuffer;
use crate::assistant::{
    AssistantHandler, HandlerFactory, HandlerHealth, HandlerState, LaunchOptions, OutputStream,
};
use crate::error::{HandlerError, TransportError};
use crate::transport::ChatTransport;

#[derive(Clone)]
pub(crate) enum ScriptedBehavior {
    /// Reply to every input with `echo: <input>`.
    Echo,
    /// Accept input but never produce a reply.
    Hang,
}

impl ScriptedBehavior {
    pub(crate) fn echo() -> Self {
        ScriptedBehavior::Echo
    }
}

pub(crate) struct ScriptedHandler {
    behavior: ScriptedBehavior,
    state: Mutex<HandlerState>,
    chunks: Arc<ChunkBuffer>,
    hanging: AtomicBool,
}

impl ScriptedHandler {
    pub(crate) fn new(behavior: ScriptedBehavior) -> Self {
        Self {
            behavior,
            state: Mutex::new(HandlerState::Idle),
            chunks: ChunkBuffer::new(256),
            hanging: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl AssistantHandler for ScriptedHandler {
    async fn start(
        &self,
        _project_dir: &Path,
        _session_id: &str,
        _opts: LaunchOptions,
    ) -> Result<(), HandlerError> {
        *self.state.lock().unwrap() = HandlerState::Running;
        Ok(())
    }

    async fn send(&self, text: &str) -> Result<(), HandlerError> {
        if *self.state.lock().unwrap() != HandlerState::Running {
            return Err(HandlerError::NotRunning);
        }
        match &self.behavior {
            ScriptedBehavior::Echo => {
                self.hanging.store(false, Ordering::SeqCst);
                self.chunks.push(format!("echo: {}\n", text));
            }
            ScriptedBehavior::Hang => {
                self.hanging.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    fn stream(&self) -> OutputStream {
        OutputStream::new(self.chunks.clone())
    }

    async fn wait_reply(&self, timeout: Duration) -> Result<(), HandlerError> {
        if self.hanging.load(Ordering::SeqCst) {
            tokio::time::sleep(timeout).await;
            return Err(HandlerError::Timeout(timeout));
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        Ok(())
    }

    async fn execute(&self, text: &str, timeout: Duration) -> Result<String, HandlerError> {
        self.send(text).await?;
        self.wait_reply(timeout).await?;
        let mut stream = self.stream();
        let mut collected = String::new();
        while let Some(chunk) = stream.try_next() {
            collected.push_str(&chunk);
        }
        Ok(collected)
    }

    async fn terminate(&self) -> Result<(), HandlerError> {
        *self.state.lock().unwrap() = HandlerState::Terminated;
        self.chunks.close();
        Ok(())
    }

    async fn health(&self) -> HandlerHealth {
        HandlerHealth {
            running: self.state().is_live(),
            exit_code: None,
            uptime_secs: 0,
            bytes_in: 0,
            bytes_out: 0,
            external_session_id: None,
        }
    }

    fn state(&self) -> HandlerState {
        *self.state.lock().unwrap()
    }
}

pub(crate) fn scripted_factory(behavior: ScriptedBehavior) -> HandlerFactory {
    Arc::new(move |_config| {
        Arc::new(ScriptedHandler::new(behavior.clone())) as Arc<dyn AssistantHandler>
    })
}

/// Chat transport that records every outbound message, optionally failing
/// the first N sends.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    sent: Mutex<Vec<(String, String)>>,
    fail_first: AtomicU32,
}

impl RecordingTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn failing(times: u32) -> Arc<Self> {
        let transport = Self::default();
        transport.fail_first.store(times, Ordering::SeqCst);
        Arc::new(transport)
    }

    pub(crate) fn messages(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send(&self, channel: &str, text: &str) -> Result<(), TransportError> {
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Api("simulated outage".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((channel.to_string(), text.to_string()));
        Ok(())
    }
}
