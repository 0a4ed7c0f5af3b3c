//! Assistant handler contract and the subprocess implementation.
//!
//! A handler owns exactly one assistant process bound to a project
//! directory and mediates its streaming I/O. The registry, router, queues,
//! and scheduler only ever see the [`AssistantHandler`] trait, so an
//! alternate (non-subprocess) implementation can be substituted without
//! touching any of them.

pub(crate) mod stream;
mod subprocess;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AssistantConfig;
use crate::error::HandlerError;

pub use stream::OutputStream;
pub use subprocess::SubprocessHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    StreamJson,
}

impl OutputFormat {
    pub fn as_flag(self) -> &'static str {
        match self {
            OutputFormat::Text => "text",
            OutputFormat::Json => "json",
            OutputFormat::StreamJson => "stream-json",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerState {
    Idle,
    Starting,
    Running,
    Processing,
    Terminating,
    Terminated,
    Error,
}

impl HandlerState {
    pub fn as_str(self) -> &'static str {
        match self {
            HandlerState::Idle => "idle",
            HandlerState::Starting => "starting",
            HandlerState::Running => "running",
            HandlerState::Processing => "processing",
            HandlerState::Terminating => "terminating",
            HandlerState::Terminated => "terminated",
            HandlerState::Error => "error",
        }
    }

    pub fn is_live(self) -> bool {
        matches!(self, HandlerState::Running | HandlerState::Processing)
    }
}

pub fn can_transition(from: HandlerState, to: HandlerState) -> bool {
    if from == to {
        return true;
    }
    // Any state may fall into Error; Error only drains into Terminated.
    if to == HandlerState::Error {
        return from != HandlerState::Terminated;
    }
    match from {
        HandlerState::Idle => matches!(to, HandlerState::Starting),
        HandlerState::Starting => matches!(to, HandlerState::Running | HandlerState::Terminating),
        HandlerState::Running => matches!(to, HandlerState::Processing | HandlerState::Terminating),
        HandlerState::Processing => matches!(to, HandlerState::Running | HandlerState::Terminating),
        HandlerState::Terminating => matches!(to, HandlerState::Terminated),
        HandlerState::Terminated => false,
        HandlerState::Error => matches!(to, HandlerState::Terminated),
    }
}

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Resume a previous assistant-side conversation by its id.
    pub resume_id: Option<String>,
    /// Continue the most recent assistant-side conversation. Mutually
    /// exclusive with `resume_id`; resume wins when both are set.
    pub continue_last: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandlerHealth {
    pub running: bool,
    pub exit_code: Option<i32>,
    pub uptime_secs: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub external_session_id: Option<String>,
}

#[async_trait]
pub trait AssistantHandler: Send + Sync {
    /// Spawn the assistant bound to `project_dir`. Fails with
    /// `HandlerError::Startup` when the executable or directory is missing
    /// or the process dies inside the startup probe window.
    async fn start(
        &self,
        project_dir: &Path,
        session_id: &str,
        opts: LaunchOptions,
    ) -> Result<(), HandlerError>;

    /// Write one line of input. The handler must be in `Running`.
    async fn send(&self, text: &str) -> Result<(), HandlerError>;

    /// Text chunks parsed from stdout, in parse order. Finite; ends on
    /// process exit or termination.
    fn stream(&self) -> OutputStream;

    /// Resolves when the reply to the most recent `send` is complete
    /// (prompt marker, quiet window, or process exit).
    async fn wait_reply(&self, timeout: Duration) -> Result<(), HandlerError>;

    /// Single-shot exchange: send, wait for completion, return the
    /// collected output.
    async fn execute(&self, text: &str, timeout: Duration) -> Result<String, HandlerError>;

    /// Graceful stop with forceful escalation. Idempotent.
    async fn terminate(&self) -> Result<(), HandlerError>;

    async fn health(&self) -> HandlerHealth;

    fn state(&self) -> HandlerState;
}

pub type HandlerFactory = Arc<dyn Fn(&AssistantConfig) -> Arc<dyn AssistantHandler> + Send + Sync>;

pub fn subprocess_factory() -> HandlerFactory {
    Arc::new(|config| Arc::new(SubprocessHandler::new(config.clone())) as Arc<dyn AssistantHandler>)
}
