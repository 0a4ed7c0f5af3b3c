//! Chat transport contract consumed by the core, plus the retrying
//! outbound wrapper. Reconnection and rate limiting live behind the trait;
//! the core only sees send/typing and a lazy inbound sequence.

pub mod slack;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::TransportError;

/// Two-character token that marks a line as a control command.
pub const CONTROL_PREFIX: &str = "@@";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Command,
    Conversation,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub text: String,
    pub user_id: String,
    pub channel_id: String,
    pub timestamp: DateTime<Utc>,
    pub thread_ts: Option<String>,
}

impl ChatMessage {
    pub fn kind(&self) -> MessageKind {
        if self.text.trim_start().starts_with(CONTROL_PREFIX) {
            MessageKind::Command
        } else {
            MessageKind::Conversation
        }
    }
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, channel: &str, text: &str) -> Result<(), TransportError>;

    async fn typing(&self, _channel: &str) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Outbound side with bounded retry. Transient failures back off
/// exponentially; exhaustion is logged and swallowed so a flaky channel
/// never takes the core down.
#[derive(Clone)]
pub struct Outbound {
    transport: Arc<dyn ChatTransport>,
    max_attempts: u32,
    base_backoff: Duration,
}

impl Outbound {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            transport,
            max_attempts: 3,
            base_backoff: Duration::from_millis(250),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_backoff(
        transport: Arc<dyn ChatTransport>,
        max_attempts: u32,
        base_backoff: Duration,
    ) -> Self {
        Self {
            transport,
            max_attempts,
            base_backoff,
        }
    }

    pub async fn send(&self, channel: &str, text: &str) {
        let mut backoff = self.base_backoff;
        for attempt in 1..=self.max_attempts {
            match self.transport.send(channel, text).await {
                Ok(()) => return,
                Err(e) if attempt < self.max_attempts => {
                    debug!("chat send attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    warn!(
                        "chat send failed after {} attempts, dropping message: {}",
                        self.max_attempts, e
                    );
                }
            }
        }
    }

    pub async fn typing(&self, channel: &str) {
        if let Err(e) = self.transport.typing(channel).await {
            debug!("typing indicator failed: {}", e);
        }
    }
}
