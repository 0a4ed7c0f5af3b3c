//! Slack Web API transport: `chat.postMessage` outbound and a
//! `conversations.history` poller for inbound messages.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ChatMessage, ChatTransport};
use crate::config::SlackConfig;
use crate::error::TransportError;

const API_BASE: &str = "https://slack.com/api";
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const HISTORY_LIMIT: u32 = 50;

pub struct SlackTransport {
    client: reqwest::Client,
    bot_token: String,
}

#[derive(Deserialize)]
struct ApiAck {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct HistoryResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    messages: Vec<HistoryMessage>,
}

#[derive(Deserialize)]
struct HistoryMessage {
    #[serde(default)]
    text: String,
    #[serde(default)]
    user: Option<String>,
    ts: String,
    #[serde(default)]
    thread_ts: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    subtype: Option<String>,
}

impl SlackTransport {
    pub fn new(config: &SlackConfig) -> Arc<Self> {
        Arc::new(Self {
            client: reqwest::Client::new(),
            bot_token: config.bot_token.clone(),
        })
    }

    async fn post(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, TransportError> {
        let response = self
            .client
            .post(format!("{}/{}", API_BASE, method))
            .header("Authorization", format!("Bearer {}", self.bot_token))
            .json(&body)
            .send()
            .await?;
        Ok(response)
    }

    async fn fetch_history(
        &self,
        channel: &str,
        oldest: &str,
    ) -> Result<Vec<HistoryMessage>, TransportError> {
        let response = self
            .post(
                "conversations.history",
                serde_json::json!({
                    "channel": channel,
                    "oldest": oldest,
                    "limit": HISTORY_LIMIT,
                }),
            )
            .await?;
        let parsed: HistoryResponse = response.json().await?;
        if !parsed.ok {
            return Err(TransportError::Api(
                parsed.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        Ok(parsed.messages)
    }

    /// Start the inbound poller for one channel. Messages arrive oldest
    /// first; bot posts and message subtypes (edits, joins) are skipped.
    pub fn spawn_poller(self: &Arc<Self>, channel: String) -> mpsc::Receiver<ChatMessage> {
        let (tx, rx) = mpsc::channel(64);
        let transport = self.clone();
        tokio::spawn(async move {
            // Start at "now" so scrollback is never replayed.
            let mut oldest = format!("{:.6}", Utc::now().timestamp_micros() as f64 / 1_000_000.0);
            info!("slack poller watching channel {}", channel);
            loop {
                match transport.fetch_history(&channel, &oldest).await {
                    Ok(mut messages) => {
                        // Slack returns newest first.
                        messages.reverse();
                        for msg in messages {
                            if msg.ts.as_str() > oldest.as_str() {
                                oldest = msg.ts.clone();
                            }
                            if msg.bot_id.is_some() || msg.subtype.is_some() {
                                continue;
                            }
                            let Some(user) = msg.user else { continue };
                            let inbound = ChatMessage {
                                text: msg.text,
                                user_id: user,
                                channel_id: channel.clone(),
                                timestamp: ts_to_datetime(&msg.ts),
                                thread_ts: msg.thread_ts,
                            };
                            if tx.send(inbound).await.is_err() {
                                debug!("inbound receiver dropped, stopping slack poller");
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("slack history poll failed: {}", e),
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        });
        rx
    }
}

fn ts_to_datetime(ts: &str) -> DateTime<Utc> {
    ts.parse::<f64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs as i64, 0))
        .unwrap_or_else(Utc::now)
}

#[async_trait]
impl ChatTransport for SlackTransport {
    async fn send(&self, channel: &str, text: &str) -> Result<(), TransportError> {
        let response = self
            .post(
                "chat.postMessage",
                serde_json::json!({ "channel": channel, "text": text }),
            )
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Api(format!("http status {}", status)));
        }
        let ack: ApiAck = response.json().await?;
        if !ack.ok {
            return Err(TransportError::Api(
                ack.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        Ok(())
    }
}
