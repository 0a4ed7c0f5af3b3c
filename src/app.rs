//! Application wiring: config → registry → queues → scheduler → router,
//! plus the inbound dispatch loop and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::Config;
use crate::cron;
use crate::queue::QueueManager;
use crate::router::CommandRouter;
use crate::session::{self, SessionRegistry};
use crate::supervisor::supervise;
use crate::transport::{ChatMessage, ChatTransport, Outbound};

pub struct App {
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    queues: Arc<QueueManager>,
    router: Arc<CommandRouter>,
}

impl App {
    pub fn build(config: Config, transport: Arc<dyn ChatTransport>) -> Result<Self> {
        let config = Arc::new(config);
        let outbound = Outbound::new(transport);

        let registry = Arc::new(SessionRegistry::new(config.clone()));
        let queues = QueueManager::new(config.clone(), registry.clone());

        let store = queues.store();
        supervise("queue-writer", move || store.clone().run_writer());

        let (cron, cron_runtime) = cron::cron_runtime(
            queues.clone(),
            outbound.clone(),
            config.slack.channel_id.clone(),
        );
        supervise("cron-ticker", move || cron::run_ticker(cron_runtime.clone()));

        let reaper_registry = registry.clone();
        let reaper_interval = Duration::from_secs(config.reaper_interval_secs);
        supervise("idle-reaper", move || {
            session::run_reaper(reaper_registry.clone(), reaper_interval)
        });

        let router = CommandRouter::new(
            config.clone(),
            registry.clone(),
            queues.clone(),
            cron,
            outbound,
        );

        Ok(Self {
            config,
            registry,
            queues,
            router,
        })
    }

    /// Consume inbound chat messages until the stream ends or ctrl-c.
    /// Each line dispatches on its own task; per-session ordering is
    /// enforced by the handlers, not the loop.
    pub async fn run(&self, mut inbound: mpsc::Receiver<ChatMessage>) -> Result<()> {
        info!(
            "ferry is up: {} project(s), channel {}",
            self.config.projects.len(),
            self.config.slack.channel_id
        );

        loop {
            tokio::select! {
                message = inbound.recv() => {
                    let Some(message) = message else { break };
                    let router = self.router.clone();
                    tokio::spawn(async move {
                        router.dispatch(&message).await;
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("terminating sessions and flushing queue state");
        self.registry.terminate_all().await;
        self.queues.flush();
    }
}
