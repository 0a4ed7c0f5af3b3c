//! Respawn-on-panic supervision for the long-lived background tasks
//! (scheduler ticker, idle reaper, persistence writer). Assistant handlers
//! are deliberately not supervised: the user decides their fate via
//! `@@new` / `@@switch`.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

const RESTART_DELAY: Duration = Duration::from_secs(1);

pub fn supervise<F, Fut>(name: &'static str, factory: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let task = tokio::spawn(factory());
            match task.await {
                Ok(()) => {
                    info!("{} task finished", name);
                    break;
                }
                Err(e) if e.is_panic() => {
                    error!("{} task panicked, restarting", name);
                    tokio::time::sleep(RESTART_DELAY).await;
                }
                Err(_) => break,
            }
        }
    })
}
