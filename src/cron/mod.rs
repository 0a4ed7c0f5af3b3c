//! Cron scheduler: wall-clock schedules that inject catalog tasks into a
//! dedicated per-project queue.
//!
//! The deterministic core is [`SchedulerState`]; the runtime ticker task is
//! its sole writer and receives external operations over a command channel,
//! so schedule state never needs a lock shared with callers.

pub mod catalog;
mod pattern;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{QueueError, ScheduleError};
use crate::queue::QueueManager;
use crate::transport::Outbound;

pub use pattern::CronPattern;

/// Responsiveness ceiling: the ticker re-evaluates at least this often even
/// when the nearest firing is far away.
const TICK_CEILING: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct CronSchedule {
    pub id: u64,
    pub pattern: CronPattern,
    pub tasks: Vec<String>,
    pub project_name: String,
    pub project_dir: PathBuf,
    pub last_run: Option<NaiveDateTime>,
    pub next_run: NaiveDateTime,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleInfo {
    pub id: u64,
    pub pattern: String,
    pub tasks: Vec<String>,
    pub project: String,
    pub enabled: bool,
    pub last_run: Option<String>,
    pub next_run: String,
}

/// One due schedule, resolved to concrete task descriptions.
#[derive(Debug, Clone)]
pub struct Firing {
    pub schedule_id: u64,
    pub project_name: String,
    pub project_dir: PathBuf,
    pub tasks: Vec<(String, String)>,
}

#[derive(Default)]
pub struct SchedulerState {
    schedules: std::collections::BTreeMap<u64, CronSchedule>,
    next_id: u64,
}

impl SchedulerState {
    /// Validate and store a schedule. A rejected pattern or task name
    /// leaves no state behind.
    pub fn schedule(
        &mut self,
        pattern: &str,
        task_names: Vec<String>,
        project_name: String,
        project_dir: PathBuf,
        now: NaiveDateTime,
    ) -> Result<u64, ScheduleError> {
        let pattern = CronPattern::parse(pattern)?;
        if task_names.is_empty() {
            return Err(ScheduleError::UnknownTaskName("(none)".to_string()));
        }
        for name in &task_names {
            if catalog::description(name).is_none() {
                return Err(ScheduleError::UnknownTaskName(name.clone()));
            }
        }
        let next_run = pattern
            .next_after(now)
            .ok_or_else(|| ScheduleError::InvalidPattern {
                pattern: pattern.source().to_string(),
                reason: "pattern never fires".to_string(),
            })?;

        self.next_id += 1;
        let id = self.next_id;
        self.schedules.insert(
            id,
            CronSchedule {
                id,
                pattern,
                tasks: task_names,
                project_name,
                project_dir,
                last_run: None,
                next_run,
                enabled: true,
            },
        );
        Ok(id)
    }

    pub fn list(&self) -> Vec<ScheduleInfo> {
        self.schedules
            .values()
            .map(|s| ScheduleInfo {
                id: s.id,
                pattern: s.pattern.source().to_string(),
                tasks: s.tasks.clone(),
                project: s.project_name.clone(),
                enabled: s.enabled,
                last_run: s.last_run.map(|t| t.format("%Y-%m-%d %H:%M").to_string()),
                next_run: s.next_run.format("%Y-%m-%d %H:%M").to_string(),
            })
            .collect()
    }

    pub fn disable(&mut self, id: u64) -> Result<(), ScheduleError> {
        let schedule = self
            .schedules
            .get_mut(&id)
            .ok_or(ScheduleError::NoSuchSchedule(id))?;
        schedule.enabled = false;
        Ok(())
    }

    pub fn remove(&mut self, id: u64) -> Result<(), ScheduleError> {
        self.schedules
            .remove(&id)
            .map(|_| ())
            .ok_or(ScheduleError::NoSuchSchedule(id))
    }

    /// Due schedules in id order. Each fires once per tick regardless of how
    /// long the process slept; missed windows are not back-filled.
    pub fn tick(&mut self, now: NaiveDateTime) -> Vec<Firing> {
        let mut firings = Vec::new();
        for schedule in self.schedules.values_mut() {
            if !schedule.enabled || schedule.next_run > now {
                continue;
            }
            schedule.last_run = Some(now);
            match schedule.pattern.next_after(now) {
                Some(next) => schedule.next_run = next,
                None => {
                    warn!(
                        "schedule {} has no future firing, disabling",
                        schedule.id
                    );
                    schedule.enabled = false;
                }
            }
            firings.push(Firing {
                schedule_id: schedule.id,
                project_name: schedule.project_name.clone(),
                project_dir: schedule.project_dir.clone(),
                tasks: schedule
                    .tasks
                    .iter()
                    .map(|name| {
                        (
                            name.clone(),
                            catalog::description(name).unwrap_or(name).to_string(),
                        )
                    })
                    .collect(),
            });
        }
        firings
    }

    pub fn next_wake(&self) -> Option<NaiveDateTime> {
        self.schedules
            .values()
            .filter(|s| s.enabled)
            .map(|s| s.next_run)
            .min()
    }
}

enum Command {
    Schedule {
        pattern: String,
        tasks: Vec<String>,
        project_name: String,
        project_dir: PathBuf,
        reply: oneshot::Sender<Result<u64, ScheduleError>>,
    },
    List {
        reply: oneshot::Sender<Vec<ScheduleInfo>>,
    },
    Disable {
        id: u64,
        reply: oneshot::Sender<Result<(), ScheduleError>>,
    },
    Remove {
        id: u64,
        reply: oneshot::Sender<Result<(), ScheduleError>>,
    },
}

#[derive(Clone)]
pub struct CronHandle {
    tx: mpsc::Sender<Command>,
}

impl CronHandle {
    pub async fn schedule(
        &self,
        pattern: &str,
        tasks: Vec<String>,
        project_name: String,
        project_dir: PathBuf,
    ) -> Result<u64, ScheduleError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Schedule {
                pattern: pattern.to_string(),
                tasks,
                project_name,
                project_dir,
                reply,
            })
            .await
            .map_err(|_| ScheduleError::Unavailable)?;
        rx.await.map_err(|_| ScheduleError::Unavailable)?
    }

    pub async fn list(&self) -> Result<Vec<ScheduleInfo>, ScheduleError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::List { reply })
            .await
            .map_err(|_| ScheduleError::Unavailable)?;
        rx.await.map_err(|_| ScheduleError::Unavailable)
    }

    pub async fn disable(&self, id: u64) -> Result<(), ScheduleError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Disable { id, reply })
            .await
            .map_err(|_| ScheduleError::Unavailable)?;
        rx.await.map_err(|_| ScheduleError::Unavailable)?
    }

    pub async fn remove(&self, id: u64) -> Result<(), ScheduleError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Remove { id, reply })
            .await
            .map_err(|_| ScheduleError::Unavailable)?;
        rx.await.map_err(|_| ScheduleError::Unavailable)?
    }
}

/// Everything the ticker needs, shared so a supervisor restart resumes with
/// the same schedules and command channel.
pub struct CronRuntime {
    state: Mutex<SchedulerState>,
    rx: AsyncMutex<mpsc::Receiver<Command>>,
    queues: Arc<QueueManager>,
    outbound: Outbound,
    channel_id: String,
}

pub fn cron_runtime(
    queues: Arc<QueueManager>,
    outbound: Outbound,
    channel_id: String,
) -> (CronHandle, Arc<CronRuntime>) {
    let (tx, rx) = mpsc::channel(16);
    (
        CronHandle { tx },
        Arc::new(CronRuntime {
            state: Mutex::new(SchedulerState::default()),
            rx: AsyncMutex::new(rx),
            queues,
            outbound,
            channel_id,
        }),
    )
}

/// Enqueue a firing's tasks into the project's cron-owned queue.
pub async fn enqueue_firing(queues: &Arc<QueueManager>, firing: &Firing) -> Result<String, QueueError> {
    let queue = format!("cron:{}", firing.project_name);
    for (name, description) in &firing.tasks {
        queues
            .add(&queue, description, firing.project_dir.clone(), 0)
            .await?;
        debug!("cron task '{}' queued into '{}'", name, queue);
    }
    Ok(queue)
}

/// The scheduler loop: sole writer of schedule state. Wakes at the nearest
/// next-run or after the ceiling, corrects for drift by re-reading the
/// clock, and pushes due work into queues.
pub async fn run_ticker(runtime: Arc<CronRuntime>) {
    let mut rx = runtime.rx.lock().await;
    info!("cron scheduler running");
    loop {
        let sleep_for = {
            let state = runtime.state.lock().unwrap();
            let now = Local::now().naive_local();
            state
                .next_wake()
                .map(|wake| {
                    (wake - now)
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                        .min(TICK_CEILING)
                })
                .unwrap_or(TICK_CEILING)
        };

        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else { break };
                let mut state = runtime.state.lock().unwrap();
                let now = Local::now().naive_local();
                match command {
                    Command::Schedule { pattern, tasks, project_name, project_dir, reply } => {
                        let result =
                            state.schedule(&pattern, tasks, project_name, project_dir, now);
                        let _ = reply.send(result);
                    }
                    Command::List { reply } => {
                        let _ = reply.send(state.list());
                    }
                    Command::Disable { id, reply } => {
                        let _ = reply.send(state.disable(id));
                    }
                    Command::Remove { id, reply } => {
                        let _ = reply.send(state.remove(id));
                    }
                }
            }
            _ = tokio::time::sleep(sleep_for) => {
                let firings = {
                    let mut state = runtime.state.lock().unwrap();
                    state.tick(Local::now().naive_local())
                };
                for firing in firings {
                    info!(
                        "schedule {} fired for project {}",
                        firing.schedule_id, firing.project_name
                    );
                    let queue = match enqueue_firing(&runtime.queues, &firing).await {
                        Ok(queue) => queue,
                        Err(e) => {
                            warn!("could not enqueue cron tasks: {}", e);
                            continue;
                        }
                    };
                    match runtime.queues.run(&queue).await {
                        Ok(mut reports) => {
                            let outbound = runtime.outbound.clone();
                            let channel = runtime.channel_id.clone();
                            tokio::spawn(async move {
                                while let Some(report) = reports.recv().await {
                                    outbound
                                        .send(&channel, &crate::router::format_report(&report))
                                        .await;
                                }
                            });
                        }
                        Err(QueueError::QueueBusy(_)) => {
                            debug!("queue '{}' already running, tasks will wait", queue);
                        }
                        Err(e) => warn!("cron queue run failed: {}", e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 5, 4)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    fn add(state: &mut SchedulerState, pattern: &str, now: NaiveDateTime) -> u64 {
        add_with_dir(state, pattern, PathBuf::from("/tmp/web"), now)
    }

    fn add_with_dir(
        state: &mut SchedulerState,
        pattern: &str,
        project_dir: PathBuf,
        now: NaiveDateTime,
    ) -> u64 {
        state
            .schedule(
                pattern,
                vec!["run_tests".to_string()],
                "web".to_string(),
                project_dir,
                now,
            )
            .unwrap()
    }

    #[test]
    fn every_minute_schedule_fires_after_sixty_seconds() {
        let mut state = SchedulerState::default();
        let now = at(12, 0);
        add(&mut state, "*/1 * * * *", now);

        assert!(state.tick(now).is_empty());

        let later = now + chrono::Duration::seconds(60);
        let firings = state.tick(later);
        assert_eq!(firings.len(), 1);
        assert_eq!(
            firings[0].tasks,
            vec![("run_tests".to_string(), "Run project test suite".to_string())]
        );

        let schedule = state.schedules.values().next().unwrap();
        assert_eq!(schedule.last_run, Some(later));
        assert_eq!(schedule.next_run, later + chrono::Duration::seconds(60));
    }

    #[test]
    fn after_tick_next_run_is_in_the_future_or_disabled() {
        let mut state = SchedulerState::default();
        let now = at(12, 0);
        add(&mut state, "*/5 * * * *", now);
        let later = now + chrono::Duration::minutes(10);
        state.tick(later);
        for schedule in state.schedules.values() {
            assert!(!schedule.enabled || schedule.next_run > later);
        }
    }

    #[test]
    fn missed_windows_fire_once_not_backfilled() {
        let mut state = SchedulerState::default();
        let now = at(12, 0);
        add(&mut state, "*/1 * * * *", now);
        // Process slept for an hour; exactly one firing results.
        let later = now + chrono::Duration::hours(1);
        assert_eq!(state.tick(later).len(), 1);
        assert!(state.tick(later).is_empty());
    }

    #[test]
    fn firings_are_processed_in_schedule_id_order() {
        let mut state = SchedulerState::default();
        let now = at(12, 0);
        let first = add(&mut state, "*/1 * * * *", now);
        let second = add(&mut state, "*/1 * * * *", now);
        let firings = state.tick(now + chrono::Duration::minutes(1));
        let ids: Vec<u64> = firings.iter().map(|f| f.schedule_id).collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[test]
    fn invalid_pattern_leaves_no_state() {
        let mut state = SchedulerState::default();
        let err = state
            .schedule(
                "*/0 * * * *",
                vec!["run_tests".to_string()],
                "web".to_string(),
                PathBuf::from("/tmp/web"),
                at(12, 0),
            )
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidPattern { .. }));
        assert!(state.schedules.is_empty());
        assert!(state.list().is_empty());
    }

    #[test]
    fn unknown_task_name_is_rejected() {
        let mut state = SchedulerState::default();
        let err = state
            .schedule(
                "*/1 * * * *",
                vec!["run_tests".to_string(), "mine_bitcoin".to_string()],
                "web".to_string(),
                PathBuf::from("/tmp/web"),
                at(12, 0),
            )
            .unwrap_err();
        assert!(matches!(err, ScheduleError::UnknownTaskName(name) if name == "mine_bitcoin"));
        assert!(state.schedules.is_empty());
    }

    #[test]
    fn disabled_schedules_do_not_fire() {
        let mut state = SchedulerState::default();
        let now = at(12, 0);
        let id = add(&mut state, "*/1 * * * *", now);
        state.disable(id).unwrap();
        assert!(state.tick(now + chrono::Duration::minutes(5)).is_empty());
        assert_eq!(state.next_wake(), None);
    }

    #[test]
    fn remove_returns_state_to_prior_shape() {
        let mut state = SchedulerState::default();
        let now = at(12, 0);
        let before = state.list();
        let id = add(&mut state, "*/1 * * * *", now);
        state.remove(id).unwrap();
        assert_eq!(state.list().len(), before.len());
        assert!(state.tick(now + chrono::Duration::minutes(2)).is_empty());
        assert!(matches!(
            state.remove(id),
            Err(ScheduleError::NoSuchSchedule(_))
        ));
    }

    #[tokio::test]
    async fn firing_lands_in_the_cron_owned_queue() {
        use crate::config::{Config, ProjectConfig};
        use crate::session::SessionRegistry;
        use crate::testutil::{ScriptedBehavior, scripted_factory};

        let base = std::env::temp_dir().join(format!(
            "ferry-cron-{}",
            uuid::Uuid::new_v4().simple()
        ));
        let project_dir = base.join("web");
        std::fs::create_dir_all(&project_dir).unwrap();

        let mut config = Config::default();
        config.data_dir = base;
        config.projects = vec![ProjectConfig {
            name: "web".to_string(),
            path: project_dir.clone(),
            description: String::new(),
        }];
        let config = Arc::new(config);
        let registry = Arc::new(SessionRegistry::with_factory(
            config.clone(),
            scripted_factory(ScriptedBehavior::echo()),
        ));
        let queues = QueueManager::new(config, registry);

        let mut state = SchedulerState::default();
        let now = at(12, 0);
        add_with_dir(&mut state, "*/1 * * * *", project_dir.clone(), now);
        let firings = state.tick(now + chrono::Duration::seconds(60));
        assert_eq!(firings.len(), 1);

        let queue = enqueue_firing(&queues, &firings[0]).await.unwrap();
        assert_eq!(queue, "cron:web");
        let pending = queues.pending_of(&queue).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].description, "Run project test suite");
        assert_eq!(pending[0].project_dir, project_dir);
    }

    #[test]
    fn next_wake_is_the_nearest_enabled_next_run() {
        let mut state = SchedulerState::default();
        let now = at(12, 0);
        add(&mut state, "0 18 * * *", now);
        add(&mut state, "*/1 * * * *", now);
        assert_eq!(state.next_wake(), Some(at(12, 1)));
    }
}
