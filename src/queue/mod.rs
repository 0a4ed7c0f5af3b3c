//! Named task queues executed iteratively through assistant sessions.
//!
//! Tasks stay in their queue's pending list while running so that a crash
//! mid-run rehydrates them as pending. At most one run per queue is in
//! flight, enforced by a per-queue async lock; different queues run in
//! parallel freely.

pub mod store;
mod task;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{HandlerError, QueueError, SessionError};
use crate::session::SessionRegistry;
use store::{QueueFileEntry, QueueStore, QueuesFile};

pub use task::{QueuedTask, TaskStatus};

struct QueueState {
    pending: Vec<QueuedTask>,
    history: VecDeque<QueuedTask>,
    run_lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
}

impl QueueState {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            history: VecDeque::new(),
            run_lock: Arc::new(Mutex::new(())),
            cancel: CancellationToken::new(),
        }
    }
}

/// One progress item from a queue run, forwarded to the chat channel.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: String,
    pub queue: String,
    pub description: String,
    pub status: TaskStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSummary {
    pub name: String,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub running: bool,
}

pub struct QueueManager {
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    queues: Mutex<HashMap<String, QueueState>>,
    store: Arc<QueueStore>,
}

impl QueueManager {
    /// Rehydrate queues from disk. Tasks left `running` by a crash are
    /// indistinguishable from cancelled ones and go back to pending.
    pub fn new(config: Arc<Config>, registry: Arc<SessionRegistry>) -> Arc<Self> {
        let path = config.queues_file();
        let file = match QueueStore::load(&path) {
            Ok(file) => file,
            Err(e) => {
                warn!("could not load queue state, starting empty: {}", e);
                QueuesFile::default()
            }
        };

        let mut queues = HashMap::new();
        for (name, entry) in file.queues {
            let mut state = QueueState::new();
            for mut task in entry.pending {
                if task.status == TaskStatus::Running {
                    task.status = TaskStatus::Pending;
                    task.started_at = None;
                }
                state.pending.push(task);
            }
            state.history = entry.history.into();
            queues.insert(name, state);
        }
        if !queues.is_empty() {
            info!("rehydrated {} queue(s) from {}", queues.len(), path.display());
        }

        Arc::new(Self {
            config,
            registry,
            queues: Mutex::new(queues),
            store: QueueStore::new(path),
        })
    }

    pub fn store(&self) -> Arc<QueueStore> {
        self.store.clone()
    }

    pub fn flush(&self) {
        if let Err(e) = self.store.flush() {
            warn!("queue state flush failed: {}", e);
        }
    }

    fn snapshot_locked(queues: &HashMap<String, QueueState>) -> QueuesFile {
        let mut file = QueuesFile::default();
        for (name, state) in queues {
            file.queues.insert(
                name.clone(),
                QueueFileEntry {
                    pending: state.pending.clone(),
                    history: state.history.iter().cloned().collect(),
                },
            );
        }
        file
    }

    fn persist_locked(&self, queues: &HashMap<String, QueueState>) {
        self.store.update(Self::snapshot_locked(queues));
    }

    pub async fn add(
        &self,
        queue: &str,
        description: &str,
        project_dir: PathBuf,
        priority: i32,
    ) -> Result<String, QueueError> {
        if description.trim().is_empty() {
            return Err(QueueError::UnknownQueue(queue.to_string()));
        }
        if description.len() > self.config.assistant.max_input_len {
            return Err(QueueError::Session(SessionError::Handler(
                HandlerError::InputTooLarge {
                    len: description.len(),
                    max: self.config.assistant.max_input_len,
                },
            )));
        }

        let mut queues = self.queues.lock().await;
        let state = queues
            .entry(queue.to_string())
            .or_insert_with(QueueState::new);
        if state.pending.len() >= self.config.task_queue_size {
            return Err(QueueError::QueueFull {
                queue: queue.to_string(),
                limit: self.config.task_queue_size,
            });
        }

        let task = QueuedTask::new(queue, description, project_dir, priority);
        let id = task.task_id.clone();
        state.pending.push(task);
        self.persist_locked(&queues);
        info!("queued task {} in '{}': {}", id, queue, description);
        Ok(id)
    }

    /// Start a run for the named queue. Progress arrives on the returned
    /// channel; the run stops on first unretried failure, on cancel, or when
    /// the queue drains.
    pub async fn run(
        self: &Arc<Self>,
        queue: &str,
    ) -> Result<mpsc::Receiver<TaskReport>, QueueError> {
        let (run_guard, cancel) = {
            let mut queues = self.queues.lock().await;
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;
            let guard = state
                .run_lock
                .clone()
                .try_lock_owned()
                .map_err(|_| QueueError::QueueBusy(queue.to_string()))?;
            state.cancel = CancellationToken::new();
            (guard, state.cancel.clone())
        };

        let (tx, rx) = mpsc::channel(32);
        let manager = self.clone();
        let queue = queue.to_string();
        tokio::spawn(async move {
            manager.run_loop(&queue, cancel, tx).await;
            drop(run_guard);
        });
        Ok(rx)
    }

    async fn run_loop(
        self: &Arc<Self>,
        queue: &str,
        cancel: CancellationToken,
        tx: mpsc::Sender<TaskReport>,
    ) {
        let timeout = Duration::from_secs(self.config.task_timeout_secs);
        info!("starting run of queue '{}'", queue);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let Some(task) = self.take_next(queue).await else {
                break;
            };
            let _ = tx
                .send(TaskReport {
                    task_id: task.task_id.clone(),
                    queue: queue.to_string(),
                    description: task.description.clone(),
                    status: TaskStatus::Running,
                    detail: None,
                })
                .await;

            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                res = self.execute_task(&task, timeout) => Some(res),
            };

            match outcome {
                None => {
                    let report = self
                        .finish_task(queue, &task.task_id, |t| t.cancel())
                        .await;
                    if let Some(report) = report {
                        let _ = tx.send(report).await;
                    }
                    break;
                }
                Some(Ok(result)) => {
                    let report = self
                        .finish_task(queue, &task.task_id, |t| t.complete(result.clone()))
                        .await;
                    if let Some(report) = report {
                        let _ = tx.send(report).await;
                    }
                }
                Some(Err(e)) => {
                    let retriable = task.retry_count < self.config.task_retry_limit;
                    if retriable {
                        self.retry_task(queue, &task.task_id).await;
                        info!(
                            "task {} failed ({}); retrying ({}/{})",
                            task.task_id,
                            e,
                            task.retry_count + 1,
                            self.config.task_retry_limit
                        );
                        continue;
                    }
                    let detail = e.to_string();
                    let report = self
                        .finish_task(queue, &task.task_id, |t| t.fail(detail.clone()))
                        .await;
                    if let Some(report) = report {
                        let _ = tx.send(report).await;
                    }
                    // Pause the queue: remaining tasks stay pending and the
                    // failed one is inspectable in history.
                    break;
                }
            }
        }
        info!("run of queue '{}' ended", queue);
    }

    async fn execute_task(
        &self,
        task: &QueuedTask,
        timeout: Duration,
    ) -> Result<String, SessionError> {
        let session = self
            .registry
            .ensure_session_for_dir(&task.project_dir)
            .await?;
        let handler = self.registry.handler_of(&session).await?;
        let output = handler.execute(&task.description, timeout).await?;
        self.registry
            .record_exchange(&session, &task.description, &output)
            .await;
        Ok(output)
    }

    /// Pick the next pending task in priority-then-FIFO order and mark it
    /// running in place (so a crash rehydrates it as pending).
    async fn take_next(&self, queue: &str) -> Option<QueuedTask> {
        let mut queues = self.queues.lock().await;
        let state = queues.get_mut(queue)?;
        state
            .pending
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        let task = state
            .pending
            .iter_mut()
            .find(|t| t.status == TaskStatus::Pending)?;
        task.begin();
        let picked = task.clone();
        self.persist_locked(&queues);
        Some(picked)
    }

    async fn finish_task(
        &self,
        queue: &str,
        task_id: &str,
        apply: impl FnOnce(&mut QueuedTask),
    ) -> Option<TaskReport> {
        let mut queues = self.queues.lock().await;
        let state = queues.get_mut(queue)?;
        let idx = state.pending.iter().position(|t| t.task_id == task_id)?;
        let mut task = state.pending.remove(idx);
        apply(&mut task);
        let report = TaskReport {
            task_id: task.task_id.clone(),
            queue: queue.to_string(),
            description: task.description.clone(),
            status: task.status,
            detail: task.error.clone(),
        };
        state.history.push_back(task);
        while state.history.len() > self.config.queue_history_limit {
            state.history.pop_front();
        }
        self.persist_locked(&queues);
        Some(report)
    }

    async fn retry_task(&self, queue: &str, task_id: &str) {
        let mut queues = self.queues.lock().await;
        if let Some(state) = queues.get_mut(queue)
            && let Some(task) = state.pending.iter_mut().find(|t| t.task_id == task_id)
        {
            task.requeue_for_retry();
            self.persist_locked(&queues);
        }
    }

    pub async fn status(&self, queue: Option<&str>) -> Result<Vec<QueueSummary>, QueueError> {
        let queues = self.queues.lock().await;
        let summarize = |name: &str, state: &QueueState| QueueSummary {
            name: name.to_string(),
            pending: state
                .pending
                .iter()
                .filter(|t| !t.status.is_finished())
                .count(),
            completed: state
                .history
                .iter()
                .filter(|t| t.status == TaskStatus::Completed)
                .count(),
            failed: state
                .history
                .iter()
                .filter(|t| t.status == TaskStatus::Failed)
                .count(),
            cancelled: state
                .history
                .iter()
                .filter(|t| t.status == TaskStatus::Cancelled)
                .count(),
            running: state.run_lock.try_lock().is_err(),
        };

        match queue {
            Some(name) => {
                let state = queues
                    .get(name)
                    .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))?;
                Ok(vec![summarize(name, state)])
            }
            None => {
                let mut out: Vec<QueueSummary> = queues
                    .iter()
                    .map(|(name, state)| summarize(name, state))
                    .collect();
                out.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(out)
            }
        }
    }

    /// Empty the pending list. History stays for inspection.
    pub async fn clear(&self, queue: &str) -> Result<usize, QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;
        let removed = state.pending.len();
        state.pending.clear();
        self.persist_locked(&queues);
        info!("cleared {} task(s) from queue '{}'", removed, queue);
        Ok(removed)
    }

    /// Stop the in-flight run, if any. The current task becomes cancelled.
    pub async fn cancel(&self, queue: &str) -> Result<(), QueueError> {
        let queues = self.queues.lock().await;
        let state = queues
            .get(queue)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;
        state.cancel.cancel();
        Ok(())
    }

    pub async fn history_of(&self, queue: &str) -> Result<Vec<QueuedTask>, QueueError> {
        let queues = self.queues.lock().await;
        let state = queues
            .get(queue)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;
        Ok(state.history.iter().cloned().collect())
    }

    pub async fn pending_of(&self, queue: &str) -> Result<Vec<QueuedTask>, QueueError> {
        let queues = self.queues.lock().await;
        let state = queues
            .get(queue)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;
        Ok(state.pending.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use crate::testutil::{ScriptedBehavior, scripted_factory};
    use uuid::Uuid;

    struct Fixture {
        manager: Arc<QueueManager>,
        registry: Arc<SessionRegistry>,
        project_dir: PathBuf,
    }

    fn fixture(behavior: ScriptedBehavior, mutate: impl FnOnce(&mut Config)) -> Fixture {
        let base = std::env::temp_dir().join(format!("ferry-queue-{}", Uuid::new_v4().simple()));
        let project_dir = base.join("web");
        std::fs::create_dir_all(&project_dir).unwrap();

        let mut config = Config::default();
        config.data_dir = base;
        config.task_timeout_secs = 1;
        config.projects = vec![ProjectConfig {
            name: "web".to_string(),
            path: project_dir.clone(),
            description: String::new(),
        }];
        mutate(&mut config);

        let config = Arc::new(config);
        let registry = Arc::new(SessionRegistry::with_factory(
            config.clone(),
            scripted_factory(behavior),
        ));
        let manager = QueueManager::new(config, registry.clone());
        Fixture {
            manager,
            registry,
            project_dir,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<TaskReport>) -> Vec<TaskReport> {
        let mut out = Vec::new();
        while let Some(report) = rx.recv().await {
            out.push(report);
        }
        out
    }

    #[tokio::test]
    async fn run_completes_tasks_in_order() {
        let fx = fixture(ScriptedBehavior::echo(), |_| {});
        fx.manager
            .add("feat", "do A", fx.project_dir.clone(), 0)
            .await
            .unwrap();
        fx.manager
            .add("feat", "do B", fx.project_dir.clone(), 0)
            .await
            .unwrap();

        let reports = collect(fx.manager.run("feat").await.unwrap()).await;
        let finished: Vec<&TaskReport> = reports
            .iter()
            .filter(|r| r.status.is_finished())
            .collect();
        assert_eq!(finished.len(), 2);
        assert_eq!(finished[0].description, "do A");
        assert_eq!(finished[0].status, TaskStatus::Completed);
        assert_eq!(finished[1].description, "do B");
        assert_eq!(finished[1].status, TaskStatus::Completed);

        let history = fx.manager.history_of("feat").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|t| t.result.is_some()));
        assert!(fx.manager.pending_of("feat").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn priority_beats_fifo_with_stable_ties() {
        let fx = fixture(ScriptedBehavior::echo(), |_| {});
        fx.manager
            .add("q", "low first", fx.project_dir.clone(), 0)
            .await
            .unwrap();
        fx.manager
            .add("q", "high", fx.project_dir.clone(), 5)
            .await
            .unwrap();
        fx.manager
            .add("q", "low second", fx.project_dir.clone(), 0)
            .await
            .unwrap();

        let reports = collect(fx.manager.run("q").await.unwrap()).await;
        let order: Vec<&str> = reports
            .iter()
            .filter(|r| r.status == TaskStatus::Completed)
            .map(|r| r.description.as_str())
            .collect();
        assert_eq!(order, vec!["high", "low first", "low second"]);
    }

    #[tokio::test]
    async fn timeout_fails_task_and_pauses_queue() {
        let fx = fixture(ScriptedBehavior::Hang, |_| {});
        fx.manager
            .add("q1", "hang", fx.project_dir.clone(), 0)
            .await
            .unwrap();
        fx.manager
            .add("q1", "never reached", fx.project_dir.clone(), 0)
            .await
            .unwrap();

        let reports = collect(fx.manager.run("q1").await.unwrap()).await;
        let failed: Vec<&TaskReport> = reports
            .iter()
            .filter(|r| r.status == TaskStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].description, "hang");
        assert!(failed[0].detail.as_deref().unwrap_or("").contains("finish"));

        let status = &fx.manager.status(Some("q1")).await.unwrap()[0];
        assert_eq!(status.failed, 1);
        assert_eq!(status.pending, 1);
    }

    #[tokio::test]
    async fn retry_requeues_before_pausing() {
        let fx = fixture(ScriptedBehavior::Hang, |c| c.task_retry_limit = 1);
        fx.manager
            .add("q", "flaky", fx.project_dir.clone(), 0)
            .await
            .unwrap();

        let reports = collect(fx.manager.run("q").await.unwrap()).await;
        let failed: Vec<&TaskReport> = reports
            .iter()
            .filter(|r| r.status == TaskStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);

        let history = fx.manager.history_of("q").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].retry_count, 1);
    }

    #[tokio::test]
    async fn cancel_stops_run_and_marks_task() {
        let fx = fixture(ScriptedBehavior::Hang, |c| c.task_timeout_secs = 30);
        fx.manager
            .add("q", "hang", fx.project_dir.clone(), 0)
            .await
            .unwrap();

        let mut rx = fx.manager.run("q").await.unwrap();
        let started = rx.recv().await.unwrap();
        assert_eq!(started.status, TaskStatus::Running);

        fx.manager.cancel("q").await.unwrap();
        let mut rest = Vec::new();
        while let Some(report) = rx.recv().await {
            rest.push(report);
        }
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].status, TaskStatus::Cancelled);

        // The lock is released again: a new run may start. The release
        // happens just after the report channel closes, so poll briefly.
        let mut released = false;
        for _ in 0..100 {
            match fx.manager.run("q").await {
                Ok(_) => {
                    released = true;
                    break;
                }
                Err(QueueError::QueueBusy(_)) => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert!(released);
    }

    #[tokio::test]
    async fn second_run_is_rejected_while_busy() {
        let fx = fixture(ScriptedBehavior::Hang, |c| c.task_timeout_secs = 30);
        fx.manager
            .add("q", "hang", fx.project_dir.clone(), 0)
            .await
            .unwrap();

        let mut rx = fx.manager.run("q").await.unwrap();
        let _ = rx.recv().await;
        let err = fx.manager.run("q").await.unwrap_err();
        assert!(matches!(err, QueueError::QueueBusy(_)));
        fx.manager.cancel("q").await.unwrap();
    }

    #[tokio::test]
    async fn empty_description_is_rejected() {
        let fx = fixture(ScriptedBehavior::echo(), |_| {});
        let err = fx
            .manager
            .add("q", "   ", fx.project_dir.clone(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::UnknownQueue(_)));
    }

    #[tokio::test]
    async fn oversized_description_is_rejected() {
        let fx = fixture(ScriptedBehavior::echo(), |c| {
            c.assistant.max_input_len = 8;
        });
        let err = fx
            .manager
            .add("q", "123456789", fx.project_dir.clone(), 0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::Session(SessionError::Handler(HandlerError::InputTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn clear_empties_pending_but_keeps_history() {
        let fx = fixture(ScriptedBehavior::echo(), |_| {});
        fx.manager
            .add("q", "done already", fx.project_dir.clone(), 0)
            .await
            .unwrap();
        collect(fx.manager.run("q").await.unwrap()).await;
        fx.manager
            .add("q", "still pending", fx.project_dir.clone(), 0)
            .await
            .unwrap();

        let removed = fx.manager.clear("q").await.unwrap();
        assert_eq!(removed, 1);
        assert!(fx.manager.pending_of("q").await.unwrap().is_empty());
        assert_eq!(fx.manager.history_of("q").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_of_unknown_queue_fails() {
        let fx = fixture(ScriptedBehavior::echo(), |_| {});
        let err = fx.manager.run("ghost").await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownQueue(_)));
    }

    #[tokio::test]
    async fn crashed_running_tasks_rehydrate_as_pending() {
        let fx = fixture(ScriptedBehavior::echo(), |_| {});
        fx.manager
            .add("q", "interrupted", fx.project_dir.clone(), 0)
            .await
            .unwrap();
        {
            let mut queues = fx.manager.queues.lock().await;
            queues.get_mut("q").unwrap().pending[0].begin();
            fx.manager.persist_locked(&queues);
        }
        fx.manager.flush();

        let reloaded = QueueManager::new(fx.manager.config.clone(), fx.registry.clone());
        let pending = reloaded.pending_of("q").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, TaskStatus::Pending);
        assert!(pending[0].started_at.is_none());
    }

    #[tokio::test]
    async fn queue_run_reuses_one_session_per_project() {
        let fx = fixture(ScriptedBehavior::echo(), |_| {});
        fx.manager
            .add("q", "do A", fx.project_dir.clone(), 0)
            .await
            .unwrap();
        fx.manager
            .add("q", "do B", fx.project_dir.clone(), 0)
            .await
            .unwrap();
        collect(fx.manager.run("q").await.unwrap()).await;
        assert_eq!(fx.registry.count_active().await, 1);
    }
}
