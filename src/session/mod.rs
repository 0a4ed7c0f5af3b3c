//! Session registry: sole owner of live sessions and their handlers.
//!
//! Handlers never hold a reference back to their session; everything goes
//! through the registry by session id, which keeps ownership acyclic and
//! makes the conversation log append-only under one lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::assistant::{
    AssistantHandler, HandlerFactory, HandlerState, LaunchOptions, OutputFormat, OutputStream,
    SubprocessHandler, subprocess_factory,
};
use crate::config::{Config, ProjectConfig};
use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub project_name: String,
    pub project_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub log: Vec<LogEntry>,
    pub active: bool,
}

impl Session {
    fn new(id: String, project: &ProjectConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            project_name: project.name.clone(),
            project_dir: project.path.clone(),
            created_at: now,
            last_activity: now,
            log: Vec::new(),
            active: true,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    fn append(&mut self, role: Role, content: impl Into<String>) {
        self.log.push(LogEntry {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        });
        self.touch();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub project: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub state: HandlerState,
    pub conversation_length: usize,
    pub is_current: bool,
}

struct Entry {
    session: Session,
    handler: Arc<dyn AssistantHandler>,
}

pub struct SessionRegistry {
    config: Arc<Config>,
    factory: HandlerFactory,
    sessions: Mutex<HashMap<String, Entry>>,
    current: Mutex<Option<String>>,
}

impl SessionRegistry {
    pub fn new(config: Arc<Config>) -> Self {
        Self::with_factory(config, subprocess_factory())
    }

    pub fn with_factory(config: Arc<Config>, factory: HandlerFactory) -> Self {
        Self {
            config,
            factory,
            sessions: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
        }
    }

    fn resolve_project(&self, name: &str) -> Result<ProjectConfig, SessionError> {
        let project = self
            .config
            .project(name)
            .ok_or_else(|| SessionError::InvalidProject(name.to_string()))?;
        if !project.path.is_dir() {
            return Err(SessionError::InvalidProject(name.to_string()));
        }
        Ok(project.clone())
    }

    /// Create and start a session for a configured project. The new session
    /// becomes current only when nothing else is.
    pub async fn create(&self, project_name: &str) -> Result<String, SessionError> {
        let project = self.resolve_project(project_name)?;

        {
            let sessions = self.sessions.lock().await;
            let live = sessions.values().filter(|e| e.session.active).count();
            if live >= self.config.max_sessions {
                return Err(SessionError::LimitExceeded(self.config.max_sessions));
            }
        }

        let id = {
            let mut id = Uuid::new_v4().simple().to_string();
            id.truncate(8);
            id
        };

        let handler = (self.factory)(&self.config.assistant);
        handler
            .start(&project.path, &id, LaunchOptions::default())
            .await?;

        let session = Session::new(id.clone(), &project);
        {
            let mut sessions = self.sessions.lock().await;
            // Re-check under the same lock that will record the handler, so
            // concurrent creates cannot overshoot the cap.
            let live = sessions.values().filter(|e| e.session.active).count();
            if live >= self.config.max_sessions {
                drop(sessions);
                let _ = handler.terminate().await;
                return Err(SessionError::LimitExceeded(self.config.max_sessions));
            }
            sessions.insert(id.clone(), Entry { session, handler });
        }

        let mut current = self.current.lock().await;
        if current.is_none() {
            *current = Some(id.clone());
        }

        info!("created session {} for project {}", id, project.name);
        Ok(id)
    }

    /// Mark a session as the routing target for conversational messages.
    /// Process state is untouched.
    pub async fn switch(&self, session_id: &str) -> Result<(), SessionError> {
        {
            let mut sessions = self.sessions.lock().await;
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::NoSuchSession(session_id.to_string()))?;
            if !entry.session.active {
                return Err(SessionError::NoSuchSession(session_id.to_string()));
            }
            entry.session.touch();
        }
        *self.current.lock().await = Some(session_id.to_string());
        Ok(())
    }

    pub async fn current(&self) -> Option<String> {
        self.current.lock().await.clone()
    }

    pub async fn current_project(&self) -> Option<(String, PathBuf)> {
        let current = self.current.lock().await.clone()?;
        let sessions = self.sessions.lock().await;
        sessions
            .get(&current)
            .map(|e| (e.session.project_name.clone(), e.session.project_dir.clone()))
    }

    /// Snapshot taken under the lock; I/O happens after release.
    pub async fn list(&self) -> Vec<SessionSnapshot> {
        let current = self.current.lock().await.clone();
        let sessions = self.sessions.lock().await;
        let mut out: Vec<SessionSnapshot> = sessions
            .values()
            .map(|entry| SessionSnapshot {
                id: entry.session.id.clone(),
                project: entry.session.project_name.clone(),
                created_at: entry.session.created_at,
                last_activity: entry.session.last_activity,
                state: entry.handler.state(),
                conversation_length: entry.session.log.len(),
                is_current: current.as_deref() == Some(entry.session.id.as_str()),
            })
            .collect();
        out.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        out
    }

    /// Forward one line of input, recording it in the conversation log, and
    /// hand back the handler's chunk stream for the reply.
    pub async fn send(&self, session_id: &str, text: &str) -> Result<OutputStream, SessionError> {
        let handler = {
            let mut sessions = self.sessions.lock().await;
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::NoSuchSession(session_id.to_string()))?;
            if !entry.session.active {
                return Err(SessionError::NoSuchSession(session_id.to_string()));
            }
            if !entry.session.project_dir.is_dir() {
                // The project vanished out from under us; retire the session.
                entry.session.active = false;
                let name = entry.session.project_name.clone();
                let handler = entry.handler.clone();
                drop(sessions);
                let _ = handler.terminate().await;
                return Err(SessionError::InvalidProject(name));
            }
            entry.session.append(Role::User, text);
            entry.handler.clone()
        };

        if let Err(e) = handler.send(text).await {
            // A handler that fell over stays listed until reaped, but the
            // session stops being a live routing target.
            if !handler.state().is_live() {
                let mut sessions = self.sessions.lock().await;
                if let Some(entry) = sessions.get_mut(session_id) {
                    entry.session.active = false;
                }
            }
            return Err(e.into());
        }
        Ok(handler.stream())
    }

    pub async fn wait_reply(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let handler = self.handler_of(session_id).await?;
        handler.wait_reply(timeout).await?;
        Ok(())
    }

    pub async fn record_assistant(&self, session_id: &str, text: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.session.append(Role::Assistant, text);
        }
    }

    /// Record a full exchange driven outside the conversational path
    /// (queue runs).
    pub async fn record_exchange(&self, session_id: &str, input: &str, output: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.session.append(Role::User, input);
            entry.session.append(Role::Assistant, output);
        }
    }

    pub async fn handler_of(
        &self,
        session_id: &str,
    ) -> Result<Arc<dyn AssistantHandler>, SessionError> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .filter(|e| e.session.active)
            .map(|e| e.handler.clone())
            .ok_or_else(|| SessionError::NoSuchSession(session_id.to_string()))
    }

    pub async fn find_by_project(&self, project_dir: &Path) -> Option<String> {
        let sessions = self.sessions.lock().await;
        sessions
            .values()
            .find(|e| e.session.active && e.session.project_dir == project_dir)
            .map(|e| e.session.id.clone())
    }

    /// Reuse a live session for the project directory, or create one.
    pub async fn ensure_session_for_dir(
        &self,
        project_dir: &Path,
    ) -> Result<String, SessionError> {
        if let Some(id) = self.find_by_project(project_dir).await {
            return Ok(id);
        }
        let project = self
            .config
            .project_for_dir(project_dir)
            .ok_or_else(|| {
                SessionError::InvalidProject(project_dir.display().to_string())
            })?
            .name
            .clone();
        self.create(&project).await
    }

    pub async fn terminate(&self, session_id: &str) -> Result<(), SessionError> {
        let handler = {
            let mut sessions = self.sessions.lock().await;
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::NoSuchSession(session_id.to_string()))?;
            entry.session.active = false;
            entry.handler.clone()
        };

        if let Err(e) = handler.terminate().await {
            warn!("session {} handler terminate failed: {}", session_id, e);
        }

        {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(session_id);
        }
        let mut current = self.current.lock().await;
        if current.as_deref() == Some(session_id) {
            *current = None;
        }
        info!("terminated session {}", session_id);
        Ok(())
    }

    pub async fn terminate_all(&self) {
        let ids: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions.keys().cloned().collect()
        };
        for id in ids {
            let _ = self.terminate(&id).await;
        }
    }

    /// Retire sessions idle past the configured timeout. Returns the
    /// reaped ids.
    pub async fn reap_idle(&self) -> Vec<String> {
        let cutoff = chrono::Duration::seconds(self.config.session_idle_secs as i64);
        let now = Utc::now();
        let stale: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions
                .values()
                .filter(|e| e.session.active && now - e.session.last_activity > cutoff)
                .map(|e| e.session.id.clone())
                .collect()
        };
        for id in &stale {
            info!("reaping idle session {}", id);
            let _ = self.terminate(id).await;
        }
        stale
    }

    pub async fn count_active(&self) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.values().filter(|e| e.session.active).count()
    }

    /// Short-lived non-interactive exchange. The transient process never
    /// occupies a slot in the session map, so it cannot consume the cap.
    pub async fn execute_one_shot(
        &self,
        project_name: &str,
        text: &str,
        format: OutputFormat,
        timeout: Duration,
    ) -> Result<String, SessionError> {
        let project = self.resolve_project(project_name)?;
        let result = SubprocessHandler::run_one_shot(
            &self.config.assistant,
            &project.path,
            text,
            format,
            timeout,
        )
        .await?;
        Ok(result)
    }
}

/// Periodic idle reaping; runs under the supervisor.
pub async fn run_reaper(registry: Arc<SessionRegistry>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let reaped = registry.reap_idle().await;
        if !reaped.is_empty() {
            info!("idle reaper removed {} session(s)", reaped.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ScriptedBehavior, scripted_factory};

    fn test_config(max_sessions: usize) -> Arc<Config> {
        let mut config = Config::default();
        config.max_sessions = max_sessions;
        let base = std::env::temp_dir().join(format!("ferry-reg-{}", Uuid::new_v4().simple()));
        for name in ["web", "api", "jobs"] {
            let dir = base.join(name);
            std::fs::create_dir_all(&dir).unwrap();
            config.projects.push(ProjectConfig {
                name: name.to_string(),
                path: dir,
                description: String::new(),
            });
        }
        Arc::new(config)
    }

    fn registry(max_sessions: usize) -> SessionRegistry {
        SessionRegistry::with_factory(
            test_config(max_sessions),
            scripted_factory(ScriptedBehavior::echo()),
        )
    }

    #[tokio::test]
    async fn create_sets_first_session_current() {
        let registry = registry(4);
        let id = registry.create("web").await.unwrap();
        assert_eq!(registry.current().await.as_deref(), Some(id.as_str()));

        let other = registry.create("api").await.unwrap();
        assert_ne!(other, id);
        // Second create does not steal the routing target.
        assert_eq!(registry.current().await.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn session_cap_is_enforced() {
        let registry = registry(2);
        registry.create("web").await.unwrap();
        registry.create("api").await.unwrap();
        let err = registry.create("jobs").await.unwrap_err();
        assert!(matches!(err, SessionError::LimitExceeded(2)));
        assert_eq!(registry.count_active().await, 2);
    }

    #[tokio::test]
    async fn unknown_project_is_invalid() {
        let registry = registry(4);
        let err = registry.create("nope").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidProject(_)));
    }

    #[tokio::test]
    async fn switch_to_missing_session_fails() {
        let registry = registry(4);
        let err = registry.switch("ghost").await.unwrap_err();
        assert!(matches!(err, SessionError::NoSuchSession(_)));
    }

    #[tokio::test]
    async fn send_appends_user_entry_and_streams_reply() {
        let registry = registry(4);
        let id = registry.create("web").await.unwrap();

        let mut stream = registry.send(&id, "hello").await.unwrap();
        let chunk = stream.next().await.unwrap();
        assert!(chunk.contains("hello"));
        registry.record_assistant(&id, &chunk).await;

        let sessions = registry.sessions.lock().await;
        let log = &sessions.get(&id).unwrap().session.log;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].role, Role::User);
        assert_eq!(log[0].content, "hello");
        assert_eq!(log[1].role, Role::Assistant);
        assert!(!log[1].content.is_empty());
    }

    #[tokio::test]
    async fn terminate_removes_session_and_clears_current() {
        let registry = registry(4);
        let id = registry.create("web").await.unwrap();
        registry.terminate(&id).await.unwrap();

        assert_eq!(registry.current().await, None);
        assert!(registry.list().await.is_empty());
        let err = registry.send(&id, "anyone there?").await.unwrap_err();
        assert!(matches!(err, SessionError::NoSuchSession(_)));
    }

    #[tokio::test]
    async fn terminate_is_propagated_to_handler() {
        let registry = registry(4);
        let id = registry.create("web").await.unwrap();
        let handler = registry.handler_of(&id).await.unwrap();
        registry.terminate(&id).await.unwrap();
        assert_eq!(handler.state(), HandlerState::Terminated);
    }

    #[tokio::test]
    async fn reap_idle_removes_stale_sessions() {
        let registry = registry(4);
        let id = registry.create("web").await.unwrap();
        {
            let mut sessions = registry.sessions.lock().await;
            sessions.get_mut(&id).unwrap().session.last_activity =
                Utc::now() - chrono::Duration::hours(2);
        }
        let reaped = registry.reap_idle().await;
        assert_eq!(reaped, vec![id]);
        assert_eq!(registry.count_active().await, 0);
    }

    #[tokio::test]
    async fn vanished_project_dir_retires_session_on_send() {
        let registry = registry(4);
        let id = registry.create("web").await.unwrap();
        let dir = {
            let sessions = registry.sessions.lock().await;
            sessions.get(&id).unwrap().session.project_dir.clone()
        };
        std::fs::remove_dir_all(&dir).unwrap();

        let err = registry.send(&id, "hello").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidProject(_)));
        assert_eq!(registry.count_active().await, 0);
    }

    #[tokio::test]
    async fn ensure_session_reuses_live_session() {
        let registry = registry(4);
        let id = registry.create("web").await.unwrap();
        let dir = registry.config.project("web").unwrap().path.clone();
        let again = registry.ensure_session_for_dir(&dir).await.unwrap();
        assert_eq!(id, again);
    }
}
