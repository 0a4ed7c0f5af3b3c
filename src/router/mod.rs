//! Command router: classifies inbound chat lines and dispatches them.
//!
//! A line whose first non-whitespace characters are `@@` is a control
//! command; everything else is conversation forwarded to the current
//! session. The command surface is a closed enum; unknown tokens produce a
//! single well-defined usage message and handler failures are surfaced as
//! one-line channel replies, never stack traces.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::Config;
use crate::cron::CronHandle;
use crate::error::{QueueError, SessionError};
use crate::queue::{QueueManager, TaskReport, TaskStatus};
use crate::session::SessionRegistry;
use crate::transport::{CONTROL_PREFIX, ChatMessage, Outbound};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Projects,
    Switch(String),
    New(String),
    Sessions,
    Quit,
    Help,
    QueueAdd { queue: String, description: String },
    QueueRun(String),
    QueueStatus(Option<String>),
    QueueClear(String),
    Cron { pattern: String, tasks: Vec<String> },
}

/// Whitespace-separated tokens; a token opening with `"` runs to the
/// matching close quote (or end of line), which is how cron patterns with
/// spaces survive tokenization.
pub fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut token = String::new();
        if c == '"' {
            chars.next();
            for inner in chars.by_ref() {
                if inner == '"' {
                    break;
                }
                token.push(inner);
            }
        } else {
            while let Some(&inner) = chars.peek() {
                if inner.is_whitespace() {
                    break;
                }
                token.push(inner);
                chars.next();
            }
        }
        tokens.push(token);
    }
    tokens
}

/// `None` for conversational lines; `Some(Err(usage))` for malformed or
/// unknown commands.
pub fn parse(text: &str) -> Option<Result<Command, String>> {
    let trimmed = text.trim_start();
    let rest = trimmed.strip_prefix(CONTROL_PREFIX)?;

    let tokens = tokenize(rest);
    let Some(name) = tokens.first() else {
        return Some(Err(usage_line()));
    };
    let args = &tokens[1..];

    let command = match name.to_lowercase().as_str() {
        "projects" => Command::Projects,
        "switch" => match args.first() {
            Some(project) => Command::Switch(project.clone()),
            None => return Some(Err("Usage: `@@switch <project>`".to_string())),
        },
        "new" => match args.first() {
            Some(project) => Command::New(project.clone()),
            None => return Some(Err("Usage: `@@new <project>`".to_string())),
        },
        "sessions" => Command::Sessions,
        "quit" | "q" => Command::Quit,
        "help" => Command::Help,
        "queue_add" => {
            if args.len() < 2 {
                return Some(Err(
                    "Usage: `@@queue_add <queue> <description...>`".to_string()
                ));
            }
            let description = args[1..].join(" ");
            if description.trim().is_empty() {
                return Some(Err(
                    "Usage: `@@queue_add <queue> <description...>`".to_string()
                ));
            }
            Command::QueueAdd {
                queue: args[0].clone(),
                description,
            }
        }
        "queue" => match args.first() {
            Some(queue) => Command::QueueRun(queue.clone()),
            None => return Some(Err("Usage: `@@queue <queue>`".to_string())),
        },
        "queue_status" => Command::QueueStatus(args.first().cloned()),
        "queue_clear" => match args.first() {
            Some(queue) => Command::QueueClear(queue.clone()),
            None => return Some(Err("Usage: `@@queue_clear <queue>`".to_string())),
        },
        "cron" => {
            if args.len() < 2 {
                return Some(Err(
                    "Usage: `@@cron \"<pattern>\" <task,task,...>`".to_string()
                ));
            }
            let tasks: Vec<String> = args[1]
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            if tasks.is_empty() {
                return Some(Err(
                    "Usage: `@@cron \"<pattern>\" <task,task,...>`".to_string()
                ));
            }
            Command::Cron {
                pattern: args[0].clone(),
                tasks,
            }
        }
        other => {
            return Some(Err(format!(
                "Unknown command `@@{}`. Try `@@help`.",
                other
            )));
        }
    };
    Some(Ok(command))
}

fn usage_line() -> String {
    "Unknown command. Try `@@help`.".to_string()
}

pub const NO_ACTIVE_SESSION: &str =
    "No active session. Use `@@switch <project>` to start one.";

const HELP_TEXT: &str = "Available commands:\n\
    `@@projects` - list configured projects\n\
    `@@switch <name>` - switch to a project session (created if needed)\n\
    `@@new <name>` - start a fresh session for a project\n\
    `@@sessions` - list sessions\n\
    `@@quit` / `@@q` - terminate the current session\n\
    `@@queue_add <queue> <description...>` - queue a task\n\
    `@@queue <queue>` - run a queue\n\
    `@@queue_status [<queue>]` - queue status\n\
    `@@queue_clear <queue>` - clear a queue\n\
    `@@cron \"<pattern>\" <task,task,...>` - schedule recurring tasks\n\
    Anything else is sent to the current session.";

pub fn format_report(report: &TaskReport) -> String {
    match report.status {
        TaskStatus::Running => format!("▶ Task started: {}", report.description),
        TaskStatus::Completed => format!("✅ Task completed: {}", report.description),
        TaskStatus::Failed => format!(
            "❌ Task failed: {} ({})",
            report.description,
            report.detail.as_deref().unwrap_or("unknown error")
        ),
        TaskStatus::Cancelled => format!("🚫 Task cancelled: {}", report.description),
        TaskStatus::Pending => format!("Task queued: {}", report.description),
    }
}

pub struct CommandRouter {
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    queues: Arc<QueueManager>,
    cron: CronHandle,
    outbound: Outbound,
}

impl CommandRouter {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<SessionRegistry>,
        queues: Arc<QueueManager>,
        cron: CronHandle,
        outbound: Outbound,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            queues,
            cron,
            outbound,
        })
    }

    /// Handle one inbound line end to end. All failures become one-line
    /// channel replies.
    pub async fn dispatch(self: &Arc<Self>, message: &ChatMessage) {
        match parse(&message.text) {
            Some(Ok(command)) => {
                let reply = self.handle(command, message).await;
                if let Some(reply) = reply {
                    self.outbound.send(&message.channel_id, &reply).await;
                }
            }
            Some(Err(usage)) => {
                self.outbound.send(&message.channel_id, &usage).await;
            }
            None => self.converse(message).await,
        }
    }

    async fn handle(self: &Arc<Self>, command: Command, message: &ChatMessage) -> Option<String> {
        let channel = &message.channel_id;
        match command {
            Command::Projects => {
                if self.config.projects.is_empty() {
                    return Some("No projects configured.".to_string());
                }
                let mut lines = vec!["Configured projects:".to_string()];
                for project in &self.config.projects {
                    let description = if project.description.is_empty() {
                        String::new()
                    } else {
                        format!(" - {}", project.description)
                    };
                    lines.push(format!(
                        "• `{}` ({}){}",
                        project.name,
                        project.path.display(),
                        description
                    ));
                }
                Some(lines.join("\n"))
            }

            Command::Switch(project) => match self.switch_to(&project, false).await {
                Ok(id) => Some(format!("Switched to project `{}` (session {}).", project, id)),
                Err(e) => Some(short_session_error(&e)),
            },

            Command::New(project) => match self.switch_to(&project, true).await {
                Ok(id) => Some(format!(
                    "Started new session {} for project `{}`.",
                    id, project
                )),
                Err(e) => Some(short_session_error(&e)),
            },

            Command::Sessions => {
                let sessions = self.registry.list().await;
                if sessions.is_empty() {
                    return Some("No sessions.".to_string());
                }
                let mut lines = vec!["Sessions:".to_string()];
                for snapshot in sessions {
                    let marker = if snapshot.is_current { " (current)" } else { "" };
                    lines.push(format!(
                        "• {} `{}` [{}] {} messages, last active {}{}",
                        snapshot.id,
                        snapshot.project,
                        snapshot.state.as_str(),
                        snapshot.conversation_length,
                        snapshot.last_activity.format("%H:%M:%S"),
                        marker
                    ));
                }
                Some(lines.join("\n"))
            }

            Command::Quit => {
                let Some(current) = self.registry.current().await else {
                    return Some(NO_ACTIVE_SESSION.to_string());
                };
                match self.registry.terminate(&current).await {
                    Ok(()) => Some(format!("Session {} terminated.", current)),
                    Err(e) => Some(short_session_error(&e)),
                }
            }

            Command::Help => Some(HELP_TEXT.to_string()),

            Command::QueueAdd { queue, description } => {
                let Some((_, project_dir)) = self.registry.current_project().await else {
                    return Some(NO_ACTIVE_SESSION.to_string());
                };
                match self.queues.add(&queue, &description, project_dir, 0).await {
                    Ok(id) => Some(format!("Queued task {} in `{}`.", id, queue)),
                    Err(e) => Some(short_queue_error(&e)),
                }
            }

            Command::QueueRun(queue) => match self.queues.run(&queue).await {
                Ok(mut reports) => {
                    let outbound = self.outbound.clone();
                    let channel = channel.clone();
                    tokio::spawn(async move {
                        while let Some(report) = reports.recv().await {
                            outbound.send(&channel, &format_report(&report)).await;
                        }
                    });
                    Some(format!("Running queue `{}`...", queue))
                }
                Err(e) => Some(short_queue_error(&e)),
            },

            Command::QueueStatus(queue) => {
                match self.queues.status(queue.as_deref()).await {
                    Ok(summaries) if summaries.is_empty() => Some("No queues.".to_string()),
                    Ok(summaries) => {
                        let mut lines = vec!["Queue status:".to_string()];
                        for s in summaries {
                            let running = if s.running { ", running" } else { "" };
                            lines.push(format!(
                                "• `{}`: {} pending, {} completed, {} failed, {} cancelled{}",
                                s.name, s.pending, s.completed, s.failed, s.cancelled, running
                            ));
                        }
                        Some(lines.join("\n"))
                    }
                    Err(e) => Some(short_queue_error(&e)),
                }
            }

            Command::QueueClear(queue) => match self.queues.clear(&queue).await {
                Ok(removed) => Some(format!("Cleared {} task(s) from `{}`.", removed, queue)),
                Err(e) => Some(short_queue_error(&e)),
            },

            Command::Cron { pattern, tasks } => {
                let Some((project_name, project_dir)) = self.registry.current_project().await
                else {
                    return Some(NO_ACTIVE_SESSION.to_string());
                };
                match self
                    .cron
                    .schedule(&pattern, tasks, project_name.clone(), project_dir)
                    .await
                {
                    Ok(id) => Some(format!(
                        "Schedule {} registered for `{}` ({}).",
                        id, project_name, pattern
                    )),
                    Err(e) => Some(e.to_string()),
                }
            }
        }
    }

    /// Reuse a live session for the project unless a fresh one is forced.
    async fn switch_to(&self, project: &str, force_new: bool) -> Result<String, SessionError> {
        if !force_new
            && let Some(existing) = self.config.project(project)
            && let Some(id) = self.registry.find_by_project(&existing.path).await
        {
            self.registry.switch(&id).await?;
            return Ok(id);
        }
        let id = self.registry.create(project).await?;
        self.registry.switch(&id).await?;
        Ok(id)
    }

    /// Forward a conversational line to the current session and pipe the
    /// reply back chunk by chunk, in parse order.
    async fn converse(self: &Arc<Self>, message: &ChatMessage) {
        let channel = &message.channel_id;
        let Some(current) = self.registry.current().await else {
            self.outbound.send(channel, NO_ACTIVE_SESSION).await;
            return;
        };

        // Empty lines are still conversation: a bare newline goes through.
        let text = if message.text.is_empty() {
            "\n"
        } else {
            message.text.as_str()
        };

        let mut stream = match self.registry.send(&current, text).await {
            Ok(stream) => stream,
            Err(e) => {
                self.outbound.send(channel, &short_session_error(&e)).await;
                return;
            }
        };

        self.outbound.typing(channel).await;

        let timeout = Duration::from_secs(self.config.task_timeout_secs);
        let mut collected = String::new();
        let mut done = Box::pin(self.registry.wait_reply(&current, timeout));
        loop {
            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(chunk) => {
                        collected.push_str(&chunk);
                        let line = chunk.trim_end();
                        if !line.is_empty() {
                            self.outbound.send(channel, line).await;
                        }
                    }
                    None => break,
                },
                result = &mut done => {
                    if let Err(e) = result {
                        warn!("reply for session {} did not complete: {}", current, e);
                    }
                    while let Some(chunk) = stream.try_next() {
                        collected.push_str(&chunk);
                        let line = chunk.trim_end();
                        if !line.is_empty() {
                            self.outbound.send(channel, line).await;
                        }
                    }
                    break;
                }
            }
        }

        if collected.is_empty() {
            debug!("session {} produced no output for this line", current);
        } else {
            self.registry.record_assistant(&current, &collected).await;
        }
    }
}

fn short_session_error(error: &SessionError) -> String {
    match error {
        SessionError::NoSuchSession(id) => format!("No such session: {}.", id),
        SessionError::LimitExceeded(max) => {
            format!("Session limit of {} reached. Close one with `@@quit` first.", max)
        }
        SessionError::InvalidProject(name) => {
            format!("Unknown or missing project `{}`. See `@@projects`.", name)
        }
        SessionError::Handler(e) => format!("Assistant error: {}.", e),
    }
}

fn short_queue_error(error: &QueueError) -> String {
    match error {
        QueueError::UnknownQueue(name) => format!("Unknown queue `{}`.", name),
        QueueError::QueueBusy(name) => format!("Queue `{}` is already running.", name),
        QueueError::QueueFull { queue, limit } => {
            format!("Queue `{}` is full ({} tasks).", queue, limit)
        }
        QueueError::TaskTimeout => "Task timed out.".to_string(),
        QueueError::Session(e) => short_session_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use crate::cron::cron_runtime;
    use crate::testutil::{RecordingTransport, ScriptedBehavior, scripted_factory};
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn tokenizer_splits_on_whitespace_and_respects_quotes() {
        assert_eq!(tokenize("a b  c"), vec!["a", "b", "c"]);
        assert_eq!(
            tokenize(r#"cron "*/5 * * * *" run_tests"#),
            vec!["cron", "*/5 * * * *", "run_tests"]
        );
        assert_eq!(tokenize(r#""unterminated quote"#), vec!["unterminated quote"]);
        assert_eq!(tokenize(""), Vec::<String>::new());
    }

    #[test]
    fn conversational_lines_do_not_parse_as_commands() {
        assert!(parse("hello there").is_none());
        assert!(parse("email me @ home").is_none());
        assert!(parse("").is_none());
    }

    #[test]
    fn known_commands_parse() {
        assert_eq!(parse("@@projects").unwrap().unwrap(), Command::Projects);
        assert_eq!(
            parse("@@switch web").unwrap().unwrap(),
            Command::Switch("web".to_string())
        );
        assert_eq!(parse("@@q").unwrap().unwrap(), Command::Quit);
        assert_eq!(parse("@@quit").unwrap().unwrap(), Command::Quit);
        assert_eq!(
            parse("@@queue_add feat \"do A\"").unwrap().unwrap(),
            Command::QueueAdd {
                queue: "feat".to_string(),
                description: "do A".to_string()
            }
        );
        assert_eq!(
            parse("@@queue_status").unwrap().unwrap(),
            Command::QueueStatus(None)
        );
        assert_eq!(
            parse(r#"@@cron "*/1 * * * *" run_tests,clean_code"#)
                .unwrap()
                .unwrap(),
            Command::Cron {
                pattern: "*/1 * * * *".to_string(),
                tasks: vec!["run_tests".to_string(), "clean_code".to_string()]
            }
        );
    }

    #[test]
    fn malformed_and_unknown_commands_get_usage_lines() {
        assert!(parse("@@switch").unwrap().is_err());
        assert!(parse("@@queue_add feat").unwrap().is_err());
        assert!(parse("@@cron \"* * * * *\"").unwrap().is_err());
        let err = parse("@@frobnicate").unwrap().unwrap_err();
        assert!(err.contains("@@frobnicate"));
        assert!(err.contains("@@help"));
    }

    struct Fixture {
        router: Arc<CommandRouter>,
        transport: Arc<RecordingTransport>,
        registry: Arc<SessionRegistry>,
    }

    fn fixture(behavior: ScriptedBehavior, mutate: impl FnOnce(&mut Config)) -> Fixture {
        let base = std::env::temp_dir().join(format!("ferry-router-{}", Uuid::new_v4().simple()));
        let mut config = Config::default();
        config.data_dir = base.clone();
        config.task_timeout_secs = 2;
        for name in ["web", "api", "jobs"] {
            let dir = base.join(name);
            std::fs::create_dir_all(&dir).unwrap();
            config.projects.push(ProjectConfig {
                name: name.to_string(),
                path: dir,
                description: format!("{} project", name),
            });
        }
        mutate(&mut config);

        let config = Arc::new(config);
        let transport = RecordingTransport::new();
        let outbound = Outbound::new(transport.clone());
        let registry = Arc::new(SessionRegistry::with_factory(
            config.clone(),
            scripted_factory(behavior),
        ));
        let queues = QueueManager::new(config.clone(), registry.clone());
        let (cron, runtime) = cron_runtime(queues.clone(), outbound.clone(), "C1".to_string());
        tokio::spawn(crate::cron::run_ticker(runtime));

        let router = CommandRouter::new(config, registry.clone(), queues, cron, outbound);
        Fixture {
            router,
            transport,
            registry,
        }
    }

    fn message(text: &str) -> ChatMessage {
        ChatMessage {
            text: text.to_string(),
            user_id: "U1".to_string(),
            channel_id: "C1".to_string(),
            timestamp: Utc::now(),
            thread_ts: None,
        }
    }

    #[tokio::test]
    async fn project_switch_and_conversation_flow() {
        let fx = fixture(ScriptedBehavior::echo(), |_| {});

        fx.router.dispatch(&message("@@projects")).await;
        fx.router.dispatch(&message("@@switch web")).await;
        fx.router.dispatch(&message("hello")).await;

        let texts = fx.transport.texts();
        assert!(texts[0].contains("`web`"));
        assert!(texts[0].contains("`api`"));
        assert!(texts[1].contains("Switched to project `web`"));
        assert!(texts.iter().any(|t| t.contains("hello")));

        let sessions = fx.registry.list().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].project, "web");
        assert_eq!(sessions[0].conversation_length, 2);
    }

    #[tokio::test]
    async fn conversation_without_session_gets_standard_notice() {
        let fx = fixture(ScriptedBehavior::echo(), |_| {});
        fx.router.dispatch(&message("hello?")).await;
        assert_eq!(fx.transport.texts(), vec![NO_ACTIVE_SESSION.to_string()]);
    }

    #[tokio::test]
    async fn switch_reuses_live_session_and_new_forces_another() {
        let fx = fixture(ScriptedBehavior::echo(), |_| {});
        fx.router.dispatch(&message("@@switch web")).await;
        fx.router.dispatch(&message("@@switch web")).await;
        assert_eq!(fx.registry.list().await.len(), 1);

        fx.router.dispatch(&message("@@new web")).await;
        assert_eq!(fx.registry.list().await.len(), 2);
    }

    #[tokio::test]
    async fn session_cap_surfaces_limit_exceeded() {
        let fx = fixture(ScriptedBehavior::echo(), |c| c.max_sessions = 2);
        fx.router.dispatch(&message("@@new web")).await;
        fx.router.dispatch(&message("@@new api")).await;
        fx.router.dispatch(&message("@@new jobs")).await;

        let texts = fx.transport.texts();
        assert!(texts[2].contains("Session limit of 2"));
        let sessions = fx.registry.list().await;
        assert_eq!(sessions.len(), 2);
        let projects: Vec<&str> = sessions.iter().map(|s| s.project.as_str()).collect();
        assert!(projects.contains(&"web"));
        assert!(projects.contains(&"api"));
    }

    #[tokio::test]
    async fn quit_terminates_and_later_messages_get_the_notice() {
        let fx = fixture(ScriptedBehavior::echo(), |_| {});
        fx.router.dispatch(&message("@@switch web")).await;
        fx.router.dispatch(&message("@@quit")).await;

        let sessions = fx.registry.list().await;
        assert!(sessions.is_empty());

        fx.router.dispatch(&message("anyone?")).await;
        let texts = fx.transport.texts();
        assert!(texts[1].contains("terminated"));
        assert_eq!(texts[2], NO_ACTIVE_SESSION);
    }

    #[tokio::test]
    async fn queue_add_and_run_reports_progress_in_order() {
        let fx = fixture(ScriptedBehavior::echo(), |_| {});
        fx.router.dispatch(&message("@@switch web")).await;
        fx.router.dispatch(&message("@@queue_add feat \"do A\"")).await;
        fx.router.dispatch(&message("@@queue_add feat \"do B\"")).await;
        fx.router.dispatch(&message("@@queue feat")).await;

        // The run streams progress from a background task.
        for _ in 0..200 {
            let done = fx
                .transport
                .texts()
                .iter()
                .filter(|t| t.contains("Task completed"))
                .count()
                == 2;
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let texts = fx.transport.texts();
        let completed: Vec<&String> = texts
            .iter()
            .filter(|t| t.contains("Task completed"))
            .collect();
        assert_eq!(completed.len(), 2, "all texts: {:?}", texts);
        assert!(completed[0].contains("do A"));
        assert!(completed[1].contains("do B"));
    }

    #[tokio::test]
    async fn queue_add_without_session_is_rejected() {
        let fx = fixture(ScriptedBehavior::echo(), |_| {});
        fx.router.dispatch(&message("@@queue_add feat \"do A\"")).await;
        assert_eq!(fx.transport.texts(), vec![NO_ACTIVE_SESSION.to_string()]);
    }

    #[tokio::test]
    async fn queue_status_of_unknown_queue_is_one_line() {
        let fx = fixture(ScriptedBehavior::echo(), |_| {});
        fx.router.dispatch(&message("@@queue_status ghost")).await;
        assert_eq!(fx.transport.texts(), vec!["Unknown queue `ghost`.".to_string()]);
    }

    #[tokio::test]
    async fn cron_command_registers_a_schedule() {
        let fx = fixture(ScriptedBehavior::echo(), |_| {});
        fx.router.dispatch(&message("@@switch web")).await;
        fx.router
            .dispatch(&message(r#"@@cron "*/1 * * * *" run_tests"#))
            .await;

        let texts = fx.transport.texts();
        assert!(
            texts[1].contains("Schedule 1 registered for `web`"),
            "got: {:?}",
            texts
        );
    }

    #[tokio::test]
    async fn cron_with_bad_pattern_reports_invalid_pattern() {
        let fx = fixture(ScriptedBehavior::echo(), |_| {});
        fx.router.dispatch(&message("@@switch web")).await;
        fx.router
            .dispatch(&message(r#"@@cron "*/0 * * * *" run_tests"#))
            .await;
        let texts = fx.transport.texts();
        assert!(texts[1].contains("invalid cron pattern"));
    }

    #[tokio::test]
    async fn help_lists_the_command_surface() {
        let fx = fixture(ScriptedBehavior::echo(), |_| {});
        fx.router.dispatch(&message("@@help")).await;
        let text = &fx.transport.texts()[0];
        for needle in [
            "@@projects",
            "@@switch",
            "@@new",
            "@@sessions",
            "@@quit",
            "@@queue_add",
            "@@queue_status",
            "@@queue_clear",
            "@@cron",
        ] {
            assert!(text.contains(needle), "help is missing {}", needle);
        }
    }
}
