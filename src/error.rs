//! Error taxonomy shared across the bridge components.
//!
//! Each component owns one enum; `main` and the app wiring use `anyhow` and
//! convert at the edge. None of these terminate the process except
//! `ConfigError` at startup.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("chat api error: {0}")]
    Api(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("chat send failed after {attempts} attempts: {last}")]
    SendExhausted { attempts: u32, last: String },
}

/// Per-session failures from an assistant handler. None of these are fatal
/// to the process; the owning session is marked inactive at worst.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("assistant failed to start: {0}")]
    Startup(String),

    #[error("assistant is not running")]
    NotRunning,

    #[error("input of {len} bytes exceeds the {max} byte limit")]
    InputTooLarge { len: usize, max: usize },

    #[error("assistant did not finish within {0:?}")]
    Timeout(Duration),

    #[error("assistant exited unexpectedly with code {code:?}")]
    UnexpectedExit { code: Option<i32>, stderr: String },

    #[error("unparseable assistant output: {0}")]
    Parse(String),

    #[error("assistant i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("no such session: {0}")]
    NoSuchSession(String),

    #[error("session limit of {0} reached")]
    LimitExceeded(usize),

    #[error("invalid project: {0}")]
    InvalidProject(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("queue '{0}' already has a run in flight")]
    QueueBusy(String),

    #[error("queue '{queue}' is full ({limit} tasks)")]
    QueueFull { queue: String, limit: usize },

    #[error("task timed out")]
    TaskTimeout,

    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("invalid cron pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("unknown task name: {0}")]
    UnknownTaskName(String),

    #[error("no such schedule: {0}")]
    NoSuchSchedule(u64),

    #[error("scheduler is not running")]
    Unavailable,
}

/// Failures writing `queues.json`. Logged and swallowed; the next
/// successful write heals the on-disk state.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("could not read or write queue state: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not encode or decode queue state: {0}")]
    Serde(#[from] serde_json::Error),
}
