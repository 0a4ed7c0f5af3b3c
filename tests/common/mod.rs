//! Shared harness for subprocess integration tests: a self-cleaning temp
//! directory and shell-script stand-ins for the assistant CLI.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use ferry::config::AssistantConfig;

pub struct LocalTempDir {
    path: PathBuf,
}

impl LocalTempDir {
    pub fn new(prefix: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::create_dir_all(&path).expect("temp dir");
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn subdir(&self, name: &str) -> PathBuf {
        let dir = self.path.join(name);
        std::fs::create_dir_all(&dir).expect("subdir");
        dir
    }
}

impl Drop for LocalTempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

#[cfg(unix)]
pub fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, body).expect("stub script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}

/// Echo-style assistant: replies `reply: <line>` per input line, emits a
/// stream-json session id on demand, and supports `-p` one-shot mode.
pub const ECHO_ASSISTANT: &str = r#"#!/bin/sh
prompt=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-p" ]; then
    shift
    prompt="$1"
  fi
  shift
done
if [ -n "$prompt" ]; then
  echo "single: $prompt"
  exit 0
fi
while IFS= read -r line; do
  case "$line" in
    json*) echo "{\"session_id\": \"ext-42\"}" ;;
    count*) echo "one"; echo "two"; echo "three" ;;
    *) echo "reply: $line" ;;
  esac
done
"#;

/// Accepts input but never answers.
pub const SILENT_ASSISTANT: &str = r#"#!/bin/sh
while IFS= read -r line; do
  :
done
"#;

/// Dies immediately, the way a misconfigured CLI would.
pub const DYING_ASSISTANT: &str = r#"#!/bin/sh
echo "bad flags" >&2
exit 3
"#;

/// Timings tuned for tests: short probe, short quiet window, short grace.
pub fn assistant_config(cli_path: &Path) -> AssistantConfig {
    AssistantConfig {
        cli_path: cli_path.to_string_lossy().to_string(),
        startup_probe_ms: 150,
        quiet_window_ms: 120,
        terminate_grace_secs: 2,
        ..AssistantConfig::default()
    }
}
