//! Runtime JSON log parsing.
//!
//! runc-style runtimes write one JSON object per line:
//! `{"level":"error","msg":"...","time":"..."}`.

use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct LogLine {
    #[serde(default)]
    level: String,
    #[serde(default)]
    msg: String,
}

/// The last `error`/`fatal` message in a runtime log body.
#[must_use]
pub fn last_error(contents: &str) -> Option<String> {
    contents
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<LogLine>(line).ok())
        .find(|line| matches!(line.level.as_str(), "error" | "fatal") && !line.msg.is_empty())
        .map(|line| line.msg)
}

/// [`last_error`] of the log at `path`; `None` if it cannot be read.
#[must_use]
pub fn last_error_in(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok().as_deref().and_then(last_error)
}
