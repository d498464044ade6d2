//! External fetch executable: invocation and output protocol.
//!
//! The executable reports progress on stdout as `PROGRESS_PREFIX` followed by
//! a small JSON object, and brackets its final JSON result between
//! `RESULT_START_MARKER` and `RESULT_END_MARKER`. Everything else on stdout is
//! free-form.

pub mod process_manager;

use serde::Deserialize;
use serde_json::Value;

use crate::error::CoreError;

pub const PROGRESS_PREFIX: &str = "@@PROGRESS@@";
pub const RESULT_START_MARKER: &str = "@@JSON_START@@";
pub const RESULT_END_MARKER: &str = "@@JSON_END@@";

/// How the executable is launched: program plus leading arguments (for
/// example an interpreter and a script path).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCommand {
    pub program: String,
    pub leading_args: Vec<String>,
}

impl FetchCommand {
    pub fn new(program: impl Into<String>, leading_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            leading_args,
        }
    }
}

/// Protocol invocation variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// `<exe> --json-output <url>`
    Download,
    /// `<exe> --resolve-artist <url> --json-output`
    ResolveArtist,
}

impl FetchMode {
    pub fn protocol_args(self, url: &str) -> Vec<String> {
        match self {
            Self::Download => vec!["--json-output".to_string(), url.to_string()],
            Self::ResolveArtist => vec![
                "--resolve-artist".to_string(),
                url.to_string(),
                "--json-output".to_string(),
            ],
        }
    }
}

/// Progress event carried by a prefixed stdout line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    ProbeStart {
        #[serde(default)]
        total: u64,
    },
    ProbeProgress {
        #[serde(default)]
        current: u64,
        #[serde(default)]
        total: u64,
    },
}

impl ProgressEvent {
    /// `(current, total)` as reported to the consumer.
    pub fn counts(self) -> (u64, u64) {
        match self {
            Self::ProbeStart { total } => (0, total),
            Self::ProbeProgress { current, total } => (current, total),
        }
    }
}

/// Parses one stdout line; `None` for non-progress or malformed lines.
pub fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    let payload = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    serde_json::from_str(payload.trim()).ok()
}

/// Extracts the JSON document bracketed by the result markers.
pub fn extract_result_payload(stdout: &str) -> Result<Value, CoreError> {
    let Some(start) = stdout.find(RESULT_START_MARKER) else {
        return Err(CoreError::Protocol("result start marker missing".to_string()));
    };
    let body_start = start + RESULT_START_MARKER.len();
    let Some(body_len) = stdout[body_start..].find(RESULT_END_MARKER) else {
        return Err(CoreError::Protocol("result end marker missing".to_string()));
    };
    let body = stdout[body_start..body_start + body_len].trim();
    serde_json::from_str(body)
        .map_err(|error| CoreError::Protocol(format!("result payload is not valid JSON: {error}")))
}
