//! Error taxonomy shared by the catalog client, job pool, and fetch manager.

use std::fmt;

/// Fixed text reported for every user/system cancellation.
pub const CANCELLED_MESSAGE: &str = "Cancelled by user";

/// Failure categories surfaced by the orchestration core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Bearer credential could not be obtained after all retries.
    Auth(String),
    /// Network or HTTP failure that survived the retry budget.
    TransientNetwork(String),
    /// Subprocess exited cleanly but its output broke the result protocol.
    Protocol(String),
    /// Subprocess exited with a non-zero status.
    Execution(String),
    /// Explicit cancellation.
    Cancelled,
    /// Malformed manifest, timed-text, or JSON content.
    Parse(String),
    /// Fetch executable missing or could not be spawned.
    Launch(String),
    /// Pool or client already shut down.
    Shutdown,
}

impl CoreError {
    /// Infrastructure failures are fatal to the requesting call; everything
    /// else is reported through the job's own failure channel.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Launch(_) | Self::Shutdown)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth(detail) => write!(f, "Authentication unavailable: {detail}"),
            Self::TransientNetwork(detail) => write!(f, "Network request failed: {detail}"),
            Self::Protocol(detail) => write!(f, "Fetch output was incomplete: {detail}"),
            Self::Execution(detail) => write!(f, "Fetch failed: {detail}"),
            Self::Cancelled => f.write_str(CANCELLED_MESSAGE),
            Self::Parse(detail) => write!(f, "Could not parse response: {detail}"),
            Self::Launch(detail) => write!(f, "Could not start fetch executable: {detail}"),
            Self::Shutdown => f.write_str("Shutting down; request rejected"),
        }
    }
}

impl std::error::Error for CoreError {}
