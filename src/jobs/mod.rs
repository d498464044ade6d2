//! Job primitives shared by the worker pool and the fetch manager.

pub mod pool;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast::Sender;

use crate::error::CoreError;
use crate::protocol::{JobId, Message, SearchCategory, Severity};

/// Unit-of-work category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Search,
    Lookup,
    Fetch,
}

/// Cooperative cancellation flag. Once set it is never cleared.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `Err(Cancelled)` once the token is set; job bodies call this
    /// before and after every blocking step.
    pub fn check(&self) -> Result<(), CoreError> {
        if self.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Monotonic id source shared by the pool and the fetch manager so job ids
/// never collide across the two.
#[derive(Debug, Clone)]
pub struct JobIdAllocator {
    next: Arc<AtomicI64>,
}

impl JobIdAllocator {
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicI64::new(1)),
        }
    }

    pub fn next_id(&self) -> JobId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for JobIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-job output channel. Emits are dropped once the job's token is
/// cancelled; a cancel that races an emit already past the check may still
/// let that one message through.
#[derive(Debug, Clone)]
pub struct JobSink {
    job_id: JobId,
    token: CancellationToken,
    bus_producer: Sender<Message>,
}

impl JobSink {
    pub fn new(job_id: JobId, token: CancellationToken, bus_producer: Sender<Message>) -> Self {
        Self {
            job_id,
            token,
            bus_producer,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    fn emit(&self, message: Message) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        let _ = self.bus_producer.send(message);
        true
    }

    pub fn status(&self, text: impl Into<String>, severity: Severity) -> bool {
        self.emit(Message::Status {
            text: text.into(),
            severity,
        })
    }

    pub fn progress(&self, current: u64, total: u64) -> bool {
        self.emit(Message::JobProgress {
            job_id: self.job_id,
            current,
            total,
        })
    }

    pub fn completed(&self, payload: Value, source_url: &str) -> bool {
        self.emit(Message::JobCompleted {
            job_id: self.job_id,
            payload,
            source_url: source_url.to_string(),
        })
    }

    pub fn failed(&self, source_url: &str, message: impl Into<String>) -> bool {
        self.emit(Message::JobFailed {
            job_id: self.job_id,
            source_url: source_url.to_string(),
            message: message.into(),
        })
    }

    pub fn search_results(&self, term: &str, results: Vec<(SearchCategory, Vec<Value>)>) -> bool {
        self.emit(Message::SearchResults {
            job_id: self.job_id,
            term: term.to_string(),
            results,
        })
    }

    pub fn category_page(
        &self,
        category: SearchCategory,
        term: &str,
        offset: u32,
        items: Vec<Value>,
        has_more: bool,
    ) -> bool {
        let message = if offset == 0 {
            Message::CategoryResults {
                job_id: self.job_id,
                category,
                term: term.to_string(),
                items,
                has_more,
            }
        } else {
            Message::AppendResults {
                job_id: self.job_id,
                category,
                term: term.to_string(),
                offset,
                items,
                has_more,
            }
        };
        self.emit(message)
    }

    pub fn lookup_result(&self, source: &str, payload: Value) -> bool {
        self.emit(Message::LookupResult {
            job_id: self.job_id,
            source: source.to_string(),
            payload,
        })
    }

    pub fn lyrics(&self, song_id: &str, lyrics: String) -> bool {
        self.emit(Message::LyricsReady {
            job_id: self.job_id,
            song_id: song_id.to_string(),
            lyrics,
        })
    }
}

/// Everything a job body receives from the pool.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: JobId,
    pub kind: JobKind,
    pub token: CancellationToken,
    pub sink: JobSink,
}
