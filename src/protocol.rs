//! Event-bus protocol shared by all runtime components.
//!
//! This is the only channel through which the orchestration core talks to its
//! consumer. Consumers subscribe to the broadcast bus and must tolerate jobs
//! completing out of order; every job-scoped message carries its job id.

use serde_json::Value;

/// Identifier assigned to every submitted job. Values `<= 0` mark
/// fire-and-forget fetches that cannot be cancelled individually.
pub type JobId = i64;

/// Severity attached to free-form status messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Catalog category used by scoped searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchCategory {
    Songs,
    Albums,
    Artists,
    Videos,
    Playlists,
    Artwork,
}

/// Why the bearer credential could not be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFailureKind {
    /// Bootstrap page or script could not be downloaded.
    Network,
    /// Downloads succeeded but the expected pattern was absent.
    PatternNotFound,
}

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    Status {
        text: String,
        severity: Severity,
    },
    JobProgress {
        job_id: JobId,
        current: u64,
        total: u64,
    },
    JobCompleted {
        job_id: JobId,
        payload: Value,
        source_url: String,
    },
    JobFailed {
        job_id: JobId,
        source_url: String,
        message: String,
    },
    /// Results of a generic multi-type search, keyed by category.
    SearchResults {
        job_id: JobId,
        term: String,
        results: Vec<(SearchCategory, Vec<Value>)>,
    },
    /// First page of a category-scoped search.
    CategoryResults {
        job_id: JobId,
        category: SearchCategory,
        term: String,
        items: Vec<Value>,
        has_more: bool,
    },
    /// Further page of a category-scoped search ("load more").
    AppendResults {
        job_id: JobId,
        category: SearchCategory,
        term: String,
        offset: u32,
        items: Vec<Value>,
        has_more: bool,
    },
    /// Item lookup payload (album/playlist with quality-enriched tracks,
    /// or a resolved artist).
    LookupResult {
        job_id: JobId,
        source: String,
        payload: Value,
    },
    LyricsReady {
        job_id: JobId,
        song_id: String,
        lyrics: String,
    },
    TokenUnavailable {
        kind: TokenFailureKind,
        detail: String,
    },
    /// Every tracked job and process was cancelled and the registries cleared.
    JobsCleared,
}

impl SearchCategory {
    /// Catalog `types` value for this category.
    pub fn api_type(self) -> &'static str {
        match self {
            Self::Songs => "songs",
            Self::Albums => "albums",
            Self::Artists => "artists",
            Self::Videos => "music-videos",
            Self::Playlists => "playlists",
            Self::Artwork => "albums",
        }
    }

    /// Key under `results` in the search response.
    pub fn result_key(self) -> &'static str {
        self.api_type()
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Songs => "songs",
            Self::Albums => "albums",
            Self::Artists => "artists",
            Self::Videos => "videos",
            Self::Playlists => "playlists",
            Self::Artwork => "artwork",
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "songs" => Some(Self::Songs),
            "albums" => Some(Self::Albums),
            "artists" => Some(Self::Artists),
            "videos" => Some(Self::Videos),
            "playlists" => Some(Self::Playlists),
            "artwork" => Some(Self::Artwork),
            _ => None,
        }
    }
}
