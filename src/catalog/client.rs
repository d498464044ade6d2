//! Catalog request helper.
//!
//! Every search and lookup goes through `CatalogClient::request`, which
//! attaches the bearer credential, refreshes it once on an auth rejection, and
//! retries transient failures according to a `RetryPolicy`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use serde_json::{Map, Value};

use crate::catalog::token_cache::TokenCache;
use crate::catalog::{HttpRequest, HttpTransport};
use crate::error::CoreError;
use crate::protocol::SearchCategory;

pub const API_BASE_URL: &str = "https://amp-api.music.apple.com/v1";
const ORIGIN: &str = "https://music.apple.com";
const DEFAULT_ATTEMPTS: u32 = 3;

/// Categories requested by a generic multi-type search.
pub const GENERIC_SEARCH_CATEGORIES: [SearchCategory; 5] = [
    SearchCategory::Songs,
    SearchCategory::Albums,
    SearchCategory::Artists,
    SearchCategory::Videos,
    SearchCategory::Playlists,
];

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same pause after every failed attempt.
    Fixed,
    /// `1 + attempt` units after the attempt-th failure (attempt counted from 0).
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Backoff,
    pub unit: Duration,
}

impl RetryPolicy {
    pub fn search(unit: Duration) -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            backoff: Backoff::Fixed,
            unit,
        }
    }

    pub fn lookup(unit: Duration) -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            backoff: Backoff::Linear,
            unit,
        }
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.unit,
            Backoff::Linear => self.unit.saturating_mul(attempt.saturating_add(1)),
        }
    }
}

/// Item kinds addressable by lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    Album,
    Playlist,
    Song,
    Artist,
}

impl LookupKind {
    fn path_segment(self) -> &'static str {
        match self {
            Self::Album => "albums",
            Self::Playlist => "playlists",
            Self::Song => "songs",
            Self::Artist => "artists",
        }
    }
}

/// One page of a category-scoped search.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryPage {
    pub items: Vec<Value>,
    pub has_more: bool,
}

/// Authenticated catalog API client.
pub struct CatalogClient {
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<TokenCache>,
    api_base_url: String,
    storefront: Mutex<String>,
    language: String,
    request_timeout: Duration,
    backoff_unit: Duration,
    shutdown: Arc<AtomicBool>,
}

impl CatalogClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<TokenCache>,
        storefront: &str,
        language: &str,
        request_timeout: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            transport,
            tokens,
            api_base_url: API_BASE_URL.to_string(),
            storefront: Mutex::new(storefront.to_string()),
            language: language.to_string(),
            request_timeout,
            backoff_unit: Duration::from_secs(1),
            shutdown,
        }
    }

    /// Overrides the API root and retry unit, mainly for tests.
    pub fn with_endpoint(mut self, api_base_url: &str, backoff_unit: Duration) -> Self {
        self.api_base_url = api_base_url.trim_end_matches('/').to_string();
        self.backoff_unit = backoff_unit;
        self
    }

    pub fn storefront(&self) -> String {
        self.storefront
            .lock()
            .expect("storefront lock poisoned")
            .clone()
    }

    /// Switches storefront and drops the cached credential.
    pub fn set_storefront(&self, storefront: &str) {
        let normalized = storefront.trim().to_ascii_lowercase();
        *self.storefront.lock().expect("storefront lock poisoned") = normalized;
        self.tokens.invalidate();
    }

    pub fn transport(&self) -> Arc<dyn HttpTransport> {
        Arc::clone(&self.transport)
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn catalog_url(&self, endpoint: &str, params: &[(String, String)]) -> String {
        let query: Vec<String> = params
            .iter()
            .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
            .collect();
        let base = format!(
            "{}/catalog/{}/{}",
            self.api_base_url,
            self.storefront(),
            endpoint.trim_start_matches('/')
        );
        if query.is_empty() {
            base
        } else {
            format!("{base}?{}", query.join("&"))
        }
    }

    /// GETs a catalog endpoint and returns its JSON body.
    pub fn request(
        &self,
        endpoint: &str,
        params: &[(String, String)],
        policy: RetryPolicy,
    ) -> Result<Value, CoreError> {
        self.request_with_headers(endpoint, params, &[], policy)
    }

    pub fn request_with_headers(
        &self,
        endpoint: &str,
        params: &[(String, String)],
        extra_headers: &[(String, String)],
        policy: RetryPolicy,
    ) -> Result<Value, CoreError> {
        let url = self.catalog_url(endpoint, params);
        let attempts = policy.attempts.max(1);
        let mut attempt = 0u32;
        let mut auth_refreshed = false;
        let mut last_error = String::new();

        while attempt < attempts {
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(CoreError::Shutdown);
            }
            let token = self.tokens.get_token()?;
            let mut request = HttpRequest::get(&url)
                .header("Authorization", format!("Bearer {token}"))
                .header("Origin", ORIGIN)
                .header("Accept", "application/json")
                .timeout(self.request_timeout);
            for (name, value) in extra_headers {
                request = request.header(name, value.clone());
            }

            match self.transport.get(&request) {
                Ok(response) if response.is_success() => {
                    return serde_json::from_str(&response.body).map_err(|error| {
                        CoreError::Parse(format!("invalid JSON from {endpoint}: {error}"))
                    });
                }
                Ok(response) if response.is_auth_rejection() => {
                    if auth_refreshed {
                        return Err(CoreError::Auth(format!(
                            "credential rejected twice by {endpoint} (HTTP {})",
                            response.status
                        )));
                    }
                    debug!(
                        "CatalogClient: HTTP {} for {}, refreshing credential",
                        response.status, endpoint
                    );
                    auth_refreshed = true;
                    self.tokens.invalidate_if_current(&token);
                    continue;
                }
                Ok(response) => {
                    last_error = format!("HTTP {}", response.status);
                }
                Err(error) => {
                    last_error = error;
                }
            }

            warn!(
                "CatalogClient: {} attempt {}/{} failed: {}",
                endpoint,
                attempt + 1,
                attempts,
                last_error
            );
            if attempt + 1 < attempts {
                std::thread::sleep(policy.delay_after(attempt));
            }
            attempt += 1;
        }

        Err(CoreError::TransientNetwork(format!(
            "{endpoint} failed after {attempts} attempts: {last_error}"
        )))
    }

    fn search_params(
        &self,
        term: &str,
        categories: &[SearchCategory],
        limit: u32,
        offset: u32,
    ) -> Vec<(String, String)> {
        let mut types: Vec<&str> = Vec::new();
        for category in categories {
            if !types.contains(&category.api_type()) {
                types.push(category.api_type());
            }
        }
        let mut params = vec![
            ("term".to_string(), term.to_string()),
            ("types".to_string(), types.join(",")),
            ("limit".to_string(), limit.to_string()),
            ("offset".to_string(), offset.to_string()),
            ("l".to_string(), self.language.clone()),
        ];
        if categories.contains(&SearchCategory::Artwork) {
            params.push(("include".to_string(), "artists".to_string()));
        }
        params
    }

    /// Generic multi-type search. Each category is parsed on its own; a
    /// malformed category degrades to an empty list.
    pub fn search(
        &self,
        term: &str,
        limit: u32,
    ) -> Result<Vec<(SearchCategory, Vec<Value>)>, CoreError> {
        let params = self.search_params(term, &GENERIC_SEARCH_CATEGORIES, limit, 0);
        let payload = self.request("search", &params, RetryPolicy::search(self.backoff_unit))?;
        Ok(GENERIC_SEARCH_CATEGORIES
            .iter()
            .map(|category| {
                let items = match category_items(&payload, *category) {
                    Ok(items) => items,
                    Err(error) => {
                        warn!(
                            "CatalogClient: dropping {} results for '{}': {}",
                            category.label(),
                            term,
                            error
                        );
                        Vec::new()
                    }
                };
                (*category, items)
            })
            .collect())
    }

    /// Category-scoped search page; `offset > 0` is a "load more" request.
    pub fn search_category(
        &self,
        category: SearchCategory,
        term: &str,
        limit: u32,
        offset: u32,
    ) -> Result<CategoryPage, CoreError> {
        let params = self.search_params(term, &[category], limit, offset);
        let payload = self.request("search", &params, RetryPolicy::search(self.backoff_unit))?;
        let items = category_items(&payload, category)?;
        let has_more = payload
            .get("results")
            .and_then(|results| results.get(category.result_key()))
            .and_then(|section| section.get("next"))
            .is_some_and(|next| !next.is_null());
        Ok(CategoryPage { items, has_more })
    }

    /// Item lookup with extended asset URLs and track relationships.
    pub fn lookup(&self, kind: LookupKind, id: &str) -> Result<Value, CoreError> {
        let endpoint = format!("{}/{}", kind.path_segment(), urlencoding::encode(id));
        let params = vec![
            (
                "extend".to_string(),
                "extendedAssetUrls,relationships.tracks".to_string(),
            ),
            ("l".to_string(), self.language.clone()),
        ];
        self.request(&endpoint, &params, RetryPolicy::lookup(self.backoff_unit))
    }

    /// Fetches the timed-text lyrics document for a song. The media user
    /// token is only ever sent on this path.
    pub fn fetch_lyrics(&self, song_id: &str, media_user_token: &str) -> Result<String, CoreError> {
        let endpoint = format!("songs/{}/lyrics", urlencoding::encode(song_id));
        let headers = vec![("Media-User-Token".to_string(), media_user_token.to_string())];
        let payload = self.request_with_headers(
            &endpoint,
            &[],
            &headers,
            RetryPolicy::lookup(self.backoff_unit),
        )?;
        payload
            .get("data")
            .and_then(Value::as_array)
            .and_then(|data| data.first())
            .and_then(|item| item.get("attributes"))
            .and_then(|attributes| attributes.get("ttml"))
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| CoreError::Parse(format!("no lyrics document for song {song_id}")))
    }
}

fn category_items(payload: &Value, category: SearchCategory) -> Result<Vec<Value>, CoreError> {
    let Some(section) = payload
        .get("results")
        .and_then(|results| results.get(category.result_key()))
    else {
        return Ok(Vec::new());
    };
    section
        .get("data")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| {
            CoreError::Parse(format!(
                "{} results are missing a data array",
                category.label()
            ))
        })
}

/// Extracts track attribute maps from a lookup payload, in catalog order.
pub fn lookup_tracks(payload: &Value) -> Vec<Map<String, Value>> {
    payload
        .get("data")
        .and_then(Value::as_array)
        .and_then(|data| data.first())
        .and_then(|item| item.get("relationships"))
        .and_then(|relationships| relationships.get("tracks"))
        .and_then(|tracks| tracks.get("data"))
        .and_then(Value::as_array)
        .map(|tracks| {
            tracks
                .iter()
                .map(|track| {
                    let mut attributes = track
                        .get("attributes")
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default();
                    if let Some(id) = track.get("id") {
                        attributes.entry("id").or_insert_with(|| id.clone());
                    }
                    attributes
                })
                .collect()
        })
        .unwrap_or_default()
}
