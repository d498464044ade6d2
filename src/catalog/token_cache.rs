//! Bearer credential cache.
//!
//! The credential is scraped in two steps: the bootstrap page names a script
//! bundle, and the bundle embeds the token. The whole fetch runs under the
//! cache lock so concurrent callers never duplicate it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};
use regex::Regex;
use tokio::sync::broadcast::Sender;

use crate::catalog::{HttpRequest, HttpTransport};
use crate::error::CoreError;
use crate::protocol::{Message, TokenFailureKind};

pub const BOOTSTRAP_URL: &str = "https://music.apple.com";
const SCRIPT_PATH_PATTERN: &str = r#"/assets/index[~\-][^/"'\s]+\.js"#;
const TOKEN_PATTERN: &str = r"eyJh[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]+";
const FETCH_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);

/// Cached credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub fetched_at: SystemTime,
}

#[derive(Debug)]
struct FetchFailure {
    kind: TokenFailureKind,
    detail: String,
}

/// Thread-safe single-credential cache with refetch on invalidation.
pub struct TokenCache {
    transport: Arc<dyn HttpTransport>,
    bus_producer: Sender<Message>,
    bootstrap_url: String,
    retry_delay: Duration,
    token: Mutex<Option<Token>>,
    bootstrap_fetches: AtomicUsize,
    script_path_pattern: Regex,
    token_pattern: Regex,
}

impl TokenCache {
    pub fn new(transport: Arc<dyn HttpTransport>, bus_producer: Sender<Message>) -> Self {
        Self::with_settings(
            transport,
            bus_producer,
            BOOTSTRAP_URL.to_string(),
            DEFAULT_RETRY_DELAY,
        )
    }

    pub fn with_settings(
        transport: Arc<dyn HttpTransport>,
        bus_producer: Sender<Message>,
        bootstrap_url: String,
        retry_delay: Duration,
    ) -> Self {
        Self {
            transport,
            bus_producer,
            bootstrap_url: bootstrap_url.trim_end_matches('/').to_string(),
            retry_delay,
            token: Mutex::new(None),
            bootstrap_fetches: AtomicUsize::new(0),
            script_path_pattern: Regex::new(SCRIPT_PATH_PATTERN).expect("valid script pattern"),
            token_pattern: Regex::new(TOKEN_PATTERN).expect("valid token pattern"),
        }
    }

    /// Returns the cached credential, fetching it first when absent.
    pub fn get_token(&self) -> Result<String, CoreError> {
        let mut cached = self.token.lock().expect("token lock poisoned");
        if let Some(token) = cached.as_ref() {
            return Ok(token.value.clone());
        }

        let mut last_failure = None;
        for attempt in 1..=FETCH_ATTEMPTS {
            match self.fetch_once() {
                Ok(value) => {
                    info!("TokenCache: credential fetched on attempt {}", attempt);
                    *cached = Some(Token {
                        value: value.clone(),
                        fetched_at: SystemTime::now(),
                    });
                    return Ok(value);
                }
                Err(failure) => {
                    warn!(
                        "TokenCache: attempt {}/{} failed ({:?}): {}",
                        attempt, FETCH_ATTEMPTS, failure.kind, failure.detail
                    );
                    last_failure = Some(failure);
                    if attempt < FETCH_ATTEMPTS {
                        std::thread::sleep(self.retry_delay);
                    }
                }
            }
        }

        let failure = last_failure.unwrap_or(FetchFailure {
            kind: TokenFailureKind::Network,
            detail: "no attempts made".to_string(),
        });
        let _ = self.bus_producer.send(Message::TokenUnavailable {
            kind: failure.kind,
            detail: failure.detail.clone(),
        });
        Err(CoreError::Auth(failure.detail))
    }

    /// Clears the credential so the next `get_token` refetches.
    pub fn invalidate(&self) {
        debug!("TokenCache: credential invalidated");
        *self.token.lock().expect("token lock poisoned") = None;
    }

    /// Clears the credential only if it is still the one the caller saw
    /// rejected. Concurrent callers rejected with the same value therefore
    /// trigger a single refetch. Returns whether anything was cleared.
    pub fn invalidate_if_current(&self, rejected: &str) -> bool {
        let mut cached = self.token.lock().expect("token lock poisoned");
        match cached.as_ref() {
            Some(token) if token.value == rejected => {
                debug!("TokenCache: rejected credential invalidated");
                *cached = None;
                true
            }
            _ => false,
        }
    }

    pub fn cached_token(&self) -> Option<Token> {
        self.token.lock().expect("token lock poisoned").clone()
    }

    /// Number of two-step bootstrap fetches started so far.
    pub fn bootstrap_fetch_count(&self) -> usize {
        self.bootstrap_fetches.load(Ordering::SeqCst)
    }

    fn fetch_once(&self) -> Result<String, FetchFailure> {
        self.bootstrap_fetches.fetch_add(1, Ordering::SeqCst);
        let page = self.fetch_text(&self.bootstrap_url)?;
        let script_path = self
            .script_path_pattern
            .find(&page)
            .map(|found| found.as_str().to_string())
            .ok_or_else(|| FetchFailure {
                kind: TokenFailureKind::PatternNotFound,
                detail: "bootstrap page does not reference a script bundle".to_string(),
            })?;
        let script = self.fetch_text(&format!("{}{}", self.bootstrap_url, script_path))?;
        self.token_pattern
            .find(&script)
            .map(|found| found.as_str().to_string())
            .ok_or_else(|| FetchFailure {
                kind: TokenFailureKind::PatternNotFound,
                detail: "script bundle does not embed a credential".to_string(),
            })
    }

    fn fetch_text(&self, url: &str) -> Result<String, FetchFailure> {
        let response = self
            .transport
            .get(&HttpRequest::get(url).timeout(BOOTSTRAP_TIMEOUT))
            .map_err(|detail| FetchFailure {
                kind: TokenFailureKind::Network,
                detail,
            })?;
        if !response.is_success() {
            return Err(FetchFailure {
                kind: TokenFailureKind::Network,
                detail: format!("HTTP {} from {}", response.status, url),
            });
        }
        Ok(response.body)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::broadcast;

    use super::TokenCache;
    use crate::catalog::test_support::ScriptedTransport;
    use crate::catalog::{HttpRequest, HttpResponse};
    use crate::error::CoreError;
    use crate::protocol::{Message, TokenFailureKind};

    pub const TEST_TOKEN: &str = "eyJhbGciOi.eyJpc3MiOi.c2lnbmF0dXJl";
    pub const BOOTSTRAP: &str = "https://bootstrap.test";

    /// Answers bootstrap and script requests with a valid credential.
    pub fn bootstrap_responder(request: &HttpRequest) -> Option<Result<HttpResponse, String>> {
        if request.url.ends_with("/assets/index-abc123.js") {
            return Some(Ok(HttpResponse {
                status: 200,
                body: format!("var a=1;const t=\"{TEST_TOKEN}\";"),
            }));
        }
        if request.url == BOOTSTRAP {
            return Some(Ok(HttpResponse {
                status: 200,
                body: "<script src=\"/assets/index-abc123.js\"></script>".to_string(),
            }));
        }
        None
    }

    fn make_cache(transport: Arc<ScriptedTransport>) -> (TokenCache, broadcast::Receiver<Message>) {
        let (bus_producer, bus_consumer) = broadcast::channel(16);
        let cache = TokenCache::with_settings(
            transport,
            bus_producer,
            BOOTSTRAP.to_string(),
            Duration::ZERO,
        );
        (cache, bus_consumer)
    }

    #[test]
    fn test_get_token_fetches_once_and_caches() {
        let transport = Arc::new(ScriptedTransport::with_fallback(bootstrap_responder));
        let (cache, _bus_consumer) = make_cache(Arc::clone(&transport));
        assert_eq!(cache.get_token().unwrap(), TEST_TOKEN);
        assert_eq!(cache.get_token().unwrap(), TEST_TOKEN);
        assert_eq!(cache.bootstrap_fetch_count(), 1);
        assert_eq!(transport.call_count(), 2);
    }

    #[test]
    fn test_concurrent_callers_share_one_bootstrap_fetch() {
        let transport = Arc::new(ScriptedTransport::with_fallback(|request| {
            std::thread::sleep(Duration::from_millis(20));
            bootstrap_responder(request)
        }));
        let (cache, _bus_consumer) = make_cache(transport);
        let cache = Arc::new(cache);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.get_token())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), TEST_TOKEN);
        }
        assert_eq!(cache.bootstrap_fetch_count(), 1);
    }

    #[test]
    fn test_missing_pattern_retries_then_reports_distinct_failure() {
        let transport = Arc::new(ScriptedTransport::with_fallback(|_| {
            Some(Ok(HttpResponse {
                status: 200,
                body: "<html>no scripts here</html>".to_string(),
            }))
        }));
        let (cache, mut bus_consumer) = make_cache(transport);
        let result = cache.get_token();
        assert!(matches!(result, Err(CoreError::Auth(_))));
        assert_eq!(cache.bootstrap_fetch_count(), 3);
        assert!(matches!(
            bus_consumer.try_recv(),
            Ok(Message::TokenUnavailable {
                kind: TokenFailureKind::PatternNotFound,
                ..
            })
        ));
    }

    #[test]
    fn test_network_failure_is_reported_as_network_kind() {
        let transport = Arc::new(ScriptedTransport::with_fallback(|_| {
            Some(Err("connection refused".to_string()))
        }));
        let (cache, mut bus_consumer) = make_cache(transport);
        assert!(cache.get_token().is_err());
        assert!(matches!(
            bus_consumer.try_recv(),
            Ok(Message::TokenUnavailable {
                kind: TokenFailureKind::Network,
                ..
            })
        ));
    }

    #[test]
    fn test_retry_recovers_after_transient_failure() {
        let transport = Arc::new(ScriptedTransport::with_fallback(bootstrap_responder));
        transport.push(BOOTSTRAP, Err("timed out".to_string()));
        let (cache, mut bus_consumer) = make_cache(transport);
        assert_eq!(cache.get_token().unwrap(), TEST_TOKEN);
        assert_eq!(cache.bootstrap_fetch_count(), 2);
        assert!(bus_consumer.try_recv().is_err());
    }

    #[test]
    fn test_invalidate_if_current_clears_only_matching_value() {
        let transport = Arc::new(ScriptedTransport::with_fallback(bootstrap_responder));
        let (cache, _bus_consumer) = make_cache(transport);
        let token = cache.get_token().unwrap();
        assert!(!cache.invalidate_if_current("some-older-token"));
        assert!(cache.cached_token().is_some());
        assert!(cache.invalidate_if_current(&token));
        assert!(!cache.invalidate_if_current(&token));
        assert!(cache.cached_token().is_none());
        cache.get_token().unwrap();
        assert_eq!(cache.bootstrap_fetch_count(), 2);
    }
}
