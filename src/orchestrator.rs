//! Named user actions mapped onto the job pool and the fetch manager.
//!
//! The orchestrator owns every long-lived component and the shared shutdown
//! flag. Results only ever leave through the bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use serde_json::Value;
use tokio::sync::broadcast::Sender;

use crate::catalog::client::{lookup_tracks, CatalogClient, LookupKind};
use crate::catalog::manifest::ManifestAggregator;
use crate::catalog::token_cache::TokenCache;
use crate::catalog::{HttpTransport, UreqTransport};
use crate::config::Config;
use crate::error::CoreError;
use crate::fetch::process_manager::ProcessFetchManager;
use crate::fetch::FetchCommand;
use crate::jobs::pool::JobPool;
use crate::jobs::{JobIdAllocator, JobKind};
use crate::lyrics;
use crate::protocol::{JobId, Message, SearchCategory, Severity};

pub struct Orchestrator {
    config: Config,
    bus_producer: Sender<Message>,
    shutdown: Arc<AtomicBool>,
    pool: JobPool,
    fetches: Arc<ProcessFetchManager>,
    catalog: Arc<CatalogClient>,
    manifests: Arc<ManifestAggregator>,
}

impl Orchestrator {
    /// Builds the production stack on top of a `ureq` transport.
    pub fn new(config: Config, bus_producer: Sender<Message>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let transport: Arc<dyn HttpTransport> =
            Arc::new(UreqTransport::new(config.catalog.request_timeout()));
        let tokens = Arc::new(TokenCache::new(
            Arc::clone(&transport),
            bus_producer.clone(),
        ));
        let catalog = Arc::new(CatalogClient::new(
            transport,
            tokens,
            &config.catalog.storefront,
            &config.catalog.language,
            config.catalog.request_timeout(),
            Arc::clone(&shutdown),
        ));
        Self::with_catalog(config, bus_producer, shutdown, catalog)
    }

    /// Builds around an existing catalog client that shares `shutdown`.
    pub fn with_catalog(
        config: Config,
        bus_producer: Sender<Message>,
        shutdown: Arc<AtomicBool>,
        catalog: Arc<CatalogClient>,
    ) -> Self {
        let job_ids = JobIdAllocator::new();
        let pool = JobPool::new(
            config.fetch.max_workers,
            job_ids.clone(),
            bus_producer.clone(),
            Arc::clone(&shutdown),
        );
        let fetches = Arc::new(ProcessFetchManager::new(
            FetchCommand::new(
                config.fetch.executable.clone(),
                config.fetch.executable_args.clone(),
            ),
            bus_producer.clone(),
            job_ids,
            Arc::clone(&shutdown),
        ));
        let manifests = Arc::new(
            ManifestAggregator::new(catalog.transport()).with_timeout(catalog.request_timeout()),
        );
        info!(
            "Orchestrator: ready (storefront={}, workers={}, executable={})",
            catalog.storefront(),
            config.fetch.max_workers,
            config.fetch.executable
        );
        Self {
            config,
            bus_producer,
            shutdown,
            pool,
            fetches,
            catalog,
            manifests,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn ensure_running(&self) -> Result<(), CoreError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(CoreError::Shutdown);
        }
        Ok(())
    }

    /// Generic multi-type search.
    pub fn search(&self, term: &str) -> Result<JobId, CoreError> {
        self.ensure_running()?;
        let term = non_empty(term, "search term")?;
        let catalog = Arc::clone(&self.catalog);
        let limit = self.config.catalog.search_limit;
        self.pool
            .submit(JobKind::Search, format!("search:{term}"), move |context| {
                context.token.check()?;
                let results = catalog.search(&term, limit)?;
                context.token.check()?;
                context.sink.search_results(&term, results);
                Ok(())
            })
    }

    /// Category-scoped search page; `offset > 0` appends to earlier results.
    pub fn search_category(
        &self,
        category: SearchCategory,
        term: &str,
        offset: u32,
    ) -> Result<JobId, CoreError> {
        self.ensure_running()?;
        let term = non_empty(term, "search term")?;
        let catalog = Arc::clone(&self.catalog);
        let limit = self.config.catalog.search_limit;
        self.pool.submit(
            JobKind::Search,
            format!("search:{}:{term}", category.label()),
            move |context| {
                context.token.check()?;
                let page = catalog.search_category(category, &term, limit, offset)?;
                context.token.check()?;
                context
                    .sink
                    .category_page(category, &term, offset, page.items, page.has_more);
                Ok(())
            },
        )
    }

    /// Looks up an album or playlist and enriches its tracks with manifest
    /// quality before emitting the result.
    pub fn lookup_album(&self, kind: LookupKind, id: &str) -> Result<JobId, CoreError> {
        self.ensure_running()?;
        let id = non_empty(id, "item id")?;
        let catalog = Arc::clone(&self.catalog);
        let manifests = Arc::clone(&self.manifests);
        let artwork = self.config.artwork.clone();
        let source = format!("{kind:?}:{id}").to_ascii_lowercase();
        self.pool
            .submit(JobKind::Lookup, source.clone(), move |context| {
                context.token.check()?;
                let mut payload = catalog.lookup(kind, &id)?;
                context.token.check()?;

                let tracks = lookup_tracks(&payload);
                context.sink.progress(0, tracks.len() as u64);
                let tracks = manifests.probe_qualities(tracks, &context.token)?;
                context.sink.progress(tracks.len() as u64, tracks.len() as u64);

                let artwork_url = payload
                    .pointer("/data/0/attributes/artwork/url")
                    .and_then(Value::as_str)
                    .map(|template| artwork.artwork_url(template));
                if let Some(object) = payload.as_object_mut() {
                    object.insert(
                        "tracks".to_string(),
                        Value::Array(tracks.into_iter().map(Value::Object).collect()),
                    );
                    if let Some(artwork_url) = artwork_url {
                        object.insert("artworkUrl".to_string(), Value::String(artwork_url));
                    }
                }
                context.sink.lookup_result(&source, payload);
                Ok(())
            })
    }

    /// Starts a download through the fetch executable.
    pub fn fetch(&self, url: &str) -> Result<JobId, CoreError> {
        self.ensure_running()?;
        let url = non_empty(url, "fetch url")?;
        let job = self.fetches.start_fetch(&url)?;
        let _ = self.bus_producer.send(Message::Status {
            text: format!("Fetching {url}"),
            severity: Severity::Info,
        });
        Ok(job.job_id)
    }

    /// Resolves an artist page through the fetch executable inside a lookup
    /// job. The process itself is only reachable through `cancel_all`.
    pub fn resolve_artist(&self, url: &str) -> Result<JobId, CoreError> {
        self.ensure_running()?;
        let url = non_empty(url, "artist url")?;
        let fetches = Arc::clone(&self.fetches);
        self.pool
            .submit(JobKind::Lookup, url.clone(), move |context| {
                context.token.check()?;
                let payload = fetches.resolve_artist(&url)?;
                context.token.check()?;
                context.sink.lookup_result(&url, payload);
                Ok(())
            })
    }

    /// Fetches lyrics for a song and renders them in the configured format.
    pub fn fetch_lyrics(&self, song_id: &str) -> Result<JobId, CoreError> {
        self.ensure_running()?;
        let song_id = non_empty(song_id, "song id")?;
        let Some(media_user_token) = self.config.lyrics.media_user_token.clone() else {
            return Err(CoreError::Auth(
                "a media user token is required for lyrics".to_string(),
            ));
        };
        let catalog = Arc::clone(&self.catalog);
        let format = self.config.lyrics.format;
        self.pool.submit(
            JobKind::Lookup,
            format!("lyrics:{song_id}"),
            move |context| {
                context.token.check()?;
                let document = catalog.fetch_lyrics(&song_id, &media_user_token)?;
                context.token.check()?;
                let Some(rendered) = lyrics::render(&document, format) else {
                    return Err(CoreError::Parse(format!(
                        "no timed lines in lyrics for song {song_id}"
                    )));
                };
                context.sink.lyrics(&song_id, rendered);
                Ok(())
            },
        )
    }

    pub fn set_storefront(&self, storefront: &str) {
        self.catalog.set_storefront(storefront);
        info!("Orchestrator: storefront set to {}", self.catalog.storefront());
    }

    /// Cancels a fetch or pool job by id.
    pub fn cancel(&self, job_id: JobId) -> bool {
        self.fetches.cancel(job_id) || self.pool.cancel(job_id)
    }

    /// Cancels every pool job and fetch process, then broadcasts
    /// `JobsCleared`.
    pub fn cancel_all(&self) {
        let jobs = self.pool.cancel_all();
        let processes = self.fetches.cancel_all_fetches();
        info!(
            "Orchestrator: cancelled {} jobs and {} processes",
            jobs, processes
        );
    }

    /// Rejects new work, tears down every process, and joins pool workers.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            warn!("Orchestrator: shutdown requested twice");
            return;
        }
        info!("Orchestrator: shutting down");
        self.fetches.cancel_all_fetches();
        self.pool.shutdown();
    }
}

fn non_empty(value: &str, what: &str) -> Result<String, CoreError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CoreError::Parse(format!("{what} is empty")));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use serde_json::{json, Value};
    use tokio::sync::broadcast::{self, Receiver};

    use super::Orchestrator;
    use crate::catalog::client::{CatalogClient, LookupKind};
    use crate::catalog::test_support::ScriptedTransport;
    use crate::catalog::token_cache::tests::{bootstrap_responder, BOOTSTRAP};
    use crate::catalog::token_cache::TokenCache;
    use crate::config::{Config, LyricsFormat};
    use crate::error::CoreError;
    use crate::protocol::{Message, SearchCategory};

    const API: &str = "https://api.test/v1";

    fn make_orchestrator(
        transport: Arc<ScriptedTransport>,
        config: Config,
    ) -> (Orchestrator, Receiver<Message>) {
        let (bus_producer, bus_consumer) = broadcast::channel(256);
        let shutdown = Arc::new(AtomicBool::new(false));
        let tokens = Arc::new(TokenCache::with_settings(
            transport.clone(),
            bus_producer.clone(),
            BOOTSTRAP.to_string(),
            Duration::ZERO,
        ));
        let catalog = Arc::new(
            CatalogClient::new(
                transport,
                tokens,
                "us",
                "en-US",
                Duration::from_secs(5),
                Arc::clone(&shutdown),
            )
            .with_endpoint(API, Duration::ZERO),
        );
        (
            Orchestrator::with_catalog(config, bus_producer, shutdown, catalog),
            bus_consumer,
        )
    }

    fn wait_for<T>(
        bus_consumer: &mut Receiver<Message>,
        select: impl Fn(&Message) -> Option<T>,
    ) -> T {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            match bus_consumer.try_recv() {
                Ok(message) => {
                    if let Some(selected) = select(&message) {
                        return selected;
                    }
                }
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        }
        panic!("expected message never arrived");
    }

    #[test]
    fn test_search_emits_results_for_term() {
        let transport = Arc::new(ScriptedTransport::with_fallback(bootstrap_responder));
        transport.push_ok(
            "/search",
            200,
            r#"{"results":{"songs":{"data":[{"id":"s1"}]}}}"#,
        );
        let (orchestrator, mut bus_consumer) = make_orchestrator(transport, Config::default());
        let job_id = orchestrator.search("  daft punk ").unwrap();

        let (term, results) = wait_for(&mut bus_consumer, |message| match message {
            Message::SearchResults {
                job_id: id,
                term,
                results,
            } if *id == job_id => Some((term.clone(), results.clone())),
            _ => None,
        });
        assert_eq!(term, "daft punk");
        let songs = results
            .iter()
            .find(|(category, _)| *category == SearchCategory::Songs)
            .map(|(_, items)| items.len());
        assert_eq!(songs, Some(1));
        orchestrator.shutdown();
    }

    #[test]
    fn test_load_more_emits_append_results() {
        let transport = Arc::new(ScriptedTransport::with_fallback(bootstrap_responder));
        transport.push_ok(
            "offset=25",
            200,
            r#"{"results":{"albums":{"data":[{"id":"a26"}],"next":"/v1/more"}}}"#,
        );
        let (orchestrator, mut bus_consumer) = make_orchestrator(transport, Config::default());
        orchestrator
            .search_category(SearchCategory::Albums, "jazz", 25)
            .unwrap();

        let (offset, has_more) = wait_for(&mut bus_consumer, |message| match message {
            Message::AppendResults {
                offset, has_more, ..
            } => Some((*offset, *has_more)),
            _ => None,
        });
        assert_eq!(offset, 25);
        assert!(has_more);
        orchestrator.shutdown();
    }

    #[test]
    fn test_lookup_album_enriches_tracks_in_order() {
        let transport = Arc::new(ScriptedTransport::with_fallback(bootstrap_responder));
        let lookup = json!({
            "data": [{
                "id": "1",
                "attributes": {
                    "name": "Album",
                    "artwork": {"url": "https://img.test/{w}x{h}bb.jpg"}
                },
                "relationships": {"tracks": {"data": [
                    {"id": "t1", "attributes": {
                        "name": "One",
                        "extendedAssetUrls": {"enhancedHls": "https://media.test/t1.m3u8"}
                    }},
                    {"id": "t2", "attributes": {"name": "Two"}}
                ]}}
            }]
        });
        transport.push_ok("/albums/1", 200, &lookup.to_string());
        transport.push_ok(
            "media.test/t1",
            200,
            "#EXTM3U\n#EXT-X-MEDIA:TYPE=AUDIO,AUDIO-FORMAT-ID=ec+3,CHANNELS=\"16/JOC\"\n#EXT-X-STREAM-INF:BANDWIDTH=768000,CODECS=\"ec-3\"\nt1.m3u8",
        );
        let (orchestrator, mut bus_consumer) = make_orchestrator(transport, Config::default());
        orchestrator.lookup_album(LookupKind::Album, "1").unwrap();

        let payload = wait_for(&mut bus_consumer, |message| match message {
            Message::LookupResult { payload, .. } => Some(payload.clone()),
            _ => None,
        });
        assert_eq!(payload["artworkUrl"], "https://img.test/1200x1200bb.jpg");
        let tracks = payload["tracks"].as_array().unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0]["id"], "t1");
        assert_eq!(tracks[0]["audioCodec"], "EC-3");
        assert_eq!(tracks[0]["bitrate"], 768000);
        let traits: Vec<&str> = tracks[0]["audioTraits"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(traits.contains(&"atmos"));
        assert!(traits.contains(&"spatial"));
        assert_eq!(tracks[1]["name"], "Two");
        assert!(tracks[1].get("audioCodec").is_none());
        orchestrator.shutdown();
    }

    #[test]
    fn test_lyrics_require_media_user_token() {
        let transport = Arc::new(ScriptedTransport::with_fallback(bootstrap_responder));
        let (orchestrator, _bus_consumer) = make_orchestrator(transport, Config::default());
        assert!(matches!(
            orchestrator.fetch_lyrics("s1"),
            Err(CoreError::Auth(_))
        ));
        orchestrator.shutdown();
    }

    #[test]
    fn test_lyrics_are_rendered_in_configured_format() {
        let document = r#"<tt><body><div><p begin="00:05.00">Later</p><p begin="00:01.00">Sooner</p></div></body></tt>"#;
        let transport = Arc::new(ScriptedTransport::with_fallback(bootstrap_responder));
        transport.push_ok(
            "/songs/s1/lyrics",
            200,
            &json!({"data": [{"attributes": {"ttml": document}}]}).to_string(),
        );
        let mut config = Config::default();
        config.lyrics.format = LyricsFormat::Lrc;
        config.lyrics.media_user_token = Some("user-token".to_string());
        let (orchestrator, mut bus_consumer) = make_orchestrator(transport, config);
        orchestrator.fetch_lyrics("s1").unwrap();

        let lyrics = wait_for(&mut bus_consumer, |message| match message {
            Message::LyricsReady { lyrics, .. } => Some(lyrics.clone()),
            _ => None,
        });
        assert_eq!(lyrics, "[00:01.00]Sooner\n[00:05.00]Later");
        orchestrator.shutdown();
    }

    #[test]
    fn test_failed_lookup_is_reported_on_job_channel() {
        let transport = Arc::new(ScriptedTransport::with_fallback(bootstrap_responder));
        for _ in 0..3 {
            transport.push_ok("/albums/9", 500, "");
        }
        let (orchestrator, mut bus_consumer) = make_orchestrator(transport, Config::default());
        let job_id = orchestrator.lookup_album(LookupKind::Album, "9").unwrap();
        let failed_id = wait_for(&mut bus_consumer, |message| match message {
            Message::JobFailed { job_id, .. } => Some(*job_id),
            _ => None,
        });
        assert_eq!(failed_id, job_id);
        orchestrator.shutdown();
    }

    #[test]
    fn test_actions_rejected_after_shutdown() {
        let transport = Arc::new(ScriptedTransport::with_fallback(bootstrap_responder));
        let (orchestrator, _bus_consumer) = make_orchestrator(transport, Config::default());
        orchestrator.shutdown();
        assert_eq!(orchestrator.search("x"), Err(CoreError::Shutdown));
        assert_eq!(orchestrator.fetch("u"), Err(CoreError::Shutdown));
        assert_eq!(
            orchestrator.search_category(SearchCategory::Videos, "x", 0),
            Err(CoreError::Shutdown)
        );
    }

    #[test]
    fn test_empty_search_term_is_rejected() {
        let transport = Arc::new(ScriptedTransport::new());
        let (orchestrator, _bus_consumer) = make_orchestrator(transport, Config::default());
        assert!(matches!(orchestrator.search("   "), Err(CoreError::Parse(_))));
        orchestrator.shutdown();
    }

    #[cfg(unix)]
    fn shell_config(script: &str) -> Config {
        let mut config = Config::default();
        config.fetch.executable = "/bin/sh".to_string();
        config.fetch.executable_args =
            vec!["-c".to_string(), script.to_string(), "fetcher".to_string()];
        config
    }

    #[cfg(unix)]
    #[test]
    fn test_fetch_and_resolve_artist_through_executable() {
        let script = r##"
echo '@@JSON_START@@'
printf '{"mode":"%s","url":"%s"}\n' "$1" "$2"
echo '@@JSON_END@@'
"##;
        let transport = Arc::new(ScriptedTransport::new());
        let (orchestrator, mut bus_consumer) =
            make_orchestrator(transport, shell_config(script));

        let job_id = orchestrator.fetch("https://example.test/album/5").unwrap();
        let payload = wait_for(&mut bus_consumer, |message| match message {
            Message::JobCompleted {
                job_id: id,
                payload,
                ..
            } if *id == job_id => Some(payload.clone()),
            _ => None,
        });
        assert_eq!(payload["mode"], "--json-output");

        orchestrator
            .resolve_artist("https://example.test/artist/3")
            .unwrap();
        let payload = wait_for(&mut bus_consumer, |message| match message {
            Message::LookupResult { payload, .. } => Some(payload.clone()),
            _ => None,
        });
        assert_eq!(
            payload,
            json!({"mode": "--resolve-artist", "url": "https://example.test/artist/3"})
        );
        orchestrator.shutdown();
    }

    #[cfg(unix)]
    #[test]
    fn test_cancel_all_clears_running_fetches() {
        let transport = Arc::new(ScriptedTransport::new());
        let (orchestrator, mut bus_consumer) =
            make_orchestrator(transport, shell_config("exec sleep 30"));
        let job_id = orchestrator.fetch("u").unwrap();
        orchestrator.cancel_all();
        wait_for(&mut bus_consumer, |message| {
            matches!(message, Message::JobsCleared).then_some(())
        });
        assert!(!orchestrator.cancel(job_id));
        orchestrator.shutdown();
    }
}
