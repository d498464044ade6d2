//! Runtime configuration model and defaults.
//!
//! The orchestration core never parses files itself; it only reads these
//! values at the point of use. Loading lives in `config_persistence`.

use std::time::Duration;

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Remote catalog API preferences.
    pub catalog: CatalogConfig,
    #[serde(default)]
    /// External fetch executable and worker sizing.
    pub fetch: FetchConfig,
    #[serde(default)]
    /// Lyrics rendering and credentials.
    pub lyrics: LyricsConfig,
    #[serde(default)]
    /// Artwork sizing used when building artwork URLs.
    pub artwork: ArtworkConfig,
}

/// Catalog API preferences.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CatalogConfig {
    #[serde(default = "default_storefront")]
    pub storefront: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_search_limit")]
    pub search_limit: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// External fetch executable settings.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct FetchConfig {
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Arguments placed before the protocol arguments, e.g. a wrapper script path.
    #[serde(default)]
    pub executable_args: Vec<String>,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

/// Lyrics output format selector.
#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LyricsFormat {
    /// Line-timed `[mm:ss.ff]` rendering.
    #[default]
    Lrc,
    /// Native timed-text document, passed through unmodified.
    Ttml,
}

/// Lyrics preferences.
#[derive(Debug, Clone, PartialEq, Default, serde::Deserialize, serde::Serialize)]
pub struct LyricsConfig {
    #[serde(default)]
    pub format: LyricsFormat,
    /// User credential required only by the lyrics endpoint.
    #[serde(default)]
    pub media_user_token: Option<String>,
}

/// Artwork dimensions; zero means "use the fallback".
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ArtworkConfig {
    #[serde(default = "default_artwork_edge")]
    pub width: u32,
    #[serde(default = "default_artwork_edge")]
    pub height: u32,
}

pub const DEFAULT_ARTWORK_EDGE: u32 = 1200;

fn default_storefront() -> String {
    "us".to_string()
}

fn default_language() -> String {
    "en-US".to_string()
}

fn default_search_limit() -> u32 {
    25
}

fn default_request_timeout_secs() -> u64 {
    20
}

fn default_executable() -> String {
    "fetcher".to_string()
}

fn default_max_workers() -> usize {
    4
}

fn default_artwork_edge() -> u32 {
    DEFAULT_ARTWORK_EDGE
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            storefront: default_storefront(),
            language: default_language(),
            search_limit: default_search_limit(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            executable_args: Vec::new(),
            max_workers: default_max_workers(),
        }
    }
}

impl Default for ArtworkConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_ARTWORK_EDGE,
            height: DEFAULT_ARTWORK_EDGE,
        }
    }
}

impl CatalogConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ArtworkConfig {
    /// Fills a catalog artwork template such as `.../{w}x{h}bb.jpg`.
    pub fn artwork_url(&self, template: &str) -> String {
        let width = if self.width == 0 {
            DEFAULT_ARTWORK_EDGE
        } else {
            self.width
        };
        let height = if self.height == 0 {
            DEFAULT_ARTWORK_EDGE
        } else {
            self.height
        };
        template
            .replace("{w}", &width.to_string())
            .replace("{h}", &height.to_string())
    }
}

/// Clamps user-provided values into the ranges the runtime supports.
pub fn sanitize_config(config: Config) -> Config {
    let storefront = config.catalog.storefront.trim().to_ascii_lowercase();
    Config {
        catalog: CatalogConfig {
            storefront: if storefront.is_empty() {
                default_storefront()
            } else {
                storefront
            },
            language: config.catalog.language,
            search_limit: config.catalog.search_limit.clamp(1, 50),
            request_timeout_secs: config.catalog.request_timeout_secs.clamp(5, 60),
        },
        fetch: FetchConfig {
            executable: if config.fetch.executable.trim().is_empty() {
                default_executable()
            } else {
                config.fetch.executable
            },
            executable_args: config.fetch.executable_args,
            max_workers: config.fetch.max_workers.clamp(1, 16),
        },
        lyrics: LyricsConfig {
            format: config.lyrics.format,
            media_user_token: config
                .lyrics
                .media_user_token
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty()),
        },
        artwork: config.artwork,
    }
}

#[cfg(test)]
mod tests {
    use super::{sanitize_config, ArtworkConfig, Config, LyricsFormat};

    #[test]
    fn test_sanitize_config_clamps_ranges() {
        let mut config = Config::default();
        config.catalog.search_limit = 500;
        config.catalog.request_timeout_secs = 1;
        config.fetch.max_workers = 0;
        config.catalog.storefront = "  GB ".to_string();
        let sanitized = sanitize_config(config);
        assert_eq!(sanitized.catalog.search_limit, 50);
        assert_eq!(sanitized.catalog.request_timeout_secs, 5);
        assert_eq!(sanitized.fetch.max_workers, 1);
        assert_eq!(sanitized.catalog.storefront, "gb");
    }

    #[test]
    fn test_sanitize_config_drops_blank_media_user_token() {
        let mut config = Config::default();
        config.lyrics.media_user_token = Some("   ".to_string());
        assert_eq!(sanitize_config(config).lyrics.media_user_token, None);
    }

    #[test]
    fn test_artwork_url_falls_back_when_dimensions_are_zero() {
        let artwork = ArtworkConfig {
            width: 0,
            height: 600,
        };
        assert_eq!(
            artwork.artwork_url("https://img.example/{w}x{h}bb.jpg"),
            "https://img.example/1200x600bb.jpg"
        );
    }

    #[test]
    fn test_lyrics_format_parses_snake_case() {
        let config: Config = toml::from_str("[lyrics]\nformat = \"ttml\"\n").unwrap();
        assert_eq!(config.lyrics.format, LyricsFormat::Ttml);
        assert_eq!(config.catalog.storefront, "us");
    }
}
