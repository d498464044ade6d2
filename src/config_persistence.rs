use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::config::{sanitize_config, Config};

const CONFIG_DIR_NAME: &str = "tunefetch";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default location of `config.toml` under the user's config directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|root| root.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Parses config text, falling back to defaults when it is malformed.
pub fn parse_config(content: &str) -> Config {
    match toml::from_str::<Config>(content) {
        Ok(config) => sanitize_config(config),
        Err(error) => {
            warn!("Config file is malformed, using defaults: {}", error);
            sanitize_config(Config::default())
        }
    }
}

/// Loads config from `path`. A missing or unreadable file yields defaults.
pub fn load_config(path: &Path) -> Config {
    if !path.exists() {
        info!(
            "Config file not found. Using defaults. path={}",
            path.display()
        );
        return sanitize_config(Config::default());
    }
    match std::fs::read_to_string(path) {
        Ok(content) => parse_config(&content),
        Err(error) => {
            warn!(
                "Failed to read config file {}: {}. Using defaults.",
                path.display(),
                error
            );
            sanitize_config(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{load_config, parse_config};
    use crate::config::Config;

    #[test]
    fn test_parse_config_falls_back_on_malformed_toml() {
        let config = parse_config("[catalog\nstorefront = 3");
        assert_eq!(config, crate::config::sanitize_config(Config::default()));
    }

    #[test]
    fn test_parse_config_reads_fetch_section() {
        let config = parse_config(
            "[fetch]\nexecutable = \"python3\"\nexecutable_args = [\"fetch.py\"]\nmax_workers = 2\n",
        );
        assert_eq!(config.fetch.executable, "python3");
        assert_eq!(config.fetch.executable_args, vec!["fetch.py".to_string()]);
        assert_eq!(config.fetch.max_workers, 2);
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let config = load_config(Path::new("/nonexistent/tunefetch/config.toml"));
        assert_eq!(config.catalog.storefront, "us");
    }
}
