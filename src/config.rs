use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Settings read from `datasmith.toml`. Every field is optional; env vars and
/// CLI flags take precedence.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatasmithConfig {
    pub cache_location: Option<String>,
    pub github_token: Option<String>,
    pub codecov_token: Option<String>,
    pub requests_per_second: Option<f64>,
    pub max_retries: Option<u32>,
    pub base_delay_secs: Option<f64>,
    pub max_backoff_secs: Option<f64>,
}

pub const DEFAULT_CACHE_LOCATION: &str = "cache.db";
pub const TOKENS_FILE: &str = "tokens.env";

pub fn default_config_path() -> PathBuf {
    PathBuf::from("datasmith.toml")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<DatasmithConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: DatasmithConfig = toml::from_str(&contents)?;
    Ok(Some(config))
}

/// Parse `KEY=VALUE` lines. Lines without `=` are ignored, values keep
/// everything after the first `=`.
pub fn parse_tokens_env(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

pub fn load_tokens_env(path: &Path) -> anyhow::Result<HashMap<String, String>> {
    if !path.exists() {
        tracing::warn!("No {} file found. Skipping token setup.", path.display());
        return Ok(HashMap::new());
    }
    let contents = std::fs::read_to_string(path)?;
    Ok(parse_tokens_env(&contents))
}

/// Resolved runtime settings shared by every command.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache_location: PathBuf,
    pub github_token: Option<String>,
    pub codecov_token: Option<String>,
    pub requests_per_second: f64,
    pub max_retries: u32,
    pub base_delay_secs: f64,
    pub max_backoff_secs: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_location: PathBuf::from(DEFAULT_CACHE_LOCATION),
            github_token: None,
            codecov_token: None,
            requests_per_second: 2.0,
            max_retries: 5,
            base_delay_secs: 1.0,
            max_backoff_secs: 60.0,
        }
    }
}

impl Settings {
    /// Merge sources: process env, then `tokens.env`, then the config file,
    /// then defaults.
    pub fn resolve(
        config: Option<&DatasmithConfig>,
        tokens: &HashMap<String, String>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let lookup = |key: &str| env(key).or_else(|| tokens.get(key).cloned());
        let defaults = Self::default();
        let config = config.cloned().unwrap_or_default();

        let cache_location = lookup("CACHE_LOCATION")
            .or(config.cache_location)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                tracing::warn!("CACHE_LOCATION not set. Using default '{}'.", DEFAULT_CACHE_LOCATION);
                defaults.cache_location.clone()
            });

        let github_token = lookup("GH_TOKEN").or(config.github_token);
        if github_token.is_none() {
            tracing::warn!("No GH_TOKEN found. Rate limits may apply.");
        }

        Self {
            cache_location,
            github_token,
            codecov_token: lookup("CODECOV_TOKEN").or(config.codecov_token),
            requests_per_second: config.requests_per_second.unwrap_or(defaults.requests_per_second),
            max_retries: config.max_retries.unwrap_or(defaults.max_retries),
            base_delay_secs: config.base_delay_secs.unwrap_or(defaults.base_delay_secs),
            max_backoff_secs: config.max_backoff_secs.unwrap_or(defaults.max_backoff_secs),
        }
    }
}

pub fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tokens_env() {
        let tokens = parse_tokens_env("GH_TOKEN=abc\n\n# comment\nCODECOV_TOKEN = x=y \n");
        assert_eq!(tokens.get("GH_TOKEN").map(String::as_str), Some("abc"));
        assert_eq!(tokens.get("CODECOV_TOKEN").map(String::as_str), Some("x=y"));
        assert_eq!(tokens.len(), 2);
    }

    #[test]
    fn test_settings_precedence() {
        let config = DatasmithConfig {
            cache_location: Some("from_config.db".into()),
            github_token: Some("config-token".into()),
            max_retries: Some(9),
            ..Default::default()
        };
        let mut tokens = HashMap::new();
        tokens.insert("GH_TOKEN".to_string(), "file-token".to_string());

        let settings = Settings::resolve(Some(&config), &tokens, |key| {
            (key == "CACHE_LOCATION").then(|| "from_env.db".to_string())
        });

        assert_eq!(settings.cache_location, PathBuf::from("from_env.db"));
        assert_eq!(settings.github_token.as_deref(), Some("file-token"));
        assert_eq!(settings.max_retries, 9);
        assert_eq!(settings.requests_per_second, 2.0);
    }

    #[test]
    fn test_load_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_config(Some(&dir.path().join("nope.toml"))).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_load_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("datasmith.toml");
        std::fs::write(&path, "cache_location = \"x.db\"\nmax_retries = 3\n").unwrap();
        let loaded = load_config(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded.cache_location.as_deref(), Some("x.db"));
        assert_eq!(loaded.max_retries, Some(3));
    }
}
