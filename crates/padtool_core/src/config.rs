use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILENAME: &str = "padtool.toml";
pub const DEFAULT_USER_AGENT: &str =
    "padtool/0.1 (Etherpad link inventory and archiver; contact via project page)";
pub const DEFAULT_LINK_QUERY: &str = "etherpad.wikimedia.org";
/// Largest `eulimit` the MediaWiki API grants anonymous clients.
pub const DEFAULT_LINK_LIMIT: usize = 500;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ToolConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub links: LinksConfig,
    #[serde(default)]
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_ms: 30_000,
            max_retries: 2,
            retry_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LinksConfig {
    pub query: String,
    pub limit: usize,
    pub page_delay_ms: u64,
    pub output_dir: PathBuf,
}

impl Default for LinksConfig {
    fn default() -> Self {
        Self {
            query: DEFAULT_LINK_QUERY.to_string(),
            limit: DEFAULT_LINK_LIMIT,
            page_delay_ms: 500,
            output_dir: PathBuf::from("output"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct DownloadConfig {
    pub delay_ms: u64,
    pub timeout_ms: u64,
    pub output_root: PathBuf,
    pub checkpoint_every: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            delay_ms: 300,
            timeout_ms: 15_000,
            output_root: PathBuf::from("downloaded_pads"),
            checkpoint_every: 25,
        }
    }
}

impl ToolConfig {
    /// Apply `PADTOOL_*` environment overrides on top of file values.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    /// Blank or unparsable values leave the current setting untouched.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let string = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        if let Some(value) = string("PADTOOL_USER_AGENT") {
            self.http.user_agent = value;
        }
        if let Some(value) = string("PADTOOL_HTTP_TIMEOUT_MS").and_then(|value| value.parse().ok()) {
            self.http.timeout_ms = value;
        }
        if let Some(value) = string("PADTOOL_HTTP_RETRIES").and_then(|value| value.parse().ok()) {
            self.http.max_retries = value;
        }
        if let Some(value) =
            string("PADTOOL_HTTP_RETRY_DELAY_MS").and_then(|value| value.parse().ok())
        {
            self.http.retry_delay_ms = value;
        }
    }

    /// HTTP settings for pad downloads, which use their own timeout.
    pub fn download_http(&self) -> HttpConfig {
        HttpConfig {
            timeout_ms: self.download.timeout_ms,
            ..self.http.clone()
        }
    }
}

/// Load a ToolConfig from a TOML file. Returns defaults if the file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<ToolConfig> {
    if !config_path.exists() {
        return Ok(ToolConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: ToolConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/padtool.toml")).expect("load config");
        assert_eq!(config, ToolConfig::default());
        assert_eq!(config.links.query, "etherpad.wikimedia.org");
        assert_eq!(config.links.limit, 500);
    }

    #[test]
    fn load_config_parses_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("padtool.toml");
        fs::write(
            &config_path,
            r#"
[http]
user_agent = "archiver-test/1.0"
max_retries = 5

[links]
page_delay_ms = 0
output_dir = "inventory"

[download]
delay_ms = 1000
checkpoint_every = 10
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.http.user_agent, "archiver-test/1.0");
        assert_eq!(config.http.max_retries, 5);
        assert_eq!(config.http.timeout_ms, 30_000);
        assert_eq!(config.links.page_delay_ms, 0);
        assert_eq!(config.links.output_dir, PathBuf::from("inventory"));
        assert_eq!(config.links.limit, 500);
        assert_eq!(config.download.delay_ms, 1000);
        assert_eq!(config.download.checkpoint_every, 10);
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("padtool.toml");
        fs::write(&config_path, "[http\nuser_agent = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn download_http_keeps_agent_but_uses_download_timeout() {
        let config = ToolConfig::default();
        let http = config.download_http();
        assert_eq!(http.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(http.timeout_ms, 15_000);
    }

    #[test]
    fn env_overrides_replace_http_settings() {
        let vars = HashMap::from([
            ("PADTOOL_USER_AGENT", " archiver/2.0 "),
            ("PADTOOL_HTTP_TIMEOUT_MS", "1200"),
            ("PADTOOL_HTTP_RETRIES", "four"),
            ("PADTOOL_HTTP_RETRY_DELAY_MS", ""),
        ]);
        let mut config = ToolConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|value| value.to_string()));

        assert_eq!(config.http.user_agent, "archiver/2.0");
        assert_eq!(config.http.timeout_ms, 1200);
        assert_eq!(config.http.max_retries, 2);
        assert_eq!(config.http.retry_delay_ms, 500);
        assert_eq!(config.links, LinksConfig::default());
    }
}
