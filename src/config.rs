use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Files processed concurrently per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause between batches, respecting remote rate limits.
    #[serde(default = "default_batch_pause_secs")]
    pub batch_pause_secs: u64,
    /// Hard cap on enumerated files per run.
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    /// Per-request timeout for source fetches.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_pause_secs: default_batch_pause_secs(),
            max_files: default_max_files(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_batch_size() -> usize {
    5
}
fn default_batch_pause_secs() -> u64 {
    2
}
fn default_max_files() -> usize {
    1000
}
fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    pub github: Option<GithubSourceConfig>,
    pub filesystem: Option<FilesystemSourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GithubSourceConfig {
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Subdirectory within the repository to enumerate.
    #[serde(default = "default_root")]
    pub root: String,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_root() -> String {
    "rules".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemSourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.toml".to_string()]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.sync.batch_size == 0 {
        anyhow::bail!("sync.batch_size must be > 0");
    }
    if config.sync.max_files == 0 {
        anyhow::bail!("sync.max_files must be > 0");
    }
    if config.sync.request_timeout_secs == 0 {
        anyhow::bail!("sync.request_timeout_secs must be > 0");
    }

    if let Some(gh) = &config.sources.github {
        if gh.owner.is_empty() || gh.repo.is_empty() {
            anyhow::bail!("sources.github.owner and sources.github.repo must be set");
        }
    }

    Ok(config)
}

/// Optional source access credential, read from the environment so it never
/// lands in a config file. Absence degrades to unauthenticated access.
pub fn github_token() -> Option<String> {
    std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty())
}
