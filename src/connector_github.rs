//! GitHub rule source.
//!
//! Enumerates and downloads rule files from a GitHub-hosted rule set using
//! the REST Contents API. Directory listings are walked with an explicit
//! work-stack and a hard cap on collected files; file contents arrive
//! base64-encoded and are decoded here. The whole-source revision marker is
//! the branch head commit SHA.
//!
//! # Configuration
//!
//! ```toml
//! [sources.github]
//! owner = "elastic"
//! repo = "detection-rules"
//! branch = "main"
//! root = "rules"
//! include_globs = ["**/*.toml"]
//! ```
//!
//! # Environment Variables
//!
//! - `GITHUB_TOKEN` — optional. Raises the API rate limit and grants access
//!   to private rule sets; absence degrades to unauthenticated access with
//!   otherwise identical behavior.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use crate::config::{GithubSourceConfig, SyncConfig};
use crate::models::RuleFile;
use crate::source::RuleSource;

const API_BASE: &str = "https://api.github.com";

pub struct GithubSource {
    config: GithubSourceConfig,
    include_set: GlobSet,
    exclude_set: GlobSet,
    max_files: usize,
    client: reqwest::Client,
}

/// One entry in a Contents API directory listing.
#[derive(Debug, Deserialize)]
struct ContentEntry {
    name: String,
    path: String,
    #[serde(rename = "type")]
    entry_type: String,
}

/// A Contents API file object, as returned for a single path.
#[derive(Debug, Deserialize)]
struct ContentFile {
    content: Option<String>,
    encoding: Option<String>,
}

/// The head commit of a branch.
#[derive(Debug, Deserialize)]
struct BranchCommit {
    sha: String,
}

impl GithubSource {
    pub fn new(
        config: GithubSourceConfig,
        sync: SyncConfig,
        token: Option<String>,
    ) -> Result<Self> {
        let include_set = build_globset(&config.include_globs)?;
        let exclude_set = build_globset(&config.exclude_globs)?;

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/vnd.github+json"),
        );
        if let Some(token) = token {
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
                .context("Invalid GITHUB_TOKEN value")?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("rule-harness/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(Duration::from_secs(sync.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            config,
            include_set,
            exclude_set,
            max_files: sync.max_files,
            client,
        })
    }

    fn contents_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}?ref={}",
            API_BASE, self.config.owner, self.config.repo, path, self.config.branch
        )
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<ContentEntry>> {
        let resp = self
            .client
            .get(self.contents_url(path))
            .send()
            .await
            .with_context(|| format!("Failed to list {}", path))?;

        if !resp.status().is_success() {
            bail!("GitHub listing of '{}' failed (HTTP {})", path, resp.status());
        }

        let entries: Vec<ContentEntry> = resp.json().await?;
        Ok(entries)
    }

    /// Path relative to the configured root, for glob matching.
    fn relative(&self, path: &str) -> String {
        let root = self.config.root.trim_end_matches('/');
        path.strip_prefix(root)
            .map(|s| s.trim_start_matches('/').to_string())
            .unwrap_or_else(|| path.to_string())
    }
}

#[async_trait]
impl RuleSource for GithubSource {
    fn label(&self) -> &str {
        "github"
    }

    async fn list(&self) -> Result<Vec<RuleFile>> {
        let mut files = Vec::new();
        let mut stack = vec![self.config.root.trim_end_matches('/').to_string()];

        while let Some(dir) = stack.pop() {
            if files.len() >= self.max_files {
                break;
            }

            let entries = match self.list_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = %dir, error = %e, "skipping unlistable directory");
                    continue;
                }
            };

            for entry in entries {
                match entry.entry_type.as_str() {
                    "dir" => stack.push(entry.path),
                    "file" => {
                        let rel = self.relative(&entry.path);
                        if !entry.name.ends_with(".toml") {
                            continue;
                        }
                        if self.exclude_set.is_match(&rel) || !self.include_set.is_match(&rel) {
                            continue;
                        }
                        if files.len() >= self.max_files {
                            break;
                        }
                        files.push(RuleFile {
                            name: entry.name,
                            path: rel,
                            locator: entry.path,
                        });
                    }
                    _ => {}
                }
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn fetch(&self, file: &RuleFile) -> Result<String> {
        let resp = self
            .client
            .get(self.contents_url(&file.locator))
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", file.path))?;

        if !resp.status().is_success() {
            bail!("GitHub fetch of '{}' failed (HTTP {})", file.path, resp.status());
        }

        let payload: ContentFile = resp.json().await?;
        match (payload.content, payload.encoding.as_deref()) {
            (Some(content), Some("base64")) => {
                let cleaned: String = content.chars().filter(|c| !c.is_whitespace()).collect();
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(cleaned)
                    .with_context(|| format!("Invalid base64 content for {}", file.path))?;
                Ok(String::from_utf8_lossy(&bytes).to_string())
            }
            (Some(content), _) => Ok(content),
            (None, _) => bail!("GitHub returned no content for '{}'", file.path),
        }
    }

    async fn marker(&self) -> Result<Option<String>> {
        let url = format!(
            "{}/repos/{}/{}/commits/{}",
            API_BASE, self.config.owner, self.config.repo, self.config.branch
        );
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            bail!(
                "GitHub head commit lookup failed (HTTP {})",
                resp.status()
            );
        }
        let commit: BranchCommit = resp.json().await?;
        Ok(Some(commit.sha))
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
