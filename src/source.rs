//! The source seam: where rule files come from.
//!
//! A [`RuleSource`] enumerates the rule files of one source-controlled rule
//! set, fetches their contents, and exposes a coarse whole-source revision
//! marker. Two implementations ship: the GitHub Contents API
//! ([`crate::connector_github`]) and a local directory
//! ([`crate::connector_fs`]).

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{self, Config};
use crate::connector_fs::FilesystemSource;
use crate::connector_github::GithubSource;
use crate::models::RuleFile;

/// A source of rule definition files.
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Short tag for logs and checkpoint keying (e.g. `"github"`).
    fn label(&self) -> &str;

    /// Enumerate all rule files, recursing into subdirectories up to the
    /// configured cap. One unreadable subtree never aborts the listing.
    async fn list(&self) -> Result<Vec<RuleFile>>;

    /// Retrieve one file's content.
    async fn fetch(&self, file: &RuleFile) -> Result<String>;

    /// An opaque token representing the state of the whole source. A changed
    /// marker means a re-sync may be needed; there is no per-file signal.
    async fn marker(&self) -> Result<Option<String>>;
}

/// Resolve a configured source by name.
pub fn resolve_source(config: &Config, name: &str) -> Result<Arc<dyn RuleSource>> {
    match name {
        "github" => {
            let gh = config
                .sources
                .github
                .clone()
                .ok_or_else(|| anyhow::anyhow!("GitHub source not configured"))?;
            Ok(Arc::new(GithubSource::new(
                gh,
                config.sync.clone(),
                config::github_token(),
            )?))
        }
        "filesystem" => {
            let fs = config
                .sources
                .filesystem
                .clone()
                .ok_or_else(|| anyhow::anyhow!("Filesystem source not configured"))?;
            Ok(Arc::new(FilesystemSource::new(fs, config.sync.max_files)?))
        }
        other => anyhow::bail!("Unknown source: '{}'. Available: github, filesystem", other),
    }
}

/// The source the server syncs from: github when configured, filesystem
/// otherwise.
pub fn default_source(config: &Config) -> Result<Arc<dyn RuleSource>> {
    if config.sources.github.is_some() {
        resolve_source(config, "github")
    } else if config.sources.filesystem.is_some() {
        resolve_source(config, "filesystem")
    } else {
        anyhow::bail!("No rule source configured. Add [sources.github] or [sources.filesystem].")
    }
}
