//! Filesystem rule source.
//!
//! Enumerates rule files under a local directory (a checkout of the rule
//! set, or test fixtures) with the same contract as the remote source:
//! capped work-stack traversal, include/exclude globs, and a whole-source
//! revision marker derived from the listing.

use anyhow::{bail, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::warn;

use crate::config::FilesystemSourceConfig;
use crate::models::RuleFile;
use crate::source::RuleSource;

pub struct FilesystemSource {
    root: PathBuf,
    include_set: GlobSet,
    exclude_set: GlobSet,
    max_files: usize,
}

impl FilesystemSource {
    pub fn new(config: FilesystemSourceConfig, max_files: usize) -> Result<Self> {
        if !config.root.exists() {
            bail!(
                "Filesystem source root does not exist: {}",
                config.root.display()
            );
        }

        let include_set = build_globset(&config.include_globs)?;

        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        default_excludes.extend(config.exclude_globs.clone());
        let exclude_set = build_globset(&default_excludes)?;

        Ok(Self {
            root: config.root,
            include_set,
            exclude_set,
            max_files,
        })
    }

    /// Walk the tree with an explicit work-stack. Descent stops once the cap
    /// is reached; files collected so far are still returned.
    fn walk(&self) -> Vec<RuleFile> {
        let mut files = Vec::new();
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            if files.len() >= self.max_files {
                break;
            }

            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "skipping unreadable directory");
                    continue;
                }
            };

            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(dir = %dir.display(), error = %e, "skipping unreadable entry");
                        continue;
                    }
                };
                let path = entry.path();
                let relative = path.strip_prefix(&self.root).unwrap_or(&path);
                let rel_str = relative.to_string_lossy().to_string();

                if path.is_dir() {
                    stack.push(path);
                    continue;
                }

                if self.exclude_set.is_match(&rel_str) {
                    continue;
                }
                if !self.include_set.is_match(&rel_str) {
                    continue;
                }
                if !rel_str.ends_with(".toml") {
                    continue;
                }
                if files.len() >= self.max_files {
                    break;
                }

                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();

                files.push(RuleFile {
                    name,
                    path: rel_str,
                    locator: path.to_string_lossy().to_string(),
                });
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }
}

#[async_trait]
impl RuleSource for FilesystemSource {
    fn label(&self) -> &str {
        "filesystem"
    }

    async fn list(&self) -> Result<Vec<RuleFile>> {
        Ok(self.walk())
    }

    async fn fetch(&self, file: &RuleFile) -> Result<String> {
        let content = tokio::fs::read_to_string(&file.locator).await?;
        Ok(content)
    }

    /// Digest over the sorted listing: the same coarse changed-at-all signal
    /// the remote source gets from its head revision.
    async fn marker(&self) -> Result<Option<String>> {
        let files = self.walk();
        if files.is_empty() {
            return Ok(None);
        }
        let mut hasher = Sha256::new();
        for file in &files {
            hasher.update(file.path.as_bytes());
            hasher.update(b"\n");
        }
        Ok(Some(hex::encode(hasher.finalize())[..12].to_string()))
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
