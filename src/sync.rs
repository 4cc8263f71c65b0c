//! Sync orchestration.
//!
//! One [`SyncOrchestrator`] owns the whole run lifecycle: single-flight
//! admission, enumeration, bounded-concurrency batches with pacing between
//! them, per-file outcome aggregation, and checkpoint persistence. Workers
//! report a [`FileOutcome`] back; only the orchestrator touches the
//! statistics.
//!
//! Per-file failures (fetch, upsert) and parser rejections are isolated and
//! counted; a run only fails outright when the store schema cannot be set up
//! or the source enumerates zero files.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::models::{FileOutcome, RuleFile, SyncState, SyncStats};
use crate::parser::parse_rule;
use crate::source::RuleSource;
use crate::store::RuleStore;

/// Fatal run errors. Everything per-file is swallowed into counters instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync run is already active")]
    AlreadyRunning,
    #[error("store setup failed: {0}")]
    Store(#[source] anyhow::Error),
    #[error("no rule files found in source")]
    EmptySource,
}

pub struct SyncOrchestrator {
    store: RuleStore,
    source: Arc<dyn RuleSource>,
    sync_config: SyncConfig,
    running: AtomicBool,
    current: Mutex<Option<SyncStats>>,
    last: Mutex<Option<SyncStats>>,
}

impl SyncOrchestrator {
    pub fn new(store: RuleStore, source: Arc<dyn RuleSource>, sync_config: SyncConfig) -> Self {
        Self {
            store,
            source,
            sync_config,
            running: AtomicBool::new(false),
            current: Mutex::new(None),
            last: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Progress of the active run, if one is active.
    pub fn current(&self) -> Option<SyncStats> {
        self.current.lock().expect("stats lock poisoned").clone()
    }

    /// Frozen result of the most recent run.
    pub fn last(&self) -> Option<SyncStats> {
        self.last.lock().expect("stats lock poisoned").clone()
    }

    pub fn source_label(&self) -> &str {
        self.source.label()
    }

    /// Run a sync inline. Rejected with [`SyncError::AlreadyRunning`] if a
    /// run is active.
    pub async fn run(&self, force: bool) -> Result<SyncStats, SyncError> {
        self.claim()?;
        self.run_claimed(force).await
    }

    /// Claim the single-flight slot and hand the run to a background task.
    /// The caller only enqueues; conflicts are reported before spawning.
    pub fn start_background(self: &Arc<Self>, force: bool) -> Result<(), SyncError> {
        self.claim()?;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.run_claimed(force).await {
                warn!(error = %e, "background sync failed");
            }
        });
        Ok(())
    }

    fn claim(&self) -> Result<(), SyncError> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SyncError::AlreadyRunning)?;
        Ok(())
    }

    /// The run body, entered with the single-flight flag held. Releases the
    /// flag, freezes the last-run result, and clears the current-run slot on
    /// every path out.
    async fn run_claimed(&self, force: bool) -> Result<SyncStats, SyncError> {
        let mut stats = SyncStats::begin();
        *self.current.lock().expect("stats lock poisoned") = Some(stats.clone());

        let outcome = self.execute(&mut stats, force).await;

        stats.end_time = Some(Utc::now());
        if let Err(e) = &outcome {
            stats.error = Some(e.to_string());
            warn!(source = self.source.label(), error = %e, "sync failed");
        }

        *self.last.lock().expect("stats lock poisoned") = Some(stats.clone());
        *self.current.lock().expect("stats lock poisoned") = None;
        self.running.store(false, Ordering::SeqCst);

        outcome.map(|_| stats)
    }

    async fn execute(&self, stats: &mut SyncStats, force: bool) -> Result<(), SyncError> {
        let mode = if force { "full" } else { "incremental" };
        info!(source = self.source.label(), mode, "sync started");

        self.store.ensure_schema().await.map_err(SyncError::Store)?;

        let prior = match self.store.get_checkpoint(self.source.label()).await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "checkpoint load failed, treating as no prior state");
                None
            }
        };
        if let Some(prior) = &prior {
            debug!(marker = ?prior.last_marker, "prior checkpoint loaded");
        }

        let marker = match self.source.marker().await {
            Ok(marker) => marker,
            Err(e) => {
                warn!(error = %e, "could not resolve source revision marker");
                None
            }
        };
        stats.marker = marker.clone();

        let files = match self.source.list().await {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "source enumeration failed");
                Vec::new()
            }
        };
        if files.is_empty() {
            return Err(SyncError::EmptySource);
        }
        stats.total_files = files.len() as u64;
        info!(files = files.len(), "enumerated rule files");

        let pause = Duration::from_secs(self.sync_config.batch_pause_secs);
        for (batch_index, batch) in files.chunks(self.sync_config.batch_size).enumerate() {
            if batch_index > 0 {
                tokio::time::sleep(pause).await;
            }

            let mut tasks = JoinSet::new();
            for file in batch {
                let source = Arc::clone(&self.source);
                let store = self.store.clone();
                let file = file.clone();
                tasks.spawn(async move { process_file(source, store, file).await });
            }
            while let Some(joined) = tasks.join_next().await {
                let outcome = joined.unwrap_or(FileOutcome::Error);
                stats.record(&outcome);
            }

            *self.current.lock().expect("stats lock poisoned") = Some(stats.clone());
        }

        if let Err(e) = self.store.refresh().await {
            warn!(error = %e, "store refresh failed");
        }

        let state = SyncState {
            last_marker: marker,
            last_sync_time: Some(Utc::now()),
        };
        if let Err(e) = self.store.put_checkpoint(self.source.label(), &state).await {
            warn!(error = %e, "checkpoint write failed");
        }

        info!(
            indexed = stats.indexed,
            updated = stats.updated,
            skipped = stats.skipped,
            errors = stats.errors,
            "sync finished"
        );
        Ok(())
    }
}

/// One file's trip through the pipeline: fetch, parse, upsert, classify.
/// Every failure is contained to this file.
async fn process_file(
    source: Arc<dyn RuleSource>,
    store: RuleStore,
    file: RuleFile,
) -> FileOutcome {
    let raw = match source.fetch(&file).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(file = %file.path, error = %e, "fetch failed");
            return FileOutcome::Error;
        }
    };

    let rule = match parse_rule(&raw, &file.name) {
        Ok(rule) => rule,
        Err(reason) => {
            debug!(file = %file.path, %reason, "rule skipped");
            return FileOutcome::Skipped;
        }
    };

    // A failed existence check degrades to "not present": the upsert is
    // keyed by id, so re-indexing an existing rule is harmless.
    let existed = store.exists(&rule.id).await.unwrap_or(false);

    if let Err(e) = store.upsert(&rule).await {
        warn!(file = %file.path, error = %e, "upsert failed");
        return FileOutcome::Error;
    }

    if existed {
        FileOutcome::Updated
    } else {
        FileOutcome::Indexed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// In-memory source: named bodies, concurrency accounting, and an
    /// optional gate that holds `list()` open.
    struct TestSource {
        files: Vec<(String, String)>,
        gate: Option<Arc<Notify>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl TestSource {
        fn new(files: Vec<(String, String)>) -> Self {
            Self {
                files,
                gate: None,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn gated(files: Vec<(String, String)>, gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new(files)
            }
        }

        fn valid_rule(name: &str) -> (String, String) {
            (
                format!("{name}.toml"),
                format!("[rule]\nname = \"Rule {name}\"\nquery = \"event.kind : {name}\"\n"),
            )
        }
    }

    #[async_trait]
    impl RuleSource for TestSource {
        fn label(&self) -> &str {
            "test"
        }

        async fn list(&self) -> Result<Vec<RuleFile>> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(self
                .files
                .iter()
                .map(|(name, _)| RuleFile {
                    name: name.clone(),
                    path: name.clone(),
                    locator: name.clone(),
                })
                .collect())
        }

        async fn fetch(&self, file: &RuleFile) -> Result<String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let body = self
                .files
                .iter()
                .find(|(name, _)| name == &file.name)
                .map(|(_, body)| body.clone())
                .ok_or_else(|| anyhow::anyhow!("unknown file"))?;
            if body == "<fetch-error>" {
                anyhow::bail!("transport failure");
            }
            Ok(body)
        }

        async fn marker(&self) -> Result<Option<String>> {
            Ok(Some("rev-1".to_string()))
        }
    }

    async fn temp_store(dir: &tempfile::TempDir) -> RuleStore {
        RuleStore::connect(&dir.path().join("rules.sqlite"))
            .await
            .unwrap()
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            batch_pause_secs: 0,
            ..SyncConfig::default()
        }
    }

    #[tokio::test]
    async fn test_twelve_files_three_batches_two_pauses() {
        let dir = tempfile::tempdir().unwrap();
        let mut files: Vec<(String, String)> =
            (0..10).map(|i| TestSource::valid_rule(&format!("r{i}"))).collect();
        // One transport failure and one parser rejection still count as
        // processed.
        files.push(("bad_fetch.toml".to_string(), "<fetch-error>".to_string()));
        files.push(("no_name.toml".to_string(), "[rule]\nseverity = \"low\"\n".to_string()));

        let source = Arc::new(TestSource::new(files));
        let orchestrator = SyncOrchestrator::new(
            temp_store(&dir).await,
            source.clone(),
            SyncConfig {
                batch_pause_secs: 1,
                ..SyncConfig::default()
            },
        );

        let started = std::time::Instant::now();
        let stats = orchestrator.run(false).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(stats.total_files, 12);
        assert_eq!(stats.processed, 12);
        assert_eq!(stats.indexed, 10);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.marker.as_deref(), Some("rev-1"));

        // Three batches of (5, 5, 2) mean exactly two pacing pauses.
        assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");

        // Concurrency stays bounded by the batch size.
        assert!(source.max_in_flight.load(Ordering::SeqCst) <= 5);
        assert!(source.max_in_flight.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let files: Vec<(String, String)> =
            (0..3).map(|i| TestSource::valid_rule(&format!("r{i}"))).collect();
        let orchestrator = SyncOrchestrator::new(
            temp_store(&dir).await,
            Arc::new(TestSource::new(files)),
            fast_config(),
        );

        let first = orchestrator.run(false).await.unwrap();
        assert_eq!(first.indexed, 3);
        assert_eq!(first.updated, 0);

        let second = orchestrator.run(false).await.unwrap();
        assert_eq!(second.indexed, 0);
        assert_eq!(second.updated, 3);
    }

    #[tokio::test]
    async fn test_empty_source_fails_without_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir).await;
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            Arc::new(TestSource::new(Vec::new())),
            fast_config(),
        );

        let result = orchestrator.run(false).await;
        assert!(matches!(result, Err(SyncError::EmptySource)));
        assert!(store.get_checkpoint("test").await.unwrap().is_none());

        let last = orchestrator.last().unwrap();
        assert!(last.error.is_some());
        assert_eq!(last.processed, 0);
        assert!(!orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_second_run_conflicts_and_first_completes() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let orchestrator = Arc::new(SyncOrchestrator::new(
            temp_store(&dir).await,
            Arc::new(TestSource::gated(
                vec![TestSource::valid_rule("solo")],
                gate.clone(),
            )),
            fast_config(),
        ));

        let background = Arc::clone(&orchestrator);
        let handle = tokio::spawn(async move { background.run(false).await });

        while !orchestrator.is_running() {
            tokio::task::yield_now().await;
        }

        let conflict = orchestrator.run(false).await;
        assert!(matches!(conflict, Err(SyncError::AlreadyRunning)));

        gate.notify_one();
        let first = handle.await.unwrap().unwrap();
        assert_eq!(first.processed, 1);
        assert_eq!(first.indexed, 1);
        assert!(!orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_checkpoint_written_after_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir).await;
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            Arc::new(TestSource::new(vec![TestSource::valid_rule("cp")])),
            fast_config(),
        );

        orchestrator.run(false).await.unwrap();

        let checkpoint = store.get_checkpoint("test").await.unwrap().unwrap();
        assert_eq!(checkpoint.last_marker.as_deref(), Some("rev-1"));
        assert!(checkpoint.last_sync_time.is_some());
    }
}
