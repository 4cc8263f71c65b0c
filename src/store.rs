//! SQLite rule store.
//!
//! Holds the normalized rules, an FTS5 index over their searchable text, and
//! the sync checkpoint. Upserts are keyed by rule id, making every write
//! safely repeatable.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

use crate::models::{DetectionRule, SyncState};

#[derive(Clone)]
pub struct RuleStore {
    pool: SqlitePool,
}

/// One keyword search hit.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub name: String,
    pub severity: String,
    pub description: Option<String>,
    pub score: f64,
}

/// Store totals for the stats command.
#[derive(Debug, Clone)]
pub struct StoreSummary {
    pub total_rules: i64,
    pub by_severity: Vec<(String, i64)>,
}

impl RuleStore {
    pub async fn connect(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Create-if-absent for every table and index. Idempotent; safe to call
    /// at the start of every run.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                query TEXT NOT NULL,
                language TEXT NOT NULL,
                severity TEXT NOT NULL,
                risk_score INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 1,
                rule_source TEXT NOT NULL,
                last_updated INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                dedup_hash TEXT NOT NULL,
                document TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create rules table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                source TEXT PRIMARY KEY,
                last_marker TEXT,
                last_sync_time TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create checkpoints table")?;

        // FTS5 CREATE is not idempotent natively, so check first.
        let fts_exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='rules_fts'",
        )
        .fetch_one(&self.pool)
        .await?;

        if !fts_exists {
            sqlx::query(
                r#"
                CREATE VIRTUAL TABLE rules_fts USING fts5(
                    rule_id UNINDEXED,
                    name,
                    description,
                    query,
                    tags
                )
                "#,
            )
            .execute(&self.pool)
            .await
            .context("Failed to create rules_fts table")?;
        }

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_rules_severity ON rules(severity)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_rules_last_updated ON rules(last_updated DESC)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Whether a rule with this id is already indexed.
    pub async fn exists(&self, id: &str) -> Result<bool> {
        let found: Option<String> = sqlx::query_scalar("SELECT id FROM rules WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Create-or-overwrite by id, replacing the FTS row in the same
    /// transaction.
    pub async fn upsert(&self, rule: &DetectionRule) -> Result<()> {
        let document = serde_json::to_string(rule)?;

        let mut hasher = Sha256::new();
        hasher.update(rule.id.as_bytes());
        hasher.update(rule.query.as_bytes());
        hasher.update(document.as_bytes());
        let dedup_hash = hex::encode(hasher.finalize());

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO rules (id, name, description, query, language, severity, risk_score,
                               version, rule_source, last_updated, enabled, dedup_hash, document)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                query = excluded.query,
                language = excluded.language,
                severity = excluded.severity,
                risk_score = excluded.risk_score,
                version = excluded.version,
                rule_source = excluded.rule_source,
                last_updated = excluded.last_updated,
                enabled = excluded.enabled,
                dedup_hash = excluded.dedup_hash,
                document = excluded.document
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(&rule.query)
        .bind(rule.language.as_str())
        .bind(rule.severity.as_str())
        .bind(rule.risk_score)
        .bind(rule.version)
        .bind(&rule.rule_source)
        .bind(rule.last_updated.timestamp())
        .bind(rule.enabled as i64)
        .bind(&dedup_hash)
        .bind(&document)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM rules_fts WHERE rule_id = ?")
            .bind(&rule.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO rules_fts (rule_id, name, description, query, tags) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&rule.id)
        .bind(&rule.name)
        .bind(rule.description.as_deref().unwrap_or(""))
        .bind(&rule.query)
        .bind(rule.tags.join(" "))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Flush the WAL so newly written rows are durable and visible to other
    /// connections.
    pub async fn refresh(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_checkpoint(&self, source: &str) -> Result<Option<SyncState>> {
        let row = sqlx::query(
            "SELECT last_marker, last_sync_time FROM checkpoints WHERE source = ?",
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let last_marker: Option<String> = row.get("last_marker");
            let last_sync_time: Option<String> = row.get("last_sync_time");
            SyncState {
                last_marker,
                last_sync_time: last_sync_time
                    .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
                    .map(|t| t.with_timezone(&Utc)),
            }
        }))
    }

    pub async fn put_checkpoint(&self, source: &str, state: &SyncState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (source, last_marker, last_sync_time, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(source) DO UPDATE SET
                last_marker = excluded.last_marker,
                last_sync_time = excluded.last_sync_time,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(source)
        .bind(&state.last_marker)
        .bind(state.last_sync_time.map(|t| t.to_rfc3339()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Connectivity probe for the health endpoint.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    /// Keyword search over name, description, query, and tags. Ranking is
    /// the engine's bm25; no scoring of our own.
    pub async fn search(&self, query: &str, limit: i64) -> Result<Vec<SearchHit>> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.name, r.severity, r.description, bm25(rules_fts) AS score
            FROM rules_fts
            JOIN rules r ON r.id = rules_fts.rule_id
            WHERE rules_fts MATCH ?
            ORDER BY score
            LIMIT ?
            "#,
        )
        .bind(query)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| SearchHit {
                id: row.get("id"),
                name: row.get("name"),
                severity: row.get("severity"),
                description: row.get("description"),
                score: row.get("score"),
            })
            .collect())
    }

    pub async fn summary(&self) -> Result<StoreSummary> {
        let total_rules: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rules")
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(
            "SELECT severity, COUNT(*) AS n FROM rules GROUP BY severity ORDER BY n DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let by_severity = rows
            .iter()
            .map(|row| (row.get("severity"), row.get("n")))
            .collect();

        Ok(StoreSummary {
            total_rules,
            by_severity,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_rule;

    async fn temp_store(dir: &tempfile::TempDir) -> RuleStore {
        let store = RuleStore::connect(&dir.path().join("rules.sqlite"))
            .await
            .unwrap();
        store.ensure_schema().await.unwrap();
        store
    }

    fn sample_rule(id: &str) -> DetectionRule {
        let raw = format!(
            "[rule]\nname = \"Rule {id}\"\nseverity = \"high\"\nquery = \"process.name : \\\"x\\\"\"\ntags = [\"Windows\"]\n"
        );
        parse_rule(&raw, &format!("{id}.toml")).unwrap()
    }

    #[tokio::test]
    async fn test_schema_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir).await;
        store.ensure_schema().await.unwrap();
        store.ensure_schema().await.unwrap();
    }

    #[tokio::test]
    async fn test_exists_flips_after_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir).await;

        assert!(!store.exists("r1").await.unwrap());
        store.upsert(&sample_rule("r1")).await.unwrap();
        assert!(store.exists("r1").await.unwrap());

        // Re-upsert stays keyed by id: still one row.
        store.upsert(&sample_rule("r1")).await.unwrap();
        let summary = store.summary().await.unwrap();
        assert_eq!(summary.total_rules, 1);
    }

    #[tokio::test]
    async fn test_checkpoint_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir).await;

        assert!(store.get_checkpoint("github").await.unwrap().is_none());

        let state = SyncState {
            last_marker: Some("abc123".to_string()),
            last_sync_time: Some(Utc::now()),
        };
        store.put_checkpoint("github", &state).await.unwrap();

        let loaded = store.get_checkpoint("github").await.unwrap().unwrap();
        assert_eq!(loaded.last_marker.as_deref(), Some("abc123"));
        assert!(loaded.last_sync_time.is_some());
    }

    #[tokio::test]
    async fn test_search_finds_indexed_rule() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir).await;

        store.upsert(&sample_rule("searchable")).await.unwrap();
        store.refresh().await.unwrap();

        let hits = store.search("process", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "searchable");
        assert_eq!(hits[0].severity, "high");
    }
}
