//! Core data models used throughout Rule Harness.
//!
//! These types represent the detection rules, sync state, and per-run
//! statistics that flow through the ingestion pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Query language a rule is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryLanguage {
    Kuery,
    Lucene,
    Eql,
}

impl QueryLanguage {
    /// Map a raw language string; unknown values fall back to kuery.
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "lucene" => Self::Lucene,
            "eql" => Self::Eql,
            _ => Self::Kuery,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kuery => "kuery",
            Self::Lucene => "lucene",
            Self::Eql => "eql",
        }
    }
}

impl Default for QueryLanguage {
    fn default() -> Self {
        Self::Kuery
    }
}

/// Rule severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Map a raw severity string; unknown values fall back to low.
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "medium" => Self::Medium,
            "high" => Self::High,
            "critical" => Self::Critical,
            _ => Self::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Self::Low
    }
}

/// Whether a rule is a standard query rule or a machine-learning rule.
///
/// Resolved once parsing completes, never assembled field-by-field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    Standard,
    MachineLearning {
        #[serde(rename = "jobId")]
        job_id: String,
    },
}

impl RuleKind {
    pub fn is_machine_learning(&self) -> bool {
        matches!(self, Self::MachineLearning { .. })
    }
}

/// A MITRE-style tactic reference attached to a threat mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatTactic {
    pub id: String,
    pub name: String,
    pub reference: String,
}

/// A technique entry under a threat mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatTechnique {
    pub id: String,
    pub name: String,
    pub reference: String,
}

/// One framework/tactic/technique record from a rule's threat section.
///
/// Populated best-effort: rules with unusual threat table layouts still
/// ingest, they just carry less structure here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatMapping {
    pub framework: String,
    pub tactic: ThreatTactic,
    #[serde(default)]
    pub technique: Vec<ThreatTechnique>,
}

/// The normalized unit of indexing: one detection rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionRule {
    /// Stable identifier derived from the source filename stem.
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub query: String,
    pub language: QueryLanguage,
    pub severity: Severity,
    pub risk_score: i64,
    pub version: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub false_positives: Vec<String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub author: Vec<String>,
    #[serde(default)]
    pub integration: Vec<String>,
    #[serde(default)]
    pub index: Vec<String>,
    #[serde(default)]
    pub threat: Vec<ThreatMapping>,
    pub maturity: Option<String>,
    pub creation_date: Option<String>,
    pub updated_date: Option<String>,
    pub license: Option<String>,
    /// The rule set's own UUID for the rule, distinct from `id`.
    pub rule_id: Option<String>,
    pub note: Option<String>,
    pub from: Option<String>,
    pub timestamp_override: Option<String>,
    /// Originating filename within the rule set.
    pub rule_source: String,
    /// Ingestion timestamp, not the rule's own metadata date.
    pub last_updated: DateTime<Utc>,
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: RuleKind,
}

/// The only durable cross-run memory: marker + timestamp of the last
/// completed pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub last_marker: Option<String>,
    pub last_sync_time: Option<DateTime<Utc>>,
}

/// Per-run counters, owned exclusively by the orchestrator. Workers report
/// outcomes back rather than holding references to this.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub total_files: u64,
    pub processed: u64,
    pub indexed: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub marker: Option<String>,
    /// Reason the run failed, if it did.
    pub error: Option<String>,
}

impl SyncStats {
    pub fn begin() -> Self {
        Self {
            total_files: 0,
            processed: 0,
            indexed: 0,
            updated: 0,
            skipped: 0,
            errors: 0,
            start_time: Utc::now(),
            end_time: None,
            marker: None,
            error: None,
        }
    }

    /// Fold one worker outcome into the counters.
    pub fn record(&mut self, outcome: &FileOutcome) {
        self.processed += 1;
        match outcome {
            FileOutcome::Indexed => self.indexed += 1,
            FileOutcome::Updated => self.updated += 1,
            FileOutcome::Skipped => self.skipped += 1,
            FileOutcome::Error => self.errors += 1,
        }
    }
}

/// Descriptor for one enumerated rule file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFile {
    /// Bare filename, e.g. `defense_evasion_clearing_logs.toml`.
    pub name: String,
    /// Path relative to the source root.
    pub path: String,
    /// Source-specific content locator (API path or absolute file path).
    pub locator: String,
}

impl RuleFile {
    /// The filename stem, used as the rule's store id.
    pub fn stem(&self) -> &str {
        self.name.strip_suffix(".toml").unwrap_or(&self.name)
    }
}

/// Classification of one file's trip through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// Newly created in the store.
    Indexed,
    /// Overwrote an existing document.
    Updated,
    /// Parser declined the file; expected and non-fatal.
    Skipped,
    /// Fetch or upsert failed; isolated to this file.
    Error,
}
