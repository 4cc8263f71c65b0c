//! Detection rule parser.
//!
//! Turns the section-based rule definition format into a [`DetectionRule`],
//! or a [`Rejection`] when the input does not carry enough to index. The
//! parser is a single-pass, line-oriented state machine and performs no I/O;
//! malformed input degrades to a rejection, never an error.
//!
//! The format is a narrow slice of TOML-like syntax: `[metadata]` and
//! `[rule]` section headers, repeated sub-tables (`[[rule.threat]]`),
//! `key = value` assignments, array literals, `#` comments, and
//! triple-quoted multiline strings for query, description, and note bodies.

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::fields::extract_fields;
use crate::models::{
    DetectionRule, QueryLanguage, RuleKind, Severity, ThreatMapping, ThreatTactic,
    ThreatTechnique,
};

const MULTILINE_DELIM: &str = "\"\"\"";

/// Why a file was declined. Counted as skipped upstream, never as an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("rule has no name")]
    MissingName,
    #[error("rule has no query and no machine learning job id")]
    MissingQuery,
}

/// Parser position within the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Root,
    InMetadata,
    InRule,
    /// Capturing a triple-quoted block; `None` when no owning field could
    /// be identified (the block is consumed and discarded).
    InMultiline(Option<CaptureField>),
}

/// Which logical field a multiline capture belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureField {
    Query,
    Description,
    Note,
}

impl CaptureField {
    fn from_key(key: &str) -> Option<Self> {
        match key {
            "query" => Some(Self::Query),
            "description" => Some(Self::Description),
            "note" => Some(Self::Note),
            _ => None,
        }
    }
}

/// Which part of a threat sub-table subsequent root-level keys belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreatContext {
    None,
    Entry,
    Tactic,
    Technique,
}

/// Accumulates fields during the pass; resolved into a [`DetectionRule`]
/// only once parsing completes.
#[derive(Default)]
struct RuleBuilder {
    name: Option<String>,
    description: Option<String>,
    query: Option<String>,
    language: Option<String>,
    rule_type: Option<String>,
    severity: Option<String>,
    risk_score: Option<i64>,
    version: Option<i64>,
    tags: Vec<String>,
    references: Vec<String>,
    false_positives: Vec<String>,
    required_fields: Vec<String>,
    author: Vec<String>,
    integration: Vec<String>,
    index: Vec<String>,
    threat: Vec<ThreatMapping>,
    maturity: Option<String>,
    creation_date: Option<String>,
    updated_date: Option<String>,
    license: Option<String>,
    rule_id: Option<String>,
    note: Option<String>,
    from: Option<String>,
    timestamp_override: Option<String>,
    enabled: Option<bool>,
    ml_job_id: Option<String>,
}

/// Parse one rule definition file.
///
/// `filename` supplies the store id (its stem) and the `rule_source` field.
pub fn parse_rule(raw: &str, filename: &str) -> Result<DetectionRule, Rejection> {
    let lines: Vec<&str> = raw.lines().collect();
    let mut state = State::Root;
    // Section to resume once a multiline capture closes. Keys routinely
    // follow a multiline description within [rule], so the section survives
    // the capture.
    let mut resume = State::Root;
    let mut threat_ctx = ThreatContext::None;
    let mut builder = RuleBuilder::default();
    let mut capture: Vec<String> = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        if let State::InMultiline(field) = state {
            if line.contains(MULTILINE_DELIM) {
                if let Some(field) = field {
                    commit_capture(&mut builder, field, &capture);
                }
                capture.clear();
                state = resume;
            } else {
                capture.push((*line).to_string());
            }
            continue;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        match trimmed {
            "[metadata]" => {
                state = State::InMetadata;
                threat_ctx = ThreatContext::None;
                continue;
            }
            "[rule]" => {
                state = State::InRule;
                threat_ctx = ThreatContext::None;
                continue;
            }
            _ => {}
        }

        // Sub-table markers drop back to the root state; threat tables are
        // tracked so their scalar keys can be routed best-effort.
        if trimmed.starts_with('[') && is_table_marker(trimmed) {
            state = State::Root;
            threat_ctx = threat_context_for(trimmed, &mut builder);
            continue;
        }

        if let Some(delim_pos) = trimmed.find(MULTILINE_DELIM) {
            // A line carrying both delimiters commits its inline text and
            // never leaves the section.
            let after = &trimmed[delim_pos + MULTILINE_DELIM.len()..];
            let field = capture_field_for(trimmed, &lines, i);
            if let Some(end) = after.find(MULTILINE_DELIM) {
                if let Some(field) = field {
                    commit_capture(&mut builder, field, &[after[..end].to_string()]);
                }
            } else {
                resume = state;
                state = State::InMultiline(field);
            }
            continue;
        }

        if let Some((key, value)) = split_assignment(trimmed) {
            match state {
                State::InMetadata => route_metadata_key(&mut builder, key, value),
                State::InRule => route_rule_key(&mut builder, key, value),
                State::Root => route_threat_key(&mut builder, threat_ctx, key, value),
                State::InMultiline(_) => unreachable!("handled above"),
            }
        }
    }

    finish(builder, filename)
}

/// A `[...]` or `[[...]]` header line, as opposed to an array literal.
fn is_table_marker(trimmed: &str) -> bool {
    trimmed.ends_with(']') && !trimmed.contains('=')
}

/// Route a table marker to the threat context it opens.
fn threat_context_for(marker: &str, builder: &mut RuleBuilder) -> ThreatContext {
    let inner = marker.trim_matches(|c| c == '[' || c == ']');
    if inner == "rule.threat" {
        builder.threat.push(ThreatMapping::default());
        ThreatContext::Entry
    } else if inner == "rule.threat.tactic" {
        ThreatContext::Tactic
    } else if inner == "rule.threat.technique" {
        if let Some(entry) = builder.threat.last_mut() {
            entry.technique.push(ThreatTechnique::default());
        }
        ThreatContext::Technique
    } else {
        ThreatContext::None
    }
}

/// Identify which field owns a multiline capture: the delimiter line itself
/// first, then the preceding one or two lines.
fn capture_field_for(current: &str, lines: &[&str], index: usize) -> Option<CaptureField> {
    if let Some(field) = field_assignment_on(current) {
        return Some(field);
    }
    for back in 1..=2 {
        if index < back {
            break;
        }
        if let Some(field) = field_assignment_on(lines[index - back].trim()) {
            return Some(field);
        }
    }
    None
}

fn field_assignment_on(line: &str) -> Option<CaptureField> {
    let key = line.split(" = ").next()?.trim();
    CaptureField::from_key(key)
}

fn commit_capture(builder: &mut RuleBuilder, field: CaptureField, buffered: &[String]) {
    let text = buffered.join("\n").trim().to_string();
    if text.is_empty() {
        return;
    }
    match field {
        CaptureField::Query => builder.query = Some(text),
        CaptureField::Description => builder.description = Some(text),
        CaptureField::Note => builder.note = Some(text),
    }
}

/// Split `key = value` on the first ` = `.
fn split_assignment(line: &str) -> Option<(&str, &str)> {
    let pos = line.find(" = ")?;
    let key = line[..pos].trim();
    let value = line[pos + 3..].trim();
    if key.is_empty() {
        return None;
    }
    Some((key, value))
}

/// Strip one layer of surrounding single or double quotes.
fn strip_quotes(value: &str) -> String {
    let v = value.trim();
    if v.len() >= 2
        && ((v.starts_with('"') && v.ends_with('"'))
            || (v.starts_with('\'') && v.ends_with('\'')))
    {
        v[1..v.len() - 1].to_string()
    } else {
        v.to_string()
    }
}

/// Parse an array-shaped value. A bare scalar with no brackets becomes a
/// single-element sequence; empty elements are dropped.
fn parse_array(value: &str) -> Vec<String> {
    let v = value.trim();
    if let Some(inner) = v.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        inner
            .split(',')
            .map(|e| strip_quotes(e.trim()))
            .filter(|e| !e.is_empty())
            .collect()
    } else {
        let scalar = strip_quotes(v);
        if scalar.is_empty() {
            Vec::new()
        } else {
            vec![scalar]
        }
    }
}

/// Normalize a rule date to `YYYY-MM-DD`, or drop it.
fn normalize_date(value: &str) -> Option<String> {
    let v = strip_quotes(value);
    let v = v.trim();
    if v.is_empty() {
        return None;
    }

    let parts: Vec<&str> = v.split('/').collect();
    if parts.len() == 3 && parts.iter().all(|p| p.chars().all(|c| c.is_ascii_digit())) {
        return Some(format!("{}-{}-{}", parts[0], parts[1], parts[2]));
    }

    if NaiveDate::parse_from_str(v, "%Y-%m-%d").is_ok() {
        return Some(v.to_string());
    }

    // Anything else is parsed generically; only the date portion survives.
    if let Ok(dt) = DateTime::parse_from_rfc3339(v) {
        return Some(dt.date_naive().format("%Y-%m-%d").to_string());
    }
    if let Ok(dt) = NaiveDate::parse_from_str(v, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.format("%Y-%m-%d").to_string());
    }
    None
}

fn parse_int(value: &str) -> Option<i64> {
    strip_quotes(value).trim().parse::<i64>().ok()
}

fn route_metadata_key(builder: &mut RuleBuilder, key: &str, value: &str) {
    match key {
        "creation_date" => builder.creation_date = normalize_date(value),
        "updated_date" => builder.updated_date = normalize_date(value),
        "integration" => builder.integration = parse_array(value),
        "maturity" => builder.maturity = Some(strip_quotes(value)),
        _ => {}
    }
}

fn route_rule_key(builder: &mut RuleBuilder, key: &str, value: &str) {
    match key {
        "name" => builder.name = Some(strip_quotes(value)),
        "description" => builder.description = Some(strip_quotes(value)),
        "query" => builder.query = Some(strip_quotes(value)),
        "language" => builder.language = Some(strip_quotes(value)),
        "type" => builder.rule_type = Some(strip_quotes(value)),
        "severity" => builder.severity = Some(strip_quotes(value)),
        "risk_score" => builder.risk_score = parse_int(value),
        "version" => builder.version = parse_int(value),
        "license" => builder.license = Some(strip_quotes(value)),
        "rule_id" => builder.rule_id = Some(strip_quotes(value)),
        "note" => builder.note = Some(strip_quotes(value)),
        "from" => builder.from = Some(strip_quotes(value)),
        "timestamp_override" => builder.timestamp_override = Some(strip_quotes(value)),
        "enabled" => builder.enabled = Some(strip_quotes(value) == "true"),
        "tags" => builder.tags = parse_array(value),
        "references" => builder.references = parse_array(value),
        "author" => builder.author = parse_array(value),
        "false_positives" => builder.false_positives = parse_array(value),
        "required_fields" => builder.required_fields = parse_array(value),
        "index" => builder.index = parse_array(value),
        "machine_learning_job_id" => {
            builder.ml_job_id = parse_array(value).into_iter().next();
        }
        _ => {}
    }
}

/// Best-effort routing for threat sub-table keys encountered at root.
fn route_threat_key(builder: &mut RuleBuilder, ctx: ThreatContext, key: &str, value: &str) {
    let Some(entry) = builder.threat.last_mut() else {
        return;
    };
    match ctx {
        ThreatContext::Entry => {
            if key == "framework" {
                entry.framework = strip_quotes(value);
            }
        }
        ThreatContext::Tactic => {
            let tactic: &mut ThreatTactic = &mut entry.tactic;
            match key {
                "id" => tactic.id = strip_quotes(value),
                "name" => tactic.name = strip_quotes(value),
                "reference" => tactic.reference = strip_quotes(value),
                _ => {}
            }
        }
        ThreatContext::Technique => {
            if let Some(tech) = entry.technique.last_mut() {
                match key {
                    "id" => tech.id = strip_quotes(value),
                    "name" => tech.name = strip_quotes(value),
                    "reference" => tech.reference = strip_quotes(value),
                    _ => {}
                }
            }
        }
        ThreatContext::None => {}
    }
}

/// Post-pass synthesis and the validation gate.
fn finish(mut builder: RuleBuilder, filename: &str) -> Result<DetectionRule, Rejection> {
    let name = builder.name.take().filter(|n| !n.is_empty());

    // A machine-learning rule without a query gets a synthetic placeholder
    // referencing the job, and its kind defaults accordingly.
    if builder.query.as_deref().map_or(true, str::is_empty) {
        if let Some(job_id) = &builder.ml_job_id {
            builder.query = Some(format!("ML Job: {}", job_id));
            if builder.rule_type.is_none() {
                builder.rule_type = Some("machine_learning".to_string());
            }
        }
    }

    let name = name.ok_or(Rejection::MissingName)?;
    let query = builder
        .query
        .take()
        .filter(|q| !q.is_empty())
        .ok_or(Rejection::MissingQuery)?;

    let kind = match builder.ml_job_id.take() {
        Some(job_id) => RuleKind::MachineLearning { job_id },
        None => RuleKind::Standard,
    };

    if builder.required_fields.is_empty() && !kind.is_machine_learning() {
        builder.required_fields = extract_fields(&query);
    }

    let stem = filename.strip_suffix(".toml").unwrap_or(filename);

    Ok(DetectionRule {
        id: stem.to_string(),
        name,
        description: builder.description,
        query,
        language: builder
            .language
            .as_deref()
            .map(QueryLanguage::from_raw)
            .unwrap_or_default(),
        severity: builder
            .severity
            .as_deref()
            .map(Severity::from_raw)
            .unwrap_or_default(),
        risk_score: builder.risk_score.unwrap_or(0),
        version: builder.version.unwrap_or(1),
        tags: builder.tags,
        references: builder.references,
        false_positives: builder.false_positives,
        required_fields: builder.required_fields,
        author: builder.author,
        integration: builder.integration,
        index: builder.index,
        threat: builder.threat,
        maturity: builder.maturity,
        creation_date: builder.creation_date,
        updated_date: builder.updated_date,
        license: builder.license,
        rule_id: builder.rule_id,
        note: builder.note,
        from: builder.from,
        timestamp_override: builder.timestamp_override,
        rule_source: filename.to_string(),
        last_updated: Utc::now(),
        enabled: builder.enabled.unwrap_or(true),
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC_RULE: &str = r#"
[metadata]
creation_date = "2024/07/25"
updated_date = "2024/08/01"
integration = ["endpoint", "windows"]
maturity = "production"

[rule]
name = "Suspicious PowerShell Download"
description = "Detects PowerShell downloading remote payloads."
risk_score = 47
severity = "medium"
language = "kuery"
type = "query"
version = 3
rule_id = "a0b1c2d3-e4f5-6789-abcd-ef0123456789"
license = "Elastic License v2"
tags = ["Windows", "Execution"]
references = ["https://attack.mitre.org/techniques/T1059/"]
author = ["Acme Security"]
false_positives = ["Administrators downloading tooling"]
index = ["logs-endpoint.events.*", "winlogbeat-*"]
query = "process.name : \"powershell.exe\" and event.action : \"start\""
"#;

    #[test]
    fn test_parse_basic_rule() {
        let rule = parse_rule(BASIC_RULE, "execution_powershell_download.toml").unwrap();
        assert_eq!(rule.id, "execution_powershell_download");
        assert_eq!(rule.name, "Suspicious PowerShell Download");
        assert_eq!(rule.severity, Severity::Medium);
        assert_eq!(rule.language, QueryLanguage::Kuery);
        assert_eq!(rule.risk_score, 47);
        assert_eq!(rule.version, 3);
        assert_eq!(rule.tags, vec!["Windows", "Execution"]);
        assert_eq!(rule.index.len(), 2);
        assert_eq!(rule.integration, vec!["endpoint", "windows"]);
        assert_eq!(rule.creation_date.as_deref(), Some("2024-07-25"));
        assert_eq!(rule.updated_date.as_deref(), Some("2024-08-01"));
        assert_eq!(rule.maturity.as_deref(), Some("production"));
        assert_eq!(rule.rule_source, "execution_powershell_download.toml");
        assert!(rule.enabled);
        assert_eq!(rule.kind, RuleKind::Standard);
    }

    #[test]
    fn test_id_is_filename_stem() {
        let raw = "[rule]\nname = \"R\"\nquery = \"a : b\"\n";
        let rule = parse_rule(raw, "my_rule.toml").unwrap();
        assert_eq!(rule.id, "my_rule");
        let rule = parse_rule(raw, "no_extension").unwrap();
        assert_eq!(rule.id, "no_extension");
    }

    #[test]
    fn test_missing_name_and_query_rejected() {
        let raw = "[rule]\nseverity = \"low\"\n";
        assert_eq!(parse_rule(raw, "x.toml"), Err(Rejection::MissingName));
    }

    #[test]
    fn test_missing_query_rejected() {
        let raw = "[rule]\nname = \"Named but empty\"\n";
        assert_eq!(parse_rule(raw, "x.toml"), Err(Rejection::MissingQuery));
    }

    #[test]
    fn test_machine_learning_rule_synthesizes_query() {
        let raw = r#"
[rule]
name = "Anomalous Process Activity"
machine_learning_job_id = "rare_process_by_host"
severity = "high"
"#;
        let rule = parse_rule(raw, "ml_rare_process.toml").unwrap();
        assert_eq!(rule.query, "ML Job: rare_process_by_host");
        assert_eq!(
            rule.kind,
            RuleKind::MachineLearning {
                job_id: "rare_process_by_host".to_string()
            }
        );
        // ML rules never run the field extractor.
        assert!(rule.required_fields.is_empty());
    }

    #[test]
    fn test_multiline_query_capture() {
        let raw = r#"
[rule]
name = "EQL Sequence Rule"
language = "eql"
query = """
sequence by host.id
  [process where process.name == "cmd.exe"]
  [network where destination.port == 4444]
"""
"#;
        let rule = parse_rule(raw, "seq.toml").unwrap();
        assert!(rule.query.starts_with("sequence by host.id"));
        assert!(rule.query.contains("destination.port == 4444"));
        assert_eq!(rule.language, QueryLanguage::Eql);
    }

    #[test]
    fn test_multiline_description_and_note() {
        let raw = r#"
[rule]
name = "Documented Rule"
description = """
First line.
Second line.
"""
query = "a.field : true"
note = """
Triage guidance goes here.
"""
"#;
        let rule = parse_rule(raw, "doc.toml").unwrap();
        assert_eq!(rule.description.as_deref(), Some("First line.\nSecond line."));
        assert_eq!(rule.note.as_deref(), Some("Triage guidance goes here."));
    }

    #[test]
    fn test_date_normalization() {
        assert_eq!(normalize_date("2024/07/25").as_deref(), Some("2024-07-25"));
        assert_eq!(normalize_date("2024-07-25").as_deref(), Some("2024-07-25"));
        assert_eq!(
            normalize_date("2024-07-25T10:30:00Z").as_deref(),
            Some("2024-07-25")
        );
        assert_eq!(normalize_date("not a date"), None);
        assert_eq!(normalize_date(""), None);
    }

    #[test]
    fn test_array_parsing() {
        assert_eq!(parse_array(r#"["a", "b"]"#), vec!["a", "b"]);
        assert_eq!(parse_array("[]"), Vec::<String>::new());
        assert_eq!(parse_array("[  ,  ]"), Vec::<String>::new());
        assert_eq!(parse_array("bare"), vec!["bare"]);
        assert_eq!(parse_array(r#"'single'"#), vec!["single"]);
    }

    #[test]
    fn test_comments_and_blank_lines_ignored() {
        let raw = "# leading comment\n\n[rule]\n# another\nname = \"R\"\n\nquery = \"x.y : 1\"\n";
        let rule = parse_rule(raw, "c.toml").unwrap();
        assert_eq!(rule.name, "R");
    }

    #[test]
    fn test_threat_mapping_best_effort() {
        let raw = r#"
[rule]
name = "Threat Mapped Rule"
query = "event.category : \"process\""

[[rule.threat]]
framework = "MITRE ATT&CK"

[rule.threat.tactic]
id = "TA0002"
name = "Execution"
reference = "https://attack.mitre.org/tactics/TA0002/"

[[rule.threat.technique]]
id = "T1059"
name = "Command and Scripting Interpreter"
reference = "https://attack.mitre.org/techniques/T1059/"
"#;
        let rule = parse_rule(raw, "threat.toml").unwrap();
        assert_eq!(rule.threat.len(), 1);
        let mapping = &rule.threat[0];
        assert_eq!(mapping.framework, "MITRE ATT&CK");
        assert_eq!(mapping.tactic.id, "TA0002");
        assert_eq!(mapping.technique.len(), 1);
        assert_eq!(mapping.technique[0].id, "T1059");
    }

    #[test]
    fn test_required_fields_from_query() {
        let raw = "[rule]\nname = \"R\"\nquery = \"process.name : \\\"x\\\" and user.id : 1\"\n";
        let rule = parse_rule(raw, "rf.toml").unwrap();
        assert!(rule.required_fields.contains(&"process.name".to_string()));
        assert!(rule.required_fields.contains(&"user.id".to_string()));
    }

    #[test]
    fn test_explicit_required_fields_win() {
        let raw = "[rule]\nname = \"R\"\nquery = \"process.name : 1\"\nrequired_fields = [\"host.os\"]\n";
        let rule = parse_rule(raw, "rf2.toml").unwrap();
        assert_eq!(rule.required_fields, vec!["host.os"]);
    }

    #[test]
    fn test_defaults_when_unparsable() {
        let raw = "[rule]\nname = \"R\"\nquery = \"a.b : 1\"\nrisk_score = \"n/a\"\nversion = \"x\"\nseverity = \"weird\"\nlanguage = \"klingon\"\n";
        let rule = parse_rule(raw, "d.toml").unwrap();
        assert_eq!(rule.risk_score, 0);
        assert_eq!(rule.version, 1);
        assert_eq!(rule.severity, Severity::Low);
        assert_eq!(rule.language, QueryLanguage::Kuery);
    }

    #[test]
    fn test_never_panics_on_garbage() {
        for garbage in ["", "]]]][[[", "\"\"\"", "= = =", "[rule]\n\"\"\"\nunterminated"] {
            let _ = parse_rule(garbage, "g.toml");
        }
    }
}
