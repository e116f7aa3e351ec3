//! Data model for the distractor annotation workflow: the canonical dataset,
//! reviewer annotation records, the interactive edit buffer, and the shared
//! error kinds used by the reconciliation pipeline.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid input in {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("split '{split}' not present in loaded dataset")]
    SplitNotFound { split: String },
    #[error("no rows match (domain='{domain}', scenario='{scenario}') in split '{split}'")]
    NoMatch {
        domain: String,
        scenario: String,
        split: String,
    },
    #[error("row_index {index} out of range for {matched} matching rows")]
    RowIndexOutOfRange { index: usize, matched: usize },
    #[error("matched row missing mandatory field '{field}'")]
    MissingField { field: String },
    #[error("no input files found in {}", dir.display())]
    NoInputFiles { dir: PathBuf },
}

impl ReconcileError {
    pub fn parse(path: &Path, reason: impl fmt::Display) -> Self {
        ReconcileError::Parse {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Per-item errors are skippable in best-effort batch mode; only the
    /// absence of any input at all aborts a run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReconcileError::NoInputFiles { .. })
    }
}

// ---------- dataset ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Validation, Split::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "validation",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accept a string or any scalar for key fields; a numeric-looking domain or
/// scenario must still compare equal to its string form.
fn stringly<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatasetRow {
    #[serde(default, deserialize_with = "stringly")]
    pub domain: String,
    #[serde(default, deserialize_with = "stringly")]
    pub scenario: String,
    #[serde(default)]
    pub system_instruction: String,
    #[serde(default)]
    pub conversation: Option<Value>,
    #[serde(default)]
    pub conversation_with_distractors: Option<Value>,
}

/// Canonical dataset, loaded read-only. Rows keep file order within each
/// split; ordinal row matching depends on that order never being re-sorted.
#[derive(Debug, Default)]
pub struct Dataset {
    splits: BTreeMap<Split, Vec<DatasetRow>>,
}

impl Dataset {
    /// Load `<split>.jsonl` files from a dataset directory. Absent splits are
    /// skipped; a directory with no split file at all is an error.
    pub fn load_dir(dir: &Path) -> Result<Self, ReconcileError> {
        let mut splits = BTreeMap::new();
        for split in Split::ALL {
            let path = dir.join(format!("{}.jsonl", split.as_str()));
            if !path.is_file() {
                continue;
            }
            let rows = load_rows(&path)?;
            debug!(split = split.as_str(), rows = rows.len(), "loaded dataset split");
            splits.insert(split, rows);
        }
        if splits.is_empty() {
            return Err(ReconcileError::NoInputFiles {
                dir: dir.to_path_buf(),
            });
        }
        Ok(Dataset { splits })
    }

    pub fn insert_split(&mut self, split: Split, rows: Vec<DatasetRow>) {
        self.splits.insert(split, rows);
    }

    pub fn split(&self, split: Split) -> Option<&[DatasetRow]> {
        self.splits.get(&split).map(Vec::as_slice)
    }

    pub fn split_names(&self) -> Vec<&'static str> {
        self.splits.keys().map(Split::as_str).collect()
    }

    pub fn row_count(&self) -> usize {
        self.splits.values().map(Vec::len).sum()
    }
}

fn load_rows(path: &Path) -> Result<Vec<DatasetRow>, ReconcileError> {
    let data = fs::read_to_string(path)?;
    let mut rows = Vec::new();
    for (lineno, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let row: DatasetRow = serde_json::from_str(line)
            .map_err(|e| ReconcileError::parse(path, format!("line {}: {}", lineno + 1, e)))?;
        rows.push(row);
    }
    Ok(rows)
}

// ---------- annotation records ----------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(default)]
    pub bot_response: String,
    pub distractor: String,
    #[serde(default)]
    pub rule_indices: Vec<i64>,
}

fn default_split() -> Split {
    Split::Train
}

/// One reviewer decision set for one source row. `rule_indices` entries are
/// only meaningful against this record's own `system_rules`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<String>,
    #[serde(default = "default_split")]
    pub split: Split,
    #[serde(default, deserialize_with = "stringly")]
    pub domain: String,
    #[serde(default, deserialize_with = "stringly")]
    pub scenario: String,
    #[serde(default)]
    pub row_index: usize,
    #[serde(default)]
    pub system_instruction: String,
    #[serde(default)]
    pub system_rules: Vec<String>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

impl AnnotationRecord {
    pub fn from_json_str(path: &Path, data: &str) -> Result<Self, ReconcileError> {
        let mut record: AnnotationRecord =
            serde_json::from_str(data).map_err(|e| ReconcileError::parse(path, e))?;
        // Reviewer-entered keys may carry stray whitespace.
        record.domain = record.domain.trim().to_string();
        record.scenario = record.scenario.trim().to_string();
        Ok(record)
    }

    pub fn load(path: &Path) -> Result<Self, ReconcileError> {
        let data = fs::read_to_string(path)?;
        Self::from_json_str(path, &data)
    }
}

// ---------- edit buffer ----------

/// In-memory accumulation of unsaved reviewer edits for one dataset row.
/// A plain mutable struct with no ties to any rendering layer; persistence is
/// `snapshot()` (pure) followed by an atomic full-record overwrite.
#[derive(Debug, Clone)]
pub struct EditBuffer {
    pub split: Split,
    pub domain: String,
    pub scenario: String,
    pub row_index: usize,
    pub system_instruction: String,
    pub system_rules: Vec<String>,
    pub annotations: Vec<Annotation>,
}

impl EditBuffer {
    pub fn new(
        split: Split,
        domain: &str,
        scenario: &str,
        row_index: usize,
        system_instruction: &str,
    ) -> Self {
        EditBuffer {
            split,
            domain: domain.trim().to_string(),
            scenario: scenario.trim().to_string(),
            row_index,
            system_instruction: system_instruction.to_string(),
            system_rules: Vec::new(),
            annotations: Vec::new(),
        }
    }

    pub fn from_record(record: AnnotationRecord) -> Self {
        EditBuffer {
            split: record.split,
            domain: record.domain,
            scenario: record.scenario,
            row_index: record.row_index,
            system_instruction: record.system_instruction,
            system_rules: record.system_rules,
            annotations: record.annotations,
        }
    }

    /// Add a rule; trimmed, empty and duplicate rules are rejected. Returns
    /// whether the rule was actually added. Existing indices are never
    /// renumbered by an add.
    pub fn add_rule(&mut self, rule: &str) -> bool {
        let rule = rule.trim();
        if rule.is_empty() || self.system_rules.iter().any(|r| r == rule) {
            return false;
        }
        self.system_rules.push(rule.to_string());
        true
    }

    pub fn remove_rule(&mut self, index: usize) -> Option<String> {
        if index < self.system_rules.len() {
            Some(self.system_rules.remove(index))
        } else {
            None
        }
    }

    pub fn clear_rules(&mut self) {
        self.system_rules.clear();
    }

    /// Record one distractor annotation. The distractor text is required;
    /// rule indices are sorted and deduplicated at creation time (resolution
    /// later preserves whatever was recorded, so dedup happens here only).
    pub fn add_annotation(
        &mut self,
        bot_response: &str,
        distractor: &str,
        rule_indices: &[i64],
    ) -> Result<(), ReconcileError> {
        let distractor = distractor.trim();
        if distractor.is_empty() {
            return Err(ReconcileError::MissingField {
                field: "distractor".to_string(),
            });
        }
        let indices: BTreeSet<i64> = rule_indices.iter().copied().collect();
        self.annotations.push(Annotation {
            bot_response: bot_response.to_string(),
            distractor: distractor.to_string(),
            rule_indices: indices.into_iter().collect(),
        });
        Ok(())
    }

    pub fn remove_annotation(&mut self, index: usize) -> Option<Annotation> {
        if index < self.annotations.len() {
            Some(self.annotations.remove(index))
        } else {
            None
        }
    }

    /// Snapshot the buffer as a full annotation record, stamped now.
    pub fn snapshot(&self) -> AnnotationRecord {
        AnnotationRecord {
            saved_at: Some(Utc::now().to_rfc3339()),
            split: self.split,
            domain: self.domain.clone(),
            scenario: self.scenario.clone(),
            row_index: self.row_index,
            system_instruction: self.system_instruction.clone(),
            system_rules: self.system_rules.clone(),
            annotations: self.annotations.clone(),
        }
    }

    /// Atomic full-record overwrite of any prior save for the same key.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, ReconcileError> {
        ensure_dir(dir)?;
        let path = dir.join(save_file_name(
            self.split,
            &self.domain,
            &self.scenario,
            self.row_index,
        ));
        let record = self.snapshot();
        let bytes = serde_json::to_vec_pretty(&record)
            .map_err(|e| ReconcileError::parse(&path, e))?;
        atomic_write_bytes(&path, &bytes)?;
        Ok(path)
    }

    /// Load a previously saved buffer for this key, if one exists.
    pub fn load(
        dir: &Path,
        split: Split,
        domain: &str,
        scenario: &str,
        row_index: usize,
    ) -> Result<Option<Self>, ReconcileError> {
        let path = dir.join(save_file_name(split, domain, scenario, row_index));
        if !path.is_file() {
            return Ok(None);
        }
        let record = AnnotationRecord::load(&path)?;
        Ok(Some(EditBuffer::from_record(record)))
    }
}

/// Deterministic save filename for a (split, domain, scenario, row_index)
/// key, with filesystem-unsafe characters replaced.
pub fn save_file_name(split: Split, domain: &str, scenario: &str, row_index: usize) -> String {
    format!(
        "{}_{}_{}_row{}.json",
        split.as_str(),
        sanitize_component(domain),
        sanitize_component(scenario),
        row_index
    )
}

fn sanitize_component(s: &str) -> String {
    s.trim()
        .chars()
        .map(|c| if c == '/' || c.is_whitespace() { '_' } else { c })
        .collect()
}

/// Saved annotation files in a directory, lexicographically sorted. A missing
/// directory reads as no saves.
pub fn list_saves(dir: &Path) -> Result<Vec<String>, ReconcileError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.path().is_file() && name.ends_with(".json") {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

pub fn delete_save(
    dir: &Path,
    split: Split,
    domain: &str,
    scenario: &str,
    row_index: usize,
) -> Result<bool, ReconcileError> {
    let path = dir.join(save_file_name(split, domain, scenario, row_index));
    if !path.is_file() {
        return Ok(false);
    }
    fs::remove_file(&path)?;
    Ok(true)
}

// ---------- value normalization ----------

/// Normalize a nested dataset value for flat serialization: a string leaf
/// that parses as JSON is replaced by the parsed value, containers are
/// recursed. Applied only to known nested fields (the conversation), never to
/// flat string columns. Idempotent: after one pass every remaining string
/// fails to parse as JSON.
pub fn normalize_value(value: Value) -> Value {
    match value {
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(parsed) => normalize_value(parsed),
            Err(_) => Value::String(s),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize_value(v)))
                .collect(),
        ),
        other => other,
    }
}

// ---------- filesystem helpers ----------

pub fn ensure_dir(path: &Path) -> Result<(), ReconcileError> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Write via a temp file and rename so a save never leaves a partial file
/// behind.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<(), ReconcileError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "annot_core_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp dir");
        dir
    }

    #[test]
    fn save_file_name_sanitizes_unsafe_characters() {
        let name = save_file_name(Split::Train, "banking / loans", "rate talk", 2);
        assert_eq!(name, "train_banking___loans_rate_talk_row2.json");
    }

    #[test]
    fn add_rule_trims_and_rejects_duplicates() {
        let mut buf = EditBuffer::new(Split::Train, "finance", "loans", 0, "");
        assert!(buf.add_rule("  no advice  "));
        assert!(!buf.add_rule("no advice"));
        assert!(!buf.add_rule("   "));
        assert_eq!(buf.system_rules, vec!["no advice".to_string()]);
    }

    #[test]
    fn add_annotation_requires_distractor_and_dedupes_indices() {
        let mut buf = EditBuffer::new(Split::Train, "finance", "loans", 0, "");
        let err = buf.add_annotation("bot", "   ", &[0]).expect_err("empty distractor");
        assert!(matches!(err, ReconcileError::MissingField { .. }));

        buf.add_annotation("bot", "refinance now", &[2, 0, 2])
            .expect("valid annotation");
        assert_eq!(buf.annotations.len(), 1);
        assert_eq!(buf.annotations[0].rule_indices, vec![0, 2]);
    }

    #[test]
    fn buffer_save_load_round_trip() {
        let dir = temp_dir("round_trip");
        let mut buf = EditBuffer::new(Split::Validation, "finance", "loans", 1, "Stay on topic.");
        buf.add_rule("no advice");
        buf.add_rule("stay on topic");
        buf.add_annotation("Here is the rate.", "You should refinance.", &[0])
            .expect("annotation");

        let path = buf.save(&dir).expect("save");
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "validation_finance_loans_row1.json"
        );

        let loaded = EditBuffer::load(&dir, Split::Validation, "finance", "loans", 1)
            .expect("load")
            .expect("save exists");
        assert_eq!(loaded.system_rules, buf.system_rules);
        assert_eq!(loaded.annotations, buf.annotations);
        assert_eq!(loaded.system_instruction, "Stay on topic.");

        let missing = EditBuffer::load(&dir, Split::Test, "finance", "loans", 1).expect("load");
        assert!(missing.is_none());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn save_overwrites_prior_save_for_same_key() {
        let dir = temp_dir("overwrite");
        let mut buf = EditBuffer::new(Split::Train, "finance", "loans", 0, "");
        buf.add_rule("first");
        buf.save(&dir).expect("first save");

        buf.clear_rules();
        buf.add_rule("second");
        buf.save(&dir).expect("second save");

        let loaded = EditBuffer::load(&dir, Split::Train, "finance", "loans", 0)
            .expect("load")
            .expect("exists");
        assert_eq!(loaded.system_rules, vec!["second".to_string()]);
        assert_eq!(list_saves(&dir).expect("list").len(), 1);

        assert!(delete_save(&dir, Split::Train, "finance", "loans", 0).expect("delete"));
        assert!(!delete_save(&dir, Split::Train, "finance", "loans", 0).expect("delete again"));
        assert!(list_saves(&dir).expect("list").is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn record_parse_defaults_split_and_trims_keys() {
        let data = r#"{"domain":" finance ","scenario":"loans ","annotations":[]}"#;
        let record =
            AnnotationRecord::from_json_str(Path::new("x.json"), data).expect("parse");
        assert_eq!(record.split, Split::Train);
        assert_eq!(record.domain, "finance");
        assert_eq!(record.scenario, "loans");
        assert_eq!(record.row_index, 0);
    }

    #[test]
    fn record_parse_rejects_malformed_json() {
        let err = AnnotationRecord::from_json_str(Path::new("x.json"), "{not json")
            .expect_err("malformed");
        assert!(matches!(err, ReconcileError::Parse { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn dataset_load_keeps_row_order_and_skips_blank_lines() {
        let dir = temp_dir("dataset");
        let jsonl = concat!(
            r#"{"domain":"finance","scenario":"loans","system_instruction":"a"}"#,
            "\n\n",
            r#"{"domain":"finance","scenario":"loans","system_instruction":"b"}"#,
            "\n",
        );
        fs::write(dir.join("train.jsonl"), jsonl).expect("write");

        let ds = Dataset::load_dir(&dir).expect("load");
        let rows = ds.split(Split::Train).expect("train split");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].system_instruction, "a");
        assert_eq!(rows[1].system_instruction, "b");
        assert!(ds.split(Split::Test).is_none());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn key_fields_accept_numeric_values_as_strings() {
        let row: DatasetRow =
            serde_json::from_str(r#"{"domain":2024,"scenario":"loans"}"#).expect("parse");
        assert_eq!(row.domain, "2024");

        let record = AnnotationRecord::from_json_str(
            Path::new("x.json"),
            r#"{"domain":2024,"scenario":"loans"}"#,
        )
        .expect("parse");
        assert_eq!(record.domain, "2024");
    }

    #[test]
    fn dataset_load_fails_on_empty_directory() {
        let dir = temp_dir("dataset_empty");
        let err = Dataset::load_dir(&dir).expect_err("no split files");
        assert!(matches!(err, ReconcileError::NoInputFiles { .. }));
        assert!(err.is_fatal());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn normalize_value_parses_json_looking_strings() {
        let v = normalize_value(json!({
            "turns": "[{\"role\":\"user\",\"text\":\"hi\"}]",
            "note": "just words",
            "count": "5"
        }));
        assert_eq!(
            v,
            json!({
                "turns": [{"role": "user", "text": "hi"}],
                "note": "just words",
                "count": 5
            })
        );
    }

    #[test]
    fn normalize_value_is_idempotent() {
        let input = json!(["{\"a\": \"1\"}", "plain", 3, {"b": "\"quoted\""}]);
        let once = normalize_value(input.clone());
        let twice = normalize_value(once.clone());
        assert_eq!(once, twice);
    }
}
