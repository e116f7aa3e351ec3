//! Reconciliation pipeline: matches saved annotation records back to their
//! canonical dataset rows, resolves rule-index references into literal rule
//! text, writes one reconciled CSV per annotation, and merges reconciled CSVs
//! into one combined table.

use annot_core::{
    atomic_write_bytes, ensure_dir, normalize_value, Annotation, AnnotationRecord, Dataset,
    DatasetRow, ReconcileError, Split,
};
use serde_json::json;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// ---------- rule resolver ----------

/// Resolve recorded rule indices against the annotation's own rule list.
/// In-range indices become the rule text; anything else (stale, negative)
/// becomes an inline sentinel so one bad reference never blocks the batch.
/// Recorded order is preserved exactly; duplicates are not collapsed here.
pub fn resolve_rule_indices(rule_indices: &[i64], system_rules: &[String]) -> String {
    let mut lines = Vec::with_capacity(rule_indices.len());
    for &idx in rule_indices {
        let resolved = usize::try_from(idx).ok().and_then(|i| system_rules.get(i));
        match resolved {
            Some(rule) => lines.push(rule.clone()),
            None => lines.push(format!("[RULE_INDEX_{}_OUT_OF_RANGE]", idx)),
        }
    }
    lines.join("\n")
}

// ---------- row matcher ----------

/// Rows matching (domain, scenario) by exact string equality on trimmed
/// values, in the dataset's native order. `row_index` is an ordinal offset
/// into this sequence, so the order must never be re-sorted.
pub fn find_rows<'a>(rows: &'a [DatasetRow], domain: &str, scenario: &str) -> Vec<&'a DatasetRow> {
    let domain = domain.trim();
    let scenario = scenario.trim();
    rows.iter()
        .filter(|r| r.domain.trim() == domain && r.scenario.trim() == scenario)
        .collect()
}

/// Select the ordinal row from a matched group. An empty group is `NoMatch`
/// (data drift) regardless of the index; a non-empty group with a stale index
/// is `RowIndexOutOfRange` (outdated save). The two call for different
/// operator responses, so they stay distinct.
pub fn select_row<'a>(
    rows: &[&'a DatasetRow],
    row_index: usize,
    split: Split,
    domain: &str,
    scenario: &str,
) -> Result<&'a DatasetRow, ReconcileError> {
    if rows.is_empty() {
        return Err(ReconcileError::NoMatch {
            domain: domain.to_string(),
            scenario: scenario.to_string(),
            split: split.to_string(),
        });
    }
    rows.get(row_index)
        .copied()
        .ok_or(ReconcileError::RowIndexOutOfRange {
            index: row_index,
            matched: rows.len(),
        })
}

// ---------- reconciler ----------

/// One derived payload entry per annotation, order-preserving. Rules come
/// from the annotation record, never from the dataset (the dataset carries no
/// rule list).
pub fn build_distractors_payload(annotations: &[Annotation], system_rules: &[String]) -> Value {
    Value::Array(
        annotations
            .iter()
            .map(|a| {
                json!({
                    "bot turn": a.bot_response,
                    "distractor": a.distractor,
                    "target system instruction": resolve_rule_indices(&a.rule_indices, system_rules),
                })
            })
            .collect(),
    )
}

/// Flat output record: verbatim canonical fields plus the derived distractor
/// payload, nested structures serialized to canonical JSON text.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledRow {
    pub split: String,
    pub domain: String,
    pub scenario: String,
    pub system_instruction: String,
    pub system_rules: String,
    pub conversation: String,
    pub distractors: String,
    pub saved_at: Option<String>,
}

impl ReconciledRow {
    pub fn header(&self) -> Vec<&'static str> {
        let mut cols = vec![
            "split",
            "domain",
            "scenario",
            "system_instruction",
            "system_rules",
            "conversation",
            "distractors",
        ];
        if self.saved_at.is_some() {
            cols.push("saved_at");
        }
        cols
    }

    pub fn values(&self) -> Vec<&str> {
        let mut vals = vec![
            self.split.as_str(),
            self.domain.as_str(),
            self.scenario.as_str(),
            self.system_instruction.as_str(),
            self.system_rules.as_str(),
            self.conversation.as_str(),
            self.distractors.as_str(),
        ];
        if let Some(saved_at) = &self.saved_at {
            vals.push(saved_at.as_str());
        }
        vals
    }

    /// Header row plus one data row, written atomically so re-runs overwrite
    /// cleanly.
    pub fn write_csv(&self, path: &Path) -> Result<(), ReconcileError> {
        let mut wtr = csv::Writer::from_writer(Vec::new());
        wtr.write_record(self.header())
            .map_err(|e| ReconcileError::parse(path, e))?;
        wtr.write_record(self.values())
            .map_err(|e| ReconcileError::parse(path, e))?;
        let bytes = wtr
            .into_inner()
            .map_err(|e| ReconcileError::parse(path, e))?;
        atomic_write_bytes(path, &bytes)
    }
}

fn json_text(field: &str, value: &Value) -> Result<String, ReconcileError> {
    serde_json::to_string(value).map_err(|e| ReconcileError::Parse {
        path: field.to_string(),
        reason: e.to_string(),
    })
}

/// Reconcile one annotation record against the loaded dataset.
///
/// `system_instruction` and `conversation` are copied verbatim from the
/// matched canonical row, never from the record: the reviewer's copies may
/// have drifted. A matched row without a conversation is unusable.
pub fn reconcile_record(
    record: &AnnotationRecord,
    dataset: &Dataset,
) -> Result<ReconciledRow, ReconcileError> {
    let split_rows = dataset
        .split(record.split)
        .ok_or_else(|| ReconcileError::SplitNotFound {
            split: record.split.to_string(),
        })?;
    let matched = find_rows(split_rows, &record.domain, &record.scenario);
    let row = select_row(
        &matched,
        record.row_index,
        record.split,
        &record.domain,
        &record.scenario,
    )?;

    let conversation = row
        .conversation
        .clone()
        .ok_or_else(|| ReconcileError::MissingField {
            field: "conversation".to_string(),
        })?;
    let conversation = normalize_value(conversation);
    let system_rules = Value::Array(
        record
            .system_rules
            .iter()
            .map(|r| Value::String(r.clone()))
            .collect(),
    );
    let distractors = build_distractors_payload(&record.annotations, &record.system_rules);

    Ok(ReconciledRow {
        split: record.split.to_string(),
        domain: record.domain.clone(),
        scenario: record.scenario.clone(),
        system_instruction: row.system_instruction.clone(),
        system_rules: json_text("system_rules", &system_rules)?,
        conversation: json_text("conversation", &conversation)?,
        distractors: json_text("distractors", &distractors)?,
        saved_at: record.saved_at.clone(),
    })
}

// ---------- batch drivers ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Ok,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub file: String,
    pub status: FileStatus,
    /// Written path for `Ok`, skip reason for `Skipped`.
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct ReconcileSummary {
    pub outcomes: Vec<FileOutcome>,
    pub written: usize,
    pub skipped: usize,
}

/// Reconcile every `*.json` annotation in a directory, writing one
/// `<stem>.csv` per surviving file. Per-file failures are recorded and the
/// batch continues, unless `strict` turns the first failure into the batch
/// result. No annotation files at all is fatal.
pub fn reconcile_dir(
    annotations_dir: &Path,
    dataset: &Dataset,
    out_dir: &Path,
    strict: bool,
) -> Result<ReconcileSummary, ReconcileError> {
    let files = sorted_files_with_ext(annotations_dir, "json")?;
    if files.is_empty() {
        return Err(ReconcileError::NoInputFiles {
            dir: annotations_dir.to_path_buf(),
        });
    }
    ensure_dir(out_dir)?;

    let mut summary = ReconcileSummary::default();
    for path in files {
        let name = file_name(&path);
        match reconcile_file(&path, dataset, out_dir) {
            Ok(out_path) => {
                debug!(file = %name, out = %out_path.display(), "reconciled");
                summary.written += 1;
                summary.outcomes.push(FileOutcome {
                    file: name,
                    status: FileStatus::Ok,
                    detail: out_path.display().to_string(),
                });
            }
            Err(err) if strict || err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(file = %name, error = %err, "skipping annotation file");
                summary.skipped += 1;
                summary.outcomes.push(FileOutcome {
                    file: name,
                    status: FileStatus::Skipped,
                    detail: err.to_string(),
                });
            }
        }
    }
    Ok(summary)
}

fn reconcile_file(path: &Path, dataset: &Dataset, out_dir: &Path) -> Result<PathBuf, ReconcileError> {
    let record = AnnotationRecord::load(path)?;
    let row = reconcile_record(&record, dataset)?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "annotation".to_string());
    let out_path = out_dir.join(format!("{}.csv", stem));
    row.write_csv(&out_path)?;
    Ok(out_path)
}

#[derive(Debug, Default)]
pub struct MergeSummary {
    pub outcomes: Vec<FileOutcome>,
    pub merged_files: usize,
    pub skipped: usize,
    pub rows: usize,
    pub columns: Vec<String>,
}

struct Table {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

/// Concatenate every `*.csv` file in a directory into one combined table, in
/// filename-sorted order. Column sets may differ between files; the combined
/// header is the union in first-seen order and rows missing a column get an
/// empty value. Unreadable files are skipped with a warning. No input files
/// at all is fatal.
pub fn merge_dir(csv_dir: &Path, out_file: &Path) -> Result<MergeSummary, ReconcileError> {
    let files = sorted_files_with_ext(csv_dir, "csv")?;
    if files.is_empty() {
        return Err(ReconcileError::NoInputFiles {
            dir: csv_dir.to_path_buf(),
        });
    }

    let mut summary = MergeSummary::default();
    let mut tables = Vec::new();
    for path in files {
        let name = file_name(&path);
        match read_table(&path) {
            Ok(table) => {
                for col in &table.header {
                    if !summary.columns.contains(col) {
                        summary.columns.push(col.clone());
                    }
                }
                summary.merged_files += 1;
                summary.outcomes.push(FileOutcome {
                    file: name,
                    status: FileStatus::Ok,
                    detail: format!("{} row(s)", table.rows.len()),
                });
                tables.push(table);
            }
            Err(err) => {
                warn!(file = %name, error = %err, "skipping table file");
                summary.skipped += 1;
                summary.outcomes.push(FileOutcome {
                    file: name,
                    status: FileStatus::Skipped,
                    detail: err.to_string(),
                });
            }
        }
    }

    let mut wtr = csv::Writer::from_writer(Vec::new());
    if !summary.columns.is_empty() {
        wtr.write_record(&summary.columns)
            .map_err(|e| ReconcileError::parse(out_file, e))?;
        for table in &tables {
            for row in &table.rows {
                let record: Vec<&str> = summary
                    .columns
                    .iter()
                    .map(|col| {
                        table
                            .header
                            .iter()
                            .position(|h| h == col)
                            .and_then(|i| row.get(i))
                            .map(String::as_str)
                            .unwrap_or("")
                    })
                    .collect();
                wtr.write_record(&record)
                    .map_err(|e| ReconcileError::parse(out_file, e))?;
                summary.rows += 1;
            }
        }
    }
    let bytes = wtr
        .into_inner()
        .map_err(|e| ReconcileError::parse(out_file, e))?;
    atomic_write_bytes(out_file, &bytes)?;
    Ok(summary)
}

fn read_table(path: &Path) -> Result<Table, ReconcileError> {
    let mut rdr = csv::Reader::from_path(path).map_err(|e| ReconcileError::parse(path, e))?;
    let header: Vec<String> = rdr
        .headers()
        .map_err(|e| ReconcileError::parse(path, e))?
        .iter()
        .map(str::to_string)
        .collect();
    let mut rows = Vec::new();
    for record in rdr.records() {
        let record = record.map_err(|e| ReconcileError::parse(path, e))?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(Table { header, rows })
}

fn sorted_files_with_ext(dir: &Path, ext: &str) -> Result<Vec<PathBuf>, ReconcileError> {
    let mut files = Vec::new();
    if dir.is_dir() {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(ext) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
