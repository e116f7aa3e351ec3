use annot_core::{AnnotationRecord, Dataset};
use annot_runner::{FileOutcome, FileStatus, MergeSummary, ReconcileSummary};
use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "annot",
    version = "0.2.0",
    about = "Distractor annotation reconciliation CLI"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile saved annotation JSON files against the canonical dataset,
    /// writing one CSV per annotation.
    Reconcile {
        #[arg(long)]
        annotations_dir: PathBuf,
        #[arg(long)]
        dataset_dir: PathBuf,
        #[arg(long)]
        out_dir: PathBuf,
        /// Abort the batch on the first per-file failure instead of skipping.
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        json: bool,
    },
    /// Concatenate reconciled CSV files into one combined CSV.
    Merge {
        #[arg(long)]
        csv_dir: PathBuf,
        #[arg(long)]
        out_file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// List saved annotation files.
    Saves {
        #[arg(long, default_value = "annotation_saves")]
        dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Re-emit a saved annotation record as pretty JSON.
    Export {
        #[arg(long)]
        save_file: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string()));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Reconcile {
            annotations_dir,
            dataset_dir,
            out_dir,
            strict,
            json,
        } => {
            let dataset = Dataset::load_dir(&dataset_dir)?;
            let summary = annot_runner::reconcile_dir(&annotations_dir, &dataset, &out_dir, strict)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "reconcile",
                    "dataset_splits": dataset.split_names(),
                    "dataset_rows": dataset.row_count(),
                    "written": summary.written,
                    "skipped": summary.skipped,
                    "files": outcomes_to_json(&summary.outcomes),
                })));
            }
            print_reconcile_summary(&summary, &out_dir);
        }
        Commands::Merge {
            csv_dir,
            out_file,
            json,
        } => {
            let summary = annot_runner::merge_dir(&csv_dir, &out_file)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "merge",
                    "out_file": out_file.display().to_string(),
                    "merged_files": summary.merged_files,
                    "skipped": summary.skipped,
                    "rows": summary.rows,
                    "columns": summary.columns,
                    "files": outcomes_to_json(&summary.outcomes),
                })));
            }
            print_merge_summary(&summary, &out_file);
        }
        Commands::Saves { dir, json } => {
            let names = annot_core::list_saves(&dir)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "saves",
                    "dir": dir.display().to_string(),
                    "count": names.len(),
                    "files": names,
                })));
            }
            if names.is_empty() {
                println!("no saved annotation files in {}", dir.display());
            }
            for name in names {
                println!("{}", name);
            }
        }
        Commands::Export { save_file, out } => {
            let record = AnnotationRecord::load(&save_file)?;
            let pretty = serde_json::to_string_pretty(&record)?;
            match out {
                Some(path) => {
                    annot_core::atomic_write_bytes(&path, pretty.as_bytes())?;
                    println!("wrote: {}", path.display());
                }
                None => println!("{}", pretty),
            }
        }
    }
    Ok(None)
}

fn print_outcomes(outcomes: &[FileOutcome]) {
    for outcome in outcomes {
        match outcome.status {
            FileStatus::Ok => println!("[OK] {}: {}", outcome.file, outcome.detail),
            FileStatus::Skipped => println!("[WARN] {}: {}", outcome.file, outcome.detail),
        }
    }
}

fn print_reconcile_summary(summary: &ReconcileSummary, out_dir: &std::path::Path) {
    print_outcomes(&summary.outcomes);
    if summary.written == 0 {
        println!(
            "[WARN] no annotation files survived reconciliation ({} skipped)",
            summary.skipped
        );
    }
    println!(
        "done: {} written, {} skipped -> {}",
        summary.written,
        summary.skipped,
        out_dir.display()
    );
}

fn print_merge_summary(summary: &MergeSummary, out_file: &std::path::Path) {
    print_outcomes(&summary.outcomes);
    if summary.merged_files == 0 {
        println!(
            "[WARN] no table files could be read ({} skipped)",
            summary.skipped
        );
    }
    println!(
        "done: {} file(s), {} row(s) -> {}",
        summary.merged_files,
        summary.rows,
        out_file.display()
    );
}

fn outcomes_to_json(outcomes: &[FileOutcome]) -> Value {
    Value::Array(
        outcomes
            .iter()
            .map(|o| {
                json!({
                    "file": o.file,
                    "status": match o.status {
                        FileStatus::Ok => "ok",
                        FileStatus::Skipped => "skipped",
                    },
                    "detail": o.detail,
                })
            })
            .collect(),
    )
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Reconcile { json, .. }
        | Commands::Merge { json, .. }
        | Commands::Saves { json, .. } => *json,
        Commands::Export { .. } => false,
    }
}
